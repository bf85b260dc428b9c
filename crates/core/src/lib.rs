// Core engine for the mediaflow pipeline orchestrator

pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod scheduler;
pub mod storage;
pub mod trigger;
pub mod types;
pub mod workflow;

pub use types::*;
