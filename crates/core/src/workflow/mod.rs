pub mod branch;
pub mod engine;
pub mod graph;
pub mod interpreter;
pub mod invoker;
pub mod map;
pub mod node;
pub mod parallel;
pub mod pipeline;
pub mod poll;

#[cfg(test)]
pub(crate) mod testing;

pub use branch::{evaluate_branch, BranchDecision, BranchNode, Choice, Predicate, Target};
pub use engine::{DriveOutcome, WorkflowEngine};
pub use graph::WorkflowGraph;
pub use invoker::{FnTask, TaskHandler, TaskInvoker, TaskRegistry};
pub use map::MapFailurePolicy;
pub use node::{
    MapNode, Node, ParallelNode, StateSpec, TaskNode, ValueSource, WaitNode, WorkflowBuilder,
    WorkflowDefinition,
};
pub use pipeline::{media_pipeline, MediaPipeline};
pub use poll::{PollLoop, PollPhase, PollProgress, PollWaitBuilder};
