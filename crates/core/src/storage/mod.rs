pub mod blob;
pub mod event_log;
pub mod executions;

pub use blob::{BlobStore, FilesystemBlobStore, ObjectStoreBlobStore};
pub use event_log::{InMemoryEventLog, JsonlEventLog};
pub use executions::{ExecutionStore, InMemoryExecutionStore, RedbExecutionStore};
