use serde::{Deserialize, Serialize};

/// Category of a failure that can end an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Submission,
    Poll,
    Stage,
    BranchMismatch,
    FanOut,
    MapItem,
    Timeout,
    Cancelled,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::Submission => "submission",
            FailureKind::Poll => "poll",
            FailureKind::Stage => "stage",
            FailureKind::BranchMismatch => "branch mismatch",
            FailureKind::FanOut => "fan-out",
            FailureKind::MapItem => "map item",
            FailureKind::Timeout => "timeout",
            FailureKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Failure descriptor carried by a failed stage or execution.
///
/// Composite stages (fan-out, map) wrap the failure that caused them in
/// `cause`, so the originating descriptor is never lost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind} failure: {message}")]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<Failure>>,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: false,
            stage: None,
            cause: None,
        }
    }

    pub fn timeout() -> Self {
        Self::new(FailureKind::Timeout, "execution deadline exceeded")
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::new(FailureKind::Cancelled, reason)
    }

    /// Build the descriptor for a task call site that gave up.
    pub fn from_task_error(kind: FailureKind, stage: &str, error: TaskError) -> Self {
        Self {
            kind,
            message: format!("{}: {}", error.error_type, error.message),
            retryable: error.retryable,
            stage: Some(stage.to_string()),
            cause: None,
        }
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn with_cause(mut self, cause: Failure) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// The innermost failure in the cause chain
    pub fn root_cause(&self) -> &Failure {
        let mut current = self;
        while let Some(cause) = current.cause.as_deref() {
            current = cause;
        }
        current
    }
}

/// Error returned by a task invoker for a single call
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{error_type}: {message}")]
pub struct TaskError {
    pub error_type: String,
    pub message: String,
    pub retryable: bool,
}

impl TaskError {
    pub fn retryable(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn terminal(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            retryable: false,
        }
    }
}

/// Reasons a workflow definition is rejected at build time
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DefinitionError {
    #[error("Workflow has no states")]
    Empty,

    #[error("Start state {0} is not defined")]
    MissingStart(String),

    #[error("State {0} is defined more than once")]
    DuplicateState(String),

    #[error("State {from} transitions to undefined state {to}")]
    UnknownState { from: String, to: String },

    #[error("Wait state {0} has no next state")]
    WaitWithoutNext(String),

    #[error("State {0} nests a {1} node inside a sub-workflow")]
    NestedControlNode(String, &'static str),

    #[error("Parallel node in state {0} declares no branches")]
    EmptyParallel(String),

    #[error("State {state} uses an invalid field path {path}")]
    InvalidPath { state: String, path: String },

    #[error("State {state} has a format template expecting {expected} arguments but {given} given")]
    FormatArity {
        state: String,
        expected: usize,
        given: usize,
    },

    #[error("States {0:?} form a loop without a wait state")]
    BusyLoop(Vec<String>),
}
