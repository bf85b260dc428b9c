use crate::context::ExecutionContext;
use crate::error::Failure;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Name of a top-level state in a workflow definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateName(pub String);

impl StateName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StateName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StateName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// Reference to an external task, resolved by the injected invoker
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRef(pub String);

impl TaskRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl std::fmt::Display for TaskRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle returned by the extraction job submission call
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationHandle(pub String);

impl std::fmt::Display for InvocationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content-addressed blob hash (SHA-256)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobHash(pub String);

impl BlobHash {
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::{Digest, Sha256};
        let hash = Sha256::digest(data);
        Self(hex::encode(hash))
    }

    /// Accepts only a lowercase hex SHA-256 digest
    pub fn parse(s: &str) -> Option<Self> {
        let valid = s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        valid.then(|| Self(s.to_string()))
    }
}

/// Status of a workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

/// Classified status of the external extraction job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Running,
    Success,
    Failure,
}

/// Retry policy for a task call site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Backoff before the retry that follows the given (0-based) attempt.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_ms =
            self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let backoff = Duration::from_millis(backoff_ms as u64);
        std::cmp::min(backoff, Duration::from_millis(self.max_backoff_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            initial_backoff_ms: 2_000,
            max_backoff_ms: 60_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Durable state of one workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub workflow: String,
    pub status: ExecutionStatus,
    /// State the execution is in, or will enter next
    pub cursor: StateName,
    pub context: ExecutionContext,
    /// Set while suspended in a wait state
    pub wake_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub visits: BTreeMap<String, u32>,
    pub last_output: Option<serde_json::Value>,
    pub failure: Option<Failure>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    pub fn new(
        workflow: impl Into<String>,
        start_at: StateName,
        context: ExecutionContext,
        timeout: Option<Duration>,
    ) -> Self {
        let now = Utc::now();
        let deadline = timeout
            .and_then(|t| chrono::Duration::from_std(t).ok())
            .map(|t| now + t);

        Self {
            id: ExecutionId::new(),
            workflow: workflow.into(),
            status: ExecutionStatus::Running,
            cursor: start_at,
            context,
            wake_at: None,
            deadline,
            visits: BTreeMap::new(),
            last_output: None,
            failure: None,
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Record a visit to a state, returning the visit number (1-based)
    pub fn enter(&mut self, state: &StateName) -> u32 {
        let count = self.visits.entry(state.0.clone()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn visits_of(&self, state: &StateName) -> u32 {
        self.visits.get(state.as_str()).copied().unwrap_or(0)
    }

    pub fn view(&self) -> ExecutionStatusView {
        ExecutionStatusView {
            id: self.id,
            workflow: self.workflow.clone(),
            status: self.status,
            state: self.cursor.clone(),
            last_output: self.last_output.clone(),
            failure: self.failure.clone(),
            wake_at: self.wake_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// Answer to an execution status query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStatusView {
    pub id: ExecutionId,
    pub workflow: String,
    pub status: ExecutionStatus,
    pub state: StateName,
    pub last_output: Option<serde_json::Value>,
    pub failure: Option<Failure>,
    pub wake_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}
