use crate::error::Failure;
use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An entry in an execution's history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub execution_id: ExecutionId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(execution_id: ExecutionId, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// Types of events that can occur during an execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Execution lifecycle events
    ExecutionStarted {
        workflow: String,
        seed_hash: BlobHash,
    },
    ExecutionSucceeded {
        duration_secs: u64,
    },
    ExecutionFailed {
        failure: Failure,
        duration_secs: u64,
    },
    ExecutionCancelled {
        reason: String,
    },

    // State machine events
    StateEntered {
        state: StateName,
        visit: u32,
    },
    WaitScheduled {
        state: StateName,
        wake_at: DateTime<Utc>,
    },
    WaitElapsed {
        state: StateName,
    },
    BranchEvaluated {
        state: StateName,
        choice: Option<usize>,
        target: String,
    },
    BranchAnomaly {
        state: StateName,
        detail: String,
    },

    // Stage events
    StageStarted {
        stage: String,
        attempt: u32,
    },
    StageCompleted {
        stage: String,
        attempt: u32,
        duration_ms: u64,
        output_hash: BlobHash,
    },
    StageFailed {
        stage: String,
        error: String,
        attempt: u32,
        will_retry: bool,
    },
    MapItemFailed {
        stage: String,
        index: usize,
        error: String,
    },
    LateResultDiscarded {
        state: StateName,
    },
}

impl EventType {
    pub fn name(&self) -> &'static str {
        match self {
            EventType::ExecutionStarted { .. } => "execution_started",
            EventType::ExecutionSucceeded { .. } => "execution_succeeded",
            EventType::ExecutionFailed { .. } => "execution_failed",
            EventType::ExecutionCancelled { .. } => "execution_cancelled",
            EventType::StateEntered { .. } => "state_entered",
            EventType::WaitScheduled { .. } => "wait_scheduled",
            EventType::WaitElapsed { .. } => "wait_elapsed",
            EventType::BranchEvaluated { .. } => "branch_evaluated",
            EventType::BranchAnomaly { .. } => "branch_anomaly",
            EventType::StageStarted { .. } => "stage_started",
            EventType::StageCompleted { .. } => "stage_completed",
            EventType::StageFailed { .. } => "stage_failed",
            EventType::MapItemFailed { .. } => "map_item_failed",
            EventType::LateResultDiscarded { .. } => "late_result_discarded",
        }
    }
}

/// Durable, per-execution history of events
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, event: Event) -> anyhow::Result<()>;

    /// Events of one execution in the order they were appended
    async fn get_execution_events(&self, execution_id: ExecutionId) -> anyhow::Result<Vec<Event>>;
}
