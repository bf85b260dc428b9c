//! Collaborator doubles for engine tests

use super::engine::{DriveOutcome, WorkflowEngine};
use super::invoker::TaskRegistry;
use super::node::WorkflowDefinition;
use crate::config::EngineConfig;
use crate::storage::{ExecutionStore, InMemoryEventLog, InMemoryExecutionStore, ObjectStoreBlobStore};
use crate::types::{ExecutionId, ExecutionStatus};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Shared stores, so several engines can be built over the same state
#[derive(Clone)]
pub struct Stores {
    pub executions: Arc<InMemoryExecutionStore>,
    pub events: Arc<InMemoryEventLog>,
    pub blobs: Arc<ObjectStoreBlobStore>,
}

impl Default for Stores {
    fn default() -> Self {
        Self {
            executions: Arc::new(InMemoryExecutionStore::new()),
            events: Arc::new(InMemoryEventLog::new()),
            blobs: Arc::new(ObjectStoreBlobStore::in_memory()),
        }
    }
}

impl Stores {
    pub fn engine(
        &self,
        definition: WorkflowDefinition,
        registry: TaskRegistry,
        config: EngineConfig,
    ) -> WorkflowEngine {
        WorkflowEngine::new(
            definition,
            self.executions.clone(),
            self.events.clone(),
            self.blobs.clone(),
            Arc::new(registry),
            config,
        )
    }

    /// Pull a suspended execution's wake-up time into the past
    pub fn make_due(&self, id: ExecutionId) {
        let mut record = self.executions.get(&id).unwrap().unwrap();
        record.wake_at = Some(chrono::Utc::now() - chrono::Duration::seconds(1));
        self.executions.save(&record).unwrap();
    }
}

pub fn harness(
    definition: WorkflowDefinition,
    registry: TaskRegistry,
    config: EngineConfig,
) -> WorkflowEngine {
    Stores::default().engine(definition, registry, config)
}

/// Drive until terminal. Waits must be zero-length or the loop gives up.
pub async fn drive_to_end(engine: &WorkflowEngine, id: ExecutionId) -> ExecutionStatus {
    for _ in 0..100 {
        match engine.drive(id).await.unwrap() {
            DriveOutcome::Terminal(status) => return status,
            DriveOutcome::Suspended { .. } => tokio::task::yield_now().await,
            DriveOutcome::Busy => panic!("execution {id} is leased elsewhere"),
        }
    }
    panic!("execution {id} did not finish")
}

#[derive(Default)]
struct JobState {
    submissions: Vec<Value>,
    // Status reads served per handle
    reads: HashMap<String, usize>,
    checks: u32,
}

/// Extraction service double. Submissions get handles `H1`, `H2`, ...; each
/// handle reports the scripted statuses in order and then keeps reporting
/// the last one.
#[derive(Clone)]
pub struct ScriptedJob {
    statuses: Arc<Vec<String>>,
    output_prefix: Arc<String>,
    state: Arc<Mutex<JobState>>,
}

impl ScriptedJob {
    pub fn new(statuses: &[&str]) -> Self {
        Self {
            statuses: Arc::new(statuses.iter().map(|s| s.to_string()).collect()),
            output_prefix: Arc::new("s3://out".to_string()),
            state: Arc::new(Mutex::new(JobState::default())),
        }
    }

    pub fn with_output_prefix(mut self, prefix: &str) -> Self {
        self.output_prefix = Arc::new(prefix.to_string());
        self
    }

    pub fn register(&self, registry: &mut TaskRegistry, submit: &str, status: &str) {
        let job = self.clone();
        registry.register_fn(submit.to_string(), move |payload| {
            let job = job.clone();
            async move { Ok(job.submit(payload)) }
        });

        let job = self.clone();
        registry.register_fn(status.to_string(), move |payload| {
            let job = job.clone();
            async move { Ok(job.status(&payload)) }
        });
    }

    fn submit(&self, payload: Value) -> Value {
        let mut state = self.state.lock().unwrap();
        state.submissions.push(payload);
        json!({ "invocationHandle": format!("H{}", state.submissions.len()) })
    }

    fn status(&self, payload: &Value) -> Value {
        let handle = payload["invocationHandle"].as_str().unwrap_or_default().to_string();
        let mut state = self.state.lock().unwrap();
        state.checks += 1;

        let read = state.reads.entry(handle.clone()).or_insert(0);
        let index = (*read).min(self.statuses.len().saturating_sub(1));
        *read += 1;

        let status = self.statuses.get(index).cloned().unwrap_or_default();
        if status == "SUCCESS" {
            json!({ "status": status, "outputUri": format!("{}/{}/", self.output_prefix, handle) })
        } else {
            json!({ "status": status })
        }
    }

    pub fn submissions(&self) -> Vec<Value> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub fn status_checks(&self) -> u32 {
        self.state.lock().unwrap().checks
    }
}

/// Ordered log of labelled stage calls
#[derive(Clone, Default)]
pub struct Calls(Arc<Mutex<Vec<(String, Value)>>>);

impl Calls {
    pub fn record(&self, label: &str, value: Value) {
        self.0.lock().unwrap().push((label.to_string(), value));
    }

    pub fn entries(&self) -> Vec<(String, Value)> {
        self.0.lock().unwrap().clone()
    }

    pub fn payloads(&self, label: &str) -> Vec<Value> {
        self.entries()
            .into_iter()
            .filter(|(l, _)| l == label)
            .map(|(_, v)| v)
            .collect()
    }
}

/// Holds a task in flight until the test is done with it
#[derive(Clone, Default)]
pub struct Gate {
    arrived: Arc<Notify>,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn arrive_and_block(&self) {
        self.arrived.notify_one();
        std::future::pending::<()>().await;
    }

    pub async fn wait_arrived(&self) {
        self.arrived.notified().await;
    }
}

/// One-shot signal from one task to another. Opening before anyone waits is
/// remembered.
#[derive(Clone, Default)]
pub struct Latch {
    opened: Arc<Notify>,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        self.opened.notify_one();
    }

    pub async fn wait_open(&self) {
        self.opened.notified().await;
    }
}
