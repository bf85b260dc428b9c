use super::branch::{evaluate_branch, Target};
use super::interpreter::Interpreter;
use super::invoker::{RetryingInvoker, TaskInvoker};
use super::node::{Node, WorkflowDefinition};
use crate::config::EngineConfig;
use crate::context::ExecutionContext;
use crate::error::{Failure, FailureKind};
use crate::events::{Event, EventLog, EventType};
use crate::storage::{BlobStore, ExecutionStore};
use crate::types::{
    BlobHash, ExecutionId, ExecutionRecord, ExecutionStatus, ExecutionStatusView, StateName,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};

/// Where a call to [`WorkflowEngine::drive`] left the execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveOutcome {
    /// Parked in a wait state until `wake_at`
    Suspended { wake_at: DateTime<Utc> },
    Terminal(ExecutionStatus),
    /// Another driver holds the execution
    Busy,
}

/// Drives executions of one workflow definition through their states.
///
/// All progress is persisted in the execution store after every state, and
/// waits are recorded as wake-up times rather than timers, so any process
/// with access to the store can pick up where another left off.
pub struct WorkflowEngine {
    definition: Arc<WorkflowDefinition>,
    store: Arc<dyn ExecutionStore>,
    event_log: Arc<dyn EventLog>,
    blob_store: Arc<dyn BlobStore>,
    invoker: RetryingInvoker,
    config: EngineConfig,
    // Lease per execution being driven; the sender signals cancellation
    active_executions: Arc<RwLock<HashMap<ExecutionId, watch::Sender<bool>>>>,
    // Serializes read-modify-write of records between drivers and cancel()
    record_lock: Mutex<()>,
}

impl WorkflowEngine {
    pub fn new(
        definition: WorkflowDefinition,
        store: Arc<dyn ExecutionStore>,
        event_log: Arc<dyn EventLog>,
        blob_store: Arc<dyn BlobStore>,
        invoker: Arc<dyn TaskInvoker>,
        config: EngineConfig,
    ) -> Self {
        let invoker = RetryingInvoker::new(invoker, event_log.clone());
        Self {
            definition: Arc::new(definition),
            store,
            event_log,
            blob_store,
            invoker,
            config,
            active_executions: Arc::new(RwLock::new(HashMap::new())),
            record_lock: Mutex::new(()),
        }
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn emit(&self, execution_id: ExecutionId, event_type: EventType) {
        if let Err(e) = self
            .event_log
            .append(Event::new(execution_id, event_type))
            .await
        {
            tracing::error!("Failed to append event for execution {}: {:#}", execution_id, e);
        }
    }

    fn load(&self, id: &ExecutionId) -> Result<ExecutionRecord> {
        self.store
            .get(id)?
            .with_context(|| format!("Execution {} not found", id))
    }

    /// Persist a new execution seeded with `seed`, without driving it
    pub async fn create_execution(&self, seed: ExecutionContext) -> Result<ExecutionId> {
        let seed_hash = self
            .blob_store
            .put_json(seed.as_value())
            .await
            .context("Failed to store execution seed")?;

        let record = ExecutionRecord::new(
            self.definition.name.clone(),
            self.definition.start_at.clone(),
            seed,
            self.config.execution_timeout(),
        );
        self.store
            .save(&record)
            .context("Failed to persist execution")?;

        self.emit(
            record.id,
            EventType::ExecutionStarted {
                workflow: self.definition.name.clone(),
                seed_hash,
            },
        )
        .await;

        tracing::info!(
            "Created execution {} of workflow {}",
            record.id,
            self.definition.name
        );
        Ok(record.id)
    }

    /// Create an execution and drive it in the background
    pub async fn start(self: &Arc<Self>, seed: ExecutionContext) -> Result<ExecutionId> {
        let id = self.create_execution(seed).await?;
        self.spawn_driver(id);
        Ok(id)
    }

    fn spawn_driver(self: &Arc<Self>, id: ExecutionId) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = engine.drive(id).await {
                tracing::error!("Driver for execution {} failed: {:#}", id, e);
            }
        });
    }

    /// Advance an execution until it suspends in a wait or terminates
    pub async fn drive(&self, id: ExecutionId) -> Result<DriveOutcome> {
        let cancel_rx = {
            let mut active = self.active_executions.write().await;
            if active.contains_key(&id) {
                tracing::debug!("Execution {} is already being driven", id);
                return Ok(DriveOutcome::Busy);
            }
            let (cancel_tx, cancel_rx) = watch::channel(false);
            active.insert(id, cancel_tx);
            cancel_rx
        };

        let outcome = self.advance(id, cancel_rx).await;
        self.active_executions.write().await.remove(&id);
        outcome
    }

    async fn advance(
        &self,
        id: ExecutionId,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> Result<DriveOutcome> {
        loop {
            let mut record = self.load(&id)?;
            if record.status.is_terminal() {
                return Ok(DriveOutcome::Terminal(record.status));
            }

            let now = Utc::now();
            if record.deadline.is_some_and(|deadline| now >= deadline) {
                let from = record.cursor.clone();
                return self.fail(record, &from, Failure::timeout()).await;
            }

            let Some(state) = self.definition.state(&record.cursor).cloned() else {
                let from = record.cursor.clone();
                let failure =
                    Failure::new(FailureKind::Stage, format!("state {from} is not defined"));
                return self.fail(record, &from, failure).await;
            };

            match &state.node {
                Node::Wait(wait) => match record.wake_at {
                    None => {
                        let visit = record.enter(&state.name);
                        let mut wake_at = now
                            + chrono::Duration::from_std(wait.duration())
                                .unwrap_or_else(|_| chrono::Duration::zero());
                        // Wake no later than the deadline so the timeout fires on time
                        if let Some(deadline) = record.deadline {
                            wake_at = wake_at.min(deadline);
                        }
                        record.wake_at = Some(wake_at);
                        if let Some(status) = self.commit(&mut record).await? {
                            return Ok(DriveOutcome::Terminal(status));
                        }

                        self.emit(
                            id,
                            EventType::StateEntered {
                                state: state.name.clone(),
                                visit,
                            },
                        )
                        .await;
                        self.emit(
                            id,
                            EventType::WaitScheduled {
                                state: state.name.clone(),
                                wake_at,
                            },
                        )
                        .await;
                        tracing::debug!(
                            "Execution {} waiting in {} until {}",
                            id,
                            state.name,
                            wake_at
                        );
                        return Ok(DriveOutcome::Suspended { wake_at });
                    }
                    Some(wake_at) if wake_at > now => {
                        return Ok(DriveOutcome::Suspended { wake_at });
                    }
                    Some(_) => {
                        record.wake_at = None;
                        self.emit(
                            id,
                            EventType::WaitElapsed {
                                state: state.name.clone(),
                            },
                        )
                        .await;
                        if let Some(outcome) =
                            self.transition(record, &state.name, state.next.clone()).await?
                        {
                            return Ok(outcome);
                        }
                    }
                },

                Node::Branch(branch) => {
                    let visit = record.enter(&state.name);
                    self.emit(
                        id,
                        EventType::StateEntered {
                            state: state.name.clone(),
                            visit,
                        },
                    )
                    .await;

                    let decision = evaluate_branch(branch, &record.context);
                    for detail in &decision.anomalies {
                        tracing::warn!(
                            "Branch anomaly in {} for execution {}: {}",
                            state.name,
                            id,
                            detail
                        );
                        self.emit(
                            id,
                            EventType::BranchAnomaly {
                                state: state.name.clone(),
                                detail: detail.clone(),
                            },
                        )
                        .await;
                    }
                    self.emit(
                        id,
                        EventType::BranchEvaluated {
                            state: state.name.clone(),
                            choice: decision.choice,
                            target: decision.target.to_string(),
                        },
                    )
                    .await;

                    match decision.target {
                        Target::Goto { state: next } => {
                            if let Some(outcome) =
                                self.transition(record, &state.name, Some(next)).await?
                            {
                                return Ok(outcome);
                            }
                        }
                        Target::Succeed => return self.succeed(record, &state.name).await,
                        Target::Fail { kind, message } => {
                            let failure = Failure::new(kind, message).with_stage(state.name.as_str());
                            return self.fail(record, &state.name, failure).await;
                        }
                    }
                }

                body => {
                    let visit = record.enter(&state.name);
                    if let Some(status) = self.commit(&mut record).await? {
                        return Ok(DriveOutcome::Terminal(status));
                    }
                    self.emit(
                        id,
                        EventType::StateEntered {
                            state: state.name.clone(),
                            visit,
                        },
                    )
                    .await;
                    tracing::info!("Execution {} entering {} (visit {})", id, state.name, visit);

                    let interpreter = Interpreter::new(
                        id,
                        self.invoker.clone(),
                        self.event_log.clone(),
                        self.blob_store.clone(),
                        self.config.map_failure_policy,
                    );
                    let remaining = record
                        .deadline
                        .map(|deadline| (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO));
                    let mut ctx = record.context.clone();

                    let result = tokio::select! {
                        result = bounded(remaining, interpreter.eval(body, &mut ctx)) => result,
                        _ = cancelled(&mut cancel_rx) => {
                            tracing::info!(
                                "Execution {} cancelled in {}, abandoning in-flight work",
                                id,
                                state.name
                            );
                            return Ok(DriveOutcome::Terminal(self.load(&id)?.status));
                        }
                    };

                    match result {
                        Ok(output) => {
                            record.context = ctx;
                            record.last_output = Some(output);
                            if let Some(outcome) =
                                self.transition(record, &state.name, state.next.clone()).await?
                            {
                                return Ok(outcome);
                            }
                        }
                        Err(failure) => return self.fail(record, &state.name, failure).await,
                    }
                }
            }
        }
    }

    /// Persist `record` unless the stored copy has reached a terminal status
    /// in the meantime, in which case that status is returned.
    async fn commit(&self, record: &mut ExecutionRecord) -> Result<Option<ExecutionStatus>> {
        let _guard = self.record_lock.lock().await;
        if let Some(current) = self.store.get(&record.id)? {
            if current.status.is_terminal() {
                return Ok(Some(current.status));
            }
        }
        record.updated_at = Utc::now();
        self.store
            .save(record)
            .context("Failed to persist execution")?;
        Ok(None)
    }

    async fn discarded(
        &self,
        id: ExecutionId,
        state: &StateName,
        status: ExecutionStatus,
    ) -> DriveOutcome {
        tracing::warn!(
            "Execution {} already {:?}, discarding result of {}",
            id,
            status,
            state
        );
        self.emit(
            id,
            EventType::LateResultDiscarded {
                state: state.clone(),
            },
        )
        .await;
        DriveOutcome::Terminal(status)
    }

    /// Move to `next`, or finish successfully when there is no next state.
    /// Returns an outcome when the drive loop must stop.
    async fn transition(
        &self,
        mut record: ExecutionRecord,
        from: &StateName,
        next: Option<StateName>,
    ) -> Result<Option<DriveOutcome>> {
        let Some(next) = next else {
            return self.succeed(record, from).await.map(Some);
        };

        record.cursor = next;
        match self.commit(&mut record).await? {
            Some(status) => Ok(Some(self.discarded(record.id, from, status).await)),
            None => Ok(None),
        }
    }

    async fn succeed(&self, mut record: ExecutionRecord, from: &StateName) -> Result<DriveOutcome> {
        let now = Utc::now();
        record.status = ExecutionStatus::Succeeded;
        record.wake_at = None;
        record.completed_at = Some(now);
        if let Some(status) = self.commit(&mut record).await? {
            return Ok(self.discarded(record.id, from, status).await);
        }

        let duration_secs = (now - record.started_at).num_seconds().max(0) as u64;
        self.emit(record.id, EventType::ExecutionSucceeded { duration_secs })
            .await;
        tracing::info!("Execution {} succeeded in {}s", record.id, duration_secs);
        Ok(DriveOutcome::Terminal(ExecutionStatus::Succeeded))
    }

    async fn fail(
        &self,
        mut record: ExecutionRecord,
        from: &StateName,
        failure: Failure,
    ) -> Result<DriveOutcome> {
        let now = Utc::now();
        record.status = ExecutionStatus::Failed;
        record.wake_at = None;
        record.completed_at = Some(now);
        record.failure = Some(failure.clone());
        if let Some(status) = self.commit(&mut record).await? {
            return Ok(self.discarded(record.id, from, status).await);
        }

        let duration_secs = (now - record.started_at).num_seconds().max(0) as u64;
        tracing::error!(
            "Execution {} failed in {}: {} (root cause: {})",
            record.id,
            from,
            failure,
            failure.root_cause()
        );
        self.emit(
            record.id,
            EventType::ExecutionFailed {
                failure,
                duration_secs,
            },
        )
        .await;
        Ok(DriveOutcome::Terminal(ExecutionStatus::Failed))
    }

    /// Drive every suspended execution whose wake-up time has passed
    pub async fn resume_due(self: &Arc<Self>) -> Result<Vec<ExecutionId>> {
        let due = self
            .store
            .due_wakeups(Utc::now())
            .context("Failed to query due wake-ups")?;
        for id in &due {
            tracing::debug!("Resuming execution {}", id);
            self.spawn_driver(*id);
        }
        Ok(due)
    }

    /// Re-drive running executions that are not parked in a wait, e.g.
    /// after a restart interrupted them mid-state
    pub async fn recover(self: &Arc<Self>) -> Result<Vec<ExecutionId>> {
        let orphaned: Vec<ExecutionId> = self
            .store
            .list()
            .context("Failed to list executions")?
            .into_iter()
            .filter(|r| r.status == ExecutionStatus::Running && r.wake_at.is_none())
            .map(|r| r.id)
            .collect();

        for id in &orphaned {
            tracing::info!("Recovering execution {}", id);
            self.spawn_driver(*id);
        }
        Ok(orphaned)
    }

    /// Cancel an execution. Returns `false` if it had already finished.
    pub async fn cancel(&self, id: ExecutionId, reason: &str) -> Result<bool> {
        {
            let _guard = self.record_lock.lock().await;
            let mut record = self.load(&id)?;
            if record.status.is_terminal() {
                return Ok(false);
            }

            let now = Utc::now();
            record.status = ExecutionStatus::Failed;
            record.failure = Some(Failure::cancelled(reason).with_stage(record.cursor.as_str()));
            record.wake_at = None;
            record.completed_at = Some(now);
            record.updated_at = now;
            self.store
                .save(&record)
                .context("Failed to persist execution")?;
        }

        self.emit(
            id,
            EventType::ExecutionCancelled {
                reason: reason.to_string(),
            },
        )
        .await;

        if let Some(cancel_tx) = self.active_executions.read().await.get(&id) {
            cancel_tx.send(true).ok();
            tracing::info!("Cancellation signal sent for execution {}", id);
        }
        tracing::info!("Execution {} cancelled: {}", id, reason);
        Ok(true)
    }

    pub fn get_record(&self, id: &ExecutionId) -> Result<Option<ExecutionRecord>> {
        self.store.get(id)
    }

    pub fn get_status(&self, id: &ExecutionId) -> Result<Option<ExecutionStatusView>> {
        Ok(self.store.get(id)?.map(|r| r.view()))
    }

    pub fn list(&self) -> Result<Vec<ExecutionStatusView>> {
        Ok(self.store.list()?.iter().map(ExecutionRecord::view).collect())
    }

    pub async fn events(&self, id: ExecutionId) -> Result<Vec<Event>> {
        self.event_log.get_execution_events(id).await
    }

    /// A seed or stage output referenced by an event
    pub async fn stored_output(&self, hash: &BlobHash) -> Result<Option<Value>> {
        self.blob_store.get_json(hash).await
    }
}

/// Bound a state's evaluation by the time left before the deadline
async fn bounded<F>(limit: Option<Duration>, evaluation: F) -> Result<Value, Failure>
where
    F: Future<Output = Result<Value, Failure>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, evaluation)
            .await
            .unwrap_or_else(|_| Err(Failure::timeout())),
        None => evaluation.await,
    }
}

/// Resolves once cancellation is signalled; never if the sender goes away
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use crate::workflow::invoker::TaskRegistry;
    use crate::workflow::node::{TaskNode, WaitNode, WorkflowBuilder};
    use crate::workflow::testing::{drive_to_end, harness, Gate};
    use crate::types::RetryPolicy;
    use serde_json::json;

    fn wait_then_task() -> WorkflowDefinition {
        WorkflowBuilder::new("wait-then-task")
            .then("Wait", Node::Wait(WaitNode::new(Duration::from_secs(600))))
            .then("Work", Node::Task(TaskNode::new("Work", "work").result_key("work")))
            .build()
            .unwrap()
    }

    fn registry_with(name: &str, output: Value) -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry.register_fn(name.to_string(), move |_| {
            let output = output.clone();
            async move { Ok(output) }
        });
        registry
    }

    #[tokio::test]
    async fn test_wait_suspends_and_persists_wake_up() {
        let engine = harness(wait_then_task(), registry_with("work", json!(1)), EngineConfig::default());
        let id = engine.create_execution(ExecutionContext::new()).await.unwrap();

        let outcome = engine.drive(id).await.unwrap();
        let DriveOutcome::Suspended { wake_at } = outcome else {
            panic!("expected suspension, got {outcome:?}");
        };
        assert!(wake_at > Utc::now() + chrono::Duration::seconds(590));

        // Still parked: driving again does not run the next state
        assert_eq!(engine.drive(id).await.unwrap(), outcome);
        let view = engine.get_status(&id).unwrap().unwrap();
        assert_eq!(view.status, ExecutionStatus::Running);
        assert_eq!(view.state, StateName::new("Wait"));
        assert_eq!(view.wake_at, Some(wake_at));
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let engine = harness(wait_then_task(), registry_with("work", json!(1)), EngineConfig::default());
        let id = engine.create_execution(ExecutionContext::new()).await.unwrap();
        engine.drive(id).await.unwrap();

        assert!(engine.cancel(id, "operator request").await.unwrap());
        assert!(!engine.cancel(id, "again").await.unwrap());

        let view = engine.get_status(&id).unwrap().unwrap();
        assert_eq!(view.status, ExecutionStatus::Failed);
        let failure = view.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::Cancelled);
        assert_eq!(failure.stage.as_deref(), Some("Wait"));
        assert_eq!(view.wake_at, None);

        assert_eq!(
            engine.drive(id).await.unwrap(),
            DriveOutcome::Terminal(ExecutionStatus::Failed)
        );
    }

    #[tokio::test]
    async fn test_cancel_during_in_flight_stage() {
        let gate = Gate::new();
        let mut registry = TaskRegistry::new();
        let entered = gate.clone();
        registry.register_fn("slow", move |_| {
            let gate = entered.clone();
            async move {
                gate.arrive_and_block().await;
                Ok(json!("late"))
            }
        });

        let def = WorkflowBuilder::new("slow")
            .then("Slow", Node::Task(TaskNode::new("Slow", "slow")))
            .build()
            .unwrap();
        let engine = Arc::new(harness(def, registry, EngineConfig::default()));
        let id = engine.create_execution(ExecutionContext::new()).await.unwrap();

        let driver = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.drive(id).await })
        };
        gate.wait_arrived().await;

        // The lease is held while the stage runs
        assert_eq!(engine.drive(id).await.unwrap(), DriveOutcome::Busy);

        assert!(engine.cancel(id, "stop").await.unwrap());
        let outcome = driver.await.unwrap().unwrap();
        assert_eq!(outcome, DriveOutcome::Terminal(ExecutionStatus::Failed));

        let view = engine.get_status(&id).unwrap().unwrap();
        assert_eq!(view.failure.unwrap().kind, FailureKind::Cancelled);
        assert_eq!(view.last_output, None);
    }

    #[tokio::test]
    async fn test_zero_timeout_fails_immediately() {
        let config = EngineConfig {
            execution_timeout_secs: Some(0),
            ..Default::default()
        };
        let engine = harness(wait_then_task(), registry_with("work", json!(1)), config);
        let id = engine.create_execution(ExecutionContext::new()).await.unwrap();

        assert_eq!(
            engine.drive(id).await.unwrap(),
            DriveOutcome::Terminal(ExecutionStatus::Failed)
        );
        let failure = engine.get_status(&id).unwrap().unwrap().failure.unwrap();
        assert_eq!(failure.kind, FailureKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_stage_bounded_by_deadline() {
        let mut registry = TaskRegistry::new();
        registry.register_fn("hang", |_| async {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Ok(json!("never"))
        });
        let def = WorkflowBuilder::new("hang")
            .then("Hang", Node::Task(TaskNode::new("Hang", "hang")))
            .build()
            .unwrap();
        let config = EngineConfig {
            execution_timeout_secs: Some(30),
            ..Default::default()
        };
        let engine = harness(def, registry, config);
        let id = engine.create_execution(ExecutionContext::new()).await.unwrap();

        assert_eq!(
            engine.drive(id).await.unwrap(),
            DriveOutcome::Terminal(ExecutionStatus::Failed)
        );
        let failure = engine.get_status(&id).unwrap().unwrap().failure.unwrap();
        assert_eq!(failure.kind, FailureKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail_execution_with_descriptor() {
        let mut registry = TaskRegistry::new();
        registry.register_fn("flaky", |_| async {
            Err(TaskError::retryable("ServiceException", "throttled"))
        });
        let def = WorkflowBuilder::new("flaky")
            .then(
                "Flaky",
                Node::Task(TaskNode::new("Flaky", "flaky").retry(RetryPolicy {
                    max_attempts: 3,
                    ..Default::default()
                })),
            )
            .build()
            .unwrap();
        let engine = harness(def, registry, EngineConfig::default());
        let id = engine.create_execution(ExecutionContext::new()).await.unwrap();

        assert_eq!(drive_to_end(&engine, id).await, ExecutionStatus::Failed);
        let failure = engine.get_status(&id).unwrap().unwrap().failure.unwrap();
        assert_eq!(failure.kind, FailureKind::Stage);
        assert_eq!(failure.stage.as_deref(), Some("Flaky"));
        assert!(failure.retryable);

        let events = engine.events(id).await.unwrap();
        let attempts = events
            .iter()
            .filter(|e| e.event_type.name() == "stage_started")
            .count();
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_recover_redrives_interrupted_execution() {
        let def = WorkflowBuilder::new("one")
            .then("Work", Node::Task(TaskNode::new("Work", "work").result_key("work")))
            .build()
            .unwrap();
        let engine = Arc::new(harness(def, registry_with("work", json!({"ok": true})), EngineConfig::default()));
        let id = engine.create_execution(ExecutionContext::new()).await.unwrap();

        assert_eq!(engine.recover().await.unwrap(), vec![id]);
        for _ in 0..100 {
            if engine.get_status(&id).unwrap().unwrap().status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let view = engine.get_status(&id).unwrap().unwrap();
        assert_eq!(view.status, ExecutionStatus::Succeeded);
        assert_eq!(view.last_output, Some(json!({"ok": true})));
    }
}
