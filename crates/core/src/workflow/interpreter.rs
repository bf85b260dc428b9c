use super::invoker::{CallSite, RetryingInvoker};
use super::map::{run_map_sequential, MapFailurePolicy};
use super::node::{MapNode, Node, ParallelNode, TaskNode};
use super::parallel::run_parallel;
use crate::context::ExecutionContext;
use crate::error::{Failure, FailureKind};
use crate::events::{Event, EventLog, EventType};
use crate::storage::BlobStore;
use crate::types::{BlobHash, ExecutionId};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type NodeFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, Failure>> + Send + 'a>>;

/// Evaluates the body of a non-suspending state (task, parallel, map,
/// sequence) against an execution context
#[derive(Clone)]
pub struct Interpreter {
    execution_id: ExecutionId,
    invoker: RetryingInvoker,
    event_log: Arc<dyn EventLog>,
    blob_store: Arc<dyn BlobStore>,
    map_policy: MapFailurePolicy,
}

impl Interpreter {
    pub fn new(
        execution_id: ExecutionId,
        invoker: RetryingInvoker,
        event_log: Arc<dyn EventLog>,
        blob_store: Arc<dyn BlobStore>,
        map_policy: MapFailurePolicy,
    ) -> Self {
        Self {
            execution_id,
            invoker,
            event_log,
            blob_store,
            map_policy,
        }
    }

    async fn emit(&self, event_type: EventType) {
        if let Err(e) = self
            .event_log
            .append(Event::new(self.execution_id, event_type))
            .await
        {
            tracing::error!(
                "Failed to append event for execution {}: {:#}",
                self.execution_id,
                e
            );
        }
    }

    /// Evaluate a node, writing keyed results into `ctx`
    pub fn eval<'a>(&'a self, node: &'a Node, ctx: &'a mut ExecutionContext) -> NodeFuture<'a> {
        Box::pin(async move {
            match node {
                Node::Task(task) => self.run_task(task, ctx).await,
                Node::Parallel(parallel) => self.run_parallel(parallel, ctx).await,
                Node::Map(map) => self.run_map(map, ctx).await,
                Node::Sequence { steps } => {
                    let mut output = Value::Null;
                    for step in steps {
                        output = self.eval(step, ctx).await?;
                    }
                    Ok(output)
                }
                Node::Wait(_) | Node::Branch(_) => Err(Failure::new(
                    FailureKind::Stage,
                    format!("{} node cannot run inside a sub-workflow", node.kind()),
                )),
            }
        })
    }

    async fn run_task(&self, task: &TaskNode, ctx: &mut ExecutionContext) -> Result<Value, Failure> {
        // Inputs are checked before anything is invoked
        let payload = task.build_payload(ctx).map_err(|e| {
            Failure::new(task.failure_kind, format!("invalid input: {e}")).with_stage(&task.name)
        })?;

        let started = std::time::Instant::now();
        let site = CallSite {
            stage: &task.name,
            task: &task.task,
            retry: &task.retry,
            check_status_code: task.check_status_code,
        };
        let attempted = self
            .invoker
            .call(self.execution_id, site, payload)
            .await
            .map_err(|e| Failure::from_task_error(task.failure_kind, &task.name, e))?;

        let output_hash = match self.blob_store.put_json(&attempted.output).await {
            Ok(hash) => hash,
            Err(e) => {
                tracing::warn!("Failed to store output of stage {}: {:#}", task.name, e);
                BlobHash::from_bytes(attempted.output.to_string().as_bytes())
            }
        };
        self.emit(EventType::StageCompleted {
            stage: task.name.clone(),
            attempt: attempted.attempt,
            duration_ms: started.elapsed().as_millis() as u64,
            output_hash,
        })
        .await;

        if let Some(key) = &task.result_key {
            ctx.insert(key.clone(), attempted.output.clone());
        }
        Ok(attempted.output)
    }

    async fn run_parallel(
        &self,
        parallel: &ParallelNode,
        ctx: &mut ExecutionContext,
    ) -> Result<Value, Failure> {
        let outputs = run_parallel(
            &parallel.name,
            ctx,
            parallel.branches.len(),
            |index, mut branch_ctx| {
                let interpreter = self.clone();
                let branch = parallel.branches[index].clone();
                async move { interpreter.eval(&branch, &mut branch_ctx).await }
            },
        )
        .await?;

        let output = Value::Array(outputs);
        if let Some(key) = &parallel.result_key {
            ctx.insert(key.clone(), output.clone());
        }
        Ok(output)
    }

    async fn run_map(&self, map: &MapNode, ctx: &mut ExecutionContext) -> Result<Value, Failure> {
        let items = match ctx.get(&map.items_path) {
            Some(Value::Array(items)) => items.clone(),
            Some(_) => {
                return Err(Failure::new(
                    FailureKind::Stage,
                    format!("items field {} is not an array", map.items_path),
                )
                .with_stage(&map.name))
            }
            None => {
                return Err(Failure::new(
                    FailureKind::Stage,
                    format!("items field {} is missing", map.items_path),
                )
                .with_stage(&map.name))
            }
        };

        let policy = map.failure_policy.unwrap_or(self.map_policy);
        tracing::debug!("Map {} over {} items ({:?})", map.name, items.len(), policy);

        let outputs = run_map_sequential(&map.name, items, policy, |index, mut item_ctx| {
            let iterator = &*map.iterator;
            async move {
                let result = self.eval(iterator, &mut item_ctx).await;
                if let Err(failure) = &result {
                    self.emit(EventType::MapItemFailed {
                        stage: map.name.clone(),
                        index,
                        error: failure.to_string(),
                    })
                    .await;
                }
                result
            }
        })
        .await?;

        let output = Value::Array(outputs);
        if let Some(key) = &map.result_key {
            ctx.insert(key.clone(), output.clone());
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use crate::storage::{InMemoryEventLog, ObjectStoreBlobStore};
    use crate::types::RetryPolicy;
    use crate::workflow::invoker::TaskRegistry;
    use crate::workflow::node::ValueSource;
    use serde_json::json;

    fn interpreter(registry: TaskRegistry) -> (Interpreter, Arc<InMemoryEventLog>, ExecutionId) {
        let log = Arc::new(InMemoryEventLog::new());
        let id = ExecutionId::new();
        let interpreter = Interpreter::new(
            id,
            RetryingInvoker::new(Arc::new(registry), log.clone()),
            log.clone(),
            Arc::new(ObjectStoreBlobStore::in_memory()),
            MapFailurePolicy::AbortAll,
        );
        (interpreter, log, id)
    }

    fn echo_registry() -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry.register_fn("echo", |payload| async move { Ok(payload) });
        registry.register_fn("fail", |_| async {
            Err(TaskError::terminal("Unhandled", "boom"))
        });
        registry
    }

    #[tokio::test]
    async fn test_task_output_written_under_result_key() {
        let (interp, log, id) = interpreter(echo_registry());
        let mut ctx = ExecutionContext::from_seed(json!({"object": {"key": "v.mp4"}})).unwrap();
        let node = Node::Task(
            TaskNode::new("Echo", "echo")
                .param("key", ValueSource::path("$.object.key"))
                .result_key("echoed"),
        );

        let output = interp.eval(&node, &mut ctx).await.unwrap();
        assert_eq!(output, json!({"key": "v.mp4"}));
        assert_eq!(ctx.get("$.echoed.key"), Some(&json!("v.mp4")));
        assert_eq!(ctx.get("$.object.key"), Some(&json!("v.mp4")));

        let events = log.get_execution_events(id).await.unwrap();
        assert_eq!(events.last().unwrap().event_type.name(), "stage_completed");
    }

    #[tokio::test]
    async fn test_missing_input_fails_before_invocation() {
        let (interp, log, id) = interpreter(echo_registry());
        let node = Node::Task(
            TaskNode::new("Echo", "echo")
                .param("key", ValueSource::path("$.object.key"))
                .failure_kind(FailureKind::Submission),
        );

        let err = interp
            .eval(&node, &mut ExecutionContext::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Submission);
        assert_eq!(err.stage.as_deref(), Some("Echo"));
        assert!(log.get_execution_events(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_map_inside_parallel() {
        let (interp, _, _) = interpreter(echo_registry());
        let mut ctx = ExecutionContext::from_seed(json!({"segments": [1, 2]})).unwrap();
        let node = Node::Parallel(ParallelNode {
            name: "Fan".to_string(),
            branches: vec![
                Node::Map(MapNode {
                    name: "Each".to_string(),
                    items_path: "$.segments".to_string(),
                    iterator: Box::new(Node::Task(
                        TaskNode::new("Item", "echo").param("n", ValueSource::path("$.item")),
                    )),
                    result_key: None,
                    failure_policy: None,
                }),
                Node::Task(TaskNode::new("Whole", "echo").param("all", ValueSource::Context)),
            ],
            result_key: Some("fan".to_string()),
        });

        let output = interp.eval(&node, &mut ctx).await.unwrap();
        assert_eq!(output[0], json!([{"n": 1}, {"n": 2}]));
        assert_eq!(output[1], json!({"all": {"segments": [1, 2]}}));
        assert_eq!(ctx.get("$.fan[0][1].n"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_map_items_must_be_an_array() {
        let (interp, _, _) = interpreter(echo_registry());
        let node = Node::Map(MapNode {
            name: "Each".to_string(),
            items_path: "$.segments".to_string(),
            iterator: Box::new(Node::Task(TaskNode::new("Item", "echo"))),
            result_key: None,
            failure_policy: None,
        });

        let mut ctx = ExecutionContext::from_seed(json!({"segments": "nope"})).unwrap();
        let err = interp.eval(&node, &mut ctx).await.unwrap_err();
        assert!(err.message.contains("not an array"));

        let err = interp
            .eval(&node, &mut ExecutionContext::new())
            .await
            .unwrap_err();
        assert!(err.message.contains("missing"));
    }

    #[tokio::test]
    async fn test_map_item_failure_is_recorded() {
        let (interp, log, id) = interpreter(echo_registry());
        let node = Node::Map(MapNode {
            name: "Each".to_string(),
            items_path: "$.segments".to_string(),
            iterator: Box::new(Node::Task(
                TaskNode::new("Item", "fail").retry(RetryPolicy::none()),
            )),
            result_key: Some("refined".to_string()),
            failure_policy: Some(MapFailurePolicy::CollectPartial),
        });
        let mut ctx = ExecutionContext::from_seed(json!({"segments": ["a"]})).unwrap();

        let output = interp.eval(&node, &mut ctx).await.unwrap();
        assert_eq!(output[0]["index"], 0);
        assert_eq!(output[0]["failure"]["stage"], "Item");

        let events = log.get_execution_events(id).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.event_type.name() == "map_item_failed"));
    }
}
