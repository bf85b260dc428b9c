use crate::error::TaskError;
use crate::events::{Event, EventLog, EventType};
use crate::types::{ExecutionId, RetryPolicy, TaskRef};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Uniform interface for calling an external task.
///
/// The task runs exactly once per `invoke` call; retries are the caller's
/// business.
#[async_trait::async_trait]
pub trait TaskInvoker: Send + Sync {
    async fn invoke(&self, task: &TaskRef, payload: Value) -> Result<Value, TaskError>;
}

/// In-process implementation of a single task
#[async_trait::async_trait]
pub trait TaskHandler: Send + Sync {
    async fn call(&self, payload: Value) -> Result<Value, TaskError>;
}

/// Adapts an async closure into a [`TaskHandler`]
pub struct FnTask<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut> TaskHandler for FnTask<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    async fn call(&self, payload: Value) -> Result<Value, TaskError> {
        (self.0)(payload).await
    }
}

/// Task invoker dispatching by name to registered handlers
#[derive(Default, Clone)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        self.register(name, Arc::new(FnTask(f)));
    }
}

#[async_trait::async_trait]
impl TaskInvoker for TaskRegistry {
    async fn invoke(&self, task: &TaskRef, payload: Value) -> Result<Value, TaskError> {
        let handler = self.handlers.get(&task.0).ok_or_else(|| {
            TaskError::terminal("TaskNotFound", format!("No handler registered for {task}"))
        })?;
        handler.call(payload).await
    }
}

/// Policy and identity of one task call site
#[derive(Debug, Clone, Copy)]
pub struct CallSite<'a> {
    pub stage: &'a str,
    pub task: &'a TaskRef,
    pub retry: &'a RetryPolicy,
    pub check_status_code: bool,
}

/// Successful call and the attempt it succeeded on (1-based)
#[derive(Debug, Clone)]
pub struct Attempted {
    pub output: Value,
    pub attempt: u32,
}

/// Errors reported inside a successful payload: `{"statusCode": 500, ...}`
fn status_code_error(output: &Value) -> Option<TaskError> {
    let code = output.get("statusCode")?.as_u64()?;
    if code < 400 {
        return None;
    }

    let message = output
        .get("message")
        .or_else(|| output.get("body"))
        .map(|m| match m {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| format!("stage returned status code {code}"));

    Some(if code >= 500 {
        TaskError::retryable(format!("StatusCode{code}"), message)
    } else {
        TaskError::terminal(format!("StatusCode{code}"), message)
    })
}

/// Invoker wrapper applying a call site's retry policy, with exponential
/// backoff between attempts
#[derive(Clone)]
pub struct RetryingInvoker {
    invoker: Arc<dyn TaskInvoker>,
    event_log: Arc<dyn EventLog>,
}

impl RetryingInvoker {
    pub fn new(invoker: Arc<dyn TaskInvoker>, event_log: Arc<dyn EventLog>) -> Self {
        Self { invoker, event_log }
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

    pub async fn call(
        &self,
        execution_id: ExecutionId,
        site: CallSite<'_>,
        payload: Value,
    ) -> Result<Attempted, TaskError> {
        let max_attempts = site.retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            self.emit(
                execution_id,
                EventType::StageStarted {
                    stage: site.stage.to_string(),
                    attempt,
                },
            )
            .await;

            let result = match self.invoker.invoke(site.task, payload.clone()).await {
                Ok(output) if site.check_status_code => match status_code_error(&output) {
                    Some(error) => Err(error),
                    None => Ok(output),
                },
                other => other,
            };

            let error = match result {
                Ok(output) => return Ok(Attempted { output, attempt }),
                Err(error) => error,
            };

            let will_retry = error.retryable && attempt < max_attempts;
            self.emit(
                execution_id,
                EventType::StageFailed {
                    stage: site.stage.to_string(),
                    error: error.to_string(),
                    attempt,
                    will_retry,
                },
            )
            .await;

            if !will_retry {
                tracing::error!(
                    "Stage {} failed on attempt {} for execution {}: {}",
                    site.stage,
                    attempt,
                    execution_id,
                    error
                );
                return Err(error);
            }

            let backoff = site.retry.backoff_for_attempt(attempt - 1);
            tracing::warn!(
                "Retrying stage {} after {:?} (attempt {}): {}",
                site.stage,
                backoff,
                attempt + 1,
                error
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }
}
