//! Task invoker that POSTs the payload as JSON to a configured endpoint per
//! task and returns the JSON response body.

use crate::config::TaskEndpoint;
use anyhow::{Context, Result};
use mediaflow_core::error::TaskError;
use mediaflow_core::types::TaskRef;
use mediaflow_core::workflow::TaskInvoker;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

pub struct HttpTaskInvoker {
    client: Client,
    endpoints: HashMap<String, TaskEndpoint>,
}

impl HttpTaskInvoker {
    pub fn new(endpoints: HashMap<String, TaskEndpoint>) -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, endpoints })
    }

    pub fn has_endpoint(&self, task: &str) -> bool {
        self.endpoints.contains_key(task)
    }
}

/// Throttling and server errors are worth retrying, other client errors are
/// not
fn classify_status(code: u16, body: String) -> TaskError {
    let error_type = format!("Http{code}");
    if code == 429 || code >= 500 {
        TaskError::retryable(error_type, body)
    } else {
        TaskError::terminal(error_type, body)
    }
}

fn classify_transport(error: reqwest::Error) -> TaskError {
    if error.is_timeout() {
        TaskError::retryable("Timeout", error.to_string())
    } else if error.is_connect() {
        TaskError::retryable("ConnectionFailed", error.to_string())
    } else {
        TaskError::terminal("TransportError", error.to_string())
    }
}

#[async_trait::async_trait]
impl TaskInvoker for HttpTaskInvoker {
    async fn invoke(&self, task: &TaskRef, payload: Value) -> Result<Value, TaskError> {
        let endpoint = self.endpoints.get(&task.0).ok_or_else(|| {
            TaskError::terminal("TaskNotFound", format!("No endpoint configured for {task}"))
        })?;
        debug!(task = %task, url = %endpoint.url, "Invoking task");

        let response = self
            .client
            .post(&endpoint.url)
            .timeout(endpoint.timeout())
            .json(&payload)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(task = %task, status = status.as_u16(), "Task endpoint returned an error");
            return Err(classify_status(status.as_u16(), body));
        }

        let body = response.bytes().await.map_err(classify_transport)?;
        if body.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&body)
            .map_err(|e| TaskError::terminal("InvalidResponse", e.to_string()))
    }
}
