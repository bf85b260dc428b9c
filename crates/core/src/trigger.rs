//! Turns storage "object created" notifications into execution seeds.

use crate::context::ExecutionContext;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const OBJECT_CREATED: &str = "Object Created";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TriggerError {
    #[error("Malformed notification: {0}")]
    Malformed(String),

    #[error("Unsupported event type: {0}")]
    UnsupportedEvent(String),

    #[error("Bucket {0} is not watched")]
    IgnoredBucket(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketRef {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub key: String,
}

/// `{bucket: {name}, object: {key}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectCreatedNotification {
    pub bucket: BucketRef,
    pub object: ObjectRef,
}

impl ObjectCreatedNotification {
    /// Accepts either the bare notification or an EventBridge envelope
    /// carrying it under `detail`.
    pub fn from_value(value: &Value) -> Result<Self, TriggerError> {
        let body = match value.get("detail") {
            Some(detail) => {
                if let Some(kind) = value.get("detail-type").and_then(Value::as_str) {
                    if kind != OBJECT_CREATED {
                        return Err(TriggerError::UnsupportedEvent(kind.to_string()));
                    }
                }
                detail
            }
            None => value,
        };

        let notification: Self = serde_json::from_value(body.clone())
            .map_err(|e| TriggerError::Malformed(e.to_string()))?;

        if notification.bucket.name.is_empty() || notification.object.key.is_empty() {
            return Err(TriggerError::Malformed(
                "bucket name and object key must be non-empty".to_string(),
            ));
        }
        Ok(notification)
    }

    pub fn source_uri(&self) -> String {
        format!("s3://{}/{}", self.bucket.name, self.object.key)
    }

    /// The seed context for a new execution
    pub fn into_seed(self) -> ExecutionContext {
        let mut ctx = ExecutionContext::new();
        ctx.insert("bucket", serde_json::json!({ "name": self.bucket.name }));
        ctx.insert("object", serde_json::json!({ "key": self.object.key }));
        ctx
    }
}

/// Restricts which buckets may start executions
#[derive(Debug, Clone, Default)]
pub struct TriggerFilter {
    input_bucket: Option<String>,
}

impl TriggerFilter {
    pub fn new(input_bucket: Option<String>) -> Self {
        Self { input_bucket }
    }

    pub fn accept(&self, value: &Value) -> Result<ObjectCreatedNotification, TriggerError> {
        let notification = ObjectCreatedNotification::from_value(value)?;
        match &self.input_bucket {
            Some(bucket) if *bucket != notification.bucket.name => {
                Err(TriggerError::IgnoredBucket(notification.bucket.name))
            }
            _ => Ok(notification),
        }
    }
}
