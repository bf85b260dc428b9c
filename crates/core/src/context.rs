//! Execution context: the JSON payload threaded through every state.
//!
//! Stages never replace the context. Each one writes its result under its
//! own key, so later stages always see what earlier stages left behind.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContextError {
    #[error("Seed payload must be a JSON object")]
    NotAnObject,

    #[error("Invalid field path: {0}")]
    InvalidPath(String),

    #[error("Required field {0} is missing")]
    Missing(String),
}

/// One segment of a field path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Parsed field path such as `$.job_status.outputUri` or `$.results[0]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    segments: Vec<PathSegment>,
}

impl FieldPath {
    pub fn parse(path: &str) -> Result<Self, ContextError> {
        let invalid = || ContextError::InvalidPath(path.to_string());
        let rest = path.strip_prefix('$').ok_or_else(invalid)?;

        let mut segments = Vec::new();
        let mut chars = rest.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '.' => {
                    let mut key = String::new();
                    while let Some(&next) = chars.peek() {
                        if next == '.' || next == '[' {
                            break;
                        }
                        key.push(next);
                        chars.next();
                    }
                    if key.is_empty() {
                        return Err(invalid());
                    }
                    segments.push(PathSegment::Key(key));
                }
                '[' => {
                    let mut digits = String::new();
                    for next in chars.by_ref() {
                        if next == ']' {
                            break;
                        }
                        digits.push(next);
                    }
                    let index = digits.parse::<usize>().map_err(|_| invalid())?;
                    segments.push(PathSegment::Index(index));
                }
                _ => return Err(invalid()),
            }
        }

        Ok(Self { segments })
    }

    pub fn resolve<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        self.segments
            .iter()
            .try_fold(value, |current, segment| match segment {
                PathSegment::Key(key) => current.get(key.as_str()),
                PathSegment::Index(index) => current.get(*index),
            })
    }
}

/// Mutable payload owned by a single execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionContext(Value);

impl ExecutionContext {
    pub fn new() -> Self {
        Self(Value::Object(Map::new()))
    }

    pub fn from_seed(seed: Value) -> Result<Self, ContextError> {
        match seed {
            Value::Object(_) => Ok(Self(seed)),
            _ => Err(ContextError::NotAnObject),
        }
    }

    /// Context for one iteration of a map: `{"item": ..., "index": ...}`
    pub fn for_item(index: usize, item: Value) -> Self {
        let mut map = Map::new();
        map.insert("item".to_string(), item);
        map.insert("index".to_string(), Value::from(index));
        Self(Value::Object(map))
    }

    /// Look up a field; malformed paths resolve to nothing.
    pub fn get(&self, path: &str) -> Option<&Value> {
        FieldPath::parse(path).ok()?.resolve(&self.0)
    }

    pub fn require(&self, path: &str) -> Result<&Value, ContextError> {
        let parsed = FieldPath::parse(path)?;
        parsed
            .resolve(&self.0)
            .ok_or_else(|| ContextError::Missing(path.to_string()))
    }

    /// Write a stage result under its namespace key
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        if !self.0.is_object() {
            self.0 = Value::Object(Map::new());
        }
        if let Value::Object(map) = &mut self.0 {
            map.insert(key.into(), value);
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.get(key).is_some()
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_path_resolution() {
        let ctx = ExecutionContext::from_seed(json!({
            "bucket": {"name": "in"},
            "results": [{"id": 1}, {"id": 2}],
        }))
        .unwrap();

        assert_eq!(ctx.get("$.bucket.name"), Some(&json!("in")));
        assert_eq!(ctx.get("$.results[1].id"), Some(&json!(2)));
        assert_eq!(ctx.get("$.results[5]"), None);
        assert_eq!(ctx.get("$.missing.field"), None);
        assert_eq!(ctx.get("$"), Some(ctx.as_value()));
    }

    #[test]
    fn test_malformed_paths() {
        for path in ["bucket.name", "$.", "$..a", "$.a[x]", "$a"] {
            assert!(FieldPath::parse(path).is_err(), "{path} should be rejected");
        }

        let ctx = ExecutionContext::new();
        assert_eq!(ctx.get("not a path"), None);
        assert!(matches!(
            ctx.require("$.a"),
            Err(ContextError::Missing(p)) if p == "$.a"
        ));
    }

    #[test]
    fn test_insert_is_additive() {
        let mut ctx = ExecutionContext::from_seed(json!({"object": {"key": "video1.mp4"}})).unwrap();
        ctx.insert("submission", json!({"invocationHandle": "H1"}));
        ctx.insert("job_status", json!({"status": "RUNNING"}));

        assert_eq!(ctx.get("$.object.key"), Some(&json!("video1.mp4")));
        assert_eq!(ctx.get("$.submission.invocationHandle"), Some(&json!("H1")));
        assert!(ctx.contains_key("job_status"));
    }

    #[test]
    fn test_seed_must_be_object() {
        assert_eq!(
            ExecutionContext::from_seed(json!([1, 2])),
            Err(ContextError::NotAnObject)
        );

        let item = ExecutionContext::for_item(3, json!({"id": 1}));
        assert_eq!(item.get("$.index"), Some(&json!(3)));
        assert_eq!(item.get("$.item.id"), Some(&json!(1)));
    }
}
