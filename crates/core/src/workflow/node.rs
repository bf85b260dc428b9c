//! Workflow definitions: a closed set of node kinds composed into named
//! top-level states.

use super::branch::BranchNode;
use super::map::MapFailurePolicy;
use crate::context::{ContextError, ExecutionContext};
use crate::error::{DefinitionError, FailureKind};
use crate::types::{RetryPolicy, StateName, TaskRef};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

/// Where a payload field takes its value from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ValueSource {
    Literal { value: Value },
    Path { path: String },
    /// The whole context
    Context,
    /// `{}` placeholders filled from the given paths, in order
    Format { template: String, args: Vec<String> },
}

impl ValueSource {
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal {
            value: value.into(),
        }
    }

    pub fn path(path: impl Into<String>) -> Self {
        Self::Path { path: path.into() }
    }

    pub fn format(template: impl Into<String>, args: &[&str]) -> Self {
        Self::Format {
            template: template.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn resolve(&self, ctx: &ExecutionContext) -> Result<Value, ContextError> {
        match self {
            ValueSource::Literal { value } => Ok(value.clone()),
            ValueSource::Path { path } => ctx.require(path).cloned(),
            ValueSource::Context => Ok(ctx.as_value().clone()),
            ValueSource::Format { template, args } => {
                let mut pieces = template.split("{}");
                let mut out = pieces.next().unwrap_or_default().to_string();
                for (arg, piece) in args.iter().zip(pieces) {
                    match ctx.require(arg)? {
                        Value::String(s) => out.push_str(s),
                        other => out.push_str(&other.to_string()),
                    }
                    out.push_str(piece);
                }
                Ok(Value::String(out))
            }
        }
    }

    pub fn required_paths(&self) -> Vec<&str> {
        match self {
            ValueSource::Path { path } => vec![path.as_str()],
            ValueSource::Format { args, .. } => args.iter().map(String::as_str).collect(),
            ValueSource::Literal { .. } | ValueSource::Context => Vec::new(),
        }
    }
}

/// Invocation of an external task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    /// Stage name used in events and failure descriptors
    pub name: String,
    pub task: TaskRef,
    /// Payload fields; when empty the whole context is sent
    #[serde(default)]
    pub parameters: BTreeMap<String, ValueSource>,
    /// Context key the output is written under
    #[serde(default)]
    pub result_key: Option<String>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_failure_kind")]
    pub failure_kind: FailureKind,
    /// Treat `{"statusCode": 4xx/5xx}` outputs as failures
    #[serde(default)]
    pub check_status_code: bool,
}

fn default_failure_kind() -> FailureKind {
    FailureKind::Stage
}

impl TaskNode {
    pub fn new(name: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            task: TaskRef::new(task),
            parameters: BTreeMap::new(),
            result_key: None,
            retry: RetryPolicy::default(),
            failure_kind: FailureKind::Stage,
            check_status_code: false,
        }
    }

    pub fn param(mut self, key: impl Into<String>, source: ValueSource) -> Self {
        self.parameters.insert(key.into(), source);
        self
    }

    pub fn result_key(mut self, key: impl Into<String>) -> Self {
        self.result_key = Some(key.into());
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn failure_kind(mut self, kind: FailureKind) -> Self {
        self.failure_kind = kind;
        self
    }

    pub fn check_status_code(mut self) -> Self {
        self.check_status_code = true;
        self
    }

    /// Resolve the payload, failing if any required input is absent
    pub fn build_payload(&self, ctx: &ExecutionContext) -> Result<Value, ContextError> {
        if self.parameters.is_empty() {
            return Ok(ctx.as_value().clone());
        }

        let mut payload = Map::new();
        for (key, source) in &self.parameters {
            payload.insert(key.clone(), source.resolve(ctx)?);
        }
        Ok(Value::Object(payload))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitNode {
    pub duration_ms: u64,
}

impl WaitNode {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Independent sub-workflows run concurrently on copies of the context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelNode {
    pub name: String,
    pub branches: Vec<Node>,
    #[serde(default)]
    pub result_key: Option<String>,
}

/// One sub-workflow run per element of a context array, one at a time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapNode {
    pub name: String,
    pub items_path: String,
    pub iterator: Box<Node>,
    #[serde(default)]
    pub result_key: Option<String>,
    /// Falls back to the engine default when unset
    #[serde(default)]
    pub failure_policy: Option<MapFailurePolicy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Node {
    Task(TaskNode),
    Wait(WaitNode),
    Branch(BranchNode),
    Parallel(ParallelNode),
    Map(MapNode),
    Sequence { steps: Vec<Node> },
}

impl Node {
    pub fn kind(&self) -> &'static str {
        match self {
            Node::Task(_) => "task",
            Node::Wait(_) => "wait",
            Node::Branch(_) => "branch",
            Node::Parallel(_) => "parallel",
            Node::Map(_) => "map",
            Node::Sequence { .. } => "sequence",
        }
    }
}

/// A named top-level state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSpec {
    pub name: StateName,
    pub node: Node,
    /// Ignored for branch states; `None` ends the execution successfully
    #[serde(default)]
    pub next: Option<StateName>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub start_at: StateName,
    pub states: Vec<StateSpec>,
}

impl WorkflowDefinition {
    pub fn state(&self, name: &StateName) -> Option<&StateSpec> {
        self.states.iter().find(|s| &s.name == name)
    }

    pub fn validate(&self) -> Result<(), DefinitionError> {
        super::graph::WorkflowGraph::from_definition(self).map(|_| ())
    }
}

/// Builds a workflow definition from a chain of states
pub struct WorkflowBuilder {
    name: String,
    start_at: Option<StateName>,
    states: Vec<StateSpec>,
    // State the next `then` links from
    link_from: Option<usize>,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start_at: None,
            states: Vec::new(),
            link_from: None,
        }
    }

    pub fn start_at(mut self, state: impl Into<StateName>) -> Self {
        self.start_at = Some(state.into());
        self
    }

    /// Append a state and link the previous one to it
    pub fn then(mut self, name: impl Into<StateName>, node: Node) -> Self {
        let name = name.into();
        if let Some(prev) = self.link_from.and_then(|i| self.states.get_mut(i)) {
            if prev.next.is_none() && !matches!(prev.node, Node::Branch(_)) {
                prev.next = Some(name.clone());
            }
        }
        self.push(name, node)
    }

    /// Append a state without linking to it; branches are expected to
    /// target it.
    pub fn state(self, name: impl Into<StateName>, node: Node) -> Self {
        let name = name.into();
        self.push(name, node)
    }

    /// Append pre-linked states, e.g. from a pattern builder
    pub fn extend(mut self, states: Vec<StateSpec>) -> Self {
        let Some(first) = states.first() else {
            return self;
        };
        let first = first.name.clone();
        if let Some(prev) = self.link_from.and_then(|i| self.states.get_mut(i)) {
            if prev.next.is_none() && !matches!(prev.node, Node::Branch(_)) {
                prev.next = Some(first.clone());
            }
        }
        if self.start_at.is_none() {
            self.start_at = Some(first);
        }
        self.states.extend(states);
        self.link_from = Some(self.states.len() - 1);
        self
    }

    /// Set an explicit transition
    pub fn next(mut self, from: impl Into<StateName>, to: impl Into<StateName>) -> Self {
        let from = from.into();
        if let Some(state) = self.states.iter_mut().find(|s| s.name == from) {
            state.next = Some(to.into());
        }
        self
    }

    fn push(mut self, name: StateName, node: Node) -> Self {
        if self.start_at.is_none() {
            self.start_at = Some(name.clone());
        }
        self.states.push(StateSpec {
            name,
            node,
            next: None,
        });
        self.link_from = Some(self.states.len() - 1);
        self
    }

    pub fn build(self) -> Result<WorkflowDefinition, DefinitionError> {
        let start_at = self.start_at.ok_or(DefinitionError::Empty)?;
        let definition = WorkflowDefinition {
            name: self.name,
            start_at,
            states: self.states,
        };
        definition.validate()?;
        Ok(definition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::branch::{Choice, Predicate, Target};
    use serde_json::json;

    fn task(name: &str) -> Node {
        Node::Task(TaskNode::new(name, name))
    }

    #[test]
    fn test_builder_links_states_in_order() {
        let def = WorkflowBuilder::new("linear")
            .then("A", task("a"))
            .then("B", task("b"))
            .then("C", task("c"))
            .build()
            .unwrap();

        assert_eq!(def.start_at, StateName::new("A"));
        assert_eq!(def.state(&"A".into()).unwrap().next, Some("B".into()));
        assert_eq!(def.state(&"B".into()).unwrap().next, Some("C".into()));
        assert_eq!(def.state(&"C".into()).unwrap().next, None);
    }

    #[test]
    fn test_builder_does_not_link_from_branch() {
        let def = WorkflowBuilder::new("routed")
            .then("Check", task("check"))
            .then(
                "Route",
                Node::Branch(BranchNode {
                    choices: vec![Choice {
                        predicate: Predicate::StringEquals {
                            path: "$.status".to_string(),
                            value: "OK".to_string(),
                        },
                        target: Target::goto("Done"),
                    }],
                    default: Target::Succeed,
                }),
            )
            .state("Done", task("done"))
            .build()
            .unwrap();

        assert_eq!(def.state(&"Route".into()).unwrap().next, None);
        assert_eq!(def.states.len(), 3);
    }

    #[test]
    fn test_payload_building() {
        let ctx = ExecutionContext::from_seed(json!({
            "bucket": {"name": "in"},
            "object": {"key": "video1.mp4"},
        }))
        .unwrap();

        let node = TaskNode::new("Submit", "submit-job")
            .param(
                "sourceUri",
                ValueSource::format("s3://{}/{}", &["$.bucket.name", "$.object.key"]),
            )
            .param("projectRef", ValueSource::literal("proj"));

        assert_eq!(
            node.build_payload(&ctx).unwrap(),
            json!({"sourceUri": "s3://in/video1.mp4", "projectRef": "proj"})
        );

        let whole = TaskNode::new("All", "all");
        assert_eq!(whole.build_payload(&ctx).unwrap(), *ctx.as_value());
    }

    #[test]
    fn test_missing_input_rejected_at_entry() {
        let node = TaskNode::new("Status", "job-status")
            .param("invocationHandle", ValueSource::path("$.submission.invocationHandle"));

        assert_eq!(
            node.build_payload(&ExecutionContext::new()),
            Err(ContextError::Missing(
                "$.submission.invocationHandle".to_string()
            ))
        );
    }

    #[test]
    fn test_node_serialization() {
        let node = Node::Sequence {
            steps: vec![Node::Wait(WaitNode::new(Duration::from_secs(2)))],
        };
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["type"], "sequence");
        assert_eq!(json["steps"][0]["duration_ms"], 2000);

        let parsed: Node = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, node);
    }
}
