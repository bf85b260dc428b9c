//! Branch evaluation: ordered predicates over the context, first match wins.
//!
//! Absent or malformed fields never abort an evaluation. They fail to match
//! and are reported as anomalies so the caller can log them.

use crate::context::ExecutionContext;
use crate::error::FailureKind;
use crate::types::StateName;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    StringEquals { path: String, value: String },
    StringIn { path: String, values: Vec<String> },
    IsPresent { path: String },
    Not { predicate: Box<Predicate> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Match,
    NoMatch,
    /// Did not match because the field was absent or not comparable
    Anomaly(String),
}

impl Evaluation {
    pub fn is_match(&self) -> bool {
        matches!(self, Evaluation::Match)
    }
}

fn string_field<'a>(ctx: &'a ExecutionContext, path: &str) -> Result<&'a str, String> {
    match ctx.get(path) {
        None => Err(format!("field {path} is missing")),
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(format!("field {path} is not a string: {other}")),
    }
}

impl Predicate {
    pub fn evaluate(&self, ctx: &ExecutionContext) -> Evaluation {
        match self {
            Predicate::StringEquals { path, value } => match string_field(ctx, path) {
                Ok(s) if s == value => Evaluation::Match,
                Ok(_) => Evaluation::NoMatch,
                Err(detail) => Evaluation::Anomaly(detail),
            },
            Predicate::StringIn { path, values } => match string_field(ctx, path) {
                Ok(s) if values.iter().any(|v| v == s) => Evaluation::Match,
                Ok(_) => Evaluation::NoMatch,
                Err(detail) => Evaluation::Anomaly(detail),
            },
            Predicate::IsPresent { path } => match ctx.get(path) {
                Some(Value::Null) | None => Evaluation::NoMatch,
                Some(_) => Evaluation::Match,
            },
            Predicate::Not { predicate } => match predicate.evaluate(ctx) {
                Evaluation::Match => Evaluation::NoMatch,
                Evaluation::NoMatch => Evaluation::Match,
                anomaly => anomaly,
            },
        }
    }

    pub fn paths(&self) -> Vec<&str> {
        match self {
            Predicate::StringEquals { path, .. }
            | Predicate::StringIn { path, .. }
            | Predicate::IsPresent { path } => vec![path.as_str()],
            Predicate::Not { predicate } => predicate.paths(),
        }
    }
}

/// Continuation selected by a branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Target {
    Goto { state: StateName },
    Succeed,
    Fail { kind: FailureKind, message: String },
}

impl Target {
    pub fn goto(state: impl Into<StateName>) -> Self {
        Self::Goto {
            state: state.into(),
        }
    }

    pub fn fail(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Fail {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Goto { state } => write!(f, "{state}"),
            Target::Succeed => f.write_str("<succeed>"),
            Target::Fail { kind, .. } => write!(f, "<fail: {kind}>"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub predicate: Predicate,
    pub target: Target,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchNode {
    pub choices: Vec<Choice>,
    pub default: Target,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BranchDecision {
    pub target: Target,
    /// Index of the matching choice, `None` for the default
    pub choice: Option<usize>,
    pub anomalies: Vec<String>,
}

pub fn evaluate_branch(node: &BranchNode, ctx: &ExecutionContext) -> BranchDecision {
    let mut anomalies = Vec::new();
    for (index, choice) in node.choices.iter().enumerate() {
        match choice.predicate.evaluate(ctx) {
            Evaluation::Match => {
                return BranchDecision {
                    target: choice.target.clone(),
                    choice: Some(index),
                    anomalies,
                }
            }
            Evaluation::NoMatch => {}
            Evaluation::Anomaly(detail) => anomalies.push(detail),
        }
    }

    BranchDecision {
        target: node.default.clone(),
        choice: None,
        anomalies,
    }
}
