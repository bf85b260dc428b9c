//! The poll-wait controller: submit a job, wait, check its status, and route.
//!
//! The controller is not a loop. It expands into four top-level states, so
//! the back-edge (route -> wait) runs through the engine's durable wait and
//! survives restarts:
//!
//! ```text
//! submit -> wait -> check -> route --SUCCESS--> on_success
//!             ^                |----FAILURE--> fail
//!             +----otherwise---+
//! ```

use super::branch::{BranchNode, Choice, Predicate, Target};
use super::node::{Node, StateSpec, TaskNode, WaitNode};
use crate::config::JobLabels;
use crate::error::FailureKind;
use crate::types::{ExecutionRecord, ExecutionStatus, InvocationHandle, JobStatus, StateName};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PollPhase {
    Submitting,
    Waiting,
    Checking,
    Succeeded,
    Failed,
}

/// Snapshot of an execution's progress through the poll loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollProgress {
    pub phase: PollPhase,
    pub handle: Option<InvocationHandle>,
    /// Status checks issued so far
    pub checks: u32,
    /// Waits entered, including the settle wait after submission
    pub waits: u32,
    /// Waits entered because a check found the job still running
    pub back_edge_waits: u32,
    pub last_status: Option<String>,
}

/// Names and field locations of an expanded poll-wait controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollLoop {
    pub submit: StateName,
    pub wait: StateName,
    pub check: StateName,
    pub route: StateName,
    pub status_path: String,
    pub handle_path: String,
    pub labels: JobLabels,
}

impl PollLoop {
    fn last_status<'a>(&self, record: &'a ExecutionRecord) -> Option<&'a str> {
        if record.visits_of(&self.check) == 0 {
            return None;
        }
        record.context.get(&self.status_path)?.as_str()
    }

    pub fn phase(&self, record: &ExecutionRecord) -> PollPhase {
        match self.last_status(record).map(|s| self.labels.classify(s)) {
            Some(JobStatus::Success) => return PollPhase::Succeeded,
            Some(JobStatus::Failure) => return PollPhase::Failed,
            _ => {}
        }
        if record.status == ExecutionStatus::Failed {
            return PollPhase::Failed;
        }

        let cursor = &record.cursor;
        if *cursor == self.submit {
            PollPhase::Submitting
        } else if *cursor == self.wait {
            PollPhase::Waiting
        } else if *cursor == self.check || *cursor == self.route {
            PollPhase::Checking
        } else {
            PollPhase::Succeeded
        }
    }

    pub fn progress(&self, record: &ExecutionRecord) -> PollProgress {
        let waits = record.visits_of(&self.wait);
        PollProgress {
            phase: self.phase(record),
            handle: record
                .context
                .get(&self.handle_path)
                .and_then(|h| h.as_str())
                .map(|h| InvocationHandle(h.to_string())),
            checks: record.visits_of(&self.check),
            waits,
            back_edge_waits: waits.saturating_sub(1),
            last_status: self.last_status(record).map(str::to_string),
        }
    }
}

/// Expands a poll-wait controller into workflow states
pub struct PollWaitBuilder {
    submit: TaskNode,
    check: TaskNode,
    on_success: StateName,
    names: [StateName; 4],
    interval: Duration,
    status_path: String,
    handle_path: String,
    labels: JobLabels,
}

impl PollWaitBuilder {
    pub fn new(submit: TaskNode, check: TaskNode, on_success: impl Into<StateName>) -> Self {
        Self {
            submit,
            check,
            on_success: on_success.into(),
            names: [
                StateName::new("Submit"),
                StateName::new("Wait"),
                StateName::new("CheckStatus"),
                StateName::new("Route"),
            ],
            interval: Duration::from_secs(120),
            status_path: "$.status".to_string(),
            handle_path: "$.invocationHandle".to_string(),
            labels: JobLabels::default(),
        }
    }

    pub fn state_names(
        mut self,
        submit: impl Into<StateName>,
        wait: impl Into<StateName>,
        check: impl Into<StateName>,
        route: impl Into<StateName>,
    ) -> Self {
        self.names = [submit.into(), wait.into(), check.into(), route.into()];
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Context path of the status label written by the check task
    pub fn status_path(mut self, path: impl Into<String>) -> Self {
        self.status_path = path.into();
        self
    }

    /// Context path of the handle written by the submit task
    pub fn handle_path(mut self, path: impl Into<String>) -> Self {
        self.handle_path = path.into();
        self
    }

    pub fn labels(mut self, labels: JobLabels) -> Self {
        self.labels = labels;
        self
    }

    pub fn build(self) -> (Vec<StateSpec>, PollLoop) {
        let [submit, wait, check, route] = self.names;

        let router = BranchNode {
            choices: vec![
                Choice {
                    predicate: Predicate::StringEquals {
                        path: self.status_path.clone(),
                        value: self.labels.success.clone(),
                    },
                    target: Target::Goto {
                        state: self.on_success,
                    },
                },
                Choice {
                    predicate: Predicate::StringIn {
                        path: self.status_path.clone(),
                        values: self.labels.failure.clone(),
                    },
                    target: Target::fail(FailureKind::Poll, "extraction job reported failure"),
                },
            ],
            default: Target::Goto {
                state: wait.clone(),
            },
        };

        let states = vec![
            StateSpec {
                name: submit.clone(),
                node: Node::Task(self.submit),
                next: Some(wait.clone()),
            },
            StateSpec {
                name: wait.clone(),
                node: Node::Wait(WaitNode::new(self.interval)),
                next: Some(check.clone()),
            },
            StateSpec {
                name: check.clone(),
                node: Node::Task(self.check),
                next: Some(route.clone()),
            },
            StateSpec {
                name: route.clone(),
                node: Node::Branch(router),
                next: None,
            },
        ];

        let poll = PollLoop {
            submit,
            wait,
            check,
            route,
            status_path: self.status_path,
            handle_path: self.handle_path,
            labels: self.labels,
        };
        (states, poll)
    }
}
