//! Engine and pipeline settings, loaded from the `[engine]` and `[pipeline]`
//! sections of the server configuration file.

use crate::types::{JobStatus, RetryPolicy};
use crate::workflow::map::MapFailurePolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Fixed delay between status checks
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Hard bound on an execution's lifetime; `None` disables it
    #[serde(default = "default_execution_timeout_secs")]
    pub execution_timeout_secs: Option<u64>,

    /// How often the wake scheduler looks for due executions
    #[serde(default = "default_scheduler_tick_ms")]
    pub scheduler_tick_ms: u64,

    /// Retry policy for post-processing stages
    #[serde(default)]
    pub stage_retry: RetryPolicy,

    /// Retry policy for job submission and status calls
    #[serde(default = "default_service_retry")]
    pub service_retry: RetryPolicy,

    #[serde(default)]
    pub map_failure_policy: MapFailurePolicy,
}

fn default_poll_interval_secs() -> u64 {
    120
}

fn default_execution_timeout_secs() -> Option<u64> {
    Some(4 * 60 * 60)
}

fn default_scheduler_tick_ms() -> u64 {
    1_000
}

fn default_service_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff_ms: 1_000,
        ..Default::default()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            execution_timeout_secs: default_execution_timeout_secs(),
            scheduler_tick_ms: default_scheduler_tick_ms(),
            stage_retry: RetryPolicy::default(),
            service_retry: default_service_retry(),
            map_failure_policy: MapFailurePolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn execution_timeout(&self) -> Option<Duration> {
        self.execution_timeout_secs.map(Duration::from_secs)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms.max(1))
    }
}

/// Status labels reported by the extraction service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLabels {
    #[serde(default = "default_success_label")]
    pub success: String,

    #[serde(default = "default_failure_labels")]
    pub failure: Vec<String>,
}

fn default_success_label() -> String {
    "SUCCESS".to_string()
}

fn default_failure_labels() -> Vec<String> {
    vec!["FAILURE".to_string()]
}

impl Default for JobLabels {
    fn default() -> Self {
        Self {
            success: default_success_label(),
            failure: default_failure_labels(),
        }
    }
}

impl JobLabels {
    /// Anything that is neither the success label nor a failure label is
    /// still running.
    pub fn classify(&self, label: &str) -> JobStatus {
        if label == self.success {
            JobStatus::Success
        } else if self.failure.iter().any(|f| f == label) {
            JobStatus::Failure
        } else {
            JobStatus::Running
        }
    }
}

/// Names under which the pipeline's tasks are registered with the invoker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNames {
    #[serde(default = "default_submit_job")]
    pub submit_job: String,
    #[serde(default = "default_job_status")]
    pub job_status: String,
    #[serde(default = "default_match_segments")]
    pub match_segments: String,
    #[serde(default = "default_refine_transcript")]
    pub refine_transcript: String,
    #[serde(default = "default_take_screenshots")]
    pub take_screenshots: String,
    #[serde(default = "default_create_handouts")]
    pub create_handouts: String,
}

fn default_submit_job() -> String {
    "submit-job".to_string()
}

fn default_job_status() -> String {
    "job-status".to_string()
}

fn default_match_segments() -> String {
    "match-segments".to_string()
}

fn default_refine_transcript() -> String {
    "refine-transcript".to_string()
}

fn default_take_screenshots() -> String {
    "take-screenshots".to_string()
}

fn default_create_handouts() -> String {
    "create-handouts".to_string()
}

impl Default for TaskNames {
    fn default() -> Self {
        Self {
            submit_job: default_submit_job(),
            job_status: default_job_status(),
            match_segments: default_match_segments(),
            refine_transcript: default_refine_transcript(),
            take_screenshots: default_take_screenshots(),
            create_handouts: default_create_handouts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Where the extraction job writes its results
    #[serde(default = "default_output_uri")]
    pub output_uri: String,

    #[serde(default = "default_project_ref")]
    pub project_ref: String,

    /// Only notifications for this bucket start executions
    #[serde(default)]
    pub input_bucket: Option<String>,

    #[serde(default)]
    pub labels: JobLabels,

    #[serde(default)]
    pub tasks: TaskNames,
}

fn default_output_uri() -> String {
    "s3://mediaflow-output/".to_string()
}

fn default_project_ref() -> String {
    "default".to_string()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_uri: default_output_uri(),
            project_ref: default_project_ref(),
            input_bucket: None,
            labels: JobLabels::default(),
            tasks: TaskNames::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();

        assert_eq!(config.poll_interval(), Duration::from_secs(120));
        assert_eq!(config.execution_timeout(), Some(Duration::from_secs(14_400)));
        assert_eq!(config.stage_retry.max_attempts, 6);
        assert_eq!(config.service_retry.max_attempts, 3);
        assert_eq!(config.map_failure_policy, MapFailurePolicy::AbortAll);
    }

    #[test]
    fn test_timeout_can_be_disabled() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"execution_timeout_secs": null}"#).unwrap();
        assert_eq!(config.execution_timeout(), None);
    }

    #[test]
    fn test_label_classification() {
        let labels = JobLabels {
            success: "Success".to_string(),
            failure: vec!["ServiceError".to_string(), "ClientError".to_string()],
        };

        assert_eq!(labels.classify("Success"), JobStatus::Success);
        assert_eq!(labels.classify("ClientError"), JobStatus::Failure);
        assert_eq!(labels.classify("InProgress"), JobStatus::Running);
        assert_eq!(labels.classify(""), JobStatus::Running);
    }
}
