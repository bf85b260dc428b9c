use crate::invoker::HttpTaskInvoker;
use anyhow::{Context, Result};
use mediaflow_core::config::{EngineConfig, PipelineConfig};
use mediaflow_core::scheduler::WakeScheduler;
use mediaflow_core::storage::{FilesystemBlobStore, JsonlEventLog, RedbExecutionStore};
use mediaflow_core::trigger::TriggerFilter;
use mediaflow_core::workflow::{media_pipeline, MediaPipeline, WorkflowEngine};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// HTTP endpoints keyed by task name
    #[serde(default)]
    pub tasks: HashMap<String, TaskEndpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_blob_dir")]
    pub blob_dir: String,

    #[serde(default = "default_event_log_dir")]
    pub event_log_dir: String,

    #[serde(default = "default_state_file")]
    pub state_file: String,
}

fn default_blob_dir() -> String {
    "blobs".to_string()
}

fn default_event_log_dir() -> String {
    "events".to_string()
}

fn default_state_file() -> String {
    "executions.redb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            blob_dir: default_blob_dir(),
            event_log_dir: default_event_log_dir(),
            state_file: default_state_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEndpoint {
    pub url: String,

    #[serde(default = "default_task_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_task_timeout_secs() -> u64 {
    900
}

impl TaskEndpoint {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ServerConfig {
    pub fn load(config_path: &PathBuf, data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        // Load config file if it exists, otherwise use defaults
        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self {
                data_dir: data_dir.clone(),
                storage: Default::default(),
                engine: Default::default(),
                pipeline: Default::default(),
                tasks: HashMap::new(),
            }
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    pub fn blob_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.blob_dir)
    }

    pub fn event_log_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.event_log_dir)
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.state_file)
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<WorkflowEngine>,
    pub scheduler: Arc<WakeScheduler>,
    pub pipeline: MediaPipeline,
    pub trigger_filter: TriggerFilter,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let blob_store = Arc::new(
            FilesystemBlobStore::new(config.blob_path())
                .context("Failed to create blob store")?,
        );

        let event_log = Arc::new(
            JsonlEventLog::new(config.event_log_path()).context("Failed to create event log")?,
        );

        let store = Arc::new(
            RedbExecutionStore::new(config.state_path())
                .context("Failed to create execution store")?,
        );

        let pipeline = media_pipeline(&config.pipeline, &config.engine)
            .context("Invalid pipeline definition")?;

        let invoker = HttpTaskInvoker::new(config.tasks.clone())?;
        let names = &config.pipeline.tasks;
        for task in [
            &names.submit_job,
            &names.job_status,
            &names.match_segments,
            &names.refine_transcript,
            &names.take_screenshots,
            &names.create_handouts,
        ] {
            if !invoker.has_endpoint(task) {
                tracing::warn!("No endpoint configured for task {}", task);
            }
        }

        let engine = Arc::new(WorkflowEngine::new(
            pipeline.definition.clone(),
            store,
            event_log,
            blob_store,
            Arc::new(invoker),
            config.engine.clone(),
        ));

        Ok(Self::from_parts(
            engine,
            pipeline,
            TriggerFilter::new(config.pipeline.input_bucket.clone()),
        ))
    }

    pub fn from_parts(
        engine: Arc<WorkflowEngine>,
        pipeline: MediaPipeline,
        trigger_filter: TriggerFilter,
    ) -> Self {
        let scheduler = Arc::new(WakeScheduler::new(engine.clone()));
        Self {
            engine,
            scheduler,
            pipeline,
            trigger_filter,
        }
    }
}
