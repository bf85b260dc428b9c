//! The media pipeline topology:
//!
//! ```text
//! InvokeDataAutomation -> WaitForJob -> GetJobStatus -> JobCompleted
//!     -> MatchSegments -> RefineAndScreenshot -> CreateHandouts
//! ```
//!
//! `RefineAndScreenshot` runs the per-segment transcript refinement (one
//! segment at a time) next to screenshot capture. Both read the matcher's
//! output (`s3_key`, `segments`) from `Payload`. `CreateHandouts` receives
//! both results as `[transcripts, screenshots]`.

use super::node::{MapNode, Node, ParallelNode, TaskNode, ValueSource, WorkflowBuilder, WorkflowDefinition};
use super::poll::{PollLoop, PollWaitBuilder};
use crate::config::{EngineConfig, PipelineConfig};
use crate::error::{DefinitionError, FailureKind};

pub const WORKFLOW_NAME: &str = "media-pipeline";

pub const SUBMIT_STATE: &str = "InvokeDataAutomation";
pub const WAIT_STATE: &str = "WaitForJob";
pub const CHECK_STATE: &str = "GetJobStatus";
pub const ROUTE_STATE: &str = "JobCompleted";
pub const MATCH_STATE: &str = "MatchSegments";
pub const FAN_OUT_STATE: &str = "RefineAndScreenshot";
pub const HANDOUTS_STATE: &str = "CreateHandouts";

/// Built pipeline definition plus the poll loop layout used to report
/// progress
#[derive(Debug, Clone)]
pub struct MediaPipeline {
    pub definition: WorkflowDefinition,
    pub poll: PollLoop,
}

pub fn media_pipeline(
    pipeline: &PipelineConfig,
    engine: &EngineConfig,
) -> Result<MediaPipeline, DefinitionError> {
    let tasks = &pipeline.tasks;

    let submit = TaskNode::new(SUBMIT_STATE, tasks.submit_job.as_str())
        .param(
            "sourceUri",
            ValueSource::format("s3://{}/{}", &["$.bucket.name", "$.object.key"]),
        )
        .param("outputUri", ValueSource::literal(pipeline.output_uri.as_str()))
        .param("projectRef", ValueSource::literal(pipeline.project_ref.as_str()))
        .result_key("submission")
        .failure_kind(FailureKind::Submission)
        .retry(engine.service_retry.clone());

    let check = TaskNode::new(CHECK_STATE, tasks.job_status.as_str())
        .param(
            "invocationHandle",
            ValueSource::path("$.submission.invocationHandle"),
        )
        .result_key("job_status")
        .failure_kind(FailureKind::Poll)
        .retry(engine.service_retry.clone());

    let (poll_states, poll) = PollWaitBuilder::new(submit, check, MATCH_STATE)
        .state_names(SUBMIT_STATE, WAIT_STATE, CHECK_STATE, ROUTE_STATE)
        .interval(engine.poll_interval())
        .status_path("$.job_status.status")
        .handle_path("$.submission.invocationHandle")
        .labels(pipeline.labels.clone())
        .build();

    let match_segments = TaskNode::new(MATCH_STATE, tasks.match_segments.as_str())
        .param("OutputS3Uri", ValueSource::path("$.job_status.outputUri"))
        .param("InputData", ValueSource::Context)
        .result_key("matched")
        .retry(engine.stage_retry.clone())
        .check_status_code();

    let refine = Node::Map(MapNode {
        name: "RefineTranscript".to_string(),
        items_path: "$.matched.segments".to_string(),
        iterator: Box::new(Node::Task(
            TaskNode::new("RefineTranscript", tasks.refine_transcript.as_str())
                .param("Payload", ValueSource::path("$.item"))
                .retry(engine.stage_retry.clone())
                .check_status_code(),
        )),
        result_key: None,
        failure_policy: None,
    });

    let screenshots = Node::Task(
        TaskNode::new("TakeScreenshots", tasks.take_screenshots.as_str())
            .param("Payload", ValueSource::path("$.matched"))
            .param("InputData", ValueSource::Context)
            .retry(engine.stage_retry.clone())
            .check_status_code(),
    );

    let handouts = TaskNode::new(HANDOUTS_STATE, tasks.create_handouts.as_str())
        .param("Payload", ValueSource::path("$.post_processing"))
        .result_key("handouts")
        .retry(engine.stage_retry.clone())
        .check_status_code();

    let definition = WorkflowBuilder::new(WORKFLOW_NAME)
        .extend(poll_states)
        .then(MATCH_STATE, Node::Task(match_segments))
        .then(
            FAN_OUT_STATE,
            Node::Parallel(ParallelNode {
                name: FAN_OUT_STATE.to_string(),
                branches: vec![refine, screenshots],
                result_key: Some("post_processing".to_string()),
            }),
        )
        .then(HANDOUTS_STATE, Node::Task(handouts))
        .build()?;

    Ok(MediaPipeline { definition, poll })
}
