use super::{ApiError, ApiResult};
use crate::config::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use mediaflow_core::{
    events::Event,
    trigger::TriggerError,
    types::{BlobHash, ExecutionId, ExecutionStatusView, StateName},
    workflow::{PollProgress, WorkflowDefinition, WorkflowGraph},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

fn parse_execution_id(execution_id: &str) -> ApiResult<ExecutionId> {
    execution_id
        .parse()
        .map_err(|_| ApiError::bad_request("Invalid execution ID"))
}

/// Start an execution from an object-created notification
pub async fn create_execution(
    State(state): State<Arc<AppState>>,
    Json(notification): Json<Value>,
) -> ApiResult<(StatusCode, Json<CreateExecutionResponse>)> {
    let notification = state.trigger_filter.accept(&notification).map_err(|e| {
        let status = match e {
            TriggerError::IgnoredBucket(_) => StatusCode::UNPROCESSABLE_ENTITY,
            TriggerError::Malformed(_) | TriggerError::UnsupportedEvent(_) => {
                StatusCode::BAD_REQUEST
            }
        };
        ApiError::new(status, e)
    })?;

    let source_uri = notification.source_uri();
    let execution_id = state.engine.start(notification.into_seed()).await?;
    tracing::info!("Started execution {} for {}", execution_id, source_uri);

    Ok((
        StatusCode::ACCEPTED,
        Json(CreateExecutionResponse {
            execution_id,
            source_uri,
        }),
    ))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateExecutionResponse {
    pub execution_id: ExecutionId,
    pub source_uri: String,
}

pub async fn list_executions(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ListExecutionsResponse>> {
    let executions = state.engine.list()?;
    Ok(Json(ListExecutionsResponse { executions }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListExecutionsResponse {
    pub executions: Vec<ExecutionStatusView>,
}

/// Status of one execution plus its progress through the poll loop
pub async fn get_execution(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
) -> ApiResult<Json<ExecutionResponse>> {
    let execution_id = parse_execution_id(&execution_id)?;
    let record = state
        .engine
        .get_record(&execution_id)?
        .ok_or_else(|| ApiError::not_found("Execution not found"))?;

    Ok(Json(ExecutionResponse {
        poll: state.pipeline.poll.progress(&record),
        view: record.view(),
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecutionResponse {
    #[serde(flatten)]
    pub view: ExecutionStatusView,
    pub poll: PollProgress,
}

pub async fn get_execution_events(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
) -> ApiResult<Json<GetExecutionEventsResponse>> {
    let execution_id = parse_execution_id(&execution_id)?;
    let events = state.engine.events(execution_id).await?;
    Ok(Json(GetExecutionEventsResponse { events }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetExecutionEventsResponse {
    pub events: Vec<Event>,
}

/// Seed or stage output by the hash recorded in an event
pub async fn get_blob(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
) -> ApiResult<Json<Value>> {
    let hash = BlobHash::parse(&hash).ok_or_else(|| ApiError::bad_request("Invalid blob hash"))?;
    let value = state
        .engine
        .stored_output(&hash)
        .await?
        .ok_or_else(|| ApiError::not_found("Blob not found"))?;
    Ok(Json(value))
}

#[derive(Debug, Deserialize)]
pub struct CancelParams {
    pub reason: Option<String>,
}

pub async fn cancel_execution(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
    Query(params): Query<CancelParams>,
) -> ApiResult<Json<CancelExecutionResponse>> {
    let execution_id = parse_execution_id(&execution_id)?;
    if state.engine.get_status(&execution_id)?.is_none() {
        return Err(ApiError::not_found("Execution not found"));
    }

    let reason = params
        .reason
        .unwrap_or_else(|| "cancelled via API".to_string());
    let cancelled = state.engine.cancel(execution_id, &reason).await?;

    Ok(Json(CancelExecutionResponse { cancelled }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelExecutionResponse {
    /// `false` when the execution had already finished
    pub cancelled: bool,
}

/// The pipeline definition and its state transitions
pub async fn get_workflow(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<WorkflowResponse>> {
    let definition = state.engine.definition().clone();
    let transitions = WorkflowGraph::from_definition(&definition)?.transitions();
    Ok(Json(WorkflowResponse {
        definition,
        transitions,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkflowResponse {
    pub definition: WorkflowDefinition,
    pub transitions: Vec<(StateName, StateName)>,
}
