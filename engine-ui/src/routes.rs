//! HTTP route handlers for the engine API.

use std::collections::BTreeMap;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use engine::core::event::Event;
use engine::core::state::WorkflowState;
use engine::core::types::{IssueRef, WorkflowRun, WorkflowType};
use engine::events::{LogError, RepoError, RunState};
use engine::workflow::WorkflowRequest;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::state::AppState;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/runs", get(list_runs).post(start_run))
        .route("/runs/{run_id}", get(get_run))
        .route("/runs/{run_id}/events", get(get_events))
        .route("/runs/{run_id}/state", get(get_state))
        .route("/issues/states", post(issue_states))
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    #[cfg(test)]
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<LogError> for ApiError {
    fn from(err: LogError) -> Self {
        let status = match &err {
            LogError::UnknownRun(_) => StatusCode::NOT_FOUND,
            LogError::Storage {
                source: RepoError::InvalidRunId(_),
                ..
            } => StatusCode::BAD_REQUEST,
            LogError::Storage {
                source: RepoError::RunExists(_),
                ..
            }
            | LogError::Transition { .. }
            | LogError::RunEnded { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<LogError>() {
            Ok(log_err) => log_err.into(),
            Err(err) => Self::internal(format!("{err:#}")),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(status = %self.status, error = %self.message, "request failed");
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Run a blocking engine call off the async executor.
pub async fn blocking<T, E>(f: impl FnOnce() -> Result<T, E> + Send + 'static) -> Result<T, ApiError>
where
    T: Send + 'static,
    E: Into<ApiError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| ApiError::internal(format!("blocking task failed: {err}")))?
        .map_err(Into::into)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    id: String,
    workflow_type: WorkflowType,
    state: WorkflowState,
    created_at: DateTime<Utc>,
}

/// GET /api/runs - every run with its derived state, oldest first.
pub async fn list_runs(State(state): State<AppState>) -> Result<Json<Vec<RunSummary>>, ApiError> {
    let log = state.engine.log().clone();
    let runs = blocking(move || {
        let mut summaries = Vec::new();
        for run in log.list_runs()? {
            summaries.push(RunSummary {
                state: log.state(&run.id)?,
                id: run.id,
                workflow_type: run.workflow_type,
                created_at: run.created_at,
            });
        }
        Ok::<_, LogError>(summaries)
    })
    .await?;
    Ok(Json(runs))
}

/// POST /api/runs - start a workflow in this process; returns the pending run.
pub async fn start_run(
    State(state): State<AppState>,
    Json(request): Json<WorkflowRequest>,
) -> Result<(StatusCode, Json<WorkflowRun>), ApiError> {
    let engine = state.engine.clone();
    let run = blocking(move || engine.spawn(request)).await?;
    info!(run_id = %run.id, workflow = %run.workflow_type, "run started via API");
    Ok((StatusCode::ACCEPTED, Json(run)))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDetail {
    #[serde(flatten)]
    run: WorkflowRun,
    state: WorkflowState,
}

/// GET /api/runs/{run_id} - the run record plus its derived state.
pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunDetail>, ApiError> {
    let log = state.engine.log().clone();
    let detail = blocking(move || {
        let run = log
            .get_run(&run_id)?
            .ok_or_else(|| LogError::UnknownRun(run_id.clone()))?;
        let state = log.state(&run_id)?;
        Ok::<_, LogError>(RunDetail { run, state })
    })
    .await?;
    Ok(Json(detail))
}

/// GET /api/runs/{run_id}/events - the full event chain in sequence order.
pub async fn get_events(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Vec<Event>>, ApiError> {
    let log = state.engine.log().clone();
    let chain = blocking(move || log.get_chain(&run_id)).await?;
    Ok(Json(chain))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateResponse {
    run_id: String,
    state: WorkflowState,
    updated_at: Option<DateTime<Utc>>,
}

/// GET /api/runs/{run_id}/state - the derived lifecycle state.
pub async fn get_state(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<StateResponse>, ApiError> {
    let log = state.engine.log().clone();
    let response = blocking(move || {
        if log.get_run(&run_id)?.is_none() {
            return Err(LogError::UnknownRun(run_id));
        }
        let latest = log.get_latest_lifecycle_event(&run_id)?;
        Ok(StateResponse {
            state: latest
                .as_ref()
                .and_then(|event| event.payload.lifecycle_state())
                .unwrap_or_default(),
            updated_at: latest.map(|event| event.created_at),
            run_id,
        })
    })
    .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct IssueStatesRequest {
    issues: Vec<String>,
}

/// POST /api/issues/states - runs and states per issue, keyed `owner/repo#N`.
pub async fn issue_states(
    State(state): State<AppState>,
    Json(request): Json<IssueStatesRequest>,
) -> Result<Json<BTreeMap<String, Vec<RunState>>>, ApiError> {
    let issues = request
        .issues
        .iter()
        .map(|raw| {
            raw.parse::<IssueRef>()
                .map_err(|err| ApiError::new(StatusCode::BAD_REQUEST, err.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let log = state.engine.log().clone();
    let states = blocking(move || log.latest_states_for_issues(&issues)).await?;
    Ok(Json(
        states
            .into_iter()
            .map(|(issue, runs)| (issue.to_string(), runs))
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use engine::test_support::sample_run;

    use super::*;
    use crate::test_support::app_state;

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let (_temp, state) = app_state(Vec::new());
        let err = get_run(State(state.clone()), Path("missing".to_string()))
            .await
            .expect_err("unknown run");
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let err = get_state(State(state), Path("missing".to_string()))
            .await
            .expect_err("unknown run");
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn lists_runs_with_pending_state() {
        let (_temp, state) = app_state(Vec::new());
        state
            .engine
            .log()
            .create_run(&sample_run("r1"))
            .expect("create run");

        let Json(runs) = list_runs(State(state.clone())).await.expect("list");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, "r1");
        assert_eq!(runs[0].state, WorkflowState::Pending);

        let Json(response) = get_state(State(state), Path("r1".to_string()))
            .await
            .expect("state");
        assert_eq!(response.state, WorkflowState::Pending);
        assert!(response.updated_at.is_none());
    }

    #[tokio::test]
    async fn duplicate_run_id_conflicts() {
        let (_temp, state) = app_state(Vec::new());
        state
            .engine
            .log()
            .create_run(&sample_run("r1"))
            .expect("create run");
        let request: WorkflowRequest = serde_json::from_value(json!({
            "runId": "r1",
            "workflowType": "resolve-issue",
            "workspace": {"kind": "host", "root": "."},
        }))
        .expect("request");

        let err = start_run(State(state), Json(request))
            .await
            .expect_err("duplicate");
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn malformed_issue_is_bad_request() {
        let (_temp, state) = app_state(Vec::new());
        let err = issue_states(
            State(state),
            Json(IssueStatesRequest {
                issues: vec!["not-an-issue".to_string()],
            }),
        )
        .await
        .expect_err("bad issue");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn issue_states_include_unmatched_issues() {
        let (_temp, state) = app_state(Vec::new());
        let mut run = sample_run("r1");
        run.target.issue = Some("acme/widgets#7".parse().expect("issue"));
        state.engine.log().create_run(&run).expect("create run");

        let Json(states) = issue_states(
            State(state),
            Json(IssueStatesRequest {
                issues: vec!["acme/widgets#7".to_string(), "acme/widgets#8".to_string()],
            }),
        )
        .await
        .expect("states");
        assert_eq!(states["acme/widgets#7"].len(), 1);
        assert_eq!(states["acme/widgets#7"][0].run.id, "r1");
        assert!(states["acme/widgets#8"].is_empty());
    }
}
