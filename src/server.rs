//! HTTP control plane for the supervisor.
//!
//! Thin JSON handlers over the supervisor's operations, plus the live
//! delivery adapter: a polling `output` endpoint and a long-lived ndjson
//! `stream` endpoint that follows the durable log until the job ends.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::errors::SupervisorError;
use crate::job::{JobId, JobStatus};
use crate::runner::{StopOutcome, Supervisor};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    /// How often the stream endpoint re-reads the sink for new lines.
    pub stream_poll: Duration,
}

/// Builds the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/jobs", post(start_job).get(list_jobs))
        .route("/api/jobs/{id}", delete(remove_job))
        .route("/api/jobs/{id}/output", get(job_output))
        .route("/api/jobs/{id}/stream", get(stream_job))
        .route("/api/jobs/{id}/stop", post(stop_job))
        .route("/api/jobs/{id}/log", get(download_job_log))
        .route("/api/log", get(download_combined_log))
        .with_state(state)
}

/// Body of `POST /api/jobs`.
///
/// Either `argv` (a resolved vector) or `command` (a string). A plain
/// `command` is split into a vector; `shell = true` opts in to handing the
/// whole string to `sh -c` instead.
#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub command: Option<String>,
    pub argv: Option<Vec<String>>,
    pub name: Option<String>,
    #[serde(default)]
    pub shell: bool,
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({"status": "error", "message": self.message})),
        )
            .into_response()
    }
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        let status = match &err {
            SupervisorError::EmptyCommand => StatusCode::BAD_REQUEST,
            SupervisorError::SpawnFailed { .. } => StatusCode::BAD_REQUEST,
            SupervisorError::NotFound(_) => StatusCode::NOT_FOUND,
            SupervisorError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

fn resolve_argv(req: &StartRequest) -> Result<Vec<String>, ApiError> {
    if let Some(argv) = &req.argv {
        if argv.iter().all(|part| part.trim().is_empty()) {
            return Err(ApiError::bad_request("empty command"));
        }
        return Ok(argv.clone());
    }
    let command = req.command.as_deref().unwrap_or("").trim();
    if command.is_empty() {
        return Err(ApiError::bad_request("empty command"));
    }
    if req.shell {
        return Ok(vec!["sh".to_string(), "-c".to_string(), command.to_string()]);
    }
    let argv = shell_words::split(command)
        .map_err(|err| ApiError::bad_request(format!("invalid command: {err}")))?;
    if argv.is_empty() {
        return Err(ApiError::bad_request("empty command"));
    }
    Ok(argv)
}

async fn start_job(
    State(state): State<AppState>,
    Json(req): Json<StartRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let argv = resolve_argv(&req)?;
    let spec = crate::job::JobSpec {
        name: req.name,
        argv,
        cwd: req.cwd,
        env: req.env,
    };
    let id = state.supervisor.start(spec)?;
    Ok((StatusCode::CREATED, Json(json!({"id": id}))))
}

async fn list_jobs(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.supervisor.list())
}

async fn job_output(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.supervisor.output(JobId(id))?;
    Ok(Json(json!({
        "content": snapshot.content,
        "is_running": snapshot.is_running,
        "status": snapshot.status,
        "exit_code": snapshot.exit_code,
    })))
}

async fn stop_job(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.supervisor.stop(JobId(id)).await?;
    let status = match outcome {
        StopOutcome::Stopping => "stopping",
        StopOutcome::AlreadyTerminal => "already_terminal",
    };
    Ok(Json(json!({"status": status})))
}

async fn remove_job(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.supervisor.get(JobId(id))?;
    if !job.status.is_terminal() {
        return Err(ApiError::conflict("job is still running; stop it first"));
    }
    state.supervisor.remove(JobId(id));
    Ok(StatusCode::NO_CONTENT)
}

async fn download_job_log(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    let content = state.supervisor.read_log(JobId(id))?;
    Ok(log_attachment(format!("job-{id}.log"), content))
}

async fn download_combined_log(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let content = state.supervisor.read_combined_log()?;
    Ok(log_attachment("combined.log".to_string(), content))
}

fn log_attachment(filename: String, content: String) -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        content,
    )
}

/// Long-lived ndjson stream of a job's output.
///
/// Emits one progress object per log line, in order and without gaps, then a
/// final status object, then closes from the server side.
async fn stream_job(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    let id = JobId(id);
    state.supervisor.get(id)?;

    let (tx, rx) = mpsc::channel::<Result<String, Infallible>>(32);
    tokio::spawn(follow_job(
        state.supervisor.clone(),
        id,
        state.stream_poll,
        tx,
    ));

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(ReceiverStream::new(rx)),
    ))
}

/// Follows the job's durable log from the start, forwarding complete lines
/// until the record turns terminal, then emits the summary object.
async fn follow_job(
    supervisor: Arc<Supervisor>,
    id: JobId,
    poll: Duration,
    tx: mpsc::Sender<Result<String, Infallible>>,
) {
    let mut offset = 0u64;
    let mut pending = String::new();
    loop {
        let Ok(job) = supervisor.get(id) else {
            // Pruned mid-stream; nothing more to say.
            return;
        };
        // Read the status before the log: once terminal, the log is final.
        let done = job.status.is_terminal();

        match supervisor.read_log_from(id, offset) {
            Ok((chunk, next)) => {
                offset = next;
                pending.push_str(&chunk);
            }
            Err(err) => {
                debug!(%id, error = %err, "stream follower read failed");
                return;
            }
        }
        while let Some(pos) = pending.find('\n') {
            let line = pending[..pos].trim().to_string();
            pending.drain(..=pos);
            if line.is_empty() {
                continue;
            }
            let msg = json!({"status": "progress", "output": line}).to_string() + "\n";
            if tx.send(Ok(msg)).await.is_err() {
                return;
            }
        }

        if done {
            let (status, message) = final_summary(job.status, job.exit_code);
            let msg = json!({
                "status": status,
                "message": message,
                "exit_code": job.exit_code,
            })
            .to_string()
                + "\n";
            let _ = tx.send(Ok(msg)).await;
            return;
        }
        tokio::time::sleep(poll).await;
    }
}

fn final_summary(status: JobStatus, exit_code: Option<i32>) -> (&'static str, String) {
    match status {
        JobStatus::Completed => ("complete", "Command completed successfully.".to_string()),
        JobStatus::Stopped => ("stopped", "Command stopped by user.".to_string()),
        JobStatus::Failed => {
            let detail = exit_code
                .map(|code| format!("Command failed with exit code {code}."))
                .unwrap_or_else(|| "Command failed.".to_string());
            ("error", detail)
        }
        JobStatus::Starting | JobStatus::Running => {
            ("error", "Command ended unexpectedly.".to_string())
        }
    }
}
