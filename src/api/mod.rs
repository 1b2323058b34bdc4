//! HTTP API for queue control, run statistics and the global pause switch.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::daemon::{DeletedConfigs, Services};
use crate::error::{PerflabError, Result};
use crate::queue::{
    ConfigUpdate, EnabledStatus, NewConfig, PriorityUpdate, QueueEntry, RepeatStatus,
};
use crate::stats::RunStats;
use crate::store::{PausedStatus, Run, RunQuery, Sample};

#[derive(Clone)]
pub struct ApiState {
    pub services: Services,
}

impl ApiState {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

/// Error body returned by every failing handler.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub struct ApiError(PerflabError);

impl From<PerflabError> for ApiError {
    fn from(err: PerflabError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PerflabError::EntryNotFound(_) | PerflabError::RunNotFound(_) => StatusCode::NOT_FOUND,
            PerflabError::InvalidId(_) | PerflabError::DeleteNotConfirmed(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "API request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
pub struct ArchiveParams {
    ids: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ArchiveResponse {
    pub archived: u64,
}

/// Deletes only happen with `really=true`.
#[derive(Debug, Deserialize)]
pub struct DeleteParams {
    ids: Option<String>,
    #[serde(default)]
    really: bool,
}

/// Paging for run listings. Negative values count as zero, and a zero
/// `limit` returns everything.
#[derive(Debug, Deserialize)]
pub struct RunsParams {
    skip: Option<i64>,
    limit: Option<i64>,
    from_datetime: Option<DateTime<Utc>>,
}

impl RunsParams {
    fn into_query(self) -> RunQuery {
        let mut query = RunQuery::page(
            self.skip.unwrap_or(0).max(0) as usize,
            self.limit.unwrap_or(0).max(0) as usize,
        );
        if let Some(from) = self.from_datetime {
            query = query.since(from);
        }
        query
    }
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/config", get(list_configs).post(create_config))
        .route(
            "/api/config/:id",
            get(get_config).put(update_config).delete(delete_config),
        )
        .route(
            "/api/config/:id/queue/enabled",
            get(get_enabled).put(set_enabled),
        )
        .route(
            "/api/config/:id/queue/repeat",
            get(get_repeat).put(set_repeat),
        )
        .route("/api/config/:id/queue/priority", put(set_priority))
        .route("/api/config/:id/runs", get(list_runs))
        .route("/api/batch", delete(delete_configs))
        .route("/api/batch/archive", put(archive_configs))
        .route("/api/run/:id", get(get_run))
        .route("/api/run/:id/samples", get(list_samples))
        .route("/api/run/:id/stats", post(update_stats))
        .route("/api/control", get(get_paused))
        .route("/api/control/paused", get(get_paused).put(set_paused))
        .layer(cors)
        .with_state(state)
}

/// Serve on an already bound listener until `token` is cancelled.
pub async fn serve_api(
    listener: TcpListener,
    state: ApiState,
    token: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(addr = %addr, "Starting API server");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;

    tracing::info!(addr = %addr, "API server stopped");
    Ok(())
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw.trim()).map_err(|_| PerflabError::InvalidId(raw.to_string()))
}

/// Comma separated ids with blanks dropped. An absent or empty list is invalid.
pub fn parse_id_list(raw: Option<&str>) -> Result<Vec<Uuid>> {
    let ids = raw
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_id)
        .collect::<Result<Vec<_>>>()?;
    if ids.is_empty() {
        return Err(PerflabError::InvalidId("no ids given".to_string()));
    }
    Ok(ids)
}

fn confirm_delete(really: bool) -> Result<()> {
    if really {
        Ok(())
    } else {
        Err(PerflabError::DeleteNotConfirmed(
            "pass really=true to delete".to_string(),
        ))
    }
}

async fn list_configs(State(state): State<ApiState>) -> ApiResult<Vec<QueueEntry>> {
    let entries = state
        .services
        .blocking(|s| s.scheduler.list_entries())
        .await?;
    Ok(Json(entries))
}

async fn create_config(
    State(state): State<ApiState>,
    Json(config): Json<NewConfig>,
) -> std::result::Result<(StatusCode, Json<QueueEntry>), ApiError> {
    let entry = state
        .services
        .blocking(move |s| s.scheduler.insert_config(config))
        .await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn get_config(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<QueueEntry> {
    let id = parse_id(&id)?;
    let entry = state
        .services
        .blocking(move |s| s.scheduler.get_entry(&id))
        .await?
        .ok_or(PerflabError::EntryNotFound(id))?;
    Ok(Json(entry))
}

async fn update_config(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(config): Json<ConfigUpdate>,
) -> ApiResult<QueueEntry> {
    let id = parse_id(&id)?;
    let entry = state
        .services
        .blocking(move |s| s.scheduler.update_config(&id, config))
        .await?;
    Ok(Json(entry))
}

async fn delete_config(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(params): Query<DeleteParams>,
) -> ApiResult<DeletedConfigs> {
    let id = parse_id(&id)?;
    confirm_delete(params.really)?;
    let deleted = state
        .services
        .blocking(move |s| s.delete_configs(&[id]))
        .await?;
    Ok(Json(deleted))
}

async fn delete_configs(
    State(state): State<ApiState>,
    Query(params): Query<DeleteParams>,
) -> ApiResult<DeletedConfigs> {
    let ids = parse_id_list(params.ids.as_deref())?;
    confirm_delete(params.really)?;
    let deleted = state
        .services
        .blocking(move |s| s.delete_configs(&ids))
        .await?;
    Ok(Json(deleted))
}

async fn get_enabled(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<EnabledStatus> {
    let id = parse_id(&id)?;
    let status = state
        .services
        .blocking(move |s| s.scheduler.get_enabled(&id))
        .await?;
    Ok(Json(status))
}

async fn set_enabled(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<EnabledStatus>,
) -> ApiResult<EnabledStatus> {
    let id = parse_id(&id)?;
    let status = state
        .services
        .blocking(move |s| {
            s.scheduler.set_enabled(&id, body.enabled)?;
            s.scheduler.get_enabled(&id)
        })
        .await?;
    Ok(Json(status))
}

async fn get_repeat(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<RepeatStatus> {
    let id = parse_id(&id)?;
    let status = state
        .services
        .blocking(move |s| s.scheduler.get_repeat(&id))
        .await?;
    Ok(Json(status))
}

async fn set_repeat(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<RepeatStatus>,
) -> ApiResult<RepeatStatus> {
    let id = parse_id(&id)?;
    let status = state
        .services
        .blocking(move |s| {
            s.scheduler.set_repeat(&id, body.repeat)?;
            s.scheduler.get_repeat(&id)
        })
        .await?;
    Ok(Json(status))
}

async fn set_priority(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<PriorityUpdate>,
) -> ApiResult<PriorityUpdate> {
    let id = parse_id(&id)?;
    let entry = state
        .services
        .blocking(move |s| {
            s.scheduler.set_priority(&id, body.priority)?;
            s.scheduler.get_entry(&id)
        })
        .await?
        .ok_or(PerflabError::EntryNotFound(id))?;
    Ok(Json(PriorityUpdate {
        priority: entry.queue.priority,
    }))
}

async fn list_runs(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(params): Query<RunsParams>,
) -> ApiResult<Vec<Run>> {
    let id = parse_id(&id)?;
    let query = params.into_query();
    let runs = state
        .services
        .blocking(move |s| s.stores.runs.runs_for_config(&id, &query))
        .await?;
    Ok(Json(runs))
}

async fn archive_configs(
    State(state): State<ApiState>,
    Query(params): Query<ArchiveParams>,
) -> ApiResult<ArchiveResponse> {
    let ids = parse_id_list(params.ids.as_deref())?;
    let archived = state
        .services
        .blocking(move |s| s.scheduler.archive(&ids))
        .await?;
    Ok(Json(ArchiveResponse { archived }))
}

async fn get_run(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult<Run> {
    let id = parse_id(&id)?;
    let run = state
        .services
        .blocking(move |s| s.stores.runs.get_run(&id))
        .await?
        .ok_or(PerflabError::RunNotFound(id))?;
    Ok(Json(run))
}

async fn list_samples(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<Sample>> {
    let id = parse_id(&id)?;
    let samples = state
        .services
        .blocking(move |s| {
            if s.stores.runs.get_run(&id)?.is_none() {
                return Err(PerflabError::RunNotFound(id));
            }
            s.stores.samples.samples_for_run(&id)
        })
        .await?;
    Ok(Json(samples))
}

async fn update_stats(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<RunStats> {
    let id = parse_id(&id)?;
    let stats = state
        .services
        .blocking(move |s| s.stats.update_run_stats(&id))
        .await?;
    Ok(Json(stats))
}

async fn get_paused(State(state): State<ApiState>) -> ApiResult<PausedStatus> {
    let status = state
        .services
        .blocking(|s| s.stores.control.get_paused())
        .await?;
    Ok(Json(status))
}

async fn set_paused(
    State(state): State<ApiState>,
    Json(body): Json<PausedStatus>,
) -> ApiResult<PausedStatus> {
    let status = state
        .services
        .blocking(move |s| {
            s.stores.control.set_paused(body.paused)?;
            s.stores.control.get_paused()
        })
        .await?;
    tracing::info!(paused = status.paused, "Pause switch set");
    Ok(Json(status))
}
