//! REST transport over the session store.
//!
//! Route handlers only translate between HTTP and the store API and map
//! the error taxonomy onto status codes; no session logic lives here.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::error;
use uuid::Uuid;

use crate::config::VERSION;
use crate::error::SessionError;
use crate::formats::{
    CreateSessionRequest, ParamValue, ParameterGroup, ResultInfo, SessionInfo,
    State as SessionState, UpdateParameterRequest,
};
use crate::session::{ExecuteMode, SessionStore};
use crate::source::DefinitionSource;
use crate::system::Command;

/// Shared state of the transport layer.
pub struct AppState {
    pub store: Arc<SessionStore>,
    pub source: Arc<dyn DefinitionSource>,
}

struct ApiError(SessionError);

impl From<SessionError> for ApiError {
    fn from(error: SessionError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SessionError::Validation(_) | SessionError::InvalidSession { .. } => {
                StatusCode::BAD_REQUEST
            }
            SessionError::Locked(_) => StatusCode::FORBIDDEN,
            SessionError::UnexpectedState(_) => StatusCode::PRECONDITION_FAILED,
            SessionError::ResultNotAvailable(_) | SessionError::FileStaging { .. } => {
                StatusCode::NOT_FOUND
            }
            SessionError::Compute(crate::compute::ComputeError::Unavailable(_)) => {
                StatusCode::NOT_FOUND
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error!("request failed: {}", self.0);
        (status, self.0.to_string()).into_response()
    }
}

pub fn router(store: Arc<SessionStore>, source: Arc<dyn DefinitionSource>) -> Router {
    let state = Arc::new(AppState { store, source });
    Router::new()
        .route("/version", get(get_version))
        .route("/session", get(list_sessions).post(create_session))
        .route("/session/{id}", get(get_session).delete(delete_session))
        .route(
            "/session/{id}/parameter/{group}",
            get(get_parameters)
                .put(put_parameter)
                .post(post_parameter_file)
                .delete(delete_parameter),
        )
        .route("/session/{id}/build", post(post_build))
        .route("/session/{id}/run", post(post_run))
        .route("/session/{id}/stop", post(post_stop))
        .route("/session/{id}/status", get(get_status))
        .route("/session/{id}/result", get(list_results))
        .route("/session/{id}/result/{name}", get(get_result))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn get_version() -> &'static str {
    VERSION
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Uuid>>, ApiError> {
    Ok(Json(state.store.list_sessions().await?))
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<Uuid>), ApiError> {
    let id = state
        .store
        .create_session(request, state.source.as_ref())
        .await?;
    Ok((StatusCode::CREATED, Json(id)))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionInfo>, ApiError> {
    let session = state.store.open_read_only(id).await?;
    Ok(Json(session.info()))
}

#[derive(Deserialize)]
struct RemoveQuery {
    #[serde(default)]
    force: bool,
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<RemoveQuery>,
) -> Result<StatusCode, ApiError> {
    state.store.remove_session(id, query.force).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_parameters(
    State(state): State<Arc<AppState>>,
    Path((id, group)): Path<(Uuid, ParameterGroup)>,
) -> Result<Json<BTreeMap<String, ParamValue>>, ApiError> {
    let session = state.store.open_read_only(id).await?;
    Ok(Json(session.parameter_values(group)))
}

async fn put_parameter(
    State(state): State<Arc<AppState>>,
    Path((id, group)): Path<(Uuid, ParameterGroup)>,
    Json(request): Json<UpdateParameterRequest>,
) -> Result<StatusCode, ApiError> {
    let mut guard = state.store.open(id).await?;
    guard
        .session_mut()
        .update_parameter(group, &request.name, request.value)?;
    guard.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct FileQuery {
    name: String,
    #[serde(default)]
    file_name: Option<String>,
}

async fn post_parameter_file(
    State(state): State<Arc<AppState>>,
    Path((id, group)): Path<(Uuid, ParameterGroup)>,
    Query(query): Query<FileQuery>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let file_name = query.file_name.unwrap_or_else(|| query.name.clone());
    let mut guard = state.store.open(id).await?;
    guard
        .session_mut()
        .add_file(group, &query.name, &file_name, &body)
        .await?;
    guard.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct ParameterQuery {
    name: String,
}

async fn delete_parameter(
    State(state): State<Arc<AppState>>,
    Path((id, group)): Path<(Uuid, ParameterGroup)>,
    Query(query): Query<ParameterQuery>,
) -> Result<StatusCode, ApiError> {
    let mut guard = state.store.open(id).await?;
    guard
        .session_mut()
        .reset_parameter(group, &query.name)
        .await?;
    guard.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct ExecuteQuery {
    #[serde(default)]
    timeout: Option<u64>,
}

async fn post_build(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<ExecuteQuery>,
) -> Result<StatusCode, ApiError> {
    state
        .store
        .execute(id, Command::Build, ExecuteMode::Async, query.timeout)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

async fn post_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<ExecuteQuery>,
) -> Result<StatusCode, ApiError> {
    state
        .store
        .execute(id, Command::Run, ExecuteMode::Async, query.timeout)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

async fn post_stop(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.store.stop(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionState>, ApiError> {
    let session = state.store.open_read_only(id).await?;
    Ok(Json(session.status()))
}

async fn list_results(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<ResultInfo>>, ApiError> {
    let session = state.store.open_read_only(id).await?;
    Ok(Json(session.result_infos()?))
}

async fn get_result(
    State(state): State<Arc<AppState>>,
    Path((id, name)): Path<(Uuid, String)>,
) -> Result<Bytes, ApiError> {
    let session = state.store.open_read_only(id).await?;
    let path = session.get_result(&name).await?;
    let content = tokio::fs::read(&path).await.map_err(SessionError::from)?;
    Ok(Bytes::from(content))
}
