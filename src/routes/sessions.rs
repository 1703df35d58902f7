use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use axum_valid::Valid;
use uuid::Uuid;

use crate::{
    dto::session::{CreateSessionRequest, SessionDetail, SessionSnapshot, SessionSummary},
    error::AppError,
    services::session_service,
    state::SharedState,
};

/// Session lifecycle endpoints used by the control room.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/{id}", get(get_session).delete(delete_session))
        .route("/sessions/{id}/activate", post(activate_session))
        .route("/sessions/current/pause", post(pause_session))
        .route("/sessions/current/complete", post(complete_session))
}

/// List stored sessions, oldest first.
#[utoipa::path(
    get,
    path = "/sessions",
    tag = "sessions",
    responses((status = 200, description = "Stored sessions", body = [SessionSummary]))
)]
pub async fn list_sessions(State(state): State<SharedState>) -> Result<Json<Vec<SessionSummary>>, AppError> {
    Ok(Json(session_service::list(&state).await?))
}

/// Create a draft session and its roster.
#[utoipa::path(
    post,
    path = "/sessions",
    tag = "sessions",
    request_body = CreateSessionRequest,
    responses((status = 201, description = "Session created", body = SessionSummary))
)]
pub async fn create_session(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<CreateSessionRequest>>,
) -> Result<(StatusCode, Json<SessionSummary>), AppError> {
    let summary = session_service::create(&state, payload).await?;
    Ok((StatusCode::CREATED, Json(summary)))
}

#[utoipa::path(
    get,
    path = "/sessions/{id}",
    tag = "sessions",
    params(("id" = Uuid, Path, description = "Session identifier")),
    responses(
        (status = 200, description = "Session with its roster", body = SessionDetail),
        (status = 404, description = "Unknown session")
    )
)]
pub async fn get_session(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionDetail>, AppError> {
    Ok(Json(session_service::get(&state, id).await?))
}

/// Delete a stored session; the live one is refused.
#[utoipa::path(
    delete,
    path = "/sessions/{id}",
    tag = "sessions",
    params(("id" = Uuid, Path, description = "Session identifier")),
    responses(
        (status = 204, description = "Session deleted"),
        (status = 409, description = "Session is live")
    )
)]
pub async fn delete_session(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    session_service::delete(&state, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Make a session live, pausing the current one.
#[utoipa::path(
    post,
    path = "/sessions/{id}/activate",
    tag = "sessions",
    params(("id" = Uuid, Path, description = "Session identifier")),
    responses((status = 200, description = "Snapshot of the now live session", body = SessionSnapshot))
)]
pub async fn activate_session(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionSnapshot>, AppError> {
    Ok(Json(session_service::activate(&state, id).await?))
}

#[utoipa::path(
    post,
    path = "/sessions/current/pause",
    tag = "sessions",
    responses((status = 200, description = "Live session paused", body = SessionSummary))
)]
pub async fn pause_session(State(state): State<SharedState>) -> Result<Json<SessionSummary>, AppError> {
    Ok(Json(session_service::pause(&state).await?))
}

/// Close the live session for good.
#[utoipa::path(
    post,
    path = "/sessions/current/complete",
    tag = "sessions",
    responses((status = 200, description = "Session completed and unloaded", body = SessionSummary))
)]
pub async fn complete_session(State(state): State<SharedState>) -> Result<Json<SessionSummary>, AppError> {
    Ok(Json(session_service::complete(&state).await?))
}
