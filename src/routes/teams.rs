use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::post,
};
use axum_valid::Valid;
use uuid::Uuid;

use crate::{
    dto::{
        control::ScoreResponse,
        team::{CreateTeamRequest, DeviceRequest, ScoreAdjustRequest, TeamSummary},
    },
    error::AppError,
    services::team_service,
    state::SharedState,
};

/// Roster and device-slot endpoints of the live session.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/live/teams", post(create_team))
        .route("/live/teams/{id}/score", post(adjust_score))
        .route("/live/teams/{id}/kick", post(kick_team))
        .route("/live/teams/{id}/connect", post(connect_device))
        .route("/live/teams/{id}/disconnect", post(disconnect_device))
}

/// Add a team to the live session.
#[utoipa::path(
    post,
    path = "/live/teams",
    tag = "teams",
    request_body = CreateTeamRequest,
    responses((status = 201, description = "Team created", body = TeamSummary))
)]
pub async fn create_team(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<CreateTeamRequest>>,
) -> Result<(StatusCode, Json<TeamSummary>), AppError> {
    let team = team_service::create(&state, payload).await?;
    Ok((StatusCode::CREATED, Json(team)))
}

#[utoipa::path(
    post,
    path = "/live/teams/{id}/score",
    tag = "teams",
    params(("id" = Uuid, Path, description = "Team identifier")),
    request_body = ScoreAdjustRequest,
    responses((status = 200, description = "Score adjusted", body = ScoreResponse))
)]
pub async fn adjust_score(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Valid(Json(payload)): Valid<Json<ScoreAdjustRequest>>,
) -> Result<Json<ScoreResponse>, AppError> {
    let score = team_service::adjust_score(&state, id, payload.delta).await?;
    Ok(Json(ScoreResponse { team_id: id, score }))
}

/// Release a team's device and tell it to leave.
#[utoipa::path(
    post,
    path = "/live/teams/{id}/kick",
    tag = "teams",
    params(("id" = Uuid, Path, description = "Team identifier")),
    responses((status = 204, description = "Team kicked"))
)]
pub async fn kick_team(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    team_service::kick(&state, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Claim a team slot for a device.
#[utoipa::path(
    post,
    path = "/live/teams/{id}/connect",
    tag = "teams",
    params(("id" = Uuid, Path, description = "Team identifier")),
    request_body = DeviceRequest,
    responses(
        (status = 204, description = "Device bound to the team"),
        (status = 409, description = "Team already connected elsewhere")
    )
)]
pub async fn connect_device(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Valid(Json(payload)): Valid<Json<DeviceRequest>>,
) -> Result<StatusCode, AppError> {
    team_service::connect(&state, id, payload.device_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/live/teams/{id}/disconnect",
    tag = "teams",
    params(("id" = Uuid, Path, description = "Team identifier")),
    request_body = DeviceRequest,
    responses((status = 204, description = "Device released"))
)]
pub async fn disconnect_device(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Valid(Json(payload)): Valid<Json<DeviceRequest>>,
) -> Result<StatusCode, AppError> {
    team_service::disconnect(&state, id, &payload.device_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
