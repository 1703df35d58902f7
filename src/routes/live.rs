use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post, put},
};
use axum_valid::Valid;
use uuid::Uuid;

use crate::{
    dto::{
        control::{
            AnswerRequest, AnswerResponse, ArmRequest, BuzzRequest, BuzzResponse,
            ExcludedTeamsRequest, GradeRequest, LaunchQuestionRequest, LeaderboardRequest,
            ResolveRequest, RevealRequest, ScoreResponse, TimerStartRequest,
        },
        session::{LoadSnapshotRequest, SessionSnapshot},
    },
    error::AppError,
    services::{answer_service, buzzer_service, state_service, timer_service},
    state::{SharedState, game::GameState, presence::Actor, session::GameCommand},
};

/// Control-room commands on the live session.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/live/snapshot", get(get_snapshot).put(load_snapshot))
        .route("/live/question", post(launch_question))
        .route("/live/question/stop", post(stop_question))
        .route("/live/buzzer/arm", post(arm))
        .route("/live/buzzer/disarm", post(disarm))
        .route("/live/buzzer/resolve", post(resolve))
        .route("/live/buzz", post(buzz))
        .route("/live/reveal", post(reveal))
        .route("/live/excluded", put(set_excluded))
        .route("/live/leaderboard", put(set_leaderboard))
        .route("/live/reset", post(reset_all))
        .route("/live/timer/start", post(start_timer))
        .route("/live/timer/stop", post(stop_timer))
        .route("/live/timer/reset", post(reset_timer))
        .route("/live/answers", post(submit_answer))
        .route("/live/answers/{team_id}/grade", post(grade_answer))
}

async fn command(state: &SharedState, command: GameCommand) -> Result<Json<GameState>, AppError> {
    Ok(Json(state_service::apply_command(state, command).await?))
}

/// Game state and roster of the live session.
#[utoipa::path(
    get,
    path = "/live/snapshot",
    tag = "live",
    responses((status = 200, description = "Current snapshot", body = SessionSnapshot))
)]
pub async fn get_snapshot(State(state): State<SharedState>) -> Result<Json<SessionSnapshot>, AppError> {
    Ok(Json(state_service::get_snapshot(&state).await?))
}

/// Replace the game state and roster wholesale, e.g. from a backup.
#[utoipa::path(
    put,
    path = "/live/snapshot",
    tag = "live",
    request_body = LoadSnapshotRequest,
    responses((status = 200, description = "Snapshot restored and broadcast", body = SessionSnapshot))
)]
pub async fn load_snapshot(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<LoadSnapshotRequest>>,
) -> Result<Json<SessionSnapshot>, AppError> {
    Ok(Json(state_service::load_snapshot(&state, payload).await?))
}

/// Launch a new instance of a question.
#[utoipa::path(
    post,
    path = "/live/question",
    tag = "live",
    request_body = LaunchQuestionRequest,
    responses((status = 200, description = "Question launched", body = GameState))
)]
pub async fn launch_question(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<LaunchQuestionRequest>>,
) -> Result<Json<GameState>, AppError> {
    command(
        &state,
        GameCommand::LaunchQuestion {
            question_ref: payload.question_ref,
            preserve_exclusions: payload.preserve_exclusions,
        },
    )
    .await
}

#[utoipa::path(
    post,
    path = "/live/question/stop",
    tag = "live",
    responses((status = 200, description = "Question closed", body = GameState))
)]
pub async fn stop_question(State(state): State<SharedState>) -> Result<Json<GameState>, AppError> {
    command(&state, GameCommand::StopQuestion).await
}

/// Arm the buzzers of the active instance.
#[utoipa::path(
    post,
    path = "/live/buzzer/arm",
    tag = "live",
    request_body = ArmRequest,
    responses(
        (status = 200, description = "Buzzers armed", body = GameState),
        (status = 409, description = "No active instance or a winner is locked")
    )
)]
pub async fn arm(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<ArmRequest>>,
) -> Result<Json<GameState>, AppError> {
    command(
        &state,
        GameCommand::Arm {
            preserve_exclusions: payload.preserve_exclusions,
        },
    )
    .await
}

#[utoipa::path(
    post,
    path = "/live/buzzer/disarm",
    tag = "live",
    responses((status = 200, description = "Buzzers disarmed", body = GameState))
)]
pub async fn disarm(State(state): State<SharedState>) -> Result<Json<GameState>, AppError> {
    command(&state, GameCommand::Disarm).await
}

/// Judge the locked team's answer.
#[utoipa::path(
    post,
    path = "/live/buzzer/resolve",
    tag = "live",
    request_body = ResolveRequest,
    responses((status = 200, description = "Winner judged", body = ScoreResponse))
)]
pub async fn resolve(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<ResolveRequest>>,
) -> Result<Json<ScoreResponse>, AppError> {
    let judgement = buzzer_service::resolve(&state, payload.correct, payload.points).await?;
    Ok(Json(ScoreResponse {
        team_id: judgement.resolution.winner,
        score: judgement.score,
    }))
}

/// Buzz on behalf of a team.
#[utoipa::path(
    post,
    path = "/live/buzz",
    tag = "live",
    request_body = BuzzRequest,
    responses(
        (status = 200, description = "Buzz recorded", body = BuzzResponse),
        (status = 409, description = "Buzz rejected")
    )
)]
pub async fn buzz(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<BuzzRequest>>,
) -> Result<Json<BuzzResponse>, AppError> {
    let outcome =
        buzzer_service::attempt(
            &state,
            payload.team_id,
            Actor::Operator,
            payload.instance_id,
            payload.client_ts,
        )
        .await?;
    Ok(Json(BuzzResponse::from(&outcome)))
}

#[utoipa::path(
    post,
    path = "/live/reveal",
    tag = "live",
    request_body = RevealRequest,
    responses((status = 200, description = "Reveal flag set", body = GameState))
)]
pub async fn reveal(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<RevealRequest>>,
) -> Result<Json<GameState>, AppError> {
    command(&state, GameCommand::SetReveal(payload.revealed)).await
}

/// Replace the set of teams barred from buzzing.
#[utoipa::path(
    put,
    path = "/live/excluded",
    tag = "live",
    request_body = ExcludedTeamsRequest,
    responses((status = 200, description = "Exclusions replaced", body = GameState))
)]
pub async fn set_excluded(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<ExcludedTeamsRequest>>,
) -> Result<Json<GameState>, AppError> {
    command(&state, GameCommand::SetExcludedTeams(payload.teams)).await
}

#[utoipa::path(
    put,
    path = "/live/leaderboard",
    tag = "live",
    request_body = LeaderboardRequest,
    responses((status = 200, description = "Leaderboard page set", body = GameState))
)]
pub async fn set_leaderboard(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<LeaderboardRequest>>,
) -> Result<Json<GameState>, AppError> {
    command(&state, GameCommand::SetLeaderboardPage(payload.page)).await
}

/// Back to a blank board with zero scores.
#[utoipa::path(
    post,
    path = "/live/reset",
    tag = "live",
    responses((status = 200, description = "Board reset", body = GameState))
)]
pub async fn reset_all(State(state): State<SharedState>) -> Result<Json<GameState>, AppError> {
    command(&state, GameCommand::ResetAll).await
}

#[utoipa::path(
    post,
    path = "/live/timer/start",
    tag = "live",
    request_body = TimerStartRequest,
    responses((status = 200, description = "Countdown started", body = GameState))
)]
pub async fn start_timer(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<TimerStartRequest>>,
) -> Result<Json<GameState>, AppError> {
    Ok(Json(timer_service::start(&state, payload.seconds).await?))
}

#[utoipa::path(
    post,
    path = "/live/timer/stop",
    tag = "live",
    responses((status = 200, description = "Countdown frozen", body = GameState))
)]
pub async fn stop_timer(State(state): State<SharedState>) -> Result<Json<GameState>, AppError> {
    Ok(Json(timer_service::stop(&state).await?))
}

#[utoipa::path(
    post,
    path = "/live/timer/reset",
    tag = "live",
    responses((status = 200, description = "Countdown cleared", body = GameState))
)]
pub async fn reset_timer(State(state): State<SharedState>) -> Result<Json<GameState>, AppError> {
    Ok(Json(timer_service::reset(&state).await?))
}

/// Submit an answer on behalf of a team.
#[utoipa::path(
    post,
    path = "/live/answers",
    tag = "live",
    request_body = AnswerRequest,
    responses((status = 200, description = "Answer stored", body = AnswerResponse))
)]
pub async fn submit_answer(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<AnswerRequest>>,
) -> Result<Json<AnswerResponse>, AppError> {
    let answer =
        answer_service::submit(
            &state,
            payload.team_id,
            Actor::Operator,
            payload.instance_id,
            payload.value,
        )
        .await?;
    Ok(Json(AnswerResponse {
        team_id: answer.team_id,
        instance_id: answer.instance_id,
        submitted_at: answer.submitted_at,
    }))
}

/// Grade a team's answer on the active instance.
#[utoipa::path(
    post,
    path = "/live/answers/{team_id}/grade",
    tag = "live",
    params(("team_id" = Uuid, Path, description = "Team whose answer is graded")),
    request_body = GradeRequest,
    responses(
        (status = 200, description = "Answer graded", body = ScoreResponse),
        (status = 404, description = "No answer from this team")
    )
)]
pub async fn grade_answer(
    State(state): State<SharedState>,
    Path(team_id): Path<Uuid>,
    Valid(Json(payload)): Valid<Json<GradeRequest>>,
) -> Result<Json<ScoreResponse>, AppError> {
    let (_, score) = answer_service::grade(&state, team_id, payload.correct, payload.points).await?;
    Ok(Json(ScoreResponse { team_id, score }))
}

#[cfg(test)]
mod tests {
    use axum::{
        Router,
        body::Body,
        http::{Method, Request, StatusCode, header::CONTENT_TYPE},
    };
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use crate::{routes, services::testing::live_fixture};

    async fn call(app: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn buzzer_round_over_http() {
        let fixture = live_fixture(2).await;
        let app = routes::router(fixture.state.clone());

        let (status, game) = call(
            app.clone(),
            Method::POST,
            "/live/question",
            Some(json!({ "question_ref": "q-12" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(game["activeInstance"]["questionRef"], "q-12");

        let (status, _) = call(app.clone(), Method::POST, "/live/buzzer/arm", Some(json!({}))).await;
        assert_eq!(status, StatusCode::OK);

        let (status, buzz) = call(
            app.clone(),
            Method::POST,
            "/live/buzz",
            Some(json!({ "team_id": fixture.teams[0] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(buzz["winner"], true);

        let (status, error) = call(
            app.clone(),
            Method::POST,
            "/live/buzz",
            Some(json!({ "team_id": fixture.teams[0] })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(error["message"].is_string());

        let (status, score) = call(
            app,
            Method::POST,
            "/live/buzzer/resolve",
            Some(json!({ "correct": true, "points": 3 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(score["score"], 3);
    }

    #[tokio::test]
    async fn invalid_payloads_are_bad_requests() {
        let fixture = live_fixture(1).await;
        let app = routes::router(fixture.state.clone());

        let (status, _) = call(
            app.clone(),
            Method::POST,
            "/live/question",
            Some(json!({ "question_ref": "" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            app,
            Method::POST,
            "/live/timer/start",
            Some(json!({ "seconds": 0 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn degraded_mode_refuses_commands_with_503() {
        let fixture = live_fixture(1).await;
        fixture.state.update_degraded(true).await;
        let app = routes::router(fixture.state.clone());

        let (status, _) = call(app.clone(), Method::POST, "/live/reset", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, snapshot) = call(app, Method::GET, "/live/snapshot", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(snapshot["teams"].as_array().unwrap().len(), 1);
    }
}
