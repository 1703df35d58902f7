use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::state::arbiter::BuzzOutcome;

/// Launch (or relaunch) a question.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct LaunchQuestionRequest {
    /// Opaque reference to the question content.
    #[validate(length(min = 1, max = 256))]
    pub question_ref: String,
    /// Keep teams excluded on the previous instance.
    #[serde(default)]
    pub preserve_exclusions: bool,
}

/// Arm the buzzers.
#[derive(Debug, Default, Deserialize, ToSchema, Validate)]
pub struct ArmRequest {
    #[serde(default)]
    pub preserve_exclusions: bool,
}

/// Judge the locked team's answer.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct ResolveRequest {
    pub correct: bool,
    /// Points credited on a correct answer; defaults to the configured value.
    #[serde(default)]
    #[validate(range(min = -1_000, max = 1_000))]
    pub points: Option<i32>,
}

/// Buzz on behalf of a team (REST fallback for devices without a socket).
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct BuzzRequest {
    pub team_id: Uuid,
    #[serde(default)]
    pub instance_id: Option<Uuid>,
    #[serde(default)]
    pub client_ts: Option<u64>,
}

/// Outcome of an accepted buzz.
#[derive(Debug, Serialize, ToSchema)]
pub struct BuzzResponse {
    pub team_id: Uuid,
    pub instance_id: Uuid,
    pub server_order: u64,
    /// `true` when the buzz won the race.
    pub winner: bool,
}

impl From<&BuzzOutcome> for BuzzResponse {
    fn from(value: &BuzzOutcome) -> Self {
        let attempt = value.attempt();
        Self {
            team_id: attempt.team_id,
            instance_id: attempt.instance_id,
            server_order: attempt.server_order,
            winner: matches!(value, BuzzOutcome::First(_)),
        }
    }
}

#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct RevealRequest {
    pub revealed: bool,
}

#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct ExcludedTeamsRequest {
    #[validate(length(max = 256))]
    pub teams: Vec<Uuid>,
}

#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct LeaderboardRequest {
    #[validate(range(max = 1_000))]
    pub page: u32,
}

/// Start a countdown.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct TimerStartRequest {
    #[validate(range(min = 1, max = 3_600))]
    pub seconds: u64,
}

/// Submit an answer on behalf of a team.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct AnswerRequest {
    pub team_id: Uuid,
    #[serde(default)]
    pub instance_id: Option<Uuid>,
    #[schema(value_type = Object)]
    pub value: serde_json::Value,
}

/// Acknowledgement of a stored answer.
#[derive(Debug, Serialize, ToSchema)]
pub struct AnswerResponse {
    pub team_id: Uuid,
    pub instance_id: Uuid,
    pub submitted_at: u64,
}

/// Grade a team's answer on the active instance.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct GradeRequest {
    pub correct: bool,
    #[serde(default)]
    #[validate(range(min = -1_000, max = 1_000))]
    pub points: Option<i32>,
}

/// Result of a grading or score change.
#[derive(Debug, Serialize, ToSchema)]
pub struct ScoreResponse {
    pub team_id: Uuid,
    pub score: i32,
}
