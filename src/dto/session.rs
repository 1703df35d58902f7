use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    dao::models::{SessionEntity, SessionSummaryEntity, TeamEntity},
    dto::{
        format_system_time,
        team::{TeamColorDto, TeamSummary},
    },
    state::{
        game::{GameState, Session, SessionStatus},
        session::{LiveSession, team_entity},
    },
};

/// Full picture of the live session: game state plus roster.
///
/// `ts` is the server time at which the snapshot was taken; mirrors drop any
/// delta older than it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub state: GameState,
    pub teams: Vec<TeamSummary>,
    pub ts: u64,
}

/// Payload replacing the game state and roster wholesale.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct LoadSnapshotRequest {
    pub state: GameState,
    #[validate(nested)]
    pub teams: Vec<TeamRestoreInput>,
}

/// Team entry of a restored snapshot.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct TeamRestoreInput {
    pub id: Uuid,
    #[validate(length(min = 1, max = 64))]
    pub name: String,
    #[validate(nested)]
    pub color: TeamColorDto,
    #[serde(default)]
    pub score: i32,
}

/// Team supplied when creating a session.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct TeamInput {
    #[validate(length(min = 1, max = 64))]
    pub name: String,
    #[serde(default)]
    #[validate(nested)]
    pub color: Option<TeamColorDto>,
}

/// Payload used to create a draft session.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct CreateSessionRequest {
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    #[serde(default)]
    #[validate(nested)]
    pub teams: Vec<TeamInput>,
}

/// Session metadata returned by listings and lifecycle routes.
#[derive(Debug, Serialize, ToSchema)]
pub struct SessionSummary {
    pub id: Uuid,
    pub name: String,
    pub status: SessionStatus,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// RFC 3339 time of the last write.
    pub updated_at: String,
    pub team_count: usize,
}

impl From<SessionSummaryEntity> for SessionSummary {
    fn from(value: SessionSummaryEntity) -> Self {
        Self {
            id: value.id,
            name: value.name,
            status: value.status.into(),
            created_at: format_system_time(value.created_at),
            updated_at: format_system_time(value.updated_at),
            team_count: value.team_count,
        }
    }
}

impl SessionSummary {
    /// Summarize a session and its team count.
    pub fn from_session(session: &Session, team_count: usize) -> Self {
        Self {
            id: session.id,
            name: session.name.clone(),
            status: session.status,
            created_at: format_system_time(session.created_at),
            updated_at: format_system_time(session.updated_at),
            team_count,
        }
    }
}

/// Stored session with its roster, for inspection.
#[derive(Debug, Serialize, ToSchema)]
pub struct SessionDetail {
    #[serde(flatten)]
    pub summary: SessionSummary,
    pub teams: Vec<StoredTeam>,
}

/// Persisted team as listed in [`SessionDetail`].
#[derive(Debug, Serialize, ToSchema)]
pub struct StoredTeam {
    pub id: Uuid,
    pub name: String,
    pub score: i32,
}

impl From<TeamEntity> for StoredTeam {
    fn from(value: TeamEntity) -> Self {
        Self {
            id: value.id,
            name: value.name,
            score: value.score,
        }
    }
}

impl From<&LiveSession> for SessionDetail {
    fn from(value: &LiveSession) -> Self {
        Self {
            summary: SessionSummary::from_session(&value.session, value.teams.len()),
            teams: value
                .teams
                .iter()
                .map(|(id, team)| team_entity(*id, team).into())
                .collect(),
        }
    }
}

impl From<SessionEntity> for SessionDetail {
    fn from(value: SessionEntity) -> Self {
        Self {
            summary: SessionSummaryEntity::from(&value).into(),
            teams: value.teams.into_iter().map(Into::into).collect(),
        }
    }
}
