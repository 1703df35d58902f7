use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

/// Lifecycle status as stored by the persistence layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatusEntity {
    Draft,
    Active,
    Paused,
    Completed,
}

/// Representation of a team stored in persistence and shared across layers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TeamEntity {
    /// Stable identifier for the team.
    pub id: Uuid,
    /// Display name chosen for the team.
    pub name: String,
    /// Current score for the team.
    pub score: i32,
    /// HSV color assigned to the team.
    pub color: TeamColorEntity,
    /// Device bound to the team slot, if any.
    #[serde(default)]
    pub device_id: Option<String>,
    /// Last time this team was updated.
    pub updated_at: SystemTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamColorEntity {
    pub h: f32,
    pub s: f32,
    pub v: f32,
}

impl PartialEq for TeamColorEntity {
    fn eq(&self, other: &Self) -> bool {
        self.h.to_bits() == other.h.to_bits()
            && self.s.to_bits() == other.s.to_bits()
            && self.v.to_bits() == other.v.to_bits()
    }
}

impl Eq for TeamColorEntity {}

/// One launch of a question.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuestionInstanceEntity {
    pub id: Uuid,
    pub question_ref: String,
    pub sequence: u32,
    pub created_at: u64,
}

/// Persisted buzzer phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum BuzzerPhaseEntity {
    Idle,
    Armed,
    Locked { winner: Uuid },
    Resolved { winner: Uuid, correct: bool },
}

/// Persisted buzz attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuzzerAttemptEntity {
    pub team_id: Uuid,
    pub instance_id: Uuid,
    pub server_order: u64,
    #[serde(default)]
    pub client_ts: Option<u64>,
    pub received_at: u64,
    pub is_winner: bool,
}

/// Arbiter state for the active instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuzzerEntity {
    pub phase: BuzzerPhaseEntity,
    #[serde(default)]
    pub attempts: Vec<BuzzerAttemptEntity>,
    #[serde(default)]
    pub excluded_teams: Vec<Uuid>,
    /// Next arrival order to hand out; never reset within a session.
    pub next_order: u64,
}

/// Display-side fields of the game state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BoardEntity {
    pub revealed: bool,
    pub leaderboard_page: u32,
    pub countdown_remaining_ms: u64,
    pub countdown_running: bool,
}

/// Persisted answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnswerEntity {
    pub team_id: Uuid,
    pub instance_id: Uuid,
    pub value: serde_json::Value,
    #[serde(default)]
    pub correct: Option<bool>,
    #[serde(default)]
    pub points: i32,
    pub submitted_at: u64,
}

/// Aggregate session entity persisted by the storage layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionEntity {
    /// Primary key of the session.
    pub id: Uuid,
    /// Display name of the event.
    pub name: String,
    pub status: SessionStatusEntity,
    /// Creation timestamp for auditing/debugging.
    pub created_at: SystemTime,
    /// Last time the session entity was updated.
    pub updated_at: SystemTime,
    /// Participating teams in display order.
    pub teams: Vec<TeamEntity>,
    #[serde(default)]
    pub active_instance: Option<QuestionInstanceEntity>,
    #[serde(default)]
    pub instance_sequence: u32,
    pub buzzer: BuzzerEntity,
    pub board: BoardEntity,
    #[serde(default)]
    pub answers: Vec<AnswerEntity>,
    /// Game state version at the time of the write.
    pub version: u64,
    /// Server timestamp (milliseconds) of the last game state write.
    pub state_updated_at: u64,
}

/// Subset of [`SessionEntity`] used for listings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSummaryEntity {
    pub id: Uuid,
    pub name: String,
    pub status: SessionStatusEntity,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
    pub team_count: usize,
}

impl From<&SessionEntity> for SessionSummaryEntity {
    fn from(value: &SessionEntity) -> Self {
        Self {
            id: value.id,
            name: value.name.clone(),
            status: value.status,
            created_at: value.created_at,
            updated_at: value.updated_at,
            team_count: value.teams.len(),
        }
    }
}
