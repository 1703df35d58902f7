use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Lifecycle status of a quiz session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created but never activated.
    Draft,
    /// Loaded as the live session driven by the control room.
    Active,
    /// Suspended by the operator; can be activated again.
    Paused,
    /// Finished; kept for the record.
    Completed,
}

/// Metadata describing one live event.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    /// Primary key of the session.
    pub id: Uuid,
    /// Display name shown on the screen and in the control room.
    pub name: String,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Creation timestamp.
    pub created_at: SystemTime,
    /// Last time the session record was written.
    pub updated_at: SystemTime,
}

impl Session {
    /// Build a new draft session.
    pub fn new(name: String) -> Self {
        let now = SystemTime::now();
        Self {
            id: Uuid::new_v4(),
            name,
            status: SessionStatus::Draft,
            created_at: now,
            updated_at: now,
        }
    }
}

/// HSV color assigned to a team.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TeamColor {
    /// Hue in degrees.
    pub h: f32,
    /// Saturation in `[0, 1]`.
    pub s: f32,
    /// Value in `[0, 1]`.
    pub v: f32,
}

/// Participating team, keyed by its identifier in the live session.
#[derive(Debug, Clone, PartialEq)]
pub struct Team {
    /// Display name.
    pub name: String,
    /// Color used on the screen and on the team device.
    pub color: TeamColor,
    /// Cumulative score.
    pub score: i32,
    /// Identifier of the device currently bound to the team slot.
    pub device_id: Option<String>,
    /// Last time this team was updated.
    pub updated_at: SystemTime,
}

impl Team {
    /// Build a fresh team with a zero score and no bound device.
    pub fn new(name: String, color: TeamColor) -> Self {
        Self {
            name,
            color,
            score: 0,
            device_id: None,
            updated_at: SystemTime::now(),
        }
    }
}

/// One activation of a question within a session.
///
/// Buzzes and answers are scoped to an instance so that relaunching the same
/// question never collides with the data of a previous attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuestionInstance {
    /// Identifier minted at launch.
    pub id: Uuid,
    /// Opaque reference to the static question content.
    pub question_ref: String,
    /// Monotonic launch counter within the session.
    pub sequence: u32,
    /// Server timestamp (milliseconds) of the launch.
    pub created_at: u64,
}

/// A team's buzz, as recorded by the authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuzzerAttempt {
    pub team_id: Uuid,
    pub instance_id: Uuid,
    /// Arrival order assigned by the authority; the only input to arbitration.
    pub server_order: u64,
    /// Timestamp reported by the device, kept for analytics only.
    pub client_ts: Option<u64>,
    /// Server timestamp (milliseconds) at which the attempt was recorded.
    pub received_at: u64,
    pub is_winner: bool,
}

/// A team's response to a question instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub team_id: Uuid,
    pub instance_id: Uuid,
    /// Raw answer value as submitted by the device.
    pub value: serde_json::Value,
    /// Correctness, unknown until graded.
    pub correct: Option<bool>,
    /// Points awarded at grading time.
    pub points: i32,
    pub submitted_at: u64,
}

/// Countdown fields mirrored into the game state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CountdownState {
    pub remaining_ms: u64,
    pub running: bool,
}

/// The single authoritative "now" record of a session, as seen by every client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameState {
    pub session_id: Uuid,
    pub active_instance: Option<QuestionInstance>,
    pub buzzer_armed: bool,
    /// Team currently holding the buzzer lock, if any.
    pub locked_team: Option<Uuid>,
    /// Teams barred from buzzing again on the active instance.
    pub excluded_teams: Vec<Uuid>,
    pub revealed: bool,
    pub countdown: CountdownState,
    pub leaderboard_page: u32,
    /// Incremented on every committed write.
    pub version: u64,
    /// Server timestamp (milliseconds) of the last committed write.
    pub updated_at: u64,
}

impl GameState {
    /// Compute the delta turning `self` into `next`.
    ///
    /// `version` and `updated_at` are always carried so mirrors can track
    /// progress even for an otherwise empty change.
    pub fn diff(&self, next: &GameState) -> GameStatePatch {
        GameStatePatch {
            active_instance: (self.active_instance != next.active_instance)
                .then(|| next.active_instance.clone()),
            buzzer_armed: (self.buzzer_armed != next.buzzer_armed).then_some(next.buzzer_armed),
            locked_team: (self.locked_team != next.locked_team).then_some(next.locked_team),
            excluded_teams: (self.excluded_teams != next.excluded_teams)
                .then(|| next.excluded_teams.clone()),
            revealed: (self.revealed != next.revealed).then_some(next.revealed),
            countdown: (self.countdown != next.countdown).then_some(next.countdown),
            leaderboard_page: (self.leaderboard_page != next.leaderboard_page)
                .then_some(next.leaderboard_page),
            version: Some(next.version),
            updated_at: Some(next.updated_at),
        }
    }

    /// Overwrite every field present in `patch`.
    pub fn apply(&mut self, patch: &GameStatePatch) {
        if let Some(instance) = &patch.active_instance {
            self.active_instance = instance.clone();
        }
        if let Some(armed) = patch.buzzer_armed {
            self.buzzer_armed = armed;
        }
        if let Some(locked) = patch.locked_team {
            self.locked_team = locked;
        }
        if let Some(excluded) = &patch.excluded_teams {
            self.excluded_teams = excluded.clone();
        }
        if let Some(revealed) = patch.revealed {
            self.revealed = revealed;
        }
        if let Some(countdown) = patch.countdown {
            self.countdown = countdown;
        }
        if let Some(page) = patch.leaderboard_page {
            self.leaderboard_page = page;
        }
        if let Some(version) = patch.version {
            self.version = version;
        }
        if let Some(updated_at) = patch.updated_at {
            self.updated_at = updated_at;
        }
    }
}

/// Partial game state broadcast as `state:update`.
///
/// Nullable fields use a double option so that "cleared" (`Some(None)`, sent as
/// `null`) stays distinct from "unchanged" (`None`, omitted).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStatePatch {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    pub active_instance: Option<Option<QuestionInstance>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buzzer_armed: Option<bool>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    pub locked_team: Option<Option<Uuid>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excluded_teams: Option<Vec<Uuid>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revealed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub countdown: Option<CountdownState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leaderboard_page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<u64>,
}

impl GameStatePatch {
    /// True when the patch changes nothing but the bookkeeping fields.
    pub fn is_empty(&self) -> bool {
        self.active_instance.is_none()
            && self.buzzer_armed.is_none()
            && self.locked_team.is_none()
            && self.excluded_teams.is_none()
            && self.revealed.is_none()
            && self.countdown.is_none()
            && self.leaderboard_page.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_state() -> GameState {
        GameState {
            session_id: Uuid::new_v4(),
            active_instance: Some(QuestionInstance {
                id: Uuid::new_v4(),
                question_ref: "q-1".into(),
                sequence: 1,
                created_at: 10,
            }),
            buzzer_armed: true,
            locked_team: None,
            excluded_teams: vec![],
            revealed: false,
            countdown: CountdownState::default(),
            leaderboard_page: 0,
            version: 3,
            updated_at: 100,
        }
    }

    #[test]
    fn diff_then_apply_reaches_target() {
        let before = base_state();
        let mut after = before.clone();
        after.active_instance = None;
        after.buzzer_armed = false;
        after.locked_team = Some(Uuid::new_v4());
        after.leaderboard_page = 2;
        after.version = 4;
        after.updated_at = 150;

        let patch = before.diff(&after);
        assert!(!patch.is_empty());
        assert_eq!(patch.revealed, None);

        let mut mirror = before.clone();
        mirror.apply(&patch);
        assert_eq!(mirror, after);
    }

    #[test]
    fn cleared_fields_serialize_as_null_and_untouched_fields_are_omitted() {
        let before = base_state();
        let mut after = before.clone();
        after.active_instance = None;
        after.version = 4;

        let json = serde_json::to_value(before.diff(&after)).unwrap();
        assert_eq!(json["activeInstance"], serde_json::Value::Null);
        assert!(json.get("buzzerArmed").is_none());
        assert!(json.get("lockedTeam").is_none());

        let decoded: GameStatePatch = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.active_instance, Some(None));
        assert_eq!(decoded.locked_team, None);
    }

    #[test]
    fn bookkeeping_only_patch_is_empty() {
        let before = base_state();
        let mut after = before.clone();
        after.version = 4;
        assert!(before.diff(&after).is_empty());
    }
}
