use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    dto::validation::validate_device_id,
    state::{game::{Team, TeamColor}, presence::PresenceRecord},
};

/// Team as shown to mirrors, with runtime presence merged in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TeamSummary {
    pub id: Uuid,
    pub name: String,
    pub color: TeamColor,
    pub score: i32,
    /// Whether a device currently holds the team slot.
    pub device_bound: bool,
    pub online: bool,
    /// Server timestamp (milliseconds) of the last heartbeat.
    #[serde(default)]
    pub last_heartbeat_at: Option<u64>,
}

impl TeamSummary {
    /// Merge a roster entry with its presence record.
    pub fn new(id: Uuid, team: &Team, presence: Option<&PresenceRecord>) -> Self {
        Self {
            id,
            name: team.name.clone(),
            color: team.color.clone(),
            score: team.score,
            device_bound: team.device_id.is_some(),
            online: presence.is_some_and(|record| record.online),
            last_heartbeat_at: presence.map(|record| record.last_heartbeat_at),
        }
    }
}

/// HSV color supplied by the control room.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema, Validate)]
pub struct TeamColorDto {
    #[validate(range(min = -360.0, max = 360.0))]
    pub h: f32,
    #[validate(range(min = 0.0, max = 1.0))]
    pub s: f32,
    #[validate(range(min = 0.0, max = 1.0))]
    pub v: f32,
}

impl From<TeamColorDto> for TeamColor {
    fn from(value: TeamColorDto) -> Self {
        Self {
            h: value.h,
            s: value.s,
            v: value.v,
        }
    }
}

/// Payload used to register a team.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct CreateTeamRequest {
    #[validate(length(min = 1, max = 64))]
    pub name: String,
    /// If omitted, the first unused color of the configured palette is picked.
    #[serde(default)]
    #[validate(nested)]
    pub color: Option<TeamColorDto>,
}

/// Relative score change.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct ScoreAdjustRequest {
    #[validate(range(min = -10_000, max = 10_000))]
    pub delta: i32,
}

/// Device claiming or releasing a team slot over REST.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct DeviceRequest {
    #[validate(custom(function = "validate_device_id"))]
    pub device_id: String,
}
