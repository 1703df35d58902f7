use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Game-level events fanned out to every mirror on the session channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum BusEvent {
    /// A question instance became active.
    StartQuestion(StartQuestion),
    /// The active instance was closed.
    StopQuestion(InstanceRef),
    /// Buzzer attempts were cleared and the buzzer re-armed.
    BuzzerReset(InstanceRef),
    /// The outcome of a team's answer, scoped to that team.
    RevealAnswer(RevealAnswer),
    /// A team was removed from its device by the operator.
    KickTeam(TeamRef),
    /// The whole board was reset.
    ResetAll,
}

/// Payload of `START_QUESTION`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartQuestion {
    pub instance_id: Uuid,
    pub question_ref: String,
    pub sequence: u32,
}

/// Payload naming a question instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRef {
    pub instance_id: Uuid,
}

/// Payload naming a team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TeamRef {
    pub team_id: Uuid,
}

/// Payload of `REVEAL_ANSWER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RevealAnswer {
    pub team_id: Uuid,
    pub instance_id: Uuid,
    pub correct: bool,
    pub points: i32,
}

/// Discriminant of [`BusEvent`], used to register handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusEventKind {
    StartQuestion,
    StopQuestion,
    BuzzerReset,
    RevealAnswer,
    KickTeam,
    ResetAll,
}

impl BusEventKind {
    /// Wire tag of the event kind.
    pub const fn tag(self) -> &'static str {
        match self {
            Self::StartQuestion => "START_QUESTION",
            Self::StopQuestion => "STOP_QUESTION",
            Self::BuzzerReset => "BUZZER_RESET",
            Self::RevealAnswer => "REVEAL_ANSWER",
            Self::KickTeam => "KICK_TEAM",
            Self::ResetAll => "RESET_ALL",
        }
    }

    /// Reverse of [`BusEventKind::tag`].
    pub fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "START_QUESTION" => Self::StartQuestion,
            "STOP_QUESTION" => Self::StopQuestion,
            "BUZZER_RESET" => Self::BuzzerReset,
            "REVEAL_ANSWER" => Self::RevealAnswer,
            "KICK_TEAM" => Self::KickTeam,
            "RESET_ALL" => Self::ResetAll,
            _ => return None,
        })
    }
}

impl BusEvent {
    /// Discriminant of the event.
    pub fn kind(&self) -> BusEventKind {
        match self {
            Self::StartQuestion(_) => BusEventKind::StartQuestion,
            Self::StopQuestion(_) => BusEventKind::StopQuestion,
            Self::BuzzerReset(_) => BusEventKind::BuzzerReset,
            Self::RevealAnswer(_) => BusEventKind::RevealAnswer,
            Self::KickTeam(_) => BusEventKind::KickTeam,
            Self::ResetAll => BusEventKind::ResetAll,
        }
    }

    /// Team the event is addressed to; `None` means every team.
    pub fn team_scope(&self) -> Option<Uuid> {
        match self {
            Self::RevealAnswer(reveal) => Some(reveal.team_id),
            Self::KickTeam(team) => Some(team.team_id),
            _ => None,
        }
    }

    /// Question instance the event belongs to, if any.
    pub fn instance_scope(&self) -> Option<Uuid> {
        match self {
            Self::StartQuestion(start) => Some(start.instance_id),
            Self::StopQuestion(instance) | Self::BuzzerReset(instance) => {
                Some(instance.instance_id)
            }
            Self::RevealAnswer(reveal) => Some(reveal.instance_id),
            Self::KickTeam(_) | Self::ResetAll => None,
        }
    }
}
