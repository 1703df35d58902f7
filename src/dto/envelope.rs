//! Wire format shared by the private hub and the hosted realtime backend.
//!
//! Every message is an [`Envelope`] `{ channel, event, payload, ts }`. The
//! `event` tag selects one [`ChannelEvent`] variant and the payload must match
//! that variant's shape; anything else is refused with a [`CodecError`] before
//! it reaches a handler.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    dto::{
        bus::{BusEvent, BusEventKind, InstanceRef, RevealAnswer, StartQuestion, TeamRef},
        session::SessionSnapshot,
    },
    state::game::{CountdownState, GameStatePatch},
};

/// Name of the game channel of a session.
pub fn session_channel(session_id: Uuid) -> String {
    format!("session:{session_id}")
}

/// Name of the heartbeat channel of a session.
pub fn presence_channel(session_id: Uuid) -> String {
    format!("presence:{session_id}")
}

/// Uniform message shape carried by every transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Envelope {
    pub channel: String,
    pub event: String,
    #[schema(value_type = Object)]
    pub payload: Value,
    /// Server timestamp in milliseconds, assigned by the transport.
    pub ts: u64,
}

impl Envelope {
    /// Encode `event` for `channel`.
    pub fn new(channel: impl Into<String>, event: &ChannelEvent, ts: u64) -> Result<Self, CodecError> {
        Ok(Self {
            channel: channel.into(),
            event: event.name().to_owned(),
            payload: event.payload()?,
            ts,
        })
    }

    /// Validate the payload against the tag.
    pub fn decode_event(&self) -> Result<ChannelEvent, CodecError> {
        ChannelEvent::decode(&self.event, self.payload.clone())
    }

    /// Parse a raw JSON frame.
    pub fn from_json_str(raw: &str) -> Result<Self, CodecError> {
        serde_json::from_str(raw).map_err(CodecError::Frame)
    }
}

/// Failures of the envelope codec.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown event `{0}`")]
    UnknownEvent(String),
    #[error("invalid payload for `{event}`")]
    Payload {
        event: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode payload for `{event}`")]
    Encode {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed envelope")]
    Frame(#[source] serde_json::Error),
}

/// Winner or late notice for a buzz attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuzzResult {
    pub team_id: Uuid,
    pub instance_id: Uuid,
    pub server_order: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreUpdate {
    pub team_id: Uuid,
    pub score: i32,
}

/// Buzz request sent by a team device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientBuzz {
    pub team_id: Uuid,
    /// Device pressing the buzzer; required once the team is bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Instance the device believes is active.
    #[serde(default)]
    pub instance_id: Option<Uuid>,
    /// Device clock at press time; advisory only.
    #[serde(default)]
    pub client_ts: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientAnswer {
    pub team_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default)]
    pub instance_id: Option<Uuid>,
    pub value: Value,
}

/// A device claiming, releasing or being refused a team slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceClaim {
    pub team_id: Uuid,
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub team_id: Uuid,
    pub last_seen_at: u64,
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    pub team_id: Uuid,
    pub online: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerExpired {
    #[serde(default)]
    pub instance_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerReceipt {
    pub team_id: Uuid,
    pub instance_id: Uuid,
}

/// Refusal of a channel command, addressed to the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRejected {
    #[serde(default)]
    pub team_id: Option<Uuid>,
    /// Tag of the refused event.
    pub command: String,
    /// Machine-readable code.
    pub code: String,
    pub reason: String,
}

/// Closed set of events carried by envelopes.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    StateFull(Box<SessionSnapshot>),
    StateUpdate(GameStatePatch),
    StateRequest,
    BuzzFirst(BuzzResult),
    BuzzLate(BuzzResult),
    ScoreUpdate(ScoreUpdate),
    RegieLock,
    RegieUnlock,
    ClientBuzz(ClientBuzz),
    ClientAnswer(ClientAnswer),
    ClientJoin(DeviceClaim),
    ClientLeave(DeviceClaim),
    PresenceHeartbeat(Heartbeat),
    PresenceUpdate(PresenceUpdate),
    PresenceBlocked(DeviceClaim),
    TimerTick(CountdownState),
    TimerExpired(TimerExpired),
    AnswerReceived(AnswerReceipt),
    CommandRejected(CommandRejected),
    Bus(BusEvent),
}

impl ChannelEvent {
    /// Wire tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StateFull(_) => "state:full",
            Self::StateUpdate(_) => "state:update",
            Self::StateRequest => "state:request",
            Self::BuzzFirst(_) => "buzz:first",
            Self::BuzzLate(_) => "buzz:late",
            Self::ScoreUpdate(_) => "score:update",
            Self::RegieLock => "regie:lock",
            Self::RegieUnlock => "regie:unlock",
            Self::ClientBuzz(_) => "client:buzz",
            Self::ClientAnswer(_) => "client:answer",
            Self::ClientJoin(_) => "client:join",
            Self::ClientLeave(_) => "client:leave",
            Self::PresenceHeartbeat(_) => "presence:heartbeat",
            Self::PresenceUpdate(_) => "presence:update",
            Self::PresenceBlocked(_) => "presence:blocked",
            Self::TimerTick(_) => "timer:tick",
            Self::TimerExpired(_) => "timer:expired",
            Self::AnswerReceived(_) => "answer:received",
            Self::CommandRejected(_) => "command:rejected",
            Self::Bus(event) => event.kind().tag(),
        }
    }

    /// Whether a device may publish this event through the hub.
    pub fn is_client_originated(&self) -> bool {
        matches!(
            self,
            Self::StateRequest
                | Self::ClientBuzz(_)
                | Self::ClientAnswer(_)
                | Self::ClientJoin(_)
                | Self::ClientLeave(_)
                | Self::PresenceHeartbeat(_)
        )
    }

    /// Encode the payload.
    pub fn payload(&self) -> Result<Value, CodecError> {
        let event = self.name();
        let encoded = match self {
            Self::StateFull(snapshot) => serde_json::to_value(snapshot),
            Self::StateUpdate(patch) => serde_json::to_value(patch),
            Self::StateRequest | Self::RegieLock | Self::RegieUnlock => {
                return Ok(Value::Object(Default::default()));
            }
            Self::BuzzFirst(result) | Self::BuzzLate(result) => serde_json::to_value(result),
            Self::ScoreUpdate(update) => serde_json::to_value(update),
            Self::ClientBuzz(buzz) => serde_json::to_value(buzz),
            Self::ClientAnswer(answer) => serde_json::to_value(answer),
            Self::ClientJoin(claim) | Self::ClientLeave(claim) | Self::PresenceBlocked(claim) => {
                serde_json::to_value(claim)
            }
            Self::PresenceHeartbeat(heartbeat) => serde_json::to_value(heartbeat),
            Self::PresenceUpdate(update) => serde_json::to_value(update),
            Self::TimerTick(countdown) => serde_json::to_value(countdown),
            Self::TimerExpired(expired) => serde_json::to_value(expired),
            Self::AnswerReceived(receipt) => serde_json::to_value(receipt),
            Self::CommandRejected(rejected) => serde_json::to_value(rejected),
            Self::Bus(bus) => match bus {
                BusEvent::StartQuestion(start) => serde_json::to_value(start),
                BusEvent::StopQuestion(instance) | BusEvent::BuzzerReset(instance) => {
                    serde_json::to_value(instance)
                }
                BusEvent::RevealAnswer(reveal) => serde_json::to_value(reveal),
                BusEvent::KickTeam(team) => serde_json::to_value(team),
                BusEvent::ResetAll => return Ok(Value::Object(Default::default())),
            },
        };
        encoded.map_err(|source| CodecError::Encode { event, source })
    }

    /// Decode a payload for `tag`, validating its shape.
    pub fn decode(tag: &str, payload: Value) -> Result<Self, CodecError> {
        let event = match tag {
            "state:full" => Self::StateFull(Box::new(parse(tag, payload)?)),
            "state:update" => Self::StateUpdate(parse(tag, payload)?),
            "state:request" => Self::StateRequest,
            "buzz:first" => Self::BuzzFirst(parse(tag, payload)?),
            "buzz:late" => Self::BuzzLate(parse(tag, payload)?),
            "score:update" => Self::ScoreUpdate(parse(tag, payload)?),
            "regie:lock" => Self::RegieLock,
            "regie:unlock" => Self::RegieUnlock,
            "client:buzz" => Self::ClientBuzz(parse(tag, payload)?),
            "client:answer" => Self::ClientAnswer(parse(tag, payload)?),
            "client:join" => Self::ClientJoin(parse(tag, payload)?),
            "client:leave" => Self::ClientLeave(parse(tag, payload)?),
            "presence:heartbeat" => Self::PresenceHeartbeat(parse(tag, payload)?),
            "presence:update" => Self::PresenceUpdate(parse(tag, payload)?),
            "presence:blocked" => Self::PresenceBlocked(parse(tag, payload)?),
            "timer:tick" => Self::TimerTick(parse(tag, payload)?),
            "timer:expired" => Self::TimerExpired(parse(tag, payload)?),
            "answer:received" => Self::AnswerReceived(parse(tag, payload)?),
            "command:rejected" => Self::CommandRejected(parse(tag, payload)?),
            other => match BusEventKind::from_tag(other) {
                Some(kind) => Self::Bus(decode_bus(kind, tag, payload)?),
                None => return Err(CodecError::UnknownEvent(other.to_owned())),
            },
        };
        Ok(event)
    }
}

fn decode_bus(kind: BusEventKind, tag: &str, payload: Value) -> Result<BusEvent, CodecError> {
    Ok(match kind {
        BusEventKind::StartQuestion => BusEvent::StartQuestion(parse::<StartQuestion>(tag, payload)?),
        BusEventKind::StopQuestion => BusEvent::StopQuestion(parse::<InstanceRef>(tag, payload)?),
        BusEventKind::BuzzerReset => BusEvent::BuzzerReset(parse::<InstanceRef>(tag, payload)?),
        BusEventKind::RevealAnswer => BusEvent::RevealAnswer(parse::<RevealAnswer>(tag, payload)?),
        BusEventKind::KickTeam => BusEvent::KickTeam(parse::<TeamRef>(tag, payload)?),
        BusEventKind::ResetAll => BusEvent::ResetAll,
    })
}

fn parse<T: DeserializeOwned>(tag: &str, payload: Value) -> Result<T, CodecError> {
    serde_json::from_value(payload).map_err(|source| CodecError::Payload {
        event: tag.to_owned(),
        source,
    })
}

impl From<BusEvent> for ChannelEvent {
    fn from(value: BusEvent) -> Self {
        Self::Bus(value)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn envelope_uses_camel_case_payloads() {
        let team_id = Uuid::new_v4();
        let instance_id = Uuid::new_v4();
        let event = ChannelEvent::BuzzFirst(BuzzResult {
            team_id,
            instance_id,
            server_order: 7,
        });
        let envelope = Envelope::new("session:1", &event, 1_000).unwrap();

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["event"], "buzz:first");
        assert_eq!(json["ts"], 1_000);
        assert_eq!(json["payload"]["teamId"], team_id.to_string());
        assert_eq!(json["payload"]["serverOrder"], 7);
        assert_eq!(envelope.decode_event().unwrap(), event);
    }

    #[test]
    fn bus_events_travel_under_their_uppercase_tag() {
        let event = ChannelEvent::Bus(BusEvent::RevealAnswer(RevealAnswer {
            team_id: Uuid::new_v4(),
            instance_id: Uuid::new_v4(),
            correct: false,
            points: 0,
        }));
        let envelope = Envelope::new("session:1", &event, 5).unwrap();
        assert_eq!(envelope.event, "REVEAL_ANSWER");
        assert_eq!(envelope.decode_event().unwrap(), event);

        let reset = Envelope::new("session:1", &ChannelEvent::Bus(BusEvent::ResetAll), 6).unwrap();
        assert_eq!(reset.payload, json!({}));
        assert_eq!(
            reset.decode_event().unwrap(),
            ChannelEvent::Bus(BusEvent::ResetAll)
        );
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = ChannelEvent::decode("buzz:maybe", json!({})).unwrap_err();
        assert!(matches!(err, CodecError::UnknownEvent(tag) if tag == "buzz:maybe"));
    }

    #[test]
    fn payload_shape_mismatch_is_rejected() {
        let err = ChannelEvent::decode("client:buzz", json!({ "team": "nope" })).unwrap_err();
        assert!(matches!(err, CodecError::Payload { event, .. } if event == "client:buzz"));

        let err = ChannelEvent::decode("KICK_TEAM", json!({ "teamId": 12 })).unwrap_err();
        assert!(matches!(err, CodecError::Payload { .. }));
    }

    #[test]
    fn client_buzz_accepts_missing_optional_fields() {
        let team_id = Uuid::new_v4();
        let event = ChannelEvent::decode("client:buzz", json!({ "teamId": team_id })).unwrap();
        assert_eq!(
            event,
            ChannelEvent::ClientBuzz(ClientBuzz {
                team_id,
                device_id: None,
                instance_id: None,
                client_ts: None
            })
        );
        assert!(event.is_client_originated());
    }

    #[test]
    fn only_device_events_are_client_originated() {
        assert!(ChannelEvent::StateRequest.is_client_originated());
        assert!(!ChannelEvent::RegieUnlock.is_client_originated());
        assert!(!ChannelEvent::Bus(BusEvent::ResetAll).is_client_originated());
        assert!(
            !ChannelEvent::BuzzFirst(BuzzResult {
                team_id: Uuid::new_v4(),
                instance_id: Uuid::new_v4(),
                server_order: 1
            })
            .is_client_originated()
        );
    }

    #[test]
    fn malformed_frame_is_a_codec_error() {
        assert!(matches!(
            Envelope::from_json_str("{\"channel\":1}"),
            Err(CodecError::Frame(_))
        ));
    }
}
