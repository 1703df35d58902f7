//! Typed game events published on the session channel.

use tracing::debug;
use uuid::Uuid;

use crate::{
    dto::{
        bus::{BusEvent, InstanceRef, RevealAnswer, StartQuestion, TeamRef},
        envelope::ChannelEvent,
    },
    state::{Outbox, game::QuestionInstance},
};

/// Emit a bus event from within a write; it reaches the session channel
/// once the write is committed, after the matching `state:update`.
pub fn emit(outbox: &mut Outbox, event: BusEvent) {
    debug!(kind = event.kind().tag(), "bus event queued");
    outbox.push(ChannelEvent::Bus(event));
}

pub fn start_question(instance: &QuestionInstance) -> BusEvent {
    BusEvent::StartQuestion(StartQuestion {
        instance_id: instance.id,
        question_ref: instance.question_ref.clone(),
        sequence: instance.sequence,
    })
}

pub fn stop_question(instance_id: Uuid) -> BusEvent {
    BusEvent::StopQuestion(InstanceRef { instance_id })
}

pub fn buzzer_reset(instance_id: Uuid) -> BusEvent {
    BusEvent::BuzzerReset(InstanceRef { instance_id })
}

/// Outcome addressed to a single team.
pub fn reveal_answer(team_id: Uuid, instance_id: Uuid, correct: bool, points: i32) -> BusEvent {
    BusEvent::RevealAnswer(RevealAnswer {
        team_id,
        instance_id,
        correct,
        points,
    })
}

pub fn kick_team(team_id: Uuid) -> BusEvent {
    BusEvent::KickTeam(TeamRef { team_id })
}
