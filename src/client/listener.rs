//! Scoped dispatch of bus events on a device.

use std::collections::HashMap;

use indexmap::IndexSet;
use tracing::debug;
use uuid::Uuid;

use crate::dto::{
    bus::{BusEvent, BusEventKind},
    envelope::{ChannelEvent, CodecError, Envelope},
};

/// Number of recent events remembered for duplicate suppression.
pub const DEFAULT_DEDUP_WINDOW: usize = 128;

type Handler = Box<dyn FnMut(&BusEvent, u64) + Send + Sync>;

/// Outcome of offering one event to the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Delivered to this many handlers.
    Delivered(usize),
    /// Addressed to another team or another question instance.
    OutOfScope,
    /// Already dispatched once.
    Duplicate,
    /// Not a bus event.
    NotBus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct EventKey {
    kind: BusEventKind,
    team: Option<Uuid>,
    instance: Option<Uuid>,
    ts: u64,
}

/// Per-kind handlers filtered by team and question instance.
///
/// The instance scope follows `START_QUESTION` automatically, so a device only
/// reacts to events of the question currently on screen.
pub struct BusListener {
    team_id: Option<Uuid>,
    instance_id: Option<Uuid>,
    handlers: HashMap<BusEventKind, Vec<Handler>>,
    seen: IndexSet<EventKey>,
    window: usize,
}

impl BusListener {
    /// Listener for one team device.
    pub fn for_team(team_id: Uuid) -> Self {
        Self::new(Some(team_id))
    }

    /// Listener receiving events of every team (screens, control room).
    pub fn for_all_teams() -> Self {
        Self::new(None)
    }

    fn new(team_id: Option<Uuid>) -> Self {
        Self {
            team_id,
            instance_id: None,
            handlers: HashMap::new(),
            seen: IndexSet::new(),
            window: DEFAULT_DEDUP_WINDOW,
        }
    }

    /// Register a handler for `kind`; handlers run in registration order.
    pub fn on(&mut self, kind: BusEventKind, handler: impl FnMut(&BusEvent, u64) + Send + Sync + 'static) -> &mut Self {
        self.handlers.entry(kind).or_default().push(Box::new(handler));
        self
    }

    pub fn instance_scope(&self) -> Option<Uuid> {
        self.instance_id
    }

    /// Pin the instance scope, e.g. from a freshly loaded snapshot.
    pub fn set_instance_scope(&mut self, instance_id: Option<Uuid>) {
        self.instance_id = instance_id;
    }

    /// Decode a channel envelope and dispatch it when it is a bus event.
    pub fn handle(&mut self, envelope: &Envelope) -> Result<Dispatch, CodecError> {
        match envelope.decode_event()? {
            ChannelEvent::Bus(event) => Ok(self.dispatch(&event, envelope.ts)),
            _ => Ok(Dispatch::NotBus),
        }
    }

    /// Dispatch a bus event stamped with server time `ts`.
    pub fn dispatch(&mut self, event: &BusEvent, ts: u64) -> Dispatch {
        let kind = event.kind();
        if let (Some(ours), Some(target)) = (self.team_id, event.team_scope())
            && ours != target
        {
            return Dispatch::OutOfScope;
        }

        let starts_instance = matches!(event, BusEvent::StartQuestion(_));
        if !starts_instance
            && let (Some(ours), Some(target)) = (self.instance_id, event.instance_scope())
            && ours != target
        {
            debug!(kind = kind.tag(), %target, "bus event for another instance ignored");
            return Dispatch::OutOfScope;
        }

        let key = EventKey {
            kind,
            team: event.team_scope(),
            instance: event.instance_scope(),
            ts,
        };
        if !self.seen.insert(key) {
            return Dispatch::Duplicate;
        }
        if self.seen.len() > self.window {
            self.seen.shift_remove_index(0);
        }

        match event {
            BusEvent::StartQuestion(start) => self.instance_id = Some(start.instance_id),
            BusEvent::ResetAll => self.instance_id = None,
            _ => {}
        }

        let Some(handlers) = self.handlers.get_mut(&kind) else {
            return Dispatch::Delivered(0);
        };
        for handler in handlers.iter_mut() {
            handler(event, ts);
        }
        Dispatch::Delivered(handlers.len())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::{
        services::event_bus,
        state::game::QuestionInstance,
    };

    fn instance(id: u128) -> QuestionInstance {
        QuestionInstance {
            id: Uuid::from_u128(id),
            question_ref: format!("q-{id}"),
            sequence: id as u32,
            created_at: 0,
        }
    }

    fn recorder(listener: &mut BusListener, kind: BusEventKind) -> Arc<Mutex<Vec<u64>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        listener.on(kind, move |_, ts| sink.lock().unwrap().push(ts));
        seen
    }

    #[test]
    fn reveals_for_other_teams_are_not_dispatched() {
        let ours = Uuid::new_v4();
        let mut listener = BusListener::for_team(ours);
        let reveals = recorder(&mut listener, BusEventKind::RevealAnswer);
        let question = instance(1);
        listener.dispatch(&event_bus::start_question(&question), 10);

        let other = event_bus::reveal_answer(Uuid::new_v4(), question.id, true, 10);
        assert_eq!(listener.dispatch(&other, 20), Dispatch::OutOfScope);
        let mine = event_bus::reveal_answer(ours, question.id, false, 0);
        assert_eq!(listener.dispatch(&mine, 21), Dispatch::Delivered(1));
        assert_eq!(*reveals.lock().unwrap(), vec![21]);
    }

    #[test]
    fn events_of_a_previous_instance_are_ignored() {
        let mut listener = BusListener::for_all_teams();
        let resets = recorder(&mut listener, BusEventKind::BuzzerReset);
        let first = instance(1);
        let second = instance(2);

        listener.dispatch(&event_bus::start_question(&first), 10);
        listener.dispatch(&event_bus::start_question(&second), 20);
        assert_eq!(listener.instance_scope(), Some(second.id));

        assert_eq!(
            listener.dispatch(&event_bus::buzzer_reset(first.id), 30),
            Dispatch::OutOfScope
        );
        assert_eq!(
            listener.dispatch(&event_bus::buzzer_reset(second.id), 31),
            Dispatch::Delivered(1)
        );
        assert_eq!(*resets.lock().unwrap(), vec![31]);
    }

    #[test]
    fn duplicate_delivery_is_a_no_op() {
        let mut listener = BusListener::for_all_teams();
        let resets = recorder(&mut listener, BusEventKind::ResetAll);

        assert_eq!(listener.dispatch(&BusEvent::ResetAll, 50), Dispatch::Delivered(1));
        assert_eq!(listener.dispatch(&BusEvent::ResetAll, 50), Dispatch::Duplicate);
        assert_eq!(listener.dispatch(&BusEvent::ResetAll, 51), Dispatch::Delivered(1));
        assert_eq!(*resets.lock().unwrap(), vec![50, 51]);
    }

    #[test]
    fn dedup_window_forgets_old_events() {
        let mut listener = BusListener::for_all_teams();
        for ts in 0..=DEFAULT_DEDUP_WINDOW as u64 {
            listener.dispatch(&BusEvent::ResetAll, ts);
        }
        assert_eq!(listener.dispatch(&BusEvent::ResetAll, 0), Dispatch::Delivered(0));
    }

    #[test]
    fn non_bus_envelopes_are_passed_over() {
        let mut listener = BusListener::for_all_teams();
        let envelope = Envelope::new("session:x", &ChannelEvent::RegieLock, 5).unwrap();
        assert_eq!(listener.handle(&envelope).unwrap(), Dispatch::NotBus);

        let kick = Envelope::new(
            "session:x",
            &ChannelEvent::Bus(event_bus::kick_team(Uuid::new_v4())),
            6,
        )
        .unwrap();
        assert_eq!(listener.handle(&kick).unwrap(), Dispatch::Delivered(0));
    }

    #[test]
    fn listener_can_be_shared_across_tasks() {
        fn shareable<T: Send + Sync>(_: &T) {}
        let mut listener = BusListener::for_team(Uuid::from_u128(1));
        let _ = recorder(&mut listener, BusEventKind::KickTeam);
        shareable(&listener);
    }
}
