//! Device-side copy of the live session.
//!
//! A mirror starts empty, buffers `state:update` deltas until the first
//! `state:full` arrives, then keeps itself current from the session channel.
//! Later snapshots (answers to a periodic `state:request`) overwrite the local
//! copy and report whether it had drifted.

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    dto::{
        bus::BusEvent,
        envelope::{ChannelEvent, CodecError, Envelope, PresenceUpdate, ScoreUpdate},
        session::SessionSnapshot,
        team::TeamSummary,
    },
    state::{
        game::{CountdownState, GameState, GameStatePatch},
        timer::LocalCountdown,
    },
};

/// What a single envelope did to the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorChange {
    /// A snapshot replaced the local copy.
    Loaded {
        /// The previous copy differed from the snapshot.
        divergent: bool,
        /// Buffered deltas applied on top of the snapshot.
        replayed: usize,
    },
    /// A delta or side update was applied.
    Applied,
    /// A delta was kept until the first snapshot.
    Buffered,
    /// A delta older than the current snapshot was discarded.
    Stale,
    /// The envelope does not concern the mirror.
    Ignored,
}

/// Local replica of the game state and roster.
#[derive(Debug, Default)]
pub struct StateMirror {
    current: Option<SessionSnapshot>,
    pending: Vec<(u64, GameStatePatch)>,
    countdown: LocalCountdown,
}

impl StateMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a snapshot has been received.
    pub fn is_synced(&self) -> bool {
        self.current.is_some()
    }

    pub fn state(&self) -> Option<&GameState> {
        self.current.as_ref().map(|snapshot| &snapshot.state)
    }

    pub fn teams(&self) -> &[TeamSummary] {
        self.current
            .as_ref()
            .map(|snapshot| snapshot.teams.as_slice())
            .unwrap_or_default()
    }

    pub fn team(&self, team_id: uuid::Uuid) -> Option<&TeamSummary> {
        self.teams().iter().find(|team| team.id == team_id)
    }

    /// Server timestamp of the snapshot the mirror is based on.
    pub fn snapshot_ts(&self) -> Option<u64> {
        self.current.as_ref().map(|snapshot| snapshot.ts)
    }

    /// Number of deltas waiting for the first snapshot.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Interpolated countdown at `now`.
    pub fn remaining_ms(&self, now: Instant) -> u64 {
        self.countdown.remaining_ms(now)
    }

    /// Forget the local copy so the next `state:full` is the new base.
    ///
    /// Called on every new socket: deltas missed while disconnected make the
    /// old copy unusable, and later deltas are buffered until the snapshot.
    pub fn resync(&mut self) {
        self.current = None;
        self.pending.clear();
        self.countdown = LocalCountdown::default();
    }

    /// Feed one channel envelope.
    pub fn handle(&mut self, envelope: &Envelope, now: Instant) -> Result<MirrorChange, CodecError> {
        let event = envelope.decode_event()?;
        Ok(self.apply_event(&event, envelope.ts, now))
    }

    /// Apply an already decoded event carried by an envelope stamped `ts`.
    pub fn apply_event(&mut self, event: &ChannelEvent, ts: u64, now: Instant) -> MirrorChange {
        match event {
            ChannelEvent::StateFull(snapshot) => self.apply_snapshot(snapshot.as_ref().clone(), now),
            ChannelEvent::StateUpdate(patch) => self.apply_delta(ts, patch.clone(), now),
            ChannelEvent::TimerTick(countdown) => self.apply_tick(*countdown, now),
            ChannelEvent::ScoreUpdate(update) => self.apply_score(*update),
            ChannelEvent::PresenceUpdate(update) => self.apply_presence(*update),
            ChannelEvent::Bus(BusEvent::KickTeam(team)) => self.update_team(team.team_id, |team| {
                team.device_bound = false;
            }),
            _ => MirrorChange::Ignored,
        }
    }

    /// Replace the local copy with `snapshot`.
    ///
    /// Buffered deltas older than the snapshot are dropped, the rest are
    /// applied in arrival order.
    pub fn apply_snapshot(&mut self, snapshot: SessionSnapshot, now: Instant) -> MirrorChange {
        let divergent = self
            .current
            .as_ref()
            .is_some_and(|current| diverges(current, &snapshot));
        if divergent {
            warn!(
                session_id = %snapshot.state.session_id,
                local_version = self.state().map(|state| state.version),
                version = snapshot.state.version,
                "mirror diverged from the authority; overwriting"
            );
        }

        let snapshot_ts = snapshot.ts;
        self.countdown.sync(now, snapshot.state.countdown);
        self.current = Some(snapshot);

        let mut replayed = 0;
        for (ts, patch) in std::mem::take(&mut self.pending) {
            if ts < snapshot_ts {
                continue;
            }
            self.patch(&patch, now);
            replayed += 1;
        }
        debug!(snapshot_ts, replayed, "mirror loaded snapshot");
        MirrorChange::Loaded {
            divergent,
            replayed,
        }
    }

    /// Apply a `state:update` stamped `ts`.
    pub fn apply_delta(&mut self, ts: u64, patch: GameStatePatch, now: Instant) -> MirrorChange {
        match self.snapshot_ts() {
            None => {
                self.pending.push((ts, patch));
                MirrorChange::Buffered
            }
            Some(snapshot_ts) if ts < snapshot_ts => {
                debug!(ts, snapshot_ts, "dropping delta older than snapshot");
                MirrorChange::Stale
            }
            Some(_) => {
                self.patch(&patch, now);
                MirrorChange::Applied
            }
        }
    }

    fn apply_tick(&mut self, countdown: CountdownState, now: Instant) -> MirrorChange {
        self.countdown.sync(now, countdown);
        match &mut self.current {
            Some(snapshot) => {
                snapshot.state.countdown = countdown;
                MirrorChange::Applied
            }
            None => MirrorChange::Ignored,
        }
    }

    fn apply_score(&mut self, update: ScoreUpdate) -> MirrorChange {
        self.update_team(update.team_id, |team| team.score = update.score)
    }

    fn apply_presence(&mut self, update: PresenceUpdate) -> MirrorChange {
        self.update_team(update.team_id, |team| team.online = update.online)
    }

    fn update_team(&mut self, team_id: uuid::Uuid, change: impl FnOnce(&mut TeamSummary)) -> MirrorChange {
        let team = self
            .current
            .as_mut()
            .and_then(|snapshot| snapshot.teams.iter_mut().find(|team| team.id == team_id));
        match team {
            Some(team) => {
                change(team);
                MirrorChange::Applied
            }
            None => MirrorChange::Ignored,
        }
    }

    fn patch(&mut self, patch: &GameStatePatch, now: Instant) {
        if let Some(snapshot) = &mut self.current {
            snapshot.state.apply(patch);
            if let Some(countdown) = patch.countdown {
                self.countdown.sync(now, countdown);
            }
        }
    }
}

// Heartbeat timestamps move on every beat and are not mirrored.
fn diverges(local: &SessionSnapshot, fresh: &SessionSnapshot) -> bool {
    if local.state != fresh.state || local.teams.len() != fresh.teams.len() {
        return true;
    }
    local.teams.iter().zip(&fresh.teams).any(|(ours, theirs)| {
        ours.id != theirs.id
            || ours.name != theirs.name
            || ours.color != theirs.color
            || ours.score != theirs.score
            || ours.device_bound != theirs.device_bound
            || ours.online != theirs.online
    })
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::state::game::{QuestionInstance, TeamColor};

    fn snapshot(ts: u64) -> SessionSnapshot {
        SessionSnapshot {
            state: GameState {
                session_id: Uuid::nil(),
                active_instance: None,
                buzzer_armed: false,
                locked_team: None,
                excluded_teams: vec![],
                revealed: false,
                countdown: CountdownState::default(),
                leaderboard_page: 0,
                version: 1,
                updated_at: ts,
            },
            teams: vec![TeamSummary {
                id: Uuid::from_u128(1),
                name: "Team 1".into(),
                color: TeamColor { h: 0.0, s: 1.0, v: 1.0 },
                score: 0,
                device_bound: true,
                online: true,
                last_heartbeat_at: Some(ts),
            }],
            ts,
        }
    }

    fn armed(version: u64) -> GameStatePatch {
        GameStatePatch {
            buzzer_armed: Some(true),
            version: Some(version),
            ..Default::default()
        }
    }

    #[test]
    fn deltas_before_the_snapshot_are_buffered_then_filtered() {
        let now = Instant::now();
        let mut mirror = StateMirror::new();
        assert_eq!(mirror.apply_delta(90, armed(1), now), MirrorChange::Buffered);
        assert_eq!(
            mirror.apply_delta(
                110,
                GameStatePatch {
                    leaderboard_page: Some(3),
                    version: Some(2),
                    ..Default::default()
                },
                now
            ),
            MirrorChange::Buffered
        );
        assert_eq!(mirror.pending_len(), 2);

        let change = mirror.apply_snapshot(snapshot(100), now);
        assert_eq!(
            change,
            MirrorChange::Loaded {
                divergent: false,
                replayed: 1
            }
        );
        let state = mirror.state().unwrap();
        assert!(!state.buzzer_armed);
        assert_eq!(state.leaderboard_page, 3);
        assert_eq!(mirror.pending_len(), 0);
    }

    #[test]
    fn deltas_older_than_the_snapshot_are_dropped() {
        let now = Instant::now();
        let mut mirror = StateMirror::new();
        mirror.apply_snapshot(snapshot(100), now);

        assert_eq!(mirror.apply_delta(99, armed(2), now), MirrorChange::Stale);
        assert!(!mirror.state().unwrap().buzzer_armed);

        assert_eq!(mirror.apply_delta(100, armed(2), now), MirrorChange::Applied);
        assert!(mirror.state().unwrap().buzzer_armed);
    }

    #[test]
    fn resync_buffers_deltas_until_the_next_snapshot() {
        let now = Instant::now();
        let mut mirror = StateMirror::new();
        let mut before = snapshot(100);
        before.state.active_instance = Some(QuestionInstance {
            id: Uuid::new_v4(),
            question_ref: "q-1".into(),
            sequence: 1,
            created_at: 90,
        });
        mirror.apply_snapshot(before, now);

        mirror.resync();
        assert!(!mirror.is_synced());
        assert_eq!(mirror.apply_delta(300, armed(5), now), MirrorChange::Buffered);
        assert_eq!(mirror.state(), None);

        let change = mirror.apply_snapshot(snapshot(250), now);
        assert_eq!(
            change,
            MirrorChange::Loaded {
                divergent: false,
                replayed: 1
            }
        );
        let state = mirror.state().unwrap();
        assert!(state.buzzer_armed);
        assert_eq!(state.active_instance, None);
    }

    #[test]
    fn reconciliation_reports_drift_but_not_heartbeat_noise() {
        let now = Instant::now();
        let mut mirror = StateMirror::new();
        mirror.apply_snapshot(snapshot(100), now);

        let mut fresh = snapshot(200);
        fresh.state.updated_at = 100;
        fresh.teams[0].last_heartbeat_at = Some(195);
        assert_eq!(
            mirror.apply_snapshot(fresh, now),
            MirrorChange::Loaded {
                divergent: false,
                replayed: 0
            }
        );

        let mut drifted = snapshot(300);
        drifted.state.updated_at = 100;
        drifted.state.active_instance = Some(QuestionInstance {
            id: Uuid::new_v4(),
            question_ref: "q-7".into(),
            sequence: 7,
            created_at: 250,
        });
        drifted.teams[0].score = 40;
        assert_eq!(
            mirror.apply_snapshot(drifted, now),
            MirrorChange::Loaded {
                divergent: true,
                replayed: 0
            }
        );
        assert_eq!(mirror.team(Uuid::from_u128(1)).unwrap().score, 40);
    }

    #[test]
    fn side_channel_events_update_the_roster() {
        let now = Instant::now();
        let mut mirror = StateMirror::new();
        mirror.apply_snapshot(snapshot(100), now);
        let team_id = Uuid::from_u128(1);

        let score = Envelope::new(
            "session:x",
            &ChannelEvent::ScoreUpdate(ScoreUpdate { team_id, score: 15 }),
            120,
        )
        .unwrap();
        assert_eq!(mirror.handle(&score, now).unwrap(), MirrorChange::Applied);

        let offline = Envelope::new(
            "session:x",
            &ChannelEvent::PresenceUpdate(PresenceUpdate {
                team_id,
                online: false,
            }),
            130,
        )
        .unwrap();
        mirror.handle(&offline, now).unwrap();

        let kick = Envelope::new(
            "session:x",
            &ChannelEvent::Bus(crate::services::event_bus::kick_team(team_id)),
            140,
        )
        .unwrap();
        mirror.handle(&kick, now).unwrap();

        let team = mirror.team(team_id).unwrap();
        assert_eq!(team.score, 15);
        assert!(!team.online);
        assert!(!team.device_bound);
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_drive_the_local_countdown() {
        let mut mirror = StateMirror::new();
        mirror.apply_snapshot(snapshot(100), Instant::now());
        let tick = Envelope::new(
            "session:x",
            &ChannelEvent::TimerTick(CountdownState {
                remaining_ms: 10_000,
                running: true,
            }),
            150,
        )
        .unwrap();
        mirror.handle(&tick, Instant::now()).unwrap();

        tokio::time::advance(std::time::Duration::from_millis(400)).await;
        assert_eq!(mirror.remaining_ms(Instant::now()), 9_600);
        assert!(mirror.state().unwrap().countdown.running);
    }

    #[test]
    fn malformed_payload_is_a_codec_error() {
        let envelope = Envelope {
            channel: "session:x".into(),
            event: "state:update".into(),
            payload: serde_json::json!({ "buzzerArmed": "yes" }),
            ts: 1,
        };
        assert!(StateMirror::new().handle(&envelope, Instant::now()).is_err());
    }

    async fn drain(subscription: &mut crate::services::transport::Subscription, mirror: &mut StateMirror) {
        while let Ok(Some(envelope)) =
            tokio::time::timeout(std::time::Duration::from_millis(100), subscription.recv()).await
        {
            mirror.handle(&envelope, Instant::now()).unwrap();
        }
    }

    #[tokio::test]
    async fn late_joiner_converges_with_a_continuous_mirror() {
        use crate::{
            services::{state_service, testing::live_fixture},
            state::session::GameCommand,
        };

        let fixture = live_fixture(2).await;
        let state = &fixture.state;
        let mut continuous = StateMirror::new();
        let mut continuous_sub = fixture.join_session().await;
        state_service::request_full(state).await.unwrap();

        state_service::apply_command(
            state,
            GameCommand::LaunchQuestion {
                question_ref: "q-1".into(),
                preserve_exclusions: false,
            },
        )
        .await
        .unwrap();
        state_service::apply_command(state, GameCommand::Arm { preserve_exclusions: false })
            .await
            .unwrap();

        let mut late = StateMirror::new();
        let mut late_sub = fixture.join_session().await;
        state_service::apply_command(state, GameCommand::SetLeaderboardPage(2))
            .await
            .unwrap();
        state_service::request_full(state).await.unwrap();
        state_service::apply_command(state, GameCommand::SetReveal(true))
            .await
            .unwrap();

        drain(&mut continuous_sub, &mut continuous).await;
        drain(&mut late_sub, &mut late).await;

        let expected = state.snapshot().await.unwrap().state;
        assert_eq!(continuous.state(), Some(&expected));
        assert_eq!(late.state(), Some(&expected));
        assert_eq!(continuous.teams(), late.teams());
    }
}
