use indexmap::IndexSet;
use thiserror::Error;
use uuid::Uuid;

use crate::state::game::BuzzerAttempt;

/// Phases the buzzer goes through for the active question instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuzzerPhase {
    /// Buzzers are disabled; waiting for the control room to arm them.
    Idle,
    /// Buzzers accept attempts; the first recorded one wins.
    Armed,
    /// A team won the race and is answering.
    Locked {
        /// Team that buzzed first.
        winner: Uuid,
    },
    /// The winner's answer was judged correct.
    Resolved {
        /// Team that answered.
        winner: Uuid,
        /// Outcome of the judgement.
        correct: bool,
    },
}

/// Events that can be applied to the buzzer state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuzzerEvent {
    /// Control room (re-)enables the buzzers.
    Arm,
    /// Control room disables the buzzers.
    Disarm,
    /// A team's attempt is the first one recorded while armed.
    Buzz {
        /// Buzzing team.
        team_id: Uuid,
    },
    /// Control room judges the winner's answer.
    Resolve {
        /// Whether the answer was correct.
        correct: bool,
    },
    /// A new instance replaced the current one.
    Relaunch,
}

/// Error returned when attempting to apply an invalid transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} cannot be applied while in {from:?}")]
pub struct InvalidTransition {
    /// The phase the arbiter was in when the event was received.
    pub from: BuzzerPhase,
    /// The event that cannot be applied from this phase.
    pub event: BuzzerEvent,
}

/// Errors raised by operator-driven arbiter operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArbiterError {
    /// No question instance is active.
    #[error("no active question instance")]
    NoActiveInstance,
    /// The requested event is not valid in the current phase.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

/// Reasons a buzz attempt is refused without being recorded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuzzRejection {
    /// Buzzers are not armed.
    #[error("buzzer is not armed")]
    NotArmed,
    /// No question instance is active.
    #[error("no active question instance")]
    NoActiveInstance,
    /// The attempt targets an instance that has been superseded.
    #[error("stale question instance `{got}` (active instance is `{expected}`)")]
    StaleInstance {
        /// Instance currently active.
        expected: Uuid,
        /// Instance named by the attempt.
        got: Uuid,
    },
    /// The team is barred from buzzing on this instance.
    #[error("team `{0}` is excluded from this question")]
    Excluded(Uuid),
    /// The team already has an attempt recorded for this instance.
    #[error("team `{0}` already buzzed on this question")]
    AlreadyBuzzed(Uuid),
    /// The team does not belong to the live session.
    #[error("unknown team `{0}`")]
    UnknownTeam(Uuid),
}

impl BuzzRejection {
    /// Short machine-readable code used in `command:rejected` payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotArmed => "not_armed",
            Self::NoActiveInstance => "no_active_instance",
            Self::StaleInstance { .. } => "stale_instance",
            Self::Excluded(_) => "excluded",
            Self::AlreadyBuzzed(_) => "already_buzzed",
            Self::UnknownTeam(_) => "unknown_team",
        }
    }
}

/// Result of a recorded buzz attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuzzOutcome {
    /// The attempt won the race and locked the buzzer.
    First(BuzzerAttempt),
    /// The attempt arrived after the winner; acknowledged but discarded.
    Late(BuzzerAttempt),
}

impl BuzzOutcome {
    /// Borrow the recorded attempt.
    pub fn attempt(&self) -> &BuzzerAttempt {
        match self {
            Self::First(attempt) | Self::Late(attempt) => attempt,
        }
    }
}

/// Outcome of judging the winner's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    /// Team that held the lock.
    pub winner: Uuid,
    /// Whether its answer was judged right.
    pub correct: bool,
}

/// Arbitration state for the active question instance.
///
/// Arrival order is a counter owned by the arbiter and never reset, so server
/// orders stay monotonic across instances. Client timestamps are stored with the
/// attempts but never consulted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuzzerArbiter {
    instance_id: Option<Uuid>,
    phase: BuzzerPhase,
    attempts: Vec<BuzzerAttempt>,
    excluded: IndexSet<Uuid>,
    next_order: u64,
}

impl Default for BuzzerArbiter {
    fn default() -> Self {
        Self {
            instance_id: None,
            phase: BuzzerPhase::Idle,
            attempts: Vec::new(),
            excluded: IndexSet::new(),
            next_order: 1,
        }
    }
}

impl BuzzerArbiter {
    /// Create an idle arbiter with no active instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild an arbiter from persisted parts.
    pub fn from_parts(
        instance_id: Option<Uuid>,
        phase: BuzzerPhase,
        attempts: Vec<BuzzerAttempt>,
        excluded: impl IntoIterator<Item = Uuid>,
        next_order: u64,
    ) -> Self {
        Self {
            instance_id,
            phase,
            attempts,
            excluded: excluded.into_iter().collect(),
            next_order: next_order.max(1),
        }
    }

    /// Inspect the current phase.
    pub fn phase(&self) -> BuzzerPhase {
        self.phase
    }

    /// Instance the arbiter is scoped to.
    pub fn instance_id(&self) -> Option<Uuid> {
        self.instance_id
    }

    /// Whether new attempts can still win.
    pub fn is_armed(&self) -> bool {
        matches!(self.phase, BuzzerPhase::Armed)
    }

    /// Team holding the lock, if any.
    pub fn locked_team(&self) -> Option<Uuid> {
        match self.phase {
            BuzzerPhase::Locked { winner } => Some(winner),
            _ => None,
        }
    }

    /// Attempts recorded for the active instance, in arrival order.
    pub fn attempts(&self) -> &[BuzzerAttempt] {
        &self.attempts
    }

    /// Teams currently barred from buzzing.
    pub fn excluded(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.excluded.iter().copied()
    }

    /// Whether `team_id` is barred from buzzing.
    pub fn is_excluded(&self, team_id: Uuid) -> bool {
        self.excluded.contains(&team_id)
    }

    /// Next server order that will be handed out.
    pub fn next_order(&self) -> u64 {
        self.next_order
    }

    /// Enable buzzers for the active instance, dropping previous attempts.
    pub fn arm(&mut self, preserve_exclusions: bool) -> Result<(), ArbiterError> {
        if self.instance_id.is_none() {
            return Err(ArbiterError::NoActiveInstance);
        }
        self.phase = self.compute_transition(BuzzerEvent::Arm)?;
        self.attempts.clear();
        if !preserve_exclusions {
            self.excluded.clear();
        }
        Ok(())
    }

    /// Disable buzzers. Disarming an idle or resolved buzzer is a no-op.
    pub fn disarm(&mut self) -> Result<(), ArbiterError> {
        self.phase = self.compute_transition(BuzzerEvent::Disarm)?;
        Ok(())
    }

    /// Scope the arbiter to a freshly minted instance.
    pub fn relaunch(&mut self, instance_id: Uuid, preserve_exclusions: bool) {
        self.phase = BuzzerPhase::Idle;
        self.instance_id = Some(instance_id);
        self.attempts.clear();
        if !preserve_exclusions {
            self.excluded.clear();
        }
    }

    /// Drop the active instance entirely.
    pub fn clear_instance(&mut self) {
        self.phase = BuzzerPhase::Idle;
        self.instance_id = None;
        self.attempts.clear();
        self.excluded.clear();
    }

    /// Replace the exclusion set.
    pub fn set_excluded(&mut self, teams: impl IntoIterator<Item = Uuid>) {
        self.excluded = teams.into_iter().collect();
    }

    /// Forget a team (e.g. deleted from the roster) everywhere except past winners.
    pub fn forget_team(&mut self, team_id: Uuid) {
        self.excluded.shift_remove(&team_id);
    }

    /// Record a buzz attempt, or explain why it is refused.
    ///
    /// `instance_id` is the instance the device believes is active; `None`
    /// targets whatever instance is active. Refused attempts leave no trace.
    pub fn attempt(
        &mut self,
        team_id: Uuid,
        instance_id: Option<Uuid>,
        client_ts: Option<u64>,
        received_at: u64,
    ) -> Result<BuzzOutcome, BuzzRejection> {
        let active = self.instance_id.ok_or(BuzzRejection::NoActiveInstance)?;
        if let Some(requested) = instance_id
            && requested != active
        {
            return Err(BuzzRejection::StaleInstance {
                expected: active,
                got: requested,
            });
        }

        if !matches!(self.phase, BuzzerPhase::Armed | BuzzerPhase::Locked { .. }) {
            return Err(BuzzRejection::NotArmed);
        }
        if self.excluded.contains(&team_id) {
            return Err(BuzzRejection::Excluded(team_id));
        }
        if self.attempts.iter().any(|attempt| attempt.team_id == team_id) {
            return Err(BuzzRejection::AlreadyBuzzed(team_id));
        }

        let server_order = self.next_order;
        self.next_order += 1;

        let is_winner = self.is_armed();
        let attempt = BuzzerAttempt {
            team_id,
            instance_id: active,
            server_order,
            client_ts,
            received_at,
            is_winner,
        };
        self.attempts.push(attempt.clone());

        if is_winner {
            self.phase = BuzzerPhase::Locked { winner: team_id };
            Ok(BuzzOutcome::First(attempt))
        } else {
            Ok(BuzzOutcome::Late(attempt))
        }
    }

    /// Judge the locked winner's answer.
    ///
    /// A correct answer clears the exclusions and resolves the instance. An
    /// incorrect one excludes the winner and re-arms the same instance for the
    /// remaining teams.
    pub fn resolve(&mut self, correct: bool) -> Result<Resolution, ArbiterError> {
        let next = self.compute_transition(BuzzerEvent::Resolve { correct })?;
        let BuzzerPhase::Locked { winner } = self.phase else {
            return Err(InvalidTransition {
                from: self.phase,
                event: BuzzerEvent::Resolve { correct },
            }
            .into());
        };

        if correct {
            self.excluded.clear();
        } else {
            self.excluded.insert(winner);
            self.attempts.clear();
        }
        self.phase = next;
        Ok(Resolution { winner, correct })
    }

    /// Apply the restart policy: an armed buzzer must be re-armed by an operator.
    ///
    /// Returns `true` when the phase changed.
    pub fn recover_after_restart(&mut self) -> bool {
        if self.is_armed() {
            self.phase = BuzzerPhase::Idle;
            true
        } else {
            false
        }
    }

    /// Compute a transition from an event if the transition is valid.
    fn compute_transition(&self, event: BuzzerEvent) -> Result<BuzzerPhase, InvalidTransition> {
        let next = match (self.phase, event) {
            (_, BuzzerEvent::Arm) => BuzzerPhase::Armed,
            (BuzzerPhase::Armed | BuzzerPhase::Locked { .. }, BuzzerEvent::Disarm) => {
                BuzzerPhase::Idle
            }
            (phase @ (BuzzerPhase::Idle | BuzzerPhase::Resolved { .. }), BuzzerEvent::Disarm) => {
                phase
            }
            (BuzzerPhase::Armed, BuzzerEvent::Buzz { team_id }) => {
                BuzzerPhase::Locked { winner: team_id }
            }
            (BuzzerPhase::Locked { winner }, BuzzerEvent::Resolve { correct: true }) => {
                BuzzerPhase::Resolved {
                    winner,
                    correct: true,
                }
            }
            (BuzzerPhase::Locked { .. }, BuzzerEvent::Resolve { correct: false }) => {
                BuzzerPhase::Armed
            }
            (_, BuzzerEvent::Relaunch) => BuzzerPhase::Idle,
            (from, event) => return Err(InvalidTransition { from, event }),
        };

        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn armed_on(instance: Uuid) -> BuzzerArbiter {
        let mut arbiter = BuzzerArbiter::new();
        arbiter.relaunch(instance, false);
        arbiter.arm(false).unwrap();
        arbiter
    }

    #[test]
    fn initial_state_is_idle_without_instance() {
        let arbiter = BuzzerArbiter::new();
        assert_eq!(arbiter.phase(), BuzzerPhase::Idle);
        assert_eq!(arbiter.instance_id(), None);
    }

    #[test]
    fn arming_requires_an_instance() {
        let mut arbiter = BuzzerArbiter::new();
        assert_eq!(arbiter.arm(false), Err(ArbiterError::NoActiveInstance));
    }

    #[test]
    fn server_order_decides_the_winner_regardless_of_client_timestamps() {
        let instance = Uuid::new_v4();
        let mut arbiter = armed_on(instance);
        let teams: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();

        // Later arrivals claim ever earlier client clocks.
        let outcomes: Vec<BuzzOutcome> = teams
            .iter()
            .enumerate()
            .map(|(i, team)| {
                let forged_ts = 1_000 - (i as u64) * 100;
                arbiter
                    .attempt(*team, Some(instance), Some(forged_ts), 50 + i as u64)
                    .unwrap()
            })
            .collect();

        let winners: Vec<_> = outcomes
            .iter()
            .filter(|o| matches!(o, BuzzOutcome::First(_)))
            .collect();
        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0].attempt().team_id, teams[0]);
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, BuzzOutcome::Late(_)))
                .count(),
            4
        );
        assert_eq!(arbiter.locked_team(), Some(teams[0]));
        assert_eq!(arbiter.attempts().iter().filter(|a| a.is_winner).count(), 1);

        let orders: Vec<u64> = arbiter.attempts().iter().map(|a| a.server_order).collect();
        assert!(orders.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn second_attempt_from_same_team_is_rejected() {
        let instance = Uuid::new_v4();
        let mut arbiter = armed_on(instance);
        let team = Uuid::new_v4();
        arbiter.attempt(team, None, None, 1).unwrap();
        assert_eq!(
            arbiter.attempt(team, None, None, 2),
            Err(BuzzRejection::AlreadyBuzzed(team))
        );
        assert_eq!(arbiter.attempts().len(), 1);
    }

    #[test]
    fn attempts_are_refused_when_not_armed() {
        let instance = Uuid::new_v4();
        let mut arbiter = BuzzerArbiter::new();
        arbiter.relaunch(instance, false);
        assert_eq!(
            arbiter.attempt(Uuid::new_v4(), Some(instance), None, 1),
            Err(BuzzRejection::NotArmed)
        );
        assert!(arbiter.attempts().is_empty());
    }

    #[test]
    fn stale_instance_is_rejected() {
        let old = Uuid::new_v4();
        let current = Uuid::new_v4();
        let mut arbiter = armed_on(old);
        arbiter.relaunch(current, false);
        arbiter.arm(false).unwrap();

        let err = arbiter
            .attempt(Uuid::new_v4(), Some(old), None, 1)
            .unwrap_err();
        assert_eq!(
            err,
            BuzzRejection::StaleInstance {
                expected: current,
                got: old
            }
        );
    }

    #[test]
    fn incorrect_answer_excludes_winner_and_rearms_same_instance() {
        let instance = Uuid::new_v4();
        let mut arbiter = armed_on(instance);
        let winner = Uuid::new_v4();
        let other = Uuid::new_v4();
        arbiter.attempt(winner, Some(instance), None, 1).unwrap();
        arbiter.attempt(other, Some(instance), None, 2).unwrap();

        let resolution = arbiter.resolve(false).unwrap();
        assert_eq!(resolution.winner, winner);
        assert!(!resolution.correct);
        assert!(arbiter.is_armed());
        assert_eq!(arbiter.instance_id(), Some(instance));
        assert!(arbiter.is_excluded(winner));

        assert_eq!(
            arbiter.attempt(winner, Some(instance), None, 3),
            Err(BuzzRejection::Excluded(winner))
        );
        // The late team from the first race gets a fresh chance.
        let outcome = arbiter.attempt(other, Some(instance), None, 4).unwrap();
        assert!(matches!(outcome, BuzzOutcome::First(_)));
    }

    #[test]
    fn correct_answer_resolves_and_clears_exclusions() {
        let instance = Uuid::new_v4();
        let mut arbiter = armed_on(instance);
        let excluded = Uuid::new_v4();
        arbiter.set_excluded([excluded]);
        let winner = Uuid::new_v4();
        arbiter.attempt(winner, None, None, 1).unwrap();

        arbiter.resolve(true).unwrap();
        assert_eq!(
            arbiter.phase(),
            BuzzerPhase::Resolved {
                winner,
                correct: true
            }
        );
        assert_eq!(arbiter.excluded().count(), 0);
    }

    #[test]
    fn resolve_without_winner_is_invalid() {
        let mut arbiter = armed_on(Uuid::new_v4());
        match arbiter.resolve(true) {
            Err(ArbiterError::InvalidTransition(invalid)) => {
                assert_eq!(invalid.from, BuzzerPhase::Armed);
                assert_eq!(invalid.event, BuzzerEvent::Resolve { correct: true });
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn relaunch_lets_previously_excluded_team_buzz_again() {
        let first = Uuid::new_v4();
        let mut arbiter = armed_on(first);
        let team = Uuid::new_v4();
        arbiter.attempt(team, None, None, 1).unwrap();
        arbiter.resolve(false).unwrap();
        assert!(arbiter.is_excluded(team));

        let second = Uuid::new_v4();
        arbiter.relaunch(second, false);
        assert_eq!(arbiter.phase(), BuzzerPhase::Idle);
        arbiter.arm(false).unwrap();
        let outcome = arbiter.attempt(team, Some(second), None, 2).unwrap();
        assert!(matches!(outcome, BuzzOutcome::First(_)));
    }

    #[test]
    fn rearm_can_preserve_exclusions() {
        let instance = Uuid::new_v4();
        let mut arbiter = armed_on(instance);
        let team = Uuid::new_v4();
        arbiter.set_excluded([team]);
        arbiter.disarm().unwrap();
        arbiter.arm(true).unwrap();
        assert!(arbiter.is_excluded(team));
        arbiter.arm(false).unwrap();
        assert!(!arbiter.is_excluded(team));
    }

    #[test]
    fn disarm_is_idempotent() {
        let mut arbiter = armed_on(Uuid::new_v4());
        arbiter.disarm().unwrap();
        arbiter.disarm().unwrap();
        assert_eq!(arbiter.phase(), BuzzerPhase::Idle);
    }

    #[test]
    fn restart_recovery_disarms_but_keeps_a_locked_winner() {
        let mut armed = armed_on(Uuid::new_v4());
        assert!(armed.recover_after_restart());
        assert_eq!(armed.phase(), BuzzerPhase::Idle);

        let mut locked = armed_on(Uuid::new_v4());
        let team = Uuid::new_v4();
        locked.attempt(team, None, None, 1).unwrap();
        assert!(!locked.recover_after_restart());
        assert_eq!(locked.locked_team(), Some(team));
    }

    #[test]
    fn server_orders_keep_growing_across_instances() {
        let mut arbiter = armed_on(Uuid::new_v4());
        let first = arbiter.attempt(Uuid::new_v4(), None, None, 1).unwrap();
        arbiter.relaunch(Uuid::new_v4(), false);
        arbiter.arm(false).unwrap();
        let second = arbiter.attempt(Uuid::new_v4(), None, None, 2).unwrap();
        assert!(second.attempt().server_order > first.attempt().server_order);
    }
}
