use std::time::{Duration, SystemTime};

use indexmap::IndexMap;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::{
    dao::models::{
        AnswerEntity, BoardEntity, BuzzerAttemptEntity, BuzzerEntity, BuzzerPhaseEntity,
        QuestionInstanceEntity, SessionEntity, SessionStatusEntity, TeamColorEntity, TeamEntity,
    },
    state::{
        arbiter::{ArbiterError, BuzzOutcome, BuzzRejection, BuzzerArbiter, BuzzerPhase, Resolution},
        game::{
            Answer, BuzzerAttempt, CountdownState, GameState, QuestionInstance, Session,
            SessionStatus, Team, TeamColor,
        },
        timer::Countdown,
    },
};

/// Operator commands mutating the game state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameCommand {
    /// Enable buzzers on the active instance.
    Arm {
        /// Keep teams excluded by earlier wrong answers.
        preserve_exclusions: bool,
    },
    /// Disable buzzers.
    Disarm,
    /// Mint a new instance of `question_ref` and make it active.
    LaunchQuestion {
        /// Opaque reference to the question content.
        question_ref: String,
        /// Carry exclusions over from the previous instance.
        preserve_exclusions: bool,
    },
    /// Close the active instance.
    StopQuestion,
    /// Show or hide the answer on the displays.
    SetReveal(bool),
    /// Replace the set of teams barred from buzzing.
    SetExcludedTeams(Vec<Uuid>),
    /// Page of the leaderboard to display.
    SetLeaderboardPage(u32),
    /// Back to a blank board: no instance, no answers, zero scores.
    ResetAll,
}

/// Failures while applying a command to the live session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// The buzzer phase does not allow the transition.
    #[error(transparent)]
    Arbiter(#[from] ArbiterError),
    /// The team is not on the roster.
    #[error("unknown team `{0}`")]
    UnknownTeam(Uuid),
    /// No question instance is running.
    #[error("no active question instance")]
    NoActiveInstance,
    /// The caller targeted an instance that is no longer active.
    #[error("stale question instance `{0}`")]
    StaleInstance(Uuid),
    /// Answers are one per team and instance.
    #[error("team `{0}` already answered this question")]
    AlreadyAnswered(Uuid),
    /// Nothing to grade for the team on the active instance.
    #[error("no answer from team `{0}` on the active question")]
    AnswerNotFound(Uuid),
    /// Launch without a question reference.
    #[error("question reference must not be empty")]
    EmptyQuestionRef,
}

/// The session currently loaded by the authority, with everything needed to
/// project [`GameState`] and persist it as a [`SessionEntity`].
#[derive(Debug, Clone)]
pub struct LiveSession {
    pub session: Session,
    /// Roster in creation order.
    pub teams: IndexMap<Uuid, Team>,
    pub arbiter: BuzzerArbiter,
    pub active_instance: Option<QuestionInstance>,
    /// Sequence number of the last minted instance.
    pub instance_sequence: u32,
    pub revealed: bool,
    pub leaderboard_page: u32,
    /// Live countdown driving the ticks.
    pub countdown: Countdown,
    /// Countdown as last written into the game state.
    pub countdown_view: CountdownState,
    /// A pause froze a running countdown; resuming restarts it.
    pub countdown_suspended: bool,
    /// Submitted answers, tagged with their instance.
    pub answers: Vec<Answer>,
    /// Bumped by every committed write.
    pub version: u64,
    /// Server time (milliseconds) of the last committed write.
    pub updated_at: u64,
}

impl LiveSession {
    /// Wrap a session and its roster with a blank board.
    pub fn new(session: Session, teams: IndexMap<Uuid, Team>) -> Self {
        Self {
            session,
            teams,
            arbiter: BuzzerArbiter::new(),
            active_instance: None,
            instance_sequence: 0,
            revealed: false,
            leaderboard_page: 0,
            countdown: Countdown::default(),
            countdown_view: CountdownState::default(),
            countdown_suspended: false,
            answers: Vec::new(),
            version: 0,
            updated_at: 0,
        }
    }

    /// Identifier of the loaded session.
    pub fn id(&self) -> Uuid {
        self.session.id
    }

    /// Project the authoritative game state.
    pub fn game_state(&self) -> GameState {
        GameState {
            session_id: self.session.id,
            active_instance: self.active_instance.clone(),
            buzzer_armed: self.arbiter.is_armed(),
            locked_team: self.arbiter.locked_team(),
            excluded_teams: self.arbiter.excluded().collect(),
            revealed: self.revealed,
            countdown: self.countdown_view,
            leaderboard_page: self.leaderboard_page,
            version: self.version,
            updated_at: self.updated_at,
        }
    }

    /// Bump the version after a successful mutation.
    pub fn touch(&mut self, now_ms: u64) {
        self.version += 1;
        self.updated_at = now_ms;
        self.session.updated_at = SystemTime::now();
    }

    /// Apply an operator command to the draft.
    pub fn apply_command(&mut self, command: GameCommand, now_ms: u64) -> Result<(), CommandError> {
        match command {
            GameCommand::Arm {
                preserve_exclusions,
            } => self.arbiter.arm(preserve_exclusions)?,
            GameCommand::Disarm => self.arbiter.disarm()?,
            GameCommand::LaunchQuestion {
                question_ref,
                preserve_exclusions,
            } => {
                let question_ref = question_ref.trim();
                if question_ref.is_empty() {
                    return Err(CommandError::EmptyQuestionRef);
                }
                self.instance_sequence += 1;
                let instance = QuestionInstance {
                    id: Uuid::new_v4(),
                    question_ref: question_ref.to_owned(),
                    sequence: self.instance_sequence,
                    created_at: now_ms,
                };
                self.arbiter.relaunch(instance.id, preserve_exclusions);
                self.active_instance = Some(instance);
                self.revealed = false;
            }
            GameCommand::StopQuestion => {
                if self.active_instance.take().is_none() {
                    return Err(CommandError::NoActiveInstance);
                }
                self.arbiter.clear_instance();
            }
            GameCommand::SetReveal(revealed) => self.revealed = revealed,
            GameCommand::SetExcludedTeams(teams) => {
                if let Some(unknown) = teams.iter().find(|id| !self.teams.contains_key(*id)) {
                    return Err(CommandError::UnknownTeam(*unknown));
                }
                self.arbiter.set_excluded(teams);
            }
            GameCommand::SetLeaderboardPage(page) => self.leaderboard_page = page,
            GameCommand::ResetAll => {
                self.active_instance = None;
                self.arbiter.clear_instance();
                self.revealed = false;
                self.leaderboard_page = 0;
                self.reset_countdown();
                self.answers.clear();
                for team in self.teams.values_mut() {
                    team.score = 0;
                    team.updated_at = SystemTime::now();
                }
            }
        }
        Ok(())
    }

    /// Record a buzz attempt for a known team.
    pub fn attempt_buzz(
        &mut self,
        team_id: Uuid,
        instance_id: Option<Uuid>,
        client_ts: Option<u64>,
        now_ms: u64,
    ) -> Result<BuzzOutcome, BuzzRejection> {
        if !self.teams.contains_key(&team_id) {
            return Err(BuzzRejection::UnknownTeam(team_id));
        }
        self.arbiter.attempt(team_id, instance_id, client_ts, now_ms)
    }

    /// Judge the locked winner and credit `points` on a correct answer.
    ///
    /// Returns the resolution and the winner's score afterwards.
    pub fn resolve_buzz(&mut self, correct: bool, points: i32) -> Result<(Resolution, i32), CommandError> {
        let resolution = self.arbiter.resolve(correct)?;
        let score = if correct {
            self.adjust_score(resolution.winner, points)?
        } else {
            self.team(resolution.winner)?.score
        };
        Ok((resolution, score))
    }

    /// Register a team's answer on the active instance.
    pub fn submit_answer(
        &mut self,
        team_id: Uuid,
        instance_id: Option<Uuid>,
        value: serde_json::Value,
        now_ms: u64,
    ) -> Result<Answer, CommandError> {
        self.team(team_id)?;
        let active = self.require_instance(instance_id)?;
        if self
            .answers
            .iter()
            .any(|answer| answer.team_id == team_id && answer.instance_id == active)
        {
            return Err(CommandError::AlreadyAnswered(team_id));
        }

        let answer = Answer {
            team_id,
            instance_id: active,
            value,
            correct: None,
            points: 0,
            submitted_at: now_ms,
        };
        self.answers.push(answer.clone());
        Ok(answer)
    }

    /// Grade a team's answer on the active instance.
    ///
    /// Regrading replaces the previously awarded points. Returns the graded
    /// answer and the team's score afterwards.
    pub fn grade_answer(
        &mut self,
        team_id: Uuid,
        correct: bool,
        points: i32,
    ) -> Result<(Answer, i32), CommandError> {
        let active = self.require_instance(None)?;
        let answer = self
            .answers
            .iter_mut()
            .find(|answer| answer.team_id == team_id && answer.instance_id == active)
            .ok_or(CommandError::AnswerNotFound(team_id))?;

        let awarded = if correct { points } else { 0 };
        let delta = awarded - answer.points;
        answer.correct = Some(correct);
        answer.points = awarded;
        let graded = answer.clone();

        let score = self.adjust_score(team_id, delta)?;
        Ok((graded, score))
    }

    /// Add a team to the roster, returning its identifier.
    pub fn add_team(&mut self, name: String, color: TeamColor) -> Uuid {
        let id = Uuid::new_v4();
        self.teams.insert(id, Team::new(name, color));
        id
    }

    /// Add `delta` to a team's score.
    pub fn adjust_score(&mut self, team_id: Uuid, delta: i32) -> Result<i32, CommandError> {
        let team = self
            .teams
            .get_mut(&team_id)
            .ok_or(CommandError::UnknownTeam(team_id))?;
        team.score = team.score.saturating_add(delta);
        team.updated_at = SystemTime::now();
        Ok(team.score)
    }

    /// Bind or release the device of a team.
    pub fn set_device(&mut self, team_id: Uuid, device_id: Option<String>) -> Result<(), CommandError> {
        let team = self
            .teams
            .get_mut(&team_id)
            .ok_or(CommandError::UnknownTeam(team_id))?;
        team.device_id = device_id;
        team.updated_at = SystemTime::now();
        Ok(())
    }

    /// Start the countdown at `now`.
    pub fn start_countdown(&mut self, now: Instant, seconds: u64) {
        self.countdown.start(now, seconds);
        self.countdown_view = self.countdown.state(now);
    }

    /// Freeze the countdown at `now`.
    pub fn stop_countdown(&mut self, now: Instant) {
        self.countdown.stop(now);
        self.countdown_view = self.countdown.state(now);
    }

    /// Clear the countdown.
    pub fn reset_countdown(&mut self) {
        self.countdown.reset();
        self.countdown_view = CountdownState::default();
        self.countdown_suspended = false;
    }

    /// Freeze a running countdown for a pause. Returns whether one was running.
    pub fn suspend_countdown(&mut self, now: Instant) -> bool {
        if !self.countdown.is_running() {
            return false;
        }
        self.stop_countdown(now);
        self.countdown_suspended = true;
        true
    }

    /// Restart the countdown a pause froze. Returns its new epoch, if any.
    pub fn resume_countdown(&mut self, now: Instant) -> Option<u64> {
        if !std::mem::take(&mut self.countdown_suspended) || !self.countdown.resume(now) {
            return None;
        }
        self.countdown_view = self.countdown.state(now);
        Some(self.countdown.epoch())
    }

    /// Borrow a team or fail with [`CommandError::UnknownTeam`].
    pub fn team(&self, team_id: Uuid) -> Result<&Team, CommandError> {
        self.teams
            .get(&team_id)
            .ok_or(CommandError::UnknownTeam(team_id))
    }

    /// Replace the game state and roster wholesale (backup restore).
    pub fn restore(&mut self, state: GameState, teams: IndexMap<Uuid, Team>) {
        // A game-state backup holds no attempts and cannot tell a resolved
        // buzzer from an idle one, so both come back idle. The arrival counter
        // is kept so server orders stay monotonic.
        let next_order = self.arbiter.next_order();
        let phase = match (state.active_instance.is_some(), state.locked_team) {
            (true, Some(winner)) => BuzzerPhase::Locked { winner },
            (true, None) if state.buzzer_armed => BuzzerPhase::Armed,
            _ => BuzzerPhase::Idle,
        };
        self.arbiter = BuzzerArbiter::from_parts(
            state.active_instance.as_ref().map(|instance| instance.id),
            phase,
            Vec::new(),
            state.excluded_teams.iter().copied(),
            next_order,
        );
        if let Some(instance) = &state.active_instance {
            self.instance_sequence = self.instance_sequence.max(instance.sequence);
        }
        self.active_instance = state.active_instance;
        self.revealed = state.revealed;
        self.leaderboard_page = state.leaderboard_page;
        self.countdown
            .set_stopped(Duration::from_millis(state.countdown.remaining_ms));
        self.countdown_view = CountdownState {
            remaining_ms: state.countdown.remaining_ms,
            running: false,
        };
        self.countdown_suspended = false;
        let active_id = self.active_instance.as_ref().map(|instance| instance.id);
        self.answers
            .retain(|answer| Some(answer.instance_id) == active_id);
        self.teams = teams;
    }

    /// Rebuild the live session from storage, applying the restart policy.
    ///
    /// An armed buzzer comes back disarmed and a running countdown comes back
    /// frozen. Returns the session and whether anything had to be changed.
    pub fn from_entity(entity: SessionEntity) -> (Self, bool) {
        let SessionEntity {
            id,
            name,
            status,
            created_at,
            updated_at,
            teams,
            active_instance,
            instance_sequence,
            buzzer,
            board,
            answers,
            version,
            state_updated_at,
        } = entity;

        let teams = teams
            .into_iter()
            .map(|team| {
                (
                    team.id,
                    Team {
                        name: team.name,
                        color: team.color.into(),
                        score: team.score,
                        device_id: team.device_id,
                        updated_at: team.updated_at,
                    },
                )
            })
            .collect();

        let active_instance: Option<QuestionInstance> = active_instance.map(Into::into);
        let mut arbiter = BuzzerArbiter::from_parts(
            active_instance.as_ref().map(|instance| instance.id),
            buzzer.phase.into(),
            buzzer.attempts.into_iter().map(Into::into).collect(),
            buzzer.excluded_teams,
            buzzer.next_order,
        );
        let mut recovered = arbiter.recover_after_restart();
        if board.countdown_running {
            recovered = true;
        }
        let remaining = Duration::from_millis(board.countdown_remaining_ms);

        let live = Self {
            session: Session {
                id,
                name,
                status: status.into(),
                created_at,
                updated_at,
            },
            teams,
            arbiter,
            active_instance,
            instance_sequence,
            revealed: board.revealed,
            leaderboard_page: board.leaderboard_page,
            countdown: Countdown::stopped(remaining),
            countdown_view: CountdownState {
                remaining_ms: board.countdown_remaining_ms,
                running: false,
            },
            countdown_suspended: false,
            answers: answers.into_iter().map(Into::into).collect(),
            version,
            updated_at: state_updated_at,
        };
        (live, recovered)
    }

    /// Serialize the live session for storage.
    pub fn to_entity(&self) -> SessionEntity {
        SessionEntity {
            id: self.session.id,
            name: self.session.name.clone(),
            status: self.session.status.into(),
            created_at: self.session.created_at,
            updated_at: self.session.updated_at,
            teams: self
                .teams
                .iter()
                .map(|(id, team)| team_entity(*id, team))
                .collect(),
            active_instance: self.active_instance.clone().map(Into::into),
            instance_sequence: self.instance_sequence,
            buzzer: BuzzerEntity {
                phase: self.arbiter.phase().into(),
                attempts: self.arbiter.attempts().iter().cloned().map(Into::into).collect(),
                excluded_teams: self.arbiter.excluded().collect(),
                next_order: self.arbiter.next_order(),
            },
            board: BoardEntity {
                revealed: self.revealed,
                leaderboard_page: self.leaderboard_page,
                countdown_remaining_ms: self.countdown_view.remaining_ms,
                countdown_running: self.countdown_view.running,
            },
            answers: self.answers.iter().cloned().map(Into::into).collect(),
            version: self.version,
            state_updated_at: self.updated_at,
        }
    }

    fn require_instance(&self, requested: Option<Uuid>) -> Result<Uuid, CommandError> {
        let active = self
            .active_instance
            .as_ref()
            .map(|instance| instance.id)
            .ok_or(CommandError::NoActiveInstance)?;
        match requested {
            Some(requested) if requested != active => Err(CommandError::StaleInstance(requested)),
            _ => Ok(active),
        }
    }
}

/// Convert a domain team into its persisted form.
pub fn team_entity(id: Uuid, team: &Team) -> TeamEntity {
    TeamEntity {
        id,
        name: team.name.clone(),
        score: team.score,
        color: team.color.clone().into(),
        device_id: team.device_id.clone(),
        updated_at: team.updated_at,
    }
}

impl From<TeamColorEntity> for TeamColor {
    fn from(value: TeamColorEntity) -> Self {
        Self {
            h: value.h,
            s: value.s,
            v: value.v,
        }
    }
}

impl From<TeamColor> for TeamColorEntity {
    fn from(value: TeamColor) -> Self {
        Self {
            h: value.h,
            s: value.s,
            v: value.v,
        }
    }
}

impl From<SessionStatusEntity> for SessionStatus {
    fn from(value: SessionStatusEntity) -> Self {
        match value {
            SessionStatusEntity::Draft => Self::Draft,
            SessionStatusEntity::Active => Self::Active,
            SessionStatusEntity::Paused => Self::Paused,
            SessionStatusEntity::Completed => Self::Completed,
        }
    }
}

impl From<SessionStatus> for SessionStatusEntity {
    fn from(value: SessionStatus) -> Self {
        match value {
            SessionStatus::Draft => Self::Draft,
            SessionStatus::Active => Self::Active,
            SessionStatus::Paused => Self::Paused,
            SessionStatus::Completed => Self::Completed,
        }
    }
}

impl From<QuestionInstanceEntity> for QuestionInstance {
    fn from(value: QuestionInstanceEntity) -> Self {
        Self {
            id: value.id,
            question_ref: value.question_ref,
            sequence: value.sequence,
            created_at: value.created_at,
        }
    }
}

impl From<QuestionInstance> for QuestionInstanceEntity {
    fn from(value: QuestionInstance) -> Self {
        Self {
            id: value.id,
            question_ref: value.question_ref,
            sequence: value.sequence,
            created_at: value.created_at,
        }
    }
}

impl From<BuzzerPhaseEntity> for BuzzerPhase {
    fn from(value: BuzzerPhaseEntity) -> Self {
        match value {
            BuzzerPhaseEntity::Idle => Self::Idle,
            BuzzerPhaseEntity::Armed => Self::Armed,
            BuzzerPhaseEntity::Locked { winner } => Self::Locked { winner },
            BuzzerPhaseEntity::Resolved { winner, correct } => Self::Resolved { winner, correct },
        }
    }
}

impl From<BuzzerPhase> for BuzzerPhaseEntity {
    fn from(value: BuzzerPhase) -> Self {
        match value {
            BuzzerPhase::Idle => Self::Idle,
            BuzzerPhase::Armed => Self::Armed,
            BuzzerPhase::Locked { winner } => Self::Locked { winner },
            BuzzerPhase::Resolved { winner, correct } => Self::Resolved { winner, correct },
        }
    }
}

impl From<BuzzerAttemptEntity> for BuzzerAttempt {
    fn from(value: BuzzerAttemptEntity) -> Self {
        Self {
            team_id: value.team_id,
            instance_id: value.instance_id,
            server_order: value.server_order,
            client_ts: value.client_ts,
            received_at: value.received_at,
            is_winner: value.is_winner,
        }
    }
}

impl From<BuzzerAttempt> for BuzzerAttemptEntity {
    fn from(value: BuzzerAttempt) -> Self {
        Self {
            team_id: value.team_id,
            instance_id: value.instance_id,
            server_order: value.server_order,
            client_ts: value.client_ts,
            received_at: value.received_at,
            is_winner: value.is_winner,
        }
    }
}

impl From<AnswerEntity> for Answer {
    fn from(value: AnswerEntity) -> Self {
        Self {
            team_id: value.team_id,
            instance_id: value.instance_id,
            value: value.value,
            correct: value.correct,
            points: value.points,
            submitted_at: value.submitted_at,
        }
    }
}

impl From<Answer> for AnswerEntity {
    fn from(value: Answer) -> Self {
        Self {
            team_id: value.team_id,
            instance_id: value.instance_id,
            value: value.value,
            correct: value.correct,
            points: value.points,
            submitted_at: value.submitted_at,
        }
    }
}
