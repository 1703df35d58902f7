use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    dto::envelope::{BuzzResult, ChannelEvent, CommandRejected, ScoreUpdate},
    error::ServiceError,
    services::{event_bus, presence_service},
    state::{
        SharedState,
        arbiter::{BuzzOutcome, BuzzRejection, Resolution},
        presence::{Actor, authorize},
    },
};

/// Outcome of judging the locked team.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Judgement {
    pub resolution: Resolution,
    pub instance_id: Uuid,
    pub points: i32,
    /// Winner's score after the judgement.
    pub score: i32,
}

/// Record a buzz attempt.
///
/// Refused attempts are returned as [`ServiceError::Rejected`] and leave no
/// trace in storage or on the channel. A device other than the one bound to
/// the team is refused with [`ServiceError::Conflict`].
pub async fn attempt(
    state: &SharedState,
    team_id: Uuid,
    actor: Actor<'_>,
    instance_id: Option<Uuid>,
    client_ts: Option<u64>,
) -> Result<BuzzOutcome, ServiceError> {
    let received_at = state.now_ms();
    let result = state
        .run_write(|live, outbox| {
            if let Some(team) = live.teams.get(&team_id) {
                authorize(team_id, team.device_id.as_deref(), actor)?;
            }
            let outcome = live.attempt_buzz(team_id, instance_id, client_ts, received_at)?;
            let attempt = outcome.attempt();
            let result = BuzzResult {
                team_id: attempt.team_id,
                instance_id: attempt.instance_id,
                server_order: attempt.server_order,
            };
            outbox.push(match &outcome {
                BuzzOutcome::First(_) => ChannelEvent::BuzzFirst(result),
                BuzzOutcome::Late(_) => ChannelEvent::BuzzLate(result),
            });
            Ok(outcome)
        })
        .await;

    match result {
        Ok((outcome, _)) => {
            let attempt = outcome.attempt();
            info!(
                team_id = %attempt.team_id,
                instance_id = %attempt.instance_id,
                server_order = attempt.server_order,
                winner = attempt.is_winner,
                "buzz recorded"
            );
            Ok(outcome)
        }
        Err(ServiceError::Rejected(rejection)) => {
            log_rejection(team_id, &rejection);
            Err(ServiceError::Rejected(rejection))
        }
        Err(err) => {
            presence_service::notify_blocked(state, team_id, actor, &err).await;
            Err(err)
        }
    }
}

/// Judge the locked winner's answer.
///
/// `points` defaults to the configured value and is credited only on a
/// correct answer.
pub async fn resolve(
    state: &SharedState,
    correct: bool,
    points: Option<i32>,
) -> Result<Judgement, ServiceError> {
    let points = points.unwrap_or(state.config().default_points);
    let (judgement, _) = state
        .run_write(|live, outbox| {
            let (resolution, score) = live.resolve_buzz(correct, points)?;
            let instance_id = live
                .arbiter
                .instance_id()
                .ok_or(ServiceError::InvalidState("no active question instance".into()))?;
            let awarded = if correct { points } else { 0 };

            event_bus::emit(
                outbox,
                event_bus::reveal_answer(resolution.winner, instance_id, correct, awarded),
            );
            if correct {
                outbox.push(ChannelEvent::ScoreUpdate(ScoreUpdate {
                    team_id: resolution.winner,
                    score,
                }));
            }
            Ok(Judgement {
                resolution,
                instance_id,
                points: awarded,
                score,
            })
        })
        .await?;

    info!(
        team_id = %judgement.resolution.winner,
        correct,
        points = judgement.points,
        score = judgement.score,
        "buzz resolved"
    );
    Ok(judgement)
}

/// Refusal notice for a channel caller.
pub fn rejection_event(command: &str, team_id: Option<Uuid>, err: &ServiceError) -> ChannelEvent {
    let code = match err {
        ServiceError::Rejected(rejection) => rejection.code(),
        ServiceError::Degraded | ServiceError::Unavailable(_) | ServiceError::Timeout => "unavailable",
        ServiceError::Conflict(_) => "conflict",
        ServiceError::NotFound(_) => "not_found",
        ServiceError::InvalidInput(_) => "invalid_input",
        ServiceError::InvalidState(_) => "invalid_state",
        ServiceError::Transport(_) => "transport",
    };
    ChannelEvent::CommandRejected(CommandRejected {
        team_id,
        command: command.to_owned(),
        code: code.to_owned(),
        reason: err.to_string(),
    })
}

fn log_rejection(team_id: Uuid, rejection: &BuzzRejection) {
    match rejection {
        BuzzRejection::StaleInstance { expected, got } => {
            info!(%team_id, %expected, %got, "buzz on a stale instance ignored");
        }
        BuzzRejection::UnknownTeam(_) => warn!(%team_id, "buzz from unknown team"),
        other => info!(%team_id, reason = other.code(), "buzz rejected"),
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        dto::{
            bus::{BusEvent, RevealAnswer},
            envelope::Envelope,
        },
        services::{state_service::apply_command, testing::live_fixture},
        state::{presence::Actor, session::GameCommand},
    };

    use super::*;

    async fn launch_and_arm(state: &SharedState) -> Uuid {
        let game = apply_command(
            state,
            GameCommand::LaunchQuestion {
                question_ref: "q".into(),
                preserve_exclusions: false,
            },
        )
        .await
        .unwrap();
        apply_command(
            state,
            GameCommand::Arm {
                preserve_exclusions: false,
            },
        )
        .await
        .unwrap();
        game.active_instance.unwrap().id
    }

    fn decoded(envelope: Envelope) -> ChannelEvent {
        envelope.decode_event().unwrap()
    }

    #[tokio::test]
    async fn five_teams_single_winner_and_late_acknowledgements() {
        let fixture = live_fixture(5).await;
        let instance = launch_and_arm(&fixture.state).await;
        let mut mirror = fixture.join_session().await;

        let outcomes = futures::future::join_all(
            fixture
                .teams
                .iter()
                .map(|team| attempt(&fixture.state, *team, Actor::Operator, Some(instance), Some(0))),
        )
        .await;
        let winners: Vec<Uuid> = outcomes
            .into_iter()
            .map(Result::unwrap)
            .filter(|outcome| matches!(outcome, BuzzOutcome::First(_)))
            .map(|outcome| outcome.attempt().team_id)
            .collect();
        assert_eq!(winners.len(), 1);

        let snapshot = fixture.state.snapshot().await.unwrap();
        assert_eq!(snapshot.state.locked_team, Some(winners[0]));
        assert!(!snapshot.state.buzzer_armed);

        let mut orders = Vec::new();
        let mut firsts = 0;
        let mut lates = 0;
        while orders.len() < 5 {
            match decoded(mirror.recv().await.unwrap()) {
                ChannelEvent::BuzzFirst(result) => {
                    firsts += 1;
                    orders.push(result.server_order);
                }
                ChannelEvent::BuzzLate(result) => {
                    lates += 1;
                    orders.push(result.server_order);
                }
                _ => {}
            }
        }
        assert_eq!((firsts, lates), (1, 4));
        assert!(orders.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[tokio::test]
    async fn duplicate_and_unarmed_buzzes_are_rejected_without_write() {
        let fixture = live_fixture(2).await;
        let game = apply_command(
            &fixture.state,
            GameCommand::LaunchQuestion {
                question_ref: "q".into(),
                preserve_exclusions: false,
            },
        )
        .await
        .unwrap();

        let err = attempt(&fixture.state, fixture.teams[0], Actor::Operator, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Rejected(BuzzRejection::NotArmed)));

        apply_command(
            &fixture.state,
            GameCommand::Arm {
                preserve_exclusions: false,
            },
        )
        .await
        .unwrap();
        attempt(&fixture.state, fixture.teams[0], Actor::Operator, None, None).await.unwrap();
        let version = fixture.store.get(fixture.session_id).unwrap().version;

        let err = attempt(&fixture.state, fixture.teams[0], Actor::Operator, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Rejected(BuzzRejection::AlreadyBuzzed(_))));
        assert_eq!(fixture.store.get(fixture.session_id).unwrap().version, version);

        let active = game.active_instance.map(|instance| instance.id);
        let stale = attempt(&fixture.state, fixture.teams[1], Actor::Operator, Some(Uuid::new_v4()), None)
            .await
            .unwrap_err();
        assert!(matches!(
            stale,
            ServiceError::Rejected(BuzzRejection::StaleInstance { expected, .. })
                if Some(expected) == active
        ));
    }

    #[tokio::test]
    async fn incorrect_answer_excludes_winner_and_rearms() {
        let fixture = live_fixture(3).await;
        let instance = launch_and_arm(&fixture.state).await;
        let [first, second, third] = [fixture.teams[0], fixture.teams[1], fixture.teams[2]];

        attempt(&fixture.state, first, Actor::Operator, None, None).await.unwrap();
        attempt(&fixture.state, second, Actor::Operator, None, None).await.unwrap();
        let mut mirror = fixture.join_session().await;

        let judgement = resolve(&fixture.state, false, Some(10)).await.unwrap();
        assert_eq!(judgement.resolution.winner, first);
        assert_eq!(judgement.points, 0);

        let snapshot = fixture.state.snapshot().await.unwrap();
        assert!(snapshot.state.buzzer_armed);
        assert_eq!(snapshot.state.excluded_teams, vec![first]);
        assert_eq!(snapshot.state.active_instance.unwrap().id, instance);

        assert_eq!(mirror.recv().await.unwrap().event, "state:update");
        assert_eq!(
            decoded(mirror.recv().await.unwrap()),
            ChannelEvent::Bus(BusEvent::RevealAnswer(RevealAnswer {
                team_id: first,
                instance_id: instance,
                correct: false,
                points: 0,
            }))
        );

        let err = attempt(&fixture.state, first, Actor::Operator, None, None).await.unwrap_err();
        assert!(matches!(err, ServiceError::Rejected(BuzzRejection::Excluded(_))));
        // Attempts were cleared, so the earlier late team may buzz again.
        let outcome = attempt(&fixture.state, second, Actor::Operator, None, None).await.unwrap();
        assert!(matches!(outcome, BuzzOutcome::First(_)));
        let late = attempt(&fixture.state, third, Actor::Operator, None, None).await.unwrap();
        assert!(matches!(late, BuzzOutcome::Late(_)));
    }

    #[tokio::test]
    async fn correct_answer_credits_points_and_clears_exclusions() {
        let fixture = live_fixture(2).await;
        launch_and_arm(&fixture.state).await;
        attempt(&fixture.state, fixture.teams[0], Actor::Operator, None, None).await.unwrap();
        resolve(&fixture.state, false, None).await.unwrap();
        attempt(&fixture.state, fixture.teams[1], Actor::Operator, None, None).await.unwrap();

        let judgement = resolve(&fixture.state, true, None).await.unwrap();
        assert_eq!(judgement.points, fixture.state.config().default_points);

        let snapshot = fixture.state.snapshot().await.unwrap();
        assert!(snapshot.state.excluded_teams.is_empty());
        assert!(!snapshot.state.buzzer_armed);
        let winner = snapshot
            .teams
            .iter()
            .find(|team| team.id == fixture.teams[1])
            .unwrap();
        assert_eq!(winner.score, judgement.score);
        assert_eq!(winner.score, fixture.state.config().default_points);
    }

    #[tokio::test]
    async fn relaunch_discards_lock_and_rejects_old_instance() {
        let fixture = live_fixture(2).await;
        let old = launch_and_arm(&fixture.state).await;
        attempt(&fixture.state, fixture.teams[0], Actor::Operator, None, None).await.unwrap();

        let fresh = launch_and_arm(&fixture.state).await;
        assert_ne!(old, fresh);
        let snapshot = fixture.state.snapshot().await.unwrap();
        assert_eq!(snapshot.state.locked_team, None);
        assert_eq!(snapshot.state.active_instance.unwrap().sequence, 2);

        let err = attempt(&fixture.state, fixture.teams[1], Actor::Operator, Some(old), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Rejected(BuzzRejection::StaleInstance { .. })));
        let outcome = attempt(&fixture.state, fixture.teams[0], Actor::Operator, Some(fresh), None)
            .await
            .unwrap();
        assert!(matches!(outcome, BuzzOutcome::First(_)));
    }

    #[test]
    fn rejection_events_carry_machine_codes() {
        let team = Uuid::new_v4();
        let event = rejection_event(
            "client:buzz",
            Some(team),
            &ServiceError::Rejected(BuzzRejection::Excluded(team)),
        );
        let ChannelEvent::CommandRejected(rejected) = event else {
            panic!("expected command:rejected");
        };
        assert_eq!(rejected.code, "excluded");
        assert_eq!(rejected.team_id, Some(team));
    }
}
