use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::{
    dto::envelope::{AnswerReceipt, ChannelEvent, ScoreUpdate},
    error::ServiceError,
    services::{event_bus, presence_service},
    state::{
        SharedState,
        game::Answer,
        presence::{Actor, authorize},
    },
};

/// Store a team's answer on the active instance and acknowledge it.
///
/// Devices must be the one bound to the team, as for buzzes.
pub async fn submit(
    state: &SharedState,
    team_id: Uuid,
    actor: Actor<'_>,
    instance_id: Option<Uuid>,
    value: Value,
) -> Result<Answer, ServiceError> {
    let now = state.now_ms();
    let result = state
        .run_write(|live, outbox| {
            authorize(team_id, live.team(team_id)?.device_id.as_deref(), actor)?;
            let answer = live.submit_answer(team_id, instance_id, value, now)?;
            outbox.push(ChannelEvent::AnswerReceived(AnswerReceipt {
                team_id,
                instance_id: answer.instance_id,
            }));
            Ok(answer)
        })
        .await;
    let (answer, _) = match result {
        Ok(written) => written,
        Err(err) => {
            presence_service::notify_blocked(state, team_id, actor, &err).await;
            return Err(err);
        }
    };

    info!(%team_id, instance_id = %answer.instance_id, "answer received");
    Ok(answer)
}

/// Grade a team's answer, crediting `points` (or the configured default) when correct.
pub async fn grade(
    state: &SharedState,
    team_id: Uuid,
    correct: bool,
    points: Option<i32>,
) -> Result<(Answer, i32), ServiceError> {
    let points = points.unwrap_or(state.config().default_points);
    let ((answer, score), _) = state
        .run_write(|live, outbox| {
            let (answer, score) = live.grade_answer(team_id, correct, points)?;
            event_bus::emit(
                outbox,
                event_bus::reveal_answer(team_id, answer.instance_id, correct, answer.points),
            );
            outbox.push(ChannelEvent::ScoreUpdate(ScoreUpdate { team_id, score }));
            Ok((answer, score))
        })
        .await?;

    info!(%team_id, correct, points = answer.points, score, "answer graded");
    Ok((answer, score))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::{
        services::{state_service::apply_command, testing::live_fixture},
        state::{presence::Actor, session::GameCommand},
    };

    use super::*;

    async fn launch(state: &SharedState) -> Uuid {
        apply_command(
            state,
            GameCommand::LaunchQuestion {
                question_ref: "q".into(),
                preserve_exclusions: false,
            },
        )
        .await
        .unwrap()
        .active_instance
        .unwrap()
        .id
    }

    #[tokio::test]
    async fn one_answer_per_team_and_instance() {
        let fixture = live_fixture(2).await;
        let instance = launch(&fixture.state).await;
        let mut mirror = fixture.join_session().await;

        let answer = submit(&fixture.state, fixture.teams[0], Actor::Operator, Some(instance), json!("B"))
            .await
            .unwrap();
        assert_eq!(answer.instance_id, instance);
        assert_eq!(answer.points, 0);

        assert_eq!(mirror.recv().await.unwrap().event, "state:update");
        assert_eq!(mirror.recv().await.unwrap().event, "answer:received");

        let err = submit(&fixture.state, fixture.teams[0], Actor::Operator, None, json!("C"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));
    }

    #[tokio::test]
    async fn answers_without_active_instance_are_refused() {
        let fixture = live_fixture(1).await;
        let err = submit(&fixture.state, fixture.teams[0], Actor::Operator, None, json!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));
    }

    #[tokio::test]
    async fn regrading_replaces_awarded_points() {
        let fixture = live_fixture(1).await;
        launch(&fixture.state).await;
        let team = fixture.teams[0];
        submit(&fixture.state, team, Actor::Operator, None, json!({ "choice": 2 }))
            .await
            .unwrap();

        let (answer, score) = grade(&fixture.state, team, true, Some(5)).await.unwrap();
        assert_eq!((answer.correct, answer.points, score), (Some(true), 5, 5));

        let (answer, score) = grade(&fixture.state, team, false, Some(5)).await.unwrap();
        assert_eq!((answer.correct, answer.points, score), (Some(false), 0, 0));
    }

    #[tokio::test]
    async fn grading_a_missing_answer_is_not_found() {
        let fixture = live_fixture(1).await;
        launch(&fixture.state).await;
        let err = grade(&fixture.state, fixture.teams[0], true, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }
}
