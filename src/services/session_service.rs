use indexmap::IndexMap;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    dao::models::SessionStatusEntity,
    dto::{
        envelope::ChannelEvent,
        session::{CreateSessionRequest, SessionDetail, SessionSnapshot, SessionSummary},
    },
    error::ServiceError,
    services::{authority, presence_service, timer_service},
    state::{
        SharedState,
        game::{Session, SessionStatus, Team, TeamColor},
        session::LiveSession,
    },
};

/// Create a draft session with its initial roster.
pub async fn create(state: &SharedState, request: CreateSessionRequest) -> Result<SessionSummary, ServiceError> {
    let store = state.require_session_store().await?;
    let CreateSessionRequest { name, teams: inputs } = request;

    let mut teams: IndexMap<Uuid, Team> = IndexMap::with_capacity(inputs.len());
    for input in inputs {
        let color = match input.color {
            Some(color) => color.into(),
            None => {
                let used: Vec<TeamColor> = teams.values().map(|team| team.color.clone()).collect();
                state.config().first_unused_color(&used)
            }
        };
        teams.insert(Uuid::new_v4(), Team::new(input.name, color));
    }

    let live = LiveSession::new(Session::new(name), teams);
    state.persist(store.as_ref(), &live).await?;
    info!(session_id = %live.id(), name = %live.session.name, teams = live.teams.len(), "session created");
    Ok(SessionSummary::from_session(&live.session, live.teams.len()))
}

/// Every stored session, oldest first.
pub async fn list(state: &SharedState) -> Result<Vec<SessionSummary>, ServiceError> {
    let store = state.require_session_store().await?;
    let sessions = store.list_sessions().await?;
    Ok(sessions.into_iter().map(Into::into).collect())
}

/// Stored session, served from memory when it is the live one.
pub async fn get(state: &SharedState, session_id: Uuid) -> Result<SessionDetail, ServiceError> {
    let live = state
        .read_live(|live| live.filter(|live| live.id() == session_id).map(SessionDetail::from))
        .await;
    if let Some(detail) = live {
        return Ok(detail);
    }

    let store = state.require_session_store().await?;
    store
        .find_session(session_id)
        .await?
        .map(Into::into)
        .ok_or_else(|| ServiceError::NotFound(format!("session `{session_id}` not found")))
}

/// Make a session the live one and start its authority tasks.
///
/// The previously live session, if any, is paused first. Sessions restored
/// from storage go through the restart policy of [`LiveSession::from_entity`].
pub async fn activate(state: &SharedState, session_id: Uuid) -> Result<SessionSnapshot, ServiceError> {
    let restarted = {
        let _gate = state.write_gate().await;
        let store = state.require_session_store().await?;
        let now = state.now_ms();
        let current = state.read_live(|live| live.cloned()).await;

        match current {
            Some(mut live) if live.id() == session_id => {
                if live.session.status != SessionStatus::Active {
                    live.session.status = SessionStatus::Active;
                    let resumed = live.resume_countdown(Instant::now());
                    live.touch(now);
                    state.persist(store.as_ref(), &live).await?;
                    let instance_id = live.active_instance.as_ref().map(|instance| instance.id);
                    state.replace_live(Some(live)).await;
                    if let Some(epoch) = resumed {
                        timer_service::spawn_ticks(state, instance_id, epoch);
                    }
                    info!(%session_id, countdown_resumed = resumed.is_some(), "session resumed");
                }
                false
            }
            current => {
                let entity = store
                    .find_session(session_id)
                    .await?
                    .ok_or_else(|| ServiceError::NotFound(format!("session `{session_id}` not found")))?;
                if entity.status == SessionStatusEntity::Completed {
                    return Err(ServiceError::InvalidState(format!(
                        "session `{session_id}` is completed"
                    )));
                }

                if let Some(mut previous) = current
                    && previous.session.status == SessionStatus::Active
                {
                    previous.session.status = SessionStatus::Paused;
                    previous.suspend_countdown(Instant::now());
                    previous.touch(now);
                    state.persist(store.as_ref(), &previous).await?;
                    info!(session_id = %previous.id(), "previous live session paused");
                }

                let (mut live, recovered) = LiveSession::from_entity(entity);
                if recovered {
                    warn!(%session_id, "session restored after a restart; buzzer disarmed and countdown frozen");
                }
                live.session.status = SessionStatus::Active;
                live.touch(now);
                state.persist(store.as_ref(), &live).await?;

                state.stop_session_tasks();
                state.presence().clear();
                if let Some(previous) = state.replace_live(Some(live)).await
                    && previous.id() != session_id
                {
                    state.release_channels(previous.id());
                }
                info!(%session_id, "session activated");
                true
            }
        }
    };

    if restarted {
        authority::start(state, session_id).await?;
        presence_service::start_sweeper(state);
    }
    state.publish_snapshot().await
}

/// Suspend the live session; it stays loaded but refuses game commands.
///
/// A running countdown is frozen and picks up again when the session resumes.
pub async fn pause(state: &SharedState) -> Result<SessionSummary, ServiceError> {
    let (summary, _) = state
        .run_lifecycle_write(|live, outbox| {
            if live.session.status == SessionStatus::Completed {
                return Err(ServiceError::InvalidState("session is completed".into()));
            }
            live.session.status = SessionStatus::Paused;
            if live.suspend_countdown(Instant::now()) {
                outbox.push(ChannelEvent::TimerTick(live.countdown_view));
            }
            Ok(SessionSummary::from_session(&live.session, live.teams.len()))
        })
        .await?;
    state.replace_timer_task(None);
    info!(session_id = %summary.id, "session paused");
    Ok(summary)
}

/// Close the live session for good and unload it.
pub async fn complete(state: &SharedState) -> Result<SessionSummary, ServiceError> {
    let _gate = state.write_gate().await;
    let store = state.require_session_store().await?;
    let mut live = state
        .read_live(|live| live.cloned())
        .await
        .ok_or_else(|| ServiceError::InvalidState("no live session".into()))?;

    live.session.status = SessionStatus::Completed;
    live.reset_countdown();
    live.touch(state.now_ms());
    state.persist(store.as_ref(), &live).await?;

    state.stop_session_tasks();
    state.replace_live(None).await;
    state.presence().clear();
    state.release_channels(live.id());
    info!(session_id = %live.id(), "session completed");
    Ok(SessionSummary::from_session(&live.session, live.teams.len()))
}

/// Remove a stored session. The live session cannot be deleted.
pub async fn delete(state: &SharedState, session_id: Uuid) -> Result<(), ServiceError> {
    if state.live_session_id().await == Some(session_id) {
        return Err(ServiceError::Conflict(format!(
            "session `{session_id}` is live; complete it first"
        )));
    }
    let store = state.require_session_store().await?;
    if !store.delete_session(session_id).await? {
        return Err(ServiceError::NotFound(format!("session `{session_id}` not found")));
    }
    state.release_channels(session_id);
    info!(%session_id, "session deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{
        dto::session::TeamInput,
        services::{
            state_service::apply_command,
            testing::{live_fixture, session_request},
        },
        state::session::GameCommand,
    };

    use super::*;

    #[tokio::test]
    async fn activation_pauses_the_previous_live_session() {
        let fixture = live_fixture(2).await;
        let other = create(&fixture.state, session_request("second", 1)).await.unwrap();

        let snapshot = activate(&fixture.state, other.id).await.unwrap();
        assert_eq!(snapshot.state.session_id, other.id);
        assert_eq!(snapshot.teams.len(), 1);

        let previous = fixture.store.get(fixture.session_id).unwrap();
        assert_eq!(previous.status, SessionStatusEntity::Paused);
        assert_eq!(fixture.state.live_session_id().await, Some(other.id));
    }

    #[tokio::test]
    async fn paused_session_refuses_commands_until_resumed() {
        let fixture = live_fixture(1).await;
        pause(&fixture.state).await.unwrap();

        let err = apply_command(&fixture.state, GameCommand::SetReveal(true))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));

        let mut mirror = fixture.join_session().await;
        activate(&fixture.state, fixture.session_id).await.unwrap();
        let full = mirror.recv().await.unwrap();
        assert!(matches!(full.decode_event().unwrap(), ChannelEvent::StateFull(_)));
        apply_command(&fixture.state, GameCommand::SetReveal(true))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn pause_freezes_the_countdown_and_resume_runs_it_out() {
        let fixture = live_fixture(1).await;
        timer_service::start(&fixture.state, 30).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        pause(&fixture.state).await.unwrap();
        let paused = fixture.state.snapshot().await.unwrap();
        assert!(!paused.state.countdown.running);
        assert_eq!(paused.state.countdown.remaining_ms, 20_000);

        tokio::time::sleep(Duration::from_secs(60)).await;
        let still = fixture.state.snapshot().await.unwrap();
        assert_eq!(still.state.countdown.remaining_ms, 20_000);

        let mut mirror = fixture.join_session().await;
        let resumed = activate(&fixture.state, fixture.session_id).await.unwrap();
        assert!(resumed.state.countdown.running);

        loop {
            let envelope = mirror.recv().await.unwrap();
            if let ChannelEvent::TimerExpired(_) = envelope.decode_event().unwrap() {
                break;
            }
        }
        let expired = fixture.state.snapshot().await.unwrap();
        assert!(!expired.state.countdown.running);
        assert_eq!(expired.state.countdown.remaining_ms, 0);
    }

    #[tokio::test]
    async fn resume_leaves_an_operator_stopped_countdown_alone() {
        let fixture = live_fixture(1).await;
        timer_service::start(&fixture.state, 30).await.unwrap();
        timer_service::stop(&fixture.state).await.unwrap();

        pause(&fixture.state).await.unwrap();
        let snapshot = activate(&fixture.state, fixture.session_id).await.unwrap();
        assert!(!snapshot.state.countdown.running);
    }

    #[tokio::test]
    async fn restart_disarms_the_buzzer() {
        let fixture = live_fixture(2).await;
        apply_command(
            &fixture.state,
            GameCommand::LaunchQuestion {
                question_ref: "q".into(),
                preserve_exclusions: false,
            },
        )
        .await
        .unwrap();
        apply_command(
            &fixture.state,
            GameCommand::Arm {
                preserve_exclusions: false,
            },
        )
        .await
        .unwrap();

        // Simulate a process restart: the live session is lost, storage survives.
        fixture.state.stop_session_tasks();
        fixture.state.replace_live(None).await;

        let snapshot = activate(&fixture.state, fixture.session_id).await.unwrap();
        assert!(!snapshot.state.buzzer_armed);
        assert!(snapshot.state.active_instance.is_some());
    }

    #[tokio::test]
    async fn completed_sessions_are_unloaded_and_cannot_return() {
        let fixture = live_fixture(1).await;
        let summary = complete(&fixture.state).await.unwrap();
        assert_eq!(summary.status, SessionStatus::Completed);
        assert_eq!(fixture.state.live_session_id().await, None);

        let err = activate(&fixture.state, fixture.session_id).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));
    }

    #[tokio::test]
    async fn live_session_cannot_be_deleted() {
        let fixture = live_fixture(1).await;
        assert!(matches!(
            delete(&fixture.state, fixture.session_id).await,
            Err(ServiceError::Conflict(_))
        ));
        assert!(matches!(
            delete(&fixture.state, Uuid::new_v4()).await,
            Err(ServiceError::NotFound(_))
        ));

        let draft = create(
            &fixture.state,
            CreateSessionRequest {
                name: "spare".into(),
                teams: vec![TeamInput {
                    name: "A".into(),
                    color: None,
                }],
            },
        )
        .await
        .unwrap();
        assert_eq!(list(&fixture.state).await.unwrap().len(), 2);
        delete(&fixture.state, draft.id).await.unwrap();
        assert_eq!(list(&fixture.state).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn detail_of_live_session_comes_from_memory() {
        let fixture = live_fixture(3).await;
        fixture.store.set_offline(true);
        let detail = get(&fixture.state, fixture.session_id).await.unwrap();
        assert_eq!(detail.teams.len(), 3);
        assert_eq!(detail.summary.status, SessionStatus::Active);
    }
}
