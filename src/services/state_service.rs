use std::collections::HashSet;

use indexmap::IndexMap;
use tracing::info;

use crate::{
    dto::{
        bus::BusEvent,
        envelope::ChannelEvent,
        session::{LoadSnapshotRequest, SessionSnapshot},
    },
    error::ServiceError,
    services::event_bus,
    state::{
        SharedState,
        game::{GameState, Team},
        session::GameCommand,
    },
};

/// Apply an operator command, persist it and broadcast the outcome.
pub async fn apply_command(state: &SharedState, command: GameCommand) -> Result<GameState, ServiceError> {
    let now = state.now_ms();
    let resets_board = matches!(command, GameCommand::ResetAll);
    let summary = format!("{command:?}");

    let ((), game) = state
        .run_write(|live, outbox| {
            let previous = live.active_instance.as_ref().map(|instance| instance.id);
            live.apply_command(command.clone(), now)?;

            match &command {
                GameCommand::LaunchQuestion { .. } => {
                    if let Some(instance) = &live.active_instance {
                        event_bus::emit(outbox, event_bus::start_question(instance));
                    }
                }
                GameCommand::StopQuestion => {
                    if let Some(instance_id) = previous {
                        event_bus::emit(outbox, event_bus::stop_question(instance_id));
                    }
                }
                GameCommand::Arm { .. } => {
                    if let Some(instance_id) = live.arbiter.instance_id() {
                        event_bus::emit(outbox, event_bus::buzzer_reset(instance_id));
                    }
                    outbox.push(ChannelEvent::RegieUnlock);
                }
                GameCommand::Disarm => outbox.push(ChannelEvent::RegieLock),
                GameCommand::ResetAll => {
                    event_bus::emit(outbox, BusEvent::ResetAll);
                }
                GameCommand::SetReveal(_)
                | GameCommand::SetExcludedTeams(_)
                | GameCommand::SetLeaderboardPage(_) => {}
            }
            Ok(())
        })
        .await?;

    if resets_board {
        state.replace_timer_task(None);
        // Scores live in the roster, which deltas do not carry.
        state.publish_snapshot().await?;
    }
    info!(command = %summary, version = game.version, "command applied");
    Ok(game)
}

/// Current snapshot of the live session.
pub async fn get_snapshot(state: &SharedState) -> Result<SessionSnapshot, ServiceError> {
    state.snapshot().await
}

/// Replace game state and roster wholesale, then push `state:full` to mirrors.
pub async fn load_snapshot(
    state: &SharedState,
    request: LoadSnapshotRequest,
) -> Result<SessionSnapshot, ServiceError> {
    let LoadSnapshotRequest {
        state: game,
        teams: inputs,
    } = request;

    let mut seen = HashSet::new();
    if let Some(duplicate) = inputs.iter().find(|team| !seen.insert(team.id)) {
        return Err(ServiceError::InvalidInput(format!(
            "team `{}` listed twice",
            duplicate.id
        )));
    }
    if let Some(unknown) = game
        .excluded_teams
        .iter()
        .chain(game.locked_team.iter())
        .find(|id| !seen.contains(*id))
    {
        return Err(ServiceError::InvalidInput(format!(
            "state references unknown team `{unknown}`"
        )));
    }

    state
        .run_write(|live, _outbox| {
            if game.session_id != live.id() {
                return Err(ServiceError::InvalidInput(format!(
                    "snapshot belongs to session `{}`",
                    game.session_id
                )));
            }
            let teams: IndexMap<_, _> = inputs
                .into_iter()
                .map(|input| {
                    let mut team = Team::new(input.name, input.color.into());
                    team.score = input.score;
                    team.device_id = live
                        .teams
                        .get(&input.id)
                        .and_then(|existing| existing.device_id.clone());
                    (input.id, team)
                })
                .collect();
            live.restore(game, teams);
            Ok(())
        })
        .await?;

    state.replace_timer_task(None);
    info!("snapshot restored");
    state.publish_snapshot().await
}

/// Answer a mirror's `state:request` with a fresh `state:full`.
pub async fn request_full(state: &SharedState) -> Result<SessionSnapshot, ServiceError> {
    state.publish_snapshot().await
}
