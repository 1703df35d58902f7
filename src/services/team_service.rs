use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    dto::{
        envelope::{ChannelEvent, DeviceClaim, PresenceUpdate, ScoreUpdate},
        team::{CreateTeamRequest, TeamSummary},
    },
    error::ServiceError,
    services::event_bus,
    state::{
        SharedState,
        game::TeamColor,
        presence::{Claim, PresenceError, claim},
    },
};

/// Register a team on the live session, picking a palette color when none is given.
pub async fn create(state: &SharedState, request: CreateTeamRequest) -> Result<TeamSummary, ServiceError> {
    let CreateTeamRequest { name, color } = request;
    let name = name.trim().to_owned();
    if name.is_empty() {
        return Err(ServiceError::InvalidInput("team name must not be empty".into()));
    }

    let config = state.config();
    let ((id, team), _) = state
        .run_write(|live, _outbox| {
            let color = match color {
                Some(color) => color.into(),
                None => {
                    let used: Vec<TeamColor> =
                        live.teams.values().map(|team| team.color.clone()).collect();
                    config.first_unused_color(&used)
                }
            };
            let id = live.add_team(name, color);
            let team = live.team(id)?.clone();
            Ok((id, team))
        })
        .await?;

    info!(team_id = %id, name = %team.name, "team created");
    // The roster is not part of `state:update`; mirrors get it through `state:full`.
    state.publish_snapshot().await?;
    Ok(TeamSummary::new(id, &team, None))
}

/// Add `delta` to a team's score and broadcast the new total.
pub async fn adjust_score(state: &SharedState, team_id: Uuid, delta: i32) -> Result<i32, ServiceError> {
    let (score, _) = state
        .run_write(|live, outbox| {
            let score = live.adjust_score(team_id, delta)?;
            outbox.push(ChannelEvent::ScoreUpdate(ScoreUpdate { team_id, score }));
            Ok(score)
        })
        .await?;
    info!(%team_id, delta, score, "score adjusted");
    Ok(score)
}

/// Operator removal of a team's device: the binding is released and the device told to leave.
pub async fn kick(state: &SharedState, team_id: Uuid) -> Result<(), ServiceError> {
    state
        .run_write(|live, outbox| {
            live.set_device(team_id, None)?;
            event_bus::emit(outbox, event_bus::kick_team(team_id));
            Ok(())
        })
        .await?;

    if state.presence().remove(team_id).is_some_and(|record| record.online) {
        state
            .publish(ChannelEvent::PresenceUpdate(PresenceUpdate {
                team_id,
                online: false,
            }))
            .await;
    }
    info!(%team_id, "team kicked");
    Ok(())
}

/// Bind `device_id` to a team slot.
///
/// A slot already held by another device is refused with a `presence:blocked`
/// notice and [`ServiceError::Conflict`]. Reconnecting with the same device is
/// accepted without a write.
pub async fn connect(state: &SharedState, team_id: Uuid, device_id: String) -> Result<Claim, ServiceError> {
    let binding = state
        .read_live(|live| {
            live.ok_or_else(|| ServiceError::InvalidState("no live session".into()))
                .and_then(|live| Ok(live.team(team_id)?.device_id.clone()))
        })
        .await?;

    let outcome = match claim(team_id, binding.as_deref(), &device_id) {
        Ok(Claim::AlreadyOwned) => Claim::AlreadyOwned,
        Ok(Claim::Claimed) => {
            let device = device_id.clone();
            let (outcome, _) = state
                .run_write(move |live, _outbox| {
                    // Re-check under the gate: another device may have won the slot meanwhile.
                    let current = live.team(team_id)?.device_id.clone();
                    let outcome = claim(team_id, current.as_deref(), &device)?;
                    if outcome == Claim::Claimed {
                        live.set_device(team_id, Some(device))?;
                    }
                    Ok(outcome)
                })
                .await
                .inspect_err(|err| {
                    if matches!(err, ServiceError::Conflict(_)) {
                        warn!(%team_id, "team slot taken while claiming");
                    }
                })?;
            outcome
        }
        Err(err) => {
            warn!(%team_id, device_id = %device_id, error = %err, "device refused");
            state
                .publish(ChannelEvent::PresenceBlocked(DeviceClaim {
                    team_id,
                    device_id,
                }))
                .await;
            return Err(err.into());
        }
    };

    let now = Instant::now();
    if state
        .presence()
        .heartbeat(team_id, Some(device_id.clone()), None, now, state.now_ms())
    {
        state
            .publish(ChannelEvent::PresenceUpdate(PresenceUpdate {
                team_id,
                online: true,
            }))
            .await;
    }
    info!(%team_id, device_id = %device_id, ?outcome, "device connected");
    Ok(outcome)
}

/// Release the slot held by `device_id`. Releasing a free slot is a no-op.
pub async fn disconnect(state: &SharedState, team_id: Uuid, device_id: &str) -> Result<(), ServiceError> {
    let binding = state
        .read_live(|live| {
            live.ok_or_else(|| ServiceError::InvalidState("no live session".into()))
                .and_then(|live| Ok(live.team(team_id)?.device_id.clone()))
        })
        .await?;

    match binding.as_deref() {
        None => return Ok(()),
        Some(bound) if bound != device_id => {
            return Err(PresenceError::DeviceConflict {
                team_id,
                bound_device: bound.to_owned(),
            }
            .into());
        }
        Some(_) => {}
    }

    state
        .run_write(|live, _outbox| {
            live.set_device(team_id, None)?;
            Ok(())
        })
        .await?;

    if state.presence().mark_offline(team_id) {
        state
            .publish(ChannelEvent::PresenceUpdate(PresenceUpdate {
                team_id,
                online: false,
            }))
            .await;
    }
    info!(%team_id, device_id, "device disconnected");
    Ok(())
}
