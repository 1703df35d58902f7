use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dto::envelope::{ChannelEvent, DeviceClaim, Heartbeat, PresenceUpdate},
    error::ServiceError,
    state::{
        SharedState,
        presence::{Actor, authorize},
    },
};

/// Record a heartbeat from a team device.
///
/// Once a team is bound, only heartbeats naming the bound device are accepted.
/// The check and the record happen under the write gate so a concurrent sweep
/// cannot release a binding that was just refreshed.
pub async fn handle_heartbeat(state: &SharedState, heartbeat: Heartbeat) -> Result<(), ServiceError> {
    let Heartbeat {
        team_id,
        last_seen_at,
        device_id,
    } = heartbeat;
    let actor = Actor::Device(device_id.as_deref());

    let recorded = {
        let _gate = state.write_gate().await;
        let binding = state
            .read_live(|live| {
                live.ok_or_else(|| ServiceError::InvalidState("no live session".into()))
                    .and_then(|live| Ok(live.team(team_id)?.device_id.clone()))
            })
            .await;
        binding.and_then(|binding| {
            authorize(team_id, binding.as_deref(), actor)?;
            Ok(state.presence().heartbeat(
                team_id,
                device_id.clone(),
                Some(last_seen_at),
                Instant::now(),
                state.now_ms(),
            ))
        })
    };

    let came_online = match recorded {
        Ok(came_online) => came_online,
        Err(err) => {
            notify_blocked(state, team_id, actor, &err).await;
            return Err(err);
        }
    };
    if came_online {
        debug!(%team_id, "team online");
        state
            .publish(ChannelEvent::PresenceUpdate(PresenceUpdate {
                team_id,
                online: true,
            }))
            .await;
    }
    Ok(())
}

/// Tell a device refused by the team binding that it is blocked.
pub async fn notify_blocked(state: &SharedState, team_id: Uuid, actor: Actor<'_>, err: &ServiceError) {
    if let (Actor::Device(Some(device)), ServiceError::Conflict(_)) = (actor, err) {
        warn!(%team_id, device_id = device, "device refused by team binding");
        state
            .publish(ChannelEvent::PresenceBlocked(DeviceClaim {
                team_id,
                device_id: device.to_owned(),
            }))
            .await;
    }
}

/// Report silent teams offline and release bindings idle for too long.
///
/// Idleness is checked again under the write gate before a binding goes.
pub async fn sweep(state: &SharedState, now: Instant) {
    let timing = state.config().timing;
    let presence = state.presence();

    for change in presence.sweep(now, timing.presence_timeout) {
        info!(team_id = %change.team_id, "team went offline");
        state
            .publish(ChannelEvent::PresenceUpdate(PresenceUpdate {
                team_id: change.team_id,
                online: change.online,
            }))
            .await;
    }

    let idle = presence.idle_since(now, timing.idle_binding_timeout);
    if idle.is_empty() {
        return;
    }
    let bound: Vec<Uuid> = state
        .read_live(|live| {
            live.map(|live| {
                idle.iter()
                    .copied()
                    .filter(|id| live.teams.get(id).is_some_and(|team| team.device_id.is_some()))
                    .collect()
            })
        })
        .await
        .unwrap_or_default();

    let mut released = Vec::new();
    if !bound.is_empty() {
        let result = state
            .run_write(|live, _outbox| {
                let mut released = Vec::new();
                for team_id in bound {
                    if presence.is_idle(team_id, now, timing.idle_binding_timeout) {
                        live.set_device(team_id, None)?;
                        released.push(team_id);
                    }
                }
                Ok(released)
            })
            .await;
        match result {
            Ok((teams, _)) => released = teams,
            Err(err) => {
                warn!(error = %err, "failed to release idle bindings");
                return;
            }
        }
    }
    for team_id in idle {
        if presence
            .remove_if_idle(team_id, now, timing.idle_binding_timeout)
            .is_some()
            && released.contains(&team_id)
        {
            info!(%team_id, "idle device binding released");
        }
    }
}

/// Spawn the periodic sweep bound to the live session.
pub fn start_sweeper(state: &SharedState) {
    let task_state = state.clone();
    let handle = tokio::spawn(async move {
        let mut ticker = interval(task_state.config().timing.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            sweep(&task_state, Instant::now()).await;
        }
    });
    state.add_session_task(handle);
}
