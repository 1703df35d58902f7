use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dto::envelope::{ChannelEvent, TimerExpired},
    error::ServiceError,
    state::{SharedState, game::GameState, timer::Countdown},
};

/// Start a countdown of `seconds` and the task broadcasting its ticks.
///
/// Expiry only stops the countdown; the buzzer is left as it is.
pub async fn start(state: &SharedState, seconds: u64) -> Result<GameState, ServiceError> {
    if seconds == 0 {
        return Err(ServiceError::InvalidInput("countdown must last at least one second".into()));
    }

    let ((instance_id, epoch), game) = state
        .run_write(|live, outbox| {
            live.start_countdown(Instant::now(), seconds);
            outbox.push(ChannelEvent::TimerTick(live.countdown_view));
            Ok((
                live.active_instance.as_ref().map(|instance| instance.id),
                live.countdown.epoch(),
            ))
        })
        .await?;

    spawn_ticks(state, instance_id, epoch);
    info!(seconds, "countdown started");
    Ok(game)
}

/// Freeze the countdown at its current value.
///
/// The tick task only goes away once the frozen value is stored.
pub async fn stop(state: &SharedState) -> Result<GameState, ServiceError> {
    let (_, game) = state
        .run_write(|live, outbox| {
            live.stop_countdown(Instant::now());
            outbox.push(ChannelEvent::TimerTick(live.countdown_view));
            Ok(())
        })
        .await?;
    state.replace_timer_task(None);
    info!(remaining_ms = game.countdown.remaining_ms, "countdown stopped");
    Ok(game)
}

/// Clear the countdown.
pub async fn reset(state: &SharedState) -> Result<GameState, ServiceError> {
    let (_, game) = state
        .run_write(|live, outbox| {
            live.reset_countdown();
            outbox.push(ChannelEvent::TimerTick(live.countdown_view));
            Ok(())
        })
        .await?;
    state.replace_timer_task(None);
    info!("countdown reset");
    Ok(game)
}

/// Install the tick task for the countdown run stamped `epoch`.
pub(crate) fn spawn_ticks(state: &SharedState, instance_id: Option<Uuid>, epoch: u64) {
    let handle = tokio::spawn(run_ticks(state.clone(), instance_id, epoch));
    state.replace_timer_task(Some(handle));
}

async fn run_ticks(state: SharedState, instance_id: Option<Uuid>, epoch: u64) {
    let tick = state.config().timing.tick_interval;
    loop {
        let Some(countdown) = current_run(&state, epoch).await else {
            return;
        };
        let remaining = countdown.remaining(Instant::now());
        if remaining.is_zero() {
            expire(&state, instance_id, epoch, tick).await;
            return;
        }

        sleep(remaining.min(tick)).await;
        let Some(countdown) = current_run(&state, epoch).await else {
            return;
        };
        let now = Instant::now();
        if !countdown.is_expired(now) {
            state
                .publish(ChannelEvent::TimerTick(countdown.state(now)))
                .await;
        }
    }
}

/// Live countdown, while it is still the running one stamped `epoch`.
async fn current_run(state: &SharedState, epoch: u64) -> Option<Countdown> {
    state
        .read_live(|live| live.map(|live| live.countdown))
        .await
        .filter(|countdown| countdown.is_running() && countdown.epoch() == epoch)
}

/// Persist the expiry, retrying while storage is unavailable.
async fn expire(state: &SharedState, instance_id: Option<Uuid>, epoch: u64, retry: Duration) {
    loop {
        let result = state
            .run_write(|live, outbox| {
                if !live.countdown.is_running() || live.countdown.epoch() != epoch {
                    return Err(ServiceError::InvalidState("countdown was stopped or restarted".into()));
                }
                live.stop_countdown(Instant::now());
                outbox.push(ChannelEvent::TimerExpired(TimerExpired { instance_id }));
                Ok(())
            })
            .await;
        match result {
            Ok(_) => {
                info!(instance_id = ?instance_id, "countdown expired");
                return;
            }
            Err(ServiceError::InvalidState(reason)) => {
                debug!(%reason, "countdown expiry skipped");
                return;
            }
            Err(err) => {
                warn!(error = %err, "failed to persist countdown expiry; retrying");
                sleep(retry).await;
            }
        }
    }
}
