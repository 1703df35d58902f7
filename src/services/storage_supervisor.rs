use std::{future::Future, sync::Arc, time::Duration};

use tokio::time::sleep;
use tracing::{info, warn};

use crate::{
    dao::{session_store::SessionStore, storage::StorageError},
    services::transport::realtime::next_delay,
    state::SharedState,
};

/// Backoff and polling used while supervising the session store.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorTiming {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub health_poll_interval: Duration,
    /// In-place reconnects tried before the store is dropped and reopened.
    pub max_reconnect_attempts: u32,
}

impl Default for SupervisorTiming {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_secs(10),
            health_poll_interval: Duration::from_secs(5),
            max_reconnect_attempts: 3,
        }
    }
}

/// Connect to the session store and keep the application in degraded mode
/// whenever it is unreachable. Never returns.
pub async fn run<F, Fut>(state: SharedState, connect: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Arc<dyn SessionStore>, StorageError>> + Send,
{
    run_with(state, connect, SupervisorTiming::default()).await
}

pub async fn run_with<F, Fut>(state: SharedState, mut connect: F, timing: SupervisorTiming)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Arc<dyn SessionStore>, StorageError>> + Send,
{
    let mut delay = timing.initial_delay;

    loop {
        match connect().await {
            Ok(store) => {
                state.set_session_store(store.clone()).await;
                info!("session store connected; leaving degraded mode");
                delay = timing.initial_delay;

                watch_health(&state, store.as_ref(), &timing).await;

                state.clear_session_store().await;
                warn!("session store dropped; reopening it");
                sleep(delay).await;
                delay = next_delay(delay, timing.max_delay);
            }
            Err(err) => {
                warn!(error = %err, "session store connection attempt failed");
                sleep(delay).await;
                delay = next_delay(delay, timing.max_delay);
            }
        }
    }
}

/// Poll `store` until it stays unhealthy through every reconnect attempt.
async fn watch_health(state: &SharedState, store: &dyn SessionStore, timing: &SupervisorTiming) {
    loop {
        if store.health_check().await.is_ok() {
            if state.is_degraded().await {
                info!("session store healthy again; leaving degraded mode");
                state.update_degraded(false).await;
            }
            sleep(timing.health_poll_interval).await;
            continue;
        }

        let mut backoff = timing.initial_delay;
        let mut recovered = false;
        for attempt in 0..timing.max_reconnect_attempts {
            match store.try_reconnect().await {
                Ok(()) => {
                    info!(attempt, "session store reconnected after failed health check");
                    recovered = true;
                    break;
                }
                Err(err) => {
                    if attempt == 0 {
                        warn!(attempt, error = %err, "session store unreachable; entering degraded mode");
                        state.update_degraded(true).await;
                    } else {
                        warn!(attempt, error = %err, "session store reconnect attempt failed");
                    }
                    sleep(backoff).await;
                    backoff = next_delay(backoff, timing.max_delay);
                }
            }
        }

        if !recovered {
            warn!("exhausted session store reconnect attempts");
            return;
        }
        state.update_degraded(false).await;
        sleep(timing.health_poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        config::AppConfig, dao::session_store::MemorySessionStore, state::AppState,
    };

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn degraded_mode_follows_store_health() {
        let state = AppState::with_local_hub(AppConfig::default());
        let store = MemorySessionStore::new();
        let handle = {
            let store = store.clone();
            tokio::spawn(run(state.clone(), move || {
                let store = store.clone();
                async move { Ok(Arc::new(store) as Arc<dyn SessionStore>) }
            }))
        };

        let mut degraded = state.degraded_watcher();
        degraded.wait_for(|value| !*value).await.unwrap();

        store.set_offline(true);
        degraded.wait_for(|value| *value).await.unwrap();
        assert!(state.require_session_store().await.is_err());

        store.set_offline(false);
        degraded.wait_for(|value| !*value).await.unwrap();
        assert!(state.require_session_store().await.is_ok());

        handle.abort();
    }
}
