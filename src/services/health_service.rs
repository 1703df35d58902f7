use tracing::warn;

use crate::{dto::health::HealthResponse, state::SharedState};

/// Report storage, transport and live-session status, logging connectivity issues.
pub async fn health_status(state: &SharedState) -> HealthResponse {
    match state.session_store().await {
        Some(store) => {
            if let Err(err) = store.health_check().await {
                warn!(error = %err, "session store health check failed");
            }
        }
        None => warn!("session store unavailable (degraded mode)"),
    }

    let transport_connected = state.transport().is_connected();
    if !transport_connected {
        warn!("broadcast transport disconnected");
    }

    HealthResponse::new(
        state.is_degraded().await,
        transport_connected,
        state.live_session_id().await,
    )
}

#[cfg(test)]
mod tests {
    use crate::{config::AppConfig, services::testing::live_fixture, state::AppState};

    use super::*;

    #[tokio::test]
    async fn fresh_state_is_degraded() {
        let state = AppState::with_local_hub(AppConfig::default());
        let health = health_status(&state).await;
        assert_eq!(health.status, "degraded");
        assert!(health.transport_connected);
        assert_eq!(health.live_session, None);
    }

    #[tokio::test]
    async fn live_session_is_reported() {
        let fixture = live_fixture(1).await;
        let health = health_status(&fixture.state).await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.live_session, Some(fixture.session_id));
    }
}
