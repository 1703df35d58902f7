use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

/// Health payload returned by the `/healthcheck` route.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// "ok" or "degraded" (no session store available).
    pub status: &'static str,
    /// Whether the broadcast transport can currently publish.
    pub transport_connected: bool,
    /// Session loaded by the authority, if any.
    pub live_session: Option<Uuid>,
}

impl HealthResponse {
    /// Build the payload from the individual checks.
    pub fn new(degraded: bool, transport_connected: bool, live_session: Option<Uuid>) -> Self {
        Self {
            status: if degraded { "degraded" } else { "ok" },
            transport_connected,
            live_session,
        }
    }
}
