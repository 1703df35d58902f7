use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::{IntoResponse, Response},
    routing::get,
};

use crate::{error::AppError, services::hub_socket, state::SharedState};

#[utoipa::path(
    get,
    path = "/ws",
    tag = "hub",
    responses(
        (status = 101, description = "Switching protocols to the hub WebSocket"),
        (status = 503, description = "The private hub is not the configured transport")
    )
)]
/// Upgrade the HTTP connection into a hub WebSocket for a device or mirror.
pub async fn ws_handler(State(state): State<SharedState>, ws: WebSocketUpgrade) -> Response {
    let Some(hub) = state.hub().cloned() else {
        return AppError::ServiceUnavailable("private hub disabled; use the realtime backend".into())
            .into_response();
    };
    ws.on_upgrade(move |socket| hub_socket::handle_socket(hub, socket))
}

/// Configure the hub WebSocket endpoint.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new().route("/ws", get(ws_handler))
}
