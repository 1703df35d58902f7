//! Server-side consumer of the session and presence channels.
//!
//! Devices never mutate state themselves: their `client:*` and heartbeat
//! events are fed here, one at a time and in arrival order, and turned into
//! service calls. Refusals go back on the session channel as
//! `command:rejected`.

use futures::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dto::envelope::{ChannelEvent, Envelope, presence_channel, session_channel},
    error::ServiceError,
    services::{answer_service, buzzer_service, presence_service, state_service, team_service},
    state::{SharedState, presence::Actor},
};

/// Subscribe to the channels of `session_id` and spawn the dispatch loop.
pub async fn start(state: &SharedState, session_id: Uuid) -> Result<(), ServiceError> {
    let transport = state.transport();
    let game = transport.subscribe(&session_channel(session_id)).await?;
    let presence = transport.subscribe(&presence_channel(session_id)).await?;

    let task_state = state.clone();
    let handle = tokio::spawn(async move {
        let deliveries = futures::stream::select(game.into_stream(), presence.into_stream());
        tokio::pin!(deliveries);
        while let Some(delivery) = deliveries.next().await {
            dispatch(&task_state, &delivery.envelope).await;
        }
        debug!(%session_id, "authority channels closed");
    });
    state.add_session_task(handle);
    info!(%session_id, "authority listening");
    Ok(())
}

/// Handle one inbound envelope. Server-originated events are ignored.
pub async fn dispatch(state: &SharedState, envelope: &Envelope) {
    let event = match envelope.decode_event() {
        Ok(event) => event,
        Err(err) => {
            warn!(channel = %envelope.channel, event = %envelope.event, error = %err, "dropping undecodable envelope");
            return;
        }
    };
    if !event.is_client_originated() {
        return;
    }

    let command = event.name();
    let team_id = sender(&event);
    let result = match event {
        ChannelEvent::StateRequest => state_service::request_full(state).await.map(drop),
        ChannelEvent::ClientBuzz(buzz) => buzzer_service::attempt(
            state,
            buzz.team_id,
            Actor::Device(buzz.device_id.as_deref()),
            buzz.instance_id,
            buzz.client_ts,
        )
        .await
        .map(drop),
        ChannelEvent::ClientAnswer(answer) => answer_service::submit(
            state,
            answer.team_id,
            Actor::Device(answer.device_id.as_deref()),
            answer.instance_id,
            answer.value,
        )
        .await
        .map(drop),
        ChannelEvent::ClientJoin(claim) => team_service::connect(state, claim.team_id, claim.device_id)
            .await
            .map(drop),
        ChannelEvent::ClientLeave(claim) => {
            team_service::disconnect(state, claim.team_id, &claim.device_id).await
        }
        ChannelEvent::PresenceHeartbeat(heartbeat) => {
            presence_service::handle_heartbeat(state, heartbeat).await
        }
        _ => return,
    };

    if let Err(err) = result {
        debug!(command, team_id = ?team_id, error = %err, "channel command refused");
        state
            .publish(buzzer_service::rejection_event(command, team_id, &err))
            .await;
    }
}

fn sender(event: &ChannelEvent) -> Option<Uuid> {
    match event {
        ChannelEvent::ClientBuzz(buzz) => Some(buzz.team_id),
        ChannelEvent::ClientAnswer(answer) => Some(answer.team_id),
        ChannelEvent::ClientJoin(claim) | ChannelEvent::ClientLeave(claim) => Some(claim.team_id),
        ChannelEvent::PresenceHeartbeat(heartbeat) => Some(heartbeat.team_id),
        _ => None,
    }
}
