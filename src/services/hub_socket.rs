//! Device side of the private hub: one WebSocket per device, speaking
//! [`HubInbound`] / [`HubOutbound`] frames.

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dto::{
        envelope::{ChannelEvent, CodecError, DeviceClaim},
        hub::{HubInbound, HubOutbound},
        validation::validate_channel,
    },
    services::transport::{LocalHub, TransportError},
};

/// Refusal of a single frame; the socket stays open unless the writer is gone.
#[derive(Debug, Error)]
enum FrameError {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported channel `{0}`")]
    InvalidChannel(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("`{0}` cannot be published by a device")]
    Forbidden(&'static str),
    #[error("this socket holds team `{0}` under another device")]
    ForeignDevice(Uuid),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Per-socket bookkeeping.
struct Connection {
    id: Uuid,
    hub: LocalHub,
    tx: mpsc::UnboundedSender<Message>,
    rooms: HashMap<String, JoinHandle<()>>,
    /// Slots claimed through this socket, released when it closes.
    claims: Vec<(String, DeviceClaim)>,
}

/// Handle the full lifecycle of one hub WebSocket.
pub async fn handle_socket(hub: LocalHub, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let mut connection = Connection {
        id: Uuid::new_v4(),
        hub,
        tx: outbound_tx,
        rooms: HashMap::new(),
        claims: Vec::new(),
    };
    info!(connection_id = %connection.id, "hub socket connected");

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let result = HubInbound::from_json_str(text.as_str())
                    .map_err(FrameError::from)
                    .and_then(|frame| connection.handle_frame(frame));
                match result {
                    Ok(()) => {}
                    Err(FrameError::ConnectionClosed) => break,
                    Err(err) => {
                        debug!(connection_id = %connection.id, error = %err, "hub frame refused");
                        let reply = HubOutbound::Error {
                            message: err.to_string(),
                        };
                        if connection.send(&reply).is_err() {
                            break;
                        }
                    }
                }
            }
            Ok(Message::Ping(payload)) => {
                let _ = connection.tx.send(Message::Pong(payload));
            }
            Ok(Message::Close(frame)) => {
                let _ = connection.tx.send(Message::Close(frame));
                break;
            }
            Ok(Message::Binary(_)) | Ok(Message::Pong(_)) => {}
            Err(err) => {
                warn!(connection_id = %connection.id, error = %err, "hub socket error");
                break;
            }
        }
    }

    let Connection {
        id,
        hub,
        tx,
        rooms,
        claims,
    } = connection;
    for (_, forwarder) in rooms {
        forwarder.abort();
    }
    for (channel, claim) in claims {
        if let Err(err) = hub.send(&channel, &ChannelEvent::ClientLeave(claim), Some(id)) {
            warn!(connection_id = %id, error = %err, "failed to relay leave on close");
        }
    }
    info!(connection_id = %id, "hub socket disconnected");

    drop(tx);
    let _ = writer_task.await;
}

impl Connection {
    fn handle_frame(&mut self, frame: HubInbound) -> Result<(), FrameError> {
        match frame {
            HubInbound::Join { channel } => self.join(channel),
            HubInbound::Leave { channel } => {
                if let Some(forwarder) = self.rooms.remove(&channel) {
                    forwarder.abort();
                }
                Ok(())
            }
            HubInbound::Publish {
                channel,
                event,
                payload,
            } => self.publish(channel, &event, payload),
        }
    }

    fn join(&mut self, channel: String) -> Result<(), FrameError> {
        validate_channel(&channel).map_err(|_| FrameError::InvalidChannel(channel.clone()))?;
        if !self.rooms.contains_key(&channel) {
            let mut subscription = self.hub.join(&channel)?;
            let tx = self.tx.clone();
            let connection_id = self.id;
            let forwarder = tokio::spawn(async move {
                while let Some(delivery) = subscription.recv_delivery().await {
                    if delivery.exclude == Some(connection_id) {
                        continue;
                    }
                    if send_frame(&tx, &HubOutbound::Envelope(delivery.envelope)).is_err() {
                        break;
                    }
                }
            });
            self.rooms.insert(channel.clone(), forwarder);
        }
        self.send(&HubOutbound::Joined { channel })
    }

    fn publish(&mut self, channel: String, tag: &str, payload: serde_json::Value) -> Result<(), FrameError> {
        validate_channel(&channel).map_err(|_| FrameError::InvalidChannel(channel.clone()))?;
        let mut event = ChannelEvent::decode(tag, payload)?;
        if !event.is_client_originated() {
            return Err(FrameError::Forbidden(event.name()));
        }
        self.stamp_device(&mut event)?;

        match &event {
            ChannelEvent::ClientJoin(claim) => {
                self.claims.retain(|(_, known)| known.team_id != claim.team_id);
                self.claims.push((channel.clone(), claim.clone()));
            }
            ChannelEvent::ClientLeave(claim) => {
                self.claims.retain(|(_, known)| known != claim);
            }
            _ => {}
        }

        self.hub.send(&channel, &event, Some(self.id))?;
        Ok(())
    }

    /// Team actions for a slot claimed on this socket carry the claiming device.
    fn stamp_device(&self, event: &mut ChannelEvent) -> Result<(), FrameError> {
        let (team_id, device_id) = match event {
            ChannelEvent::ClientBuzz(buzz) => (buzz.team_id, &mut buzz.device_id),
            ChannelEvent::ClientAnswer(answer) => (answer.team_id, &mut answer.device_id),
            ChannelEvent::PresenceHeartbeat(heartbeat) => (heartbeat.team_id, &mut heartbeat.device_id),
            _ => return Ok(()),
        };
        let Some((_, claim)) = self.claims.iter().find(|(_, claim)| claim.team_id == team_id) else {
            return Ok(());
        };
        if let Some(sent) = device_id.as_deref()
            && sent != claim.device_id
        {
            return Err(FrameError::ForeignDevice(team_id));
        }
        *device_id = Some(claim.device_id.clone());
        Ok(())
    }

    fn send(&self, frame: &HubOutbound) -> Result<(), FrameError> {
        send_frame(&self.tx, frame)
    }
}

fn send_frame(tx: &mpsc::UnboundedSender<Message>, frame: &HubOutbound) -> Result<(), FrameError> {
    let payload = match serde_json::to_string(frame) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "failed to serialize hub frame");
            return Ok(());
        }
    };
    tx.send(Message::Text(payload.into()))
        .map_err(|_| FrameError::ConnectionClosed)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::dto::envelope::session_channel;

    use super::*;

    fn connection(hub: &LocalHub) -> (Connection, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Connection {
                id: Uuid::new_v4(),
                hub: hub.clone(),
                tx,
                rooms: HashMap::new(),
                claims: Vec::new(),
            },
            rx,
        )
    }

    async fn next_frame(rx: &mut mpsc::UnboundedReceiver<Message>) -> HubOutbound {
        match rx.recv().await.unwrap() {
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn joined_socket_receives_others_but_not_itself() {
        let hub = LocalHub::new();
        let channel = session_channel(Uuid::new_v4());
        let (mut alice, mut alice_rx) = connection(&hub);
        let (mut bob, mut bob_rx) = connection(&hub);

        for (conn, rx) in [(&mut alice, &mut alice_rx), (&mut bob, &mut bob_rx)] {
            conn.handle_frame(HubInbound::Join {
                channel: channel.clone(),
            })
            .unwrap();
            assert!(matches!(next_frame(rx).await, HubOutbound::Joined { .. }));
        }

        let team_id = Uuid::new_v4();
        alice
            .handle_frame(HubInbound::Publish {
                channel: channel.clone(),
                event: "client:buzz".into(),
                payload: json!({ "teamId": team_id }),
            })
            .unwrap();

        let HubOutbound::Envelope(envelope) = next_frame(&mut bob_rx).await else {
            panic!("expected an envelope");
        };
        assert_eq!(envelope.event, "client:buzz");
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn devices_cannot_forge_server_events() {
        let hub = LocalHub::new();
        let (mut device, _rx) = connection(&hub);
        let err = device
            .handle_frame(HubInbound::Publish {
                channel: session_channel(Uuid::new_v4()),
                event: "regie:unlock".into(),
                payload: json!({}),
            })
            .unwrap_err();
        assert!(matches!(err, FrameError::Forbidden("regie:unlock")));

        let err = device
            .handle_frame(HubInbound::Join {
                channel: "lobby".into(),
            })
            .unwrap_err();
        assert!(matches!(err, FrameError::InvalidChannel(_)));
    }

    #[tokio::test]
    async fn relayed_claims_are_tracked_until_left() {
        let hub = LocalHub::new();
        let channel = session_channel(Uuid::new_v4());
        let (mut device, _rx) = connection(&hub);
        let claim = json!({ "teamId": Uuid::new_v4(), "deviceId": "tablet-a" });

        device
            .handle_frame(HubInbound::Publish {
                channel: channel.clone(),
                event: "client:join".into(),
                payload: claim.clone(),
            })
            .unwrap();
        assert_eq!(device.claims.len(), 1);

        device
            .handle_frame(HubInbound::Publish {
                channel,
                event: "client:leave".into(),
                payload: claim,
            })
            .unwrap();
        assert!(device.claims.is_empty());
    }

    #[tokio::test]
    async fn buzzes_for_a_claimed_team_carry_the_claiming_device() {
        let hub = LocalHub::new();
        let channel = session_channel(Uuid::new_v4());
        let mut listener = hub.join(&channel).unwrap();
        let (mut device, _rx) = connection(&hub);
        let team_id = Uuid::new_v4();

        device
            .handle_frame(HubInbound::Publish {
                channel: channel.clone(),
                event: "client:join".into(),
                payload: json!({ "teamId": team_id, "deviceId": "tablet-a" }),
            })
            .unwrap();
        device
            .handle_frame(HubInbound::Publish {
                channel: channel.clone(),
                event: "client:buzz".into(),
                payload: json!({ "teamId": team_id }),
            })
            .unwrap();
        let err = device
            .handle_frame(HubInbound::Publish {
                channel: channel.clone(),
                event: "client:buzz".into(),
                payload: json!({ "teamId": team_id, "deviceId": "tablet-b" }),
            })
            .unwrap_err();
        assert!(matches!(err, FrameError::ForeignDevice(team) if team == team_id));

        assert_eq!(listener.recv().await.unwrap().event, "client:join");
        let buzz = listener.recv().await.unwrap();
        assert_eq!(buzz.event, "client:buzz");
        assert_eq!(buzz.payload["deviceId"], "tablet-a");
    }
}
