//! Long-running connection of a team device to the hub.
//!
//! The runtime joins the session and presence channels, claims the team slot
//! with its device id, heartbeats, keeps a [`StateMirror`] current and feeds
//! bus events to a [`BusListener`]. A lost socket is retried forever with
//! capped, jittered backoff; each new socket claims the slot and asks for a
//! fresh snapshot again.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use futures::{Sink, SinkExt, Stream, StreamExt};
use rand::Rng;
use serde_json::Value;
use thiserror::Error;
use tokio::{
    sync::{RwLock, mpsc, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval, sleep},
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    client::{
        listener::BusListener,
        mirror::{MirrorChange, StateMirror},
    },
    dto::{
        bus::BusEvent,
        envelope::{
            ChannelEvent, ClientAnswer, ClientBuzz, CodecError, DeviceClaim, Envelope, Heartbeat,
            presence_channel, session_channel,
        },
        hub::{HubInbound, HubOutbound},
    },
    services::transport::realtime::next_delay,
};

type SocketError = tokio_tungstenite::tungstenite::Error;

/// Connection settings of a team device.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Hub websocket URL, e.g. `ws://localhost:8080/ws`.
    pub url: String,
    pub session_id: Uuid,
    pub team_id: Uuid,
    pub device_id: String,
    pub heartbeat_interval: Duration,
    /// Period of the `state:request` reconciliation pass.
    pub reconcile_interval: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, session_id: Uuid, team_id: Uuid, device_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            session_id,
            team_id,
            device_id: device_id.into(),
            heartbeat_interval: Duration::from_secs(5),
            reconcile_interval: Duration::from_secs(30),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }

    fn claim(&self) -> DeviceClaim {
        DeviceClaim {
            team_id: self.team_id,
            device_id: self.device_id.clone(),
        }
    }
}

/// Connection status published by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Connecting,
    /// Socket up and slot claimed; waiting for the `state:full` that rebuilds the mirror.
    Syncing,
    /// Channels joined, slot claimed and mirror loaded.
    Connected,
    /// Another device holds the team slot; the claim is retried on every
    /// reconciliation pass.
    Blocked,
    /// Waiting `delay` before the next connection attempt.
    Reconnecting { attempt: u32, delay: Duration },
    /// The operator released the slot; the runtime does not reconnect.
    Kicked,
    Stopped,
}

/// Failures surfaced by a team client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client runtime stopped")]
    Stopped,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("failed to encode hub frame")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Socket(#[from] SocketError),
}

#[derive(Debug)]
enum ClientCommand {
    Buzz,
    Answer(Value),
}

enum SessionEnd {
    Lost,
    Kicked,
    Shutdown,
}

/// Handle on a running team device.
pub struct TeamClient {
    commands: mpsc::UnboundedSender<ClientCommand>,
    status: watch::Receiver<ClientStatus>,
    mirror: Arc<RwLock<StateMirror>>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TeamClient {
    /// Start the connection task.
    pub fn spawn(config: ClientConfig, listener: BusListener) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(ClientStatus::Connecting);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mirror = Arc::new(RwLock::new(StateMirror::new()));

        let worker = Worker {
            config,
            mirror: mirror.clone(),
            listener,
            status: status_tx,
            commands: command_rx,
            shutdown: shutdown_rx,
            blocked: false,
        };
        let task = tokio::spawn(worker.run());

        Self {
            commands,
            status,
            mirror,
            shutdown,
            task,
        }
    }

    pub fn status(&self) -> watch::Receiver<ClientStatus> {
        self.status.clone()
    }

    /// Shared view of the mirrored game state.
    pub fn mirror(&self) -> Arc<RwLock<StateMirror>> {
        self.mirror.clone()
    }

    /// Buzz on the instance the mirror currently shows.
    pub fn buzz(&self) -> Result<(), ClientError> {
        self.commands
            .send(ClientCommand::Buzz)
            .map_err(|_| ClientError::Stopped)
    }

    pub fn answer(&self, value: Value) -> Result<(), ClientError> {
        self.commands
            .send(ClientCommand::Answer(value))
            .map_err(|_| ClientError::Stopped)
    }

    /// Release the slot, close the socket and wait for the task to end.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        if let Err(err) = self.task.await {
            warn!(error = %err, "team client task ended abnormally");
        }
    }
}

/// `delay` plus up to a quarter of it, so devices do not reconnect in lockstep.
pub fn with_jitter(delay: Duration) -> Duration {
    let spread = u64::try_from(delay.as_millis() / 4).unwrap_or(u64::MAX);
    delay + Duration::from_millis(rand::rng().random_range(0..=spread))
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

/// Encode a hub `publish` frame for `event`.
pub fn publish_frame(channel: &str, event: &ChannelEvent) -> Result<Message, ClientError> {
    let frame = HubInbound::Publish {
        channel: channel.to_owned(),
        event: event.name().to_owned(),
        payload: event.payload()?,
    };
    Ok(Message::Text(serde_json::to_string(&frame)?))
}

fn join_frame(channel: &str) -> Result<Message, ClientError> {
    let frame = HubInbound::Join {
        channel: channel.to_owned(),
    };
    Ok(Message::Text(serde_json::to_string(&frame)?))
}

struct Worker {
    config: ClientConfig,
    mirror: Arc<RwLock<StateMirror>>,
    listener: BusListener,
    status: watch::Sender<ClientStatus>,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
    shutdown: watch::Receiver<bool>,
    blocked: bool,
}

impl Worker {
    async fn run(mut self) {
        let mut delay = self.config.initial_backoff;
        let mut attempt = 0u32;

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            attempt += 1;
            self.status.send_replace(ClientStatus::Connecting);
            match connect_async(self.config.url.as_str()).await {
                Ok((stream, _response)) => {
                    info!(attempt, team_id = %self.config.team_id, "connected to hub");
                    attempt = 0;
                    delay = self.config.initial_backoff;
                    match self.drive(stream).await {
                        Ok(SessionEnd::Shutdown) => break,
                        Ok(SessionEnd::Kicked) => {
                            warn!(team_id = %self.config.team_id, "kicked by the operator");
                            self.status.send_replace(ClientStatus::Kicked);
                            return;
                        }
                        Ok(SessionEnd::Lost) => warn!("hub connection lost; reconnecting"),
                        Err(err) => warn!(error = %err, "hub session failed; reconnecting"),
                    }
                }
                Err(err) => {
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "hub connection attempt failed");
                }
            }

            let wait = with_jitter(delay);
            self.status
                .send_replace(ClientStatus::Reconnecting { attempt, delay: wait });
            tokio::select! {
                _ = self.shutdown.changed() => break,
                _ = sleep(wait) => {}
            }
            delay = next_delay(delay, self.config.max_backoff);
        }
        self.status.send_replace(ClientStatus::Stopped);
    }

    async fn drive<S>(&mut self, stream: S) -> Result<SessionEnd, ClientError>
    where
        S: Stream<Item = Result<Message, SocketError>> + Sink<Message, Error = SocketError> + Unpin,
    {
        let (mut sink, mut source) = stream.split();
        let game = session_channel(self.config.session_id);
        let presence = presence_channel(self.config.session_id);

        // Whatever was mirrored before this socket is stale.
        self.mirror.write().await.resync();
        self.blocked = false;
        self.status.send_replace(ClientStatus::Syncing);

        sink.send(join_frame(&game)?).await?;
        sink.send(join_frame(&presence)?).await?;
        sink.send(publish_frame(&game, &ChannelEvent::ClientJoin(self.config.claim()))?)
            .await?;
        sink.send(publish_frame(&game, &ChannelEvent::StateRequest)?).await?;

        let mut heartbeat = interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reconcile = interval(self.config.reconcile_interval);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);
        reconcile.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    let leave = ChannelEvent::ClientLeave(self.config.claim());
                    let _ = sink.send(publish_frame(&game, &leave)?).await;
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Shutdown);
                }
                _ = heartbeat.tick() => {
                    let beat = ChannelEvent::PresenceHeartbeat(Heartbeat {
                        team_id: self.config.team_id,
                        last_seen_at: epoch_ms(),
                        device_id: Some(self.config.device_id.clone()),
                    });
                    sink.send(publish_frame(&presence, &beat)?).await?;
                }
                _ = reconcile.tick() => {
                    if self.blocked {
                        sink.send(publish_frame(&game, &ChannelEvent::ClientJoin(self.config.claim()))?)
                            .await?;
                    }
                    sink.send(publish_frame(&game, &ChannelEvent::StateRequest)?).await?;
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return Ok(SessionEnd::Shutdown);
                    };
                    if self.blocked {
                        warn!(team_id = %self.config.team_id, ?command, "team slot held by another device; command dropped");
                    } else {
                        let instance_id = self
                            .mirror
                            .read()
                            .await
                            .state()
                            .and_then(|state| state.active_instance.as_ref().map(|instance| instance.id));
                        let event = self.command_event(command, instance_id);
                        sink.send(publish_frame(&game, &event)?).await?;
                    }
                }
                message = source.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(end) = self.on_text(&text).await {
                            return Ok(end);
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => sink.send(Message::Pong(payload)).await?,
                    Some(Ok(Message::Close(frame))) => {
                        info!(?frame, "hub closed the socket");
                        return Ok(SessionEnd::Lost);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err.into()),
                    None => return Ok(SessionEnd::Lost),
                },
            }
        }
    }

    fn command_event(&self, command: ClientCommand, instance_id: Option<Uuid>) -> ChannelEvent {
        let device_id = Some(self.config.device_id.clone());
        match command {
            ClientCommand::Buzz => ChannelEvent::ClientBuzz(ClientBuzz {
                team_id: self.config.team_id,
                device_id,
                instance_id,
                client_ts: Some(epoch_ms()),
            }),
            ClientCommand::Answer(value) => ChannelEvent::ClientAnswer(ClientAnswer {
                team_id: self.config.team_id,
                device_id,
                instance_id,
                value,
            }),
        }
    }

    /// Connected once the mirror is loaded, unless another device holds the slot.
    fn settle_status(&self, synced: bool) {
        let status = match (self.blocked, synced) {
            (true, _) => ClientStatus::Blocked,
            (false, true) => ClientStatus::Connected,
            (false, false) => ClientStatus::Syncing,
        };
        self.status.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
    }

    async fn on_text(&mut self, text: &str) -> Option<SessionEnd> {
        let frame: HubOutbound = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "dropping unreadable hub frame");
                return None;
            }
        };
        match frame {
            HubOutbound::Joined { channel } => {
                debug!(%channel, "channel joined");
                None
            }
            HubOutbound::Error { message } => {
                warn!(%message, "hub refused a frame");
                None
            }
            HubOutbound::Envelope(envelope) => self.on_envelope(&envelope).await,
        }
    }

    async fn on_envelope(&mut self, envelope: &Envelope) -> Option<SessionEnd> {
        let event = match envelope.decode_event() {
            Ok(event) => event,
            Err(err) => {
                warn!(event = %envelope.event, error = %err, "dropping undecodable envelope");
                return None;
            }
        };

        let (change, synced) = {
            let mut mirror = self.mirror.write().await;
            let change = mirror.apply_event(&event, envelope.ts, Instant::now());
            (change, mirror.is_synced())
        };
        if let MirrorChange::Loaded { .. } = change
            && let ChannelEvent::StateFull(snapshot) = &event
        {
            let instance = snapshot.state.active_instance.as_ref().map(|instance| instance.id);
            self.listener.set_instance_scope(instance);
            self.settle_status(synced);
        }

        let team_id = self.config.team_id;
        match &event {
            ChannelEvent::PresenceBlocked(claim)
                if claim.team_id == team_id && claim.device_id == self.config.device_id =>
            {
                warn!(%team_id, "team slot held by another device");
                self.blocked = true;
                self.settle_status(synced);
            }
            ChannelEvent::PresenceUpdate(update) if update.team_id == team_id && update.online => {
                if self.blocked {
                    info!(%team_id, "team slot claimed");
                    self.blocked = false;
                    self.settle_status(synced);
                }
            }
            ChannelEvent::BuzzFirst(result) if result.team_id == team_id => {
                info!(server_order = result.server_order, "buzzed first");
            }
            ChannelEvent::BuzzLate(result) if result.team_id == team_id => {
                info!(server_order = result.server_order, "buzzed late");
            }
            ChannelEvent::CommandRejected(rejected) if rejected.team_id == Some(team_id) => {
                warn!(command = %rejected.command, code = %rejected.code, reason = %rejected.reason, "command rejected");
            }
            ChannelEvent::Bus(bus) => {
                self.listener.dispatch(bus, envelope.ts);
                if let BusEvent::KickTeam(kicked) = bus
                    && kicked.team_id == team_id
                {
                    return Some(SessionEnd::Kicked);
                }
            }
            _ => {}
        }
        None
    }
}
