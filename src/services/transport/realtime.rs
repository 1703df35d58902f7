//! Hosted realtime backend speaking the Phoenix channel protocol.
//!
//! One websocket carries every channel; each channel maps to the topic
//! `realtime:{channel}`. A background task owns the socket, keeps it alive
//! with heartbeats and reconnects forever with capped exponential backoff,
//! re-joining every live topic. Messages missed while disconnected are not
//! replayed.

use std::{
    env,
    sync::{
        Arc, PoisonError, RwLock, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use futures::{FutureExt, SinkExt, StreamExt, future::BoxFuture};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::{
    sync::{Mutex, broadcast, mpsc, watch},
    task::JoinHandle,
    time::{MissedTickBehavior, interval, sleep, timeout},
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::dto::envelope::{ChannelEvent, CodecError, Envelope};

use super::{Delivery, ServerClock, Subscription, Transport, TransportError};

const TOPIC_PREFIX: &str = "realtime:";
const EVENT_JOIN: &str = "phx_join";
const EVENT_LEAVE: &str = "phx_leave";
const EVENT_REPLY: &str = "phx_reply";
const EVENT_ERROR: &str = "phx_error";
const EVENT_CLOSE: &str = "phx_close";
const EVENT_BROADCAST: &str = "broadcast";
const EVENT_HEARTBEAT: &str = "heartbeat";
const HEARTBEAT_TOPIC: &str = "phoenix";

/// Connection settings of the hosted realtime service.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Base websocket URL, e.g. `wss://project.example.co/realtime/v1`.
    pub url: String,
    pub api_key: Option<String>,
    pub heartbeat_interval: Duration,
    /// Longest wait for a topic to be joined before publishing gives up.
    pub join_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Envelopes buffered per topic for local subscribers.
    pub capacity: usize,
}

impl RealtimeConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: None,
            heartbeat_interval: Duration::from_secs(30),
            join_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            capacity: 256,
        }
    }

    /// Read `REALTIME_URL` and `REALTIME_API_KEY`; `None` when no URL is set.
    pub fn from_env() -> Option<Self> {
        let url = env::var("REALTIME_URL").ok().filter(|url| !url.is_empty())?;
        let mut config = Self::new(url);
        config.api_key = env::var("REALTIME_API_KEY").ok().filter(|key| !key.is_empty());
        Some(config)
    }

    fn socket_url(&self) -> String {
        let base = self.url.trim_end_matches('/');
        match &self.api_key {
            Some(key) => format!("{base}/websocket?apikey={key}&vsn=1.0.0"),
            None => format!("{base}/websocket?vsn=1.0.0"),
        }
    }
}

/// Double `current`, capped at `max`.
pub fn next_delay(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// One Phoenix protocol message (JSON serializer v1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixFrame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub join_ref: Option<String>,
}

fn topic_name(channel: &str) -> String {
    format!("{TOPIC_PREFIX}{channel}")
}

/// [`Transport`] backed by the hosted realtime service.
#[derive(Clone)]
pub struct RealtimeTransport {
    shared: Arc<Shared>,
}

struct Shared {
    config: RealtimeConfig,
    clock: ServerClock,
    topics: DashMap<String, Topic>,
    // Present only while the socket is up, so publishing never queues.
    outbound: RwLock<Option<mpsc::UnboundedSender<PhoenixFrame>>>,
    connected: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    refs: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct Topic {
    sender: broadcast::Sender<Delivery>,
    joined: watch::Sender<bool>,
    join_ref: Option<String>,
}

enum SessionEnd {
    Shutdown,
    Lost,
}

impl RealtimeTransport {
    /// Start the connection task. Must be called inside a tokio runtime.
    pub fn start(config: RealtimeConfig) -> Self {
        let shared = Arc::new(Shared::new(config));
        let handle = tokio::spawn(run_connection(Arc::downgrade(&shared), shared.shutdown.subscribe()));
        if let Ok(mut task) = shared.task.try_lock() {
            *task = Some(handle);
        }
        Self { shared }
    }
}

impl Shared {
    fn new(config: RealtimeConfig) -> Self {
        Self {
            config,
            clock: ServerClock::new(),
            topics: DashMap::new(),
            outbound: RwLock::new(None),
            connected: watch::channel(false).0,
            shutdown: watch::channel(false).0,
            refs: AtomicU64::new(1),
            task: Mutex::new(None),
        }
    }

    fn next_ref(&self) -> String {
        self.refs.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    fn push(&self, frame: PhoenixFrame) -> Result<(), TransportError> {
        let guard = self.outbound.read().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| TransportError::Disconnected),
            None => Err(TransportError::Disconnected),
        }
    }

    fn send_join(&self, channel: &str, topic: &mut Topic) {
        let reference = self.next_ref();
        topic.join_ref = Some(reference.clone());
        topic.joined.send_replace(false);
        let frame = PhoenixFrame {
            topic: topic_name(channel),
            event: EVENT_JOIN.into(),
            payload: json!({
                "config": {
                    "broadcast": { "self": true, "ack": false },
                    "presence": { "key": "" },
                }
            }),
            reference: Some(reference.clone()),
            join_ref: Some(reference),
        };
        if self.push(frame).is_err() {
            debug!(channel, "join deferred until the socket is up");
        }
    }

    /// Register `channel` if needed and run `f` on its entry.
    fn with_topic<R>(&self, channel: &str, f: impl FnOnce(&Topic) -> R) -> R {
        let mut entry = self.topics.entry(channel.to_owned()).or_insert_with(|| Topic {
            sender: broadcast::channel(self.config.capacity.max(1)).0,
            joined: watch::channel(false).0,
            join_ref: None,
        });
        if entry.join_ref.is_none() && self.is_connected() {
            self.send_join(channel, entry.value_mut());
        }
        f(entry.value())
    }

    /// Forget `channel` once it has no local receivers, leaving it upstream.
    fn drop_idle_topic(&self, channel: &str) {
        let removed = self
            .topics
            .remove_if(channel, |_, topic| topic.sender.receiver_count() == 0);
        if let Some((_, topic)) = removed
            && topic.join_ref.is_some()
        {
            let _ = self.push(PhoenixFrame {
                topic: topic_name(channel),
                event: EVENT_LEAVE.into(),
                payload: json!({}),
                reference: Some(self.next_ref()),
                join_ref: topic.join_ref,
            });
        }
    }

    fn on_connected(&self, tx: mpsc::UnboundedSender<PhoenixFrame>) {
        *self.outbound.write().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        self.connected.send_replace(true);
        for mut entry in self.topics.iter_mut() {
            let channel = entry.key().clone();
            self.send_join(&channel, entry.value_mut());
        }
    }

    fn on_disconnected(&self) {
        self.outbound
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.connected.send_replace(false);
        for mut entry in self.topics.iter_mut() {
            entry.join_ref = None;
            entry.joined.send_replace(false);
        }
    }

    fn handle_text(&self, raw: &str) {
        let frame: PhoenixFrame = match serde_json::from_str(raw) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "dropping malformed realtime frame");
                return;
            }
        };
        let Some(channel) = frame.topic.strip_prefix(TOPIC_PREFIX) else {
            return;
        };

        match frame.event.as_str() {
            EVENT_REPLY => {
                let Some(entry) = self.topics.get(channel) else {
                    return;
                };
                let is_join_reply = frame.reference.is_some() && frame.reference == entry.join_ref;
                if !is_join_reply {
                    return;
                }
                match frame.payload.get("status").and_then(Value::as_str) {
                    Some("ok") => {
                        entry.joined.send_replace(true);
                        debug!(channel, "realtime topic joined");
                    }
                    status => {
                        warn!(channel, ?status, response = %frame.payload, "realtime join refused");
                    }
                }
            }
            EVENT_BROADCAST => {
                let Some(inner) = frame.payload.get("payload").cloned() else {
                    warn!(channel, "broadcast without payload");
                    return;
                };
                let envelope: Envelope = match serde_json::from_value(inner) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        warn!(channel, error = %err, "dropping broadcast that is not an envelope");
                        return;
                    }
                };
                if let Some(entry) = self.topics.get(channel) {
                    let _ = entry.sender.send(Delivery {
                        envelope,
                        exclude: None,
                    });
                }
            }
            EVENT_ERROR | EVENT_CLOSE => {
                if let Some(mut entry) = self.topics.get_mut(channel) {
                    warn!(channel, event = %frame.event, "realtime topic dropped; rejoining");
                    entry.join_ref = None;
                    entry.joined.send_replace(false);
                    if self.is_connected() {
                        self.send_join(channel, entry.value_mut());
                    }
                }
            }
            _ => {}
        }
    }

    async fn drive<S>(&self, stream: S, shutdown: &mut watch::Receiver<bool>) -> SessionEnd
    where
        S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
            + Unpin,
    {
        let (mut sink, mut source) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<PhoenixFrame>();
        self.on_connected(tx);

        let mut heartbeat = interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
                frame = rx.recv() => {
                    let Some(frame) = frame else {
                        return SessionEnd::Lost;
                    };
                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(error = %err, "failed to encode realtime frame");
                            continue;
                        }
                    };
                    if let Err(err) = sink.send(Message::Text(text)).await {
                        warn!(error = %err, "realtime send failed");
                        return SessionEnd::Lost;
                    }
                }
                _ = heartbeat.tick() => {
                    let frame = PhoenixFrame {
                        topic: HEARTBEAT_TOPIC.into(),
                        event: EVENT_HEARTBEAT.into(),
                        payload: json!({}),
                        reference: Some(self.next_ref()),
                        join_ref: None,
                    };
                    let _ = self.push(frame);
                }
                message = source.next() => match message {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text),
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            return SessionEnd::Lost;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(?frame, "realtime server closed the socket");
                        return SessionEnd::Lost;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "realtime socket error");
                        return SessionEnd::Lost;
                    }
                    None => return SessionEnd::Lost,
                },
            }
        }
    }
}

async fn run_connection(shared: Weak<Shared>, mut shutdown: watch::Receiver<bool>) {
    let Some(config) = shared.upgrade().map(|shared| shared.config.clone()) else {
        return;
    };
    let url = config.socket_url();
    let mut delay = config.initial_backoff;
    let mut attempt = 0u32;

    loop {
        if *shutdown.borrow() {
            return;
        }
        attempt += 1;
        match connect_async(url.as_str()).await {
            Ok((stream, _response)) => {
                let Some(state) = shared.upgrade() else {
                    return;
                };
                info!(attempt, "connected to realtime service");
                attempt = 0;
                delay = config.initial_backoff;
                let end = state.drive(stream, &mut shutdown).await;
                state.on_disconnected();
                if matches!(end, SessionEnd::Shutdown) {
                    return;
                }
                warn!("realtime connection lost; reconnecting");
            }
            Err(err) => {
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "realtime connection attempt failed");
            }
        }

        tokio::select! {
            _ = shutdown.changed() => return,
            _ = sleep(delay) => {}
        }
        delay = next_delay(delay, config.max_backoff);
    }
}

impl Transport for RealtimeTransport {
    fn publish(
        &self,
        channel: &str,
        event: ChannelEvent,
    ) -> BoxFuture<'static, Result<Envelope, TransportError>> {
        let shared = self.shared.clone();
        let channel = channel.to_owned();
        async move {
            if !shared.is_connected() {
                return Err(TransportError::Disconnected);
            }
            let envelope = Envelope::new(channel.as_str(), &event, shared.clock.now())?;
            let mut joined = shared.with_topic(&channel, |topic| topic.joined.subscribe());
            match timeout(shared.config.join_timeout, joined.wait_for(|joined| *joined)).await {
                Ok(Ok(_)) => {}
                Ok(Err(_)) => return Err(TransportError::Disconnected),
                Err(_) => return Err(TransportError::JoinTimeout(channel)),
            }

            let payload = serde_json::to_value(&envelope).map_err(|source| CodecError::Encode {
                event: event.name(),
                source,
            })?;
            let join_ref = shared.topics.get(&channel).and_then(|topic| topic.join_ref.clone());
            shared.push(PhoenixFrame {
                topic: topic_name(&channel),
                event: EVENT_BROADCAST.into(),
                payload: json!({
                    "type": EVENT_BROADCAST,
                    "event": envelope.event,
                    "payload": payload,
                }),
                reference: Some(shared.next_ref()),
                join_ref,
            })?;
            Ok(envelope)
        }
        .boxed()
    }

    fn subscribe(&self, channel: &str) -> BoxFuture<'static, Result<Subscription, TransportError>> {
        let shared = self.shared.clone();
        let channel = channel.to_owned();
        async move {
            let (receiver, mut joined) = shared.with_topic(&channel, |topic| {
                (topic.sender.subscribe(), topic.joined.subscribe())
            });

            let weak = Arc::downgrade(&shared);
            let name = channel.clone();
            let on_leave = Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.drop_idle_topic(&name);
                }
            });
            let subscription = Subscription::new(channel.clone(), receiver, Some(on_leave));

            if shared.is_connected() {
                match timeout(shared.config.join_timeout, joined.wait_for(|joined| *joined)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(_)) => return Err(TransportError::Disconnected),
                    Err(_) => return Err(TransportError::JoinTimeout(channel)),
                }
            } else {
                info!(channel = %channel, "realtime offline; topic will be joined on reconnect");
            }
            Ok(subscription)
        }
        .boxed()
    }

    fn release(&self, channel: &str) {
        self.shared.drop_idle_topic(channel);
    }

    fn now(&self) -> u64 {
        self.shared.clock.now()
    }

    fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    fn disconnect(&self) -> BoxFuture<'static, ()> {
        let shared = self.shared.clone();
        async move {
            shared.shutdown.send_replace(true);
            let handle = shared.task.lock().await.take();
            if let Some(handle) = handle
                && let Err(err) = handle.await
            {
                warn!(error = %err, "realtime connection task ended abnormally");
            }
            shared.on_disconnected();
            shared.topics.clear();
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use crate::dto::envelope::PresenceUpdate;
    use uuid::Uuid;

    use super::*;

    fn offline() -> RealtimeTransport {
        RealtimeTransport {
            shared: Arc::new(Shared::new(RealtimeConfig::new("ws://127.0.0.1:9/realtime/v1"))),
        }
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let max = Duration::from_secs(30);
        assert_eq!(next_delay(Duration::from_secs(1), max), Duration::from_secs(2));
        assert_eq!(next_delay(Duration::from_secs(16), max), max);
        assert_eq!(next_delay(max, max), max);
    }

    #[test]
    fn socket_url_carries_key_and_protocol_version() {
        let mut config = RealtimeConfig::new("wss://rt.example.co/realtime/v1/");
        assert_eq!(config.socket_url(), "wss://rt.example.co/realtime/v1/websocket?vsn=1.0.0");
        config.api_key = Some("k".into());
        assert_eq!(
            config.socket_url(),
            "wss://rt.example.co/realtime/v1/websocket?apikey=k&vsn=1.0.0"
        );
    }

    #[test]
    fn frames_use_phoenix_field_names() {
        let frame = PhoenixFrame {
            topic: topic_name("session:1"),
            event: EVENT_JOIN.into(),
            payload: json!({}),
            reference: Some("3".into()),
            join_ref: Some("3".into()),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["topic"], "realtime:session:1");
        assert_eq!(value["ref"], "3");
        assert_eq!(value["join_ref"], "3");

        let parsed: PhoenixFrame =
            serde_json::from_str(r#"{"topic":"phoenix","event":"phx_reply","payload":{"status":"ok"},"ref":null}"#)
                .unwrap();
        assert_eq!(parsed.reference, None);
        assert_eq!(parsed.join_ref, None);
    }

    #[tokio::test]
    async fn publish_fails_fast_while_disconnected() {
        let transport = offline();
        let result = transport.publish("session:1", ChannelEvent::RegieLock).await;
        assert!(matches!(result, Err(TransportError::Disconnected)));
    }

    #[tokio::test]
    async fn broadcasts_reach_local_subscribers() {
        let transport = offline();
        let mut subscription = transport.subscribe("session:1").await.unwrap();

        let event = ChannelEvent::PresenceUpdate(PresenceUpdate {
            team_id: Uuid::new_v4(),
            online: false,
        });
        let envelope = Envelope::new("session:1", &event, 10).unwrap();
        let frame = PhoenixFrame {
            topic: topic_name("session:1"),
            event: EVENT_BROADCAST.into(),
            payload: json!({ "type": "broadcast", "event": envelope.event, "payload": envelope }),
            reference: None,
            join_ref: None,
        };
        transport
            .shared
            .handle_text(&serde_json::to_string(&frame).unwrap());

        assert_eq!(subscription.recv().await.unwrap(), envelope);
    }

    #[tokio::test]
    async fn join_reply_marks_topic_joined() {
        let transport = offline();
        let _subscription = transport.subscribe("session:1").await.unwrap();
        let shared = &transport.shared;

        let (tx, mut rx) = mpsc::unbounded_channel();
        shared.on_connected(tx);
        let join = rx.recv().await.unwrap();
        assert_eq!(join.event, EVENT_JOIN);
        assert_eq!(join.topic, "realtime:session:1");

        let reply = PhoenixFrame {
            topic: join.topic.clone(),
            event: EVENT_REPLY.into(),
            payload: json!({ "status": "ok", "response": {} }),
            reference: join.reference.clone(),
            join_ref: join.join_ref.clone(),
        };
        shared.handle_text(&serde_json::to_string(&reply).unwrap());
        assert!(*shared.topics.get("session:1").unwrap().joined.borrow());

        shared.on_disconnected();
        assert!(!*shared.topics.get("session:1").unwrap().joined.borrow());
        assert!(!Transport::is_connected(&transport));
    }

    #[tokio::test]
    async fn last_subscriber_leaving_drops_the_topic() {
        let transport = offline();
        let first = transport.subscribe("session:1").await.unwrap();
        let second = transport.subscribe("session:1").await.unwrap();
        drop(first);
        assert!(transport.shared.topics.contains_key("session:1"));
        drop(second);
        assert!(!transport.shared.topics.contains_key("session:1"));
    }

    #[tokio::test]
    async fn released_publish_topics_are_forgotten() {
        let transport = offline();
        let _kept = transport.subscribe("session:kept").await.unwrap();
        let shared = &transport.shared;
        let (tx, mut rx) = mpsc::unbounded_channel();
        shared.on_connected(tx);
        assert_eq!(rx.recv().await.unwrap().topic, "realtime:session:kept");

        // Publishing registers and joins a topic nobody here listens to.
        shared.with_topic("session:gone", |_| ());
        assert_eq!(rx.recv().await.unwrap().event, EVENT_JOIN);

        transport.release("session:gone");
        transport.release("session:kept");
        assert!(!shared.topics.contains_key("session:gone"));
        assert!(shared.topics.contains_key("session:kept"));

        let leave = rx.recv().await.unwrap();
        assert_eq!(leave.event, EVENT_LEAVE);
        assert_eq!(leave.topic, "realtime:session:gone");
        assert!(rx.try_recv().is_err());
    }
}
