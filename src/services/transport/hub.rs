use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
};

use dashmap::DashMap;
use futures::{FutureExt, future::BoxFuture};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::dto::envelope::{ChannelEvent, Envelope};

use super::{Delivery, ServerClock, Subscription, Transport, TransportError};

/// Default number of envelopes buffered per room before slow members lag.
pub const DEFAULT_ROOM_CAPACITY: usize = 256;

/// In-process broadcast rooms keyed by channel name.
///
/// Each room is a tokio broadcast channel, so envelopes published on one
/// channel reach every member in publish order.
#[derive(Clone)]
pub struct LocalHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    rooms: DashMap<String, broadcast::Sender<Delivery>>,
    capacity: usize,
    clock: ServerClock,
    closed: AtomicBool,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_ROOM_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                rooms: DashMap::new(),
                capacity: capacity.max(1),
                clock: ServerClock::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Stamp and fan out an event to every member of `channel`.
    ///
    /// `exclude` names a hub connection that must not receive it. Publishing
    /// on a channel without members succeeds and is simply lost.
    pub fn send(
        &self,
        channel: &str,
        event: &ChannelEvent,
        exclude: Option<Uuid>,
    ) -> Result<Envelope, TransportError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        let envelope = Envelope::new(channel, event, self.inner.clock.now())?;
        if let Some(room) = self.inner.rooms.get(channel) {
            // Err only means nobody is listening right now.
            let _ = room.send(Delivery {
                envelope: envelope.clone(),
                exclude,
            });
        }
        Ok(envelope)
    }

    /// Become a member of `channel`.
    pub fn join(&self, channel: &str) -> Result<Subscription, TransportError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        let receiver = self
            .inner
            .rooms
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
            .subscribe();

        let weak: Weak<HubInner> = Arc::downgrade(&self.inner);
        let name = channel.to_owned();
        let on_leave = Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                let removed = inner
                    .rooms
                    .remove_if(&name, |_, sender| sender.receiver_count() == 0);
                if removed.is_some() {
                    debug!(channel = %name, "hub room closed");
                }
            }
        });
        Ok(Subscription::new(channel.to_owned(), receiver, Some(on_leave)))
    }

    /// Number of members currently in `channel`.
    pub fn member_count(&self, channel: &str) -> usize {
        self.inner
            .rooms
            .get(channel)
            .map(|room| room.receiver_count())
            .unwrap_or(0)
    }

    pub fn now(&self) -> u64 {
        self.inner.clock.now()
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        // Dropping the senders ends every subscription.
        self.inner.rooms.clear();
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LocalHub {
    fn publish(
        &self,
        channel: &str,
        event: ChannelEvent,
    ) -> BoxFuture<'static, Result<Envelope, TransportError>> {
        let result = self.send(channel, &event, None);
        async move { result }.boxed()
    }

    fn subscribe(&self, channel: &str) -> BoxFuture<'static, Result<Subscription, TransportError>> {
        let result = self.join(channel);
        async move { result }.boxed()
    }

    fn now(&self) -> u64 {
        LocalHub::now(self)
    }

    fn is_connected(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    fn disconnect(&self) -> BoxFuture<'static, ()> {
        self.close();
        async {}.boxed()
    }
}

#[cfg(test)]
mod tests {
    use crate::dto::envelope::{ClientBuzz, PresenceUpdate};

    use super::*;

    fn presence(team_id: Uuid) -> ChannelEvent {
        ChannelEvent::PresenceUpdate(PresenceUpdate {
            team_id,
            online: true,
        })
    }

    #[tokio::test]
    async fn publish_reaches_every_member_including_sender() {
        let hub = LocalHub::new();
        let mut first = hub.join("session:a").unwrap();
        let mut second = hub.join("session:a").unwrap();
        let mut other = hub.join("session:b").unwrap();

        let sent = Transport::publish(&hub, "session:a", ChannelEvent::RegieLock)
            .await
            .unwrap();

        assert_eq!(first.recv().await.unwrap(), sent);
        assert_eq!(second.recv().await.unwrap(), sent);
        hub.send("session:b", &ChannelEvent::RegieUnlock, None).unwrap();
        assert_eq!(other.recv().await.unwrap().event, "regie:unlock");
    }

    #[tokio::test]
    async fn per_channel_order_is_preserved() {
        let hub = LocalHub::new();
        let mut member = hub.join("session:a").unwrap();
        let teams: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        for team in &teams {
            hub.send("session:a", &presence(*team), None).unwrap();
        }
        for team in &teams {
            let envelope = member.recv().await.unwrap();
            assert_eq!(envelope.payload["teamId"], team.to_string());
        }
    }

    #[tokio::test]
    async fn exclusion_travels_with_the_delivery() {
        let hub = LocalHub::new();
        let mut member = hub.join("session:a").unwrap();
        let connection = Uuid::new_v4();
        let buzz = ChannelEvent::ClientBuzz(ClientBuzz {
            team_id: Uuid::new_v4(),
            device_id: None,
            instance_id: None,
            client_ts: None,
        });
        hub.send("session:a", &buzz, Some(connection)).unwrap();
        let delivery = member.recv_delivery().await.unwrap();
        assert_eq!(delivery.exclude, Some(connection));
    }

    #[tokio::test]
    async fn timestamps_never_go_backwards() {
        let hub = LocalHub::new();
        let first = hub.send("session:a", &ChannelEvent::RegieLock, None).unwrap();
        let second = hub.send("session:a", &ChannelEvent::RegieLock, None).unwrap();
        assert!(second.ts >= first.ts);
    }

    #[tokio::test]
    async fn empty_rooms_are_removed_when_last_member_leaves() {
        let hub = LocalHub::new();
        let first = hub.join("session:a").unwrap();
        let second = hub.join("session:a").unwrap();
        assert_eq!(hub.member_count("session:a"), 2);

        first.unsubscribe();
        assert_eq!(hub.member_count("session:a"), 1);
        drop(second);
        assert_eq!(hub.member_count("session:a"), 0);
        assert!(hub.inner.rooms.is_empty());
    }

    #[tokio::test]
    async fn disconnect_fails_publishers_fast_and_ends_subscriptions() {
        let hub = LocalHub::new();
        let mut member = hub.join("session:a").unwrap();
        Transport::disconnect(&hub).await;

        assert!(!Transport::is_connected(&hub));
        assert!(matches!(
            hub.send("session:a", &ChannelEvent::RegieLock, None),
            Err(TransportError::Disconnected)
        ));
        assert!(matches!(hub.join("session:a"), Err(TransportError::Disconnected)));
        assert!(member.recv().await.is_none());
    }
}
