//! Broadcast channels between the authority and its mirrors.
//!
//! Two backends implement [`Transport`]: the in-process [`LocalHub`] (served to
//! devices over `/ws`) and the hosted [`RealtimeTransport`]. Both deliver the
//! same [`Envelope`]s with at-most-once semantics.

pub mod hub;
pub mod realtime;

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use futures::{Stream, future::BoxFuture};
use thiserror::Error;
use tokio::{sync::broadcast, time::Instant};
use tokio_stream::{StreamExt, wrappers::BroadcastStream};
use tracing::warn;
use uuid::Uuid;

use crate::dto::envelope::{ChannelEvent, CodecError, Envelope};

pub use hub::LocalHub;
pub use realtime::{RealtimeConfig, RealtimeTransport};

/// Failures of a channel transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection is down; publishing fails fast instead of queueing.
    #[error("transport disconnected")]
    Disconnected,
    /// The channel did not reach the joined state in time.
    #[error("timed out joining channel `{0}`")]
    JoinTimeout(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// An envelope as routed by a transport.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: Envelope,
    /// Hub connection that must not receive its own message.
    pub exclude: Option<Uuid>,
}

/// Channel broadcast contract shared by every backend.
pub trait Transport: Send + Sync {
    /// Publish an event, returning the envelope as sent.
    fn publish(
        &self,
        channel: &str,
        event: ChannelEvent,
    ) -> BoxFuture<'static, Result<Envelope, TransportError>>;
    /// Join a channel. Dropping the subscription leaves it.
    fn subscribe(&self, channel: &str) -> BoxFuture<'static, Result<Subscription, TransportError>>;
    /// Drop what publishing kept for `channel` if nobody here subscribes to it.
    fn release(&self, _channel: &str) {}
    /// Server time in milliseconds; never goes backwards.
    fn now(&self) -> u64;
    /// Whether publishing can currently succeed.
    fn is_connected(&self) -> bool;
    /// Close the transport; pending subscriptions end.
    fn disconnect(&self) -> BoxFuture<'static, ()>;
}

type LeaveFn = Box<dyn FnOnce() + Send + Sync>;

/// Membership of one channel; also the unsubscribe token.
pub struct Subscription {
    channel: String,
    receiver: broadcast::Receiver<Delivery>,
    // Declared after `receiver` so the receiver is gone when the leave hook runs.
    membership: LeaveOnDrop,
}

impl Subscription {
    pub(crate) fn new(
        channel: String,
        receiver: broadcast::Receiver<Delivery>,
        on_leave: Option<LeaveFn>,
    ) -> Self {
        Self {
            channel,
            receiver,
            membership: LeaveOnDrop(on_leave),
        }
    }

    /// Channel this subscription belongs to.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next envelope, or `None` once the channel is closed.
    ///
    /// Envelopes missed because the subscriber lagged behind are skipped.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.recv_delivery().await.map(|delivery| delivery.envelope)
    }

    /// Next delivery with its routing information.
    pub async fn recv_delivery(&mut self) -> Option<Delivery> {
        loop {
            match self.receiver.recv().await {
                Ok(delivery) => return Some(delivery),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(channel = %self.channel, skipped, "subscriber lagged; envelopes dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Turn the subscription into a stream of deliveries, keeping membership alive.
    pub fn into_stream(self) -> impl Stream<Item = Delivery> + Send + 'static {
        let Subscription {
            channel,
            receiver,
            membership,
        } = self;
        BroadcastStream::new(receiver).filter_map(move |item| {
            let _membership = &membership;
            match item {
                Ok(delivery) => Some(delivery),
                Err(err) => {
                    warn!(channel = %channel, error = %err, "subscriber lagged; envelopes dropped");
                    None
                }
            }
        })
    }

    /// Leave the channel now.
    pub fn unsubscribe(self) {}
}

struct LeaveOnDrop(Option<LeaveFn>);

impl Drop for LeaveOnDrop {
    fn drop(&mut self) {
        if let Some(leave) = self.0.take() {
            leave();
        }
    }
}

/// Millisecond clock anchored on the wall clock at start and advanced by a
/// monotonic instant, clamped so it never goes backwards.
#[derive(Debug)]
pub struct ServerClock {
    origin_ms: u64,
    origin: Instant,
    last: AtomicU64,
}

impl ServerClock {
    pub fn new() -> Self {
        let origin_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(millis)
            .unwrap_or_default();
        Self {
            origin_ms,
            origin: Instant::now(),
            last: AtomicU64::new(origin_ms),
        }
    }

    /// Current server time in milliseconds.
    pub fn now(&self) -> u64 {
        let candidate = self.origin_ms + millis(self.origin.elapsed());
        let previous = self.last.fetch_max(candidate, Ordering::SeqCst);
        previous.max(candidate)
    }
}

impl Default for ServerClock {
    fn default() -> Self {
        Self::new()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn server_clock_follows_monotonic_time() {
        let clock = ServerClock::new();
        let first = clock.now();
        tokio::time::advance(Duration::from_millis(1_500)).await;
        let second = clock.now();
        assert!(second >= first + 1_500);
        assert!(clock.now() >= second);
    }
}
