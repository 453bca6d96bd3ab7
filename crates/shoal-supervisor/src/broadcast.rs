//! Debug broadcast sinks.
//!
//! Fans a line out to every attached sink (console sessions) on top of the
//! `tracing` output on stderr. A sink whose receiving side is gone is
//! dropped on the next broadcast.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

struct Inner {
    /// Map of sink id to its line channel
    sinks: DashMap<u64, mpsc::UnboundedSender<String>>,
    next_id: AtomicU64,
}

/// Registry of broadcast sinks.
///
/// Cheap to clone; clones share the same sinks.
///
/// ## Usage
///
/// ```ignore
/// let broadcaster = Broadcaster::new();
///
/// // When a console session attaches:
/// let mut sink = broadcaster.subscribe();
///
/// // Anywhere:
/// broadcaster.broadcast("worker 3 is misbehaving");
///
/// // In the session:
/// while let Some(line) = sink.recv().await { /* write line */ }
/// ```
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

impl Broadcaster {
    /// Create a broadcaster with no sinks.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                sinks: DashMap::new(),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Attach a sink. It stays attached until the subscription is dropped.
    pub fn subscribe(&self) -> SinkSubscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.sinks.insert(id, tx);
        debug!(sink_id = id, "Broadcast sink attached");
        SinkSubscription {
            id,
            rx,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Log `message` and send it to every attached sink.
    pub fn broadcast(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        info!(target: "shoal::debug", "{}", message);
        self.inner.sinks.retain(|id, tx| {
            let delivered = tx.send(message.to_string()).is_ok();
            if !delivered {
                debug!(sink_id = *id, "Removing dead broadcast sink");
            }
            delivered
        });
    }

    /// Number of attached sinks.
    pub fn sink_count(&self) -> usize {
        self.inner.sinks.len()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcaster")
            .field("sinks", &self.sink_count())
            .finish()
    }
}

/// An attached broadcast sink. Detaches on drop.
pub struct SinkSubscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<String>,
    inner: Arc<Inner>,
}

impl SinkSubscription {
    /// Next broadcast line.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

impl Drop for SinkSubscription {
    fn drop(&mut self) {
        self.inner.sinks.remove(&self.id);
    }
}

impl fmt::Debug for SinkSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkSubscription")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_reaches_every_sink() {
        let broadcaster = Broadcaster::new();
        let mut a = broadcaster.subscribe();
        let mut b = broadcaster.subscribe();
        assert_eq!(broadcaster.sink_count(), 2);

        broadcaster.broadcast("hello");
        assert_eq!(a.recv().await.as_deref(), Some("hello"));
        assert_eq!(b.recv().await.as_deref(), Some("hello"));
    }

    #[test]
    fn test_dropped_subscription_detaches() {
        let broadcaster = Broadcaster::new();
        let sink = broadcaster.subscribe();
        assert_eq!(broadcaster.sink_count(), 1);
        drop(sink);
        assert_eq!(broadcaster.sink_count(), 0);
        // No sinks is fine.
        broadcaster.broadcast("nobody listening");
    }

    #[test]
    fn test_clones_share_sinks() {
        let broadcaster = Broadcaster::new();
        let clone = broadcaster.clone();
        let _sink = clone.subscribe();
        assert_eq!(broadcaster.sink_count(), 1);
    }
}
