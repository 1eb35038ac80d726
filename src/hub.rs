//! Broadcast hub
//!
//! Multi-producer fan-out of [`WsMessage`] to every subscriber. Each
//! subscriber owns a bounded buffer; when it falls behind, the oldest
//! undelivered messages for that subscriber are dropped and counted. A slow
//! subscriber never blocks the pipeline or any other subscriber.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::WsMessage;

/// Default per-subscriber buffer capacity
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct Hub {
    tx: broadcast::Sender<WsMessage>,
    subscriber_seq: Arc<AtomicU64>,
    total_dropped: Arc<AtomicU64>,
}

impl Hub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            tx,
            subscriber_seq: Arc::new(AtomicU64::new(0)),
            total_dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Fan a message out to all current subscribers. A send with no
    /// subscribers is not an error.
    pub fn send(&self, msg: WsMessage) {
        let _ = self.tx.send(msg);
    }

    pub fn subscribe(&self) -> HubSubscriber {
        let id = self.subscriber_seq.fetch_add(1, Ordering::Relaxed);
        HubSubscriber {
            id,
            rx: self.tx.subscribe(),
            dropped: 0,
            total_dropped: self.total_dropped.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Messages dropped across all subscribers since startup
    pub fn total_dropped(&self) -> u64 {
        self.total_dropped.load(Ordering::Relaxed)
    }
}

/// One subscriber's end of the hub
pub struct HubSubscriber {
    id: u64,
    rx: broadcast::Receiver<WsMessage>,
    dropped: u64,
    total_dropped: Arc<AtomicU64>,
}

impl HubSubscriber {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Messages this subscriber lost to buffer overflow
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Next message in emission order. Overflow is absorbed into the drop
    /// counter and the subscriber continues from the oldest retained
    /// message. Returns None once the hub is gone and the buffer is drained.
    pub async fn recv(&mut self) -> Option<WsMessage> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => return Some(msg),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.dropped += skipped;
                    self.total_dropped.fetch_add(skipped, Ordering::Relaxed);
                    debug!(
                        "Subscriber {} lagged, dropped {} messages ({} total)",
                        self.id, skipped, self.dropped
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant used by tests and drain loops
    pub fn try_recv(&mut self) -> Option<WsMessage> {
        loop {
            match self.rx.try_recv() {
                Ok(msg) => return Some(msg),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    self.dropped += skipped;
                    self.total_dropped.fetch_add(skipped, Ordering::Relaxed);
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CVDPoint, FRESH_X};

    fn point(i: i64) -> WsMessage {
        WsMessage::CVDPoint(CVDPoint { timestamp: i as u64, value: i, x: FRESH_X })
    }

    fn point_value(msg: &WsMessage) -> i64 {
        match msg {
            WsMessage::CVDPoint(p) => p.value,
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fifo_per_subscriber() {
        let hub = Hub::new(DEFAULT_CAPACITY);
        let mut sub = hub.subscribe();
        for i in 0..100 {
            hub.send(point(i));
        }
        for i in 0..100 {
            assert_eq!(point_value(&sub.recv().await.unwrap()), i);
        }
        assert_eq!(sub.dropped(), 0);
    }

    /// A fast subscriber sees all 2000 messages in order while a blocked one
    /// overflows its 1024 buffer and counts at least 976 drops.
    #[tokio::test]
    async fn test_fast_and_blocked_subscribers() {
        let hub = Hub::new(DEFAULT_CAPACITY);
        let mut fast = hub.subscribe();
        let mut blocked = hub.subscribe();

        for i in 0..2000 {
            hub.send(point(i));
            // The fast subscriber keeps up message-for-message
            assert_eq!(point_value(&fast.recv().await.unwrap()), i);
        }

        // The blocked subscriber wakes up only now
        let mut received = Vec::new();
        while let Some(msg) = blocked.try_recv() {
            received.push(point_value(&msg));
        }

        assert!(blocked.dropped() >= 976, "dropped {}", blocked.dropped());
        assert_eq!(received.len() as u64 + blocked.dropped(), 2000);
        // Whatever survived is still in emission order and contiguous
        for pair in received.windows(2) {
            assert_eq!(pair[1], pair[0] + 1);
        }
        assert_eq!(received.last().copied(), Some(1999));
    }

    #[tokio::test]
    async fn test_subscriber_isolation() {
        let hub = Hub::new(DEFAULT_CAPACITY);
        let mut a = hub.subscribe();
        {
            let _b = hub.subscribe();
            // b is dropped here, unsubscribing it
        }
        hub.send(point(1));
        assert_eq!(point_value(&a.recv().await.unwrap()), 1);
        assert_eq!(hub.subscriber_count(), 1);
    }
}
