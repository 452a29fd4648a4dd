/// Pool events for downstream consumers (persistence, payouts, notifications)

use std::net::SocketAddr;
use tokio::sync::broadcast;

use crate::jobs::Share;

pub const DEFAULT_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
pub struct AcceptedShare {
    pub share: Share,
    pub connection_id: String,
    pub remote_address: SocketAddr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FoundBlock {
    pub pool_id: String,
    pub height: u64,
    pub hash: Option<String>,
}

#[derive(Debug, Clone)]
pub enum PoolEvent {
    AcceptedShare(Box<AcceptedShare>),
    FoundBlock(FoundBlock),
}

/// Fan-out channel shared by every pool of the cluster. Publishing with no
/// subscriber drops the event.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PoolEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: PoolEvent) {
        let _ = self.tx.send(event);
    }

    pub fn publish_share(&self, share: Share, connection_id: &str, remote_address: SocketAddr) {
        self.publish(PoolEvent::AcceptedShare(Box::new(AcceptedShare {
            share,
            connection_id: connection_id.to_string(),
            remote_address,
        })));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::WorkerShareContext;

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let share = Share::new(&WorkerShareContext::default(), 7, 1.0, 2.0);
        bus.publish_share(share, "c1", "127.0.0.1:4000".parse().unwrap());
        bus.publish(PoolEvent::FoundBlock(FoundBlock {
            pool_id: "btc".into(),
            height: 7,
            hash: None,
        }));

        match rx.recv().await.unwrap() {
            PoolEvent::AcceptedShare(accepted) => {
                assert_eq!(accepted.connection_id, "c1");
                assert_eq!(accepted.share.block_height, 7);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(rx.recv().await.unwrap(), PoolEvent::FoundBlock(b) if b.height == 7));
    }

    #[test]
    fn test_publish_without_subscribers() {
        EventBus::new(1).publish(PoolEvent::FoundBlock(FoundBlock {
            pool_id: "x".into(),
            height: 1,
            hash: None,
        }));
    }
}
