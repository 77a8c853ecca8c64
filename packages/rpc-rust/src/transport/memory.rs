//! In-process broker over tokio channels.
//!
//! Every receive address is a fanout route: each link opened on it gets a
//! copy of every envelope published there. Fault injection hooks simulate
//! connection loss and an unreachable broker.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use relay_core::{Envelope, TransportError};
use tokio::sync::mpsc;

use super::{Acknowledge, Broker, BrokerLink, Delivery, Link, DELIVERY_BUFFER};

/// Cheaply cloneable handle to a shared in-process broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    routes: DashMap<String, Vec<Subscriber>>,
    next_link_id: AtomicU64,
    failing_opens: AtomicU32,
    opens: AtomicU64,
    acks: Arc<AtomicU64>,
}

#[derive(Debug, Clone)]
struct Subscriber {
    link_id: u64,
    tx: mpsc::Sender<Delivery>,
    alive: Arc<AtomicBool>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` calls to `open` fail with `Unreachable`.
    pub fn fail_next_opens(&self, count: u32) {
        self.state.failing_opens.store(count, Ordering::SeqCst);
    }

    /// Simulates connection loss for every link on `address`.
    ///
    /// Their inbound streams end once buffered messages are drained and
    /// their publish side starts failing with `Closed`.
    pub fn sever(&self, address: &str) {
        if let Some((_, subscribers)) = self.state.routes.remove(address) {
            for subscriber in subscribers {
                subscriber.alive.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Number of links currently receiving on `address`.
    #[must_use]
    pub fn subscriber_count(&self, address: &str) -> usize {
        self.state
            .routes
            .get(address)
            .map_or(0, |entry| entry.value().len())
    }

    /// Total successful `open` calls so far.
    #[must_use]
    pub fn open_count(&self) -> u64 {
        self.state.opens.load(Ordering::SeqCst)
    }

    /// Total deliveries acknowledged so far.
    #[must_use]
    pub fn ack_count(&self) -> u64 {
        self.state.acks.load(Ordering::SeqCst)
    }
}

impl MemoryState {
    async fn route(&self, envelope: Envelope) -> Result<(), TransportError> {
        // Snapshot the subscribers so no shard lock is held across a send.
        let subscribers = self
            .routes
            .get(&envelope.destination)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();

        let mut delivered = false;
        for subscriber in subscribers {
            if !subscriber.alive.load(Ordering::SeqCst) {
                continue;
            }
            let acker = Arc::new(MemoryAcker {
                acks: Arc::clone(&self.acks),
                acked: AtomicBool::new(false),
            });
            match subscriber
                .tx
                .send(Delivery::new(envelope.clone(), acker))
                .await
            {
                Ok(()) => delivered = true,
                // Receiver dropped without closing its link.
                Err(_) => self.unsubscribe(&envelope.destination, subscriber.link_id),
            }
        }

        if delivered {
            Ok(())
        } else {
            Err(TransportError::NoRoute(envelope.destination))
        }
    }

    fn unsubscribe(&self, address: &str, link_id: u64) {
        if let Some(mut entry) = self.routes.get_mut(address) {
            entry.value_mut().retain(|s| s.link_id != link_id);
        }
        self.routes.remove_if(address, |_, subscribers| subscribers.is_empty());
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn open(&self, address: &str) -> Result<BrokerLink, TransportError> {
        let injected = self
            .state
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(TransportError::Unreachable(
                "memory broker refused connection".to_string(),
            ));
        }

        let link_id = self.state.next_link_id.fetch_add(1, Ordering::Relaxed);
        let alive = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);

        self.state
            .routes
            .entry(address.to_string())
            .or_default()
            .push(Subscriber {
                link_id,
                tx,
                alive: Arc::clone(&alive),
            });
        self.state.opens.fetch_add(1, Ordering::SeqCst);

        let link = MemoryLink {
            state: Arc::clone(&self.state),
            address: address.to_string(),
            link_id,
            alive,
        };
        Ok(BrokerLink::new(Arc::new(link), rx))
    }
}

#[derive(Debug)]
struct MemoryLink {
    state: Arc<MemoryState>,
    address: String,
    link_id: u64,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl Link for MemoryLink {
    async fn publish(&self, envelope: Envelope) -> Result<(), TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.state.route(envelope).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.alive.store(false, Ordering::SeqCst);
        self.state.unsubscribe(&self.address, self.link_id);
        Ok(())
    }
}

#[derive(Debug)]
struct MemoryAcker {
    acks: Arc<AtomicU64>,
    acked: AtomicBool,
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        if !self.acked.swap(true, Ordering::SeqCst) {
            self.acks.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use relay_core::{ContentType, CorrelationId};

    use super::*;

    fn envelope_to(destination: &str) -> Envelope {
        Envelope::request(
            destination,
            "replies",
            "echo",
            CorrelationId::generate(),
            ContentType::Json,
            b"{}".to_vec(),
        )
    }

    #[tokio::test]
    async fn publish_reaches_receiver() {
        let broker = MemoryBroker::new();
        let mut server = broker.open("rpc_server").await.unwrap();
        let client = broker.open("rpc_client").await.unwrap();

        let sent = envelope_to("rpc_server");
        client.link.publish(sent.clone()).await.unwrap();

        let delivery = server.deliveries.recv().await.unwrap();
        assert_eq!(delivery.envelope, sent);
    }

    #[tokio::test]
    async fn fanout_copies_to_every_link() {
        let broker = MemoryBroker::new();
        let mut a = broker.open("rpc_server").await.unwrap();
        let mut b = broker.open("rpc_server").await.unwrap();
        assert_eq!(broker.subscriber_count("rpc_server"), 2);

        a.link.publish(envelope_to("rpc_server")).await.unwrap();
        assert!(a.deliveries.recv().await.is_some());
        assert!(b.deliveries.recv().await.is_some());
    }

    #[tokio::test]
    async fn unknown_destination_is_no_route() {
        let broker = MemoryBroker::new();
        let client = broker.open("rpc_client").await.unwrap();
        let err = client
            .link
            .publish(envelope_to("nowhere"))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::NoRoute("nowhere".to_string()));
    }

    #[tokio::test]
    async fn sever_ends_inbound_and_fails_publish() {
        let broker = MemoryBroker::new();
        let mut link = broker.open("rpc_client").await.unwrap();
        broker.sever("rpc_client");

        assert!(link.deliveries.recv().await.is_none());
        assert_eq!(
            link.link.publish(envelope_to("rpc_client")).await,
            Err(TransportError::Closed)
        );
        assert_eq!(broker.subscriber_count("rpc_client"), 0);
    }

    #[tokio::test]
    async fn close_unsubscribes() {
        let broker = MemoryBroker::new();
        let mut link = broker.open("rpc_server").await.unwrap();
        link.link.close().await.unwrap();

        assert_eq!(broker.subscriber_count("rpc_server"), 0);
        assert!(link.deliveries.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_publish() {
        let broker = MemoryBroker::new();
        let server = broker.open("rpc_server").await.unwrap();
        let client = broker.open("rpc_client").await.unwrap();
        drop(server.deliveries);
        assert_eq!(broker.subscriber_count("rpc_server"), 1);

        let err = client
            .link
            .publish(envelope_to("rpc_server"))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::NoRoute("rpc_server".to_string()));
        assert_eq!(broker.subscriber_count("rpc_server"), 0);
    }

    #[tokio::test]
    async fn injected_open_failures_are_consumed() {
        let broker = MemoryBroker::new();
        broker.fail_next_opens(2);

        assert!(matches!(
            broker.open("a").await,
            Err(TransportError::Unreachable(_))
        ));
        assert!(broker.open("a").await.is_err());
        assert!(broker.open("a").await.is_ok());
        assert_eq!(broker.open_count(), 1);
    }

    #[tokio::test]
    async fn ack_is_counted_once() {
        let broker = MemoryBroker::new();
        let mut server = broker.open("rpc_server").await.unwrap();
        server
            .link
            .publish(envelope_to("rpc_server"))
            .await
            .unwrap();

        let delivery = server.deliveries.recv().await.unwrap();
        delivery.ack().await.unwrap();
        delivery.ack().await.unwrap();
        assert_eq!(broker.ack_count(), 1);
    }
}
