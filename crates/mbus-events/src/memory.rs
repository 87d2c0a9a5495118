//! In-process retained-message broker
//!
//! Behaves like a single MQTT broker shared by any number of
//! [`MemoryTransport`] clients: retained messages are kept per topic, an
//! empty retained payload clears the topic, and a new subscription replays
//! matching retained messages. Used for tests and single-process setups.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::filter::topic_matches;
use crate::{EventTransport, EventsError, TransportEvent};

#[derive(Debug)]
struct Client {
    id: u64,
    filters: Vec<String>,
    sender: mpsc::UnboundedSender<TransportEvent>,
}

#[derive(Debug, Default)]
struct BrokerState {
    retained: BTreeMap<String, Vec<u8>>,
    clients: Vec<Client>,
    next_id: u64,
    publish_count: usize,
}

/// Shared in-process broker
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// Create empty broker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// New client transport attached to this broker
    #[must_use]
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
            client_id: Mutex::new(None),
        }
    }

    /// Retained payload currently held for `topic`
    #[must_use]
    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.state.lock().retained.get(topic).cloned()
    }

    /// All topics holding a retained message, sorted
    #[must_use]
    pub fn retained_topics(&self) -> Vec<String> {
        self.state.lock().retained.keys().cloned().collect()
    }

    /// Number of publishes accepted so far
    #[must_use]
    pub fn publish_count(&self) -> usize {
        self.state.lock().publish_count
    }

    /// Drop every client connection, notifying each with `reason`
    pub fn disconnect_all(&self, reason: &str) {
        let clients = std::mem::take(&mut self.state.lock().clients);
        for client in clients {
            let _ = client
                .sender
                .send(TransportEvent::ConnectionLost(reason.to_string()));
        }
    }

    fn register(&self, sender: mpsc::UnboundedSender<TransportEvent>) -> u64 {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.clients.push(Client {
            id,
            filters: Vec::new(),
            sender,
        });
        id
    }

    fn subscribe(&self, client_id: u64, filter: &str) -> Result<(), EventsError> {
        let mut state = self.state.lock();
        let BrokerState {
            retained, clients, ..
        } = &mut *state;

        let client = clients
            .iter_mut()
            .find(|c| c.id == client_id)
            .ok_or(EventsError::NotConnected)?;
        client.filters.push(filter.to_string());

        for (topic, payload) in retained.iter() {
            if topic_matches(filter, topic) {
                let _ = client.sender.send(TransportEvent::Message {
                    topic: topic.clone(),
                    payload: payload.clone(),
                });
            }
        }
        Ok(())
    }

    fn publish(&self, topic: &str, payload: &[u8], retain: bool) {
        let mut state = self.state.lock();
        state.publish_count += 1;

        if retain {
            if payload.is_empty() {
                state.retained.remove(topic);
            } else {
                state.retained.insert(topic.to_string(), payload.to_vec());
            }
        }

        state.clients.retain(|client| !client.sender.is_closed());
        for client in &state.clients {
            if client.filters.iter().any(|f| topic_matches(f, topic)) {
                trace!(client = client.id, topic, "delivering");
                let _ = client.sender.send(TransportEvent::Message {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                });
            }
        }
    }
}

/// One client connection to a [`MemoryBroker`]
#[derive(Debug)]
pub struct MemoryTransport {
    broker: MemoryBroker,
    client_id: Mutex<Option<u64>>,
}

impl MemoryTransport {
    fn client_id(&self) -> Result<u64, EventsError> {
        (*self.client_id.lock()).ok_or(EventsError::NotConnected)
    }
}

#[async_trait]
impl EventTransport for MemoryTransport {
    async fn connect(
        &self,
        inbound: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), EventsError> {
        let id = self.broker.register(inbound);
        *self.client_id.lock() = Some(id);
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<(), EventsError> {
        let id = self.client_id()?;
        self.broker.subscribe(id, filter)
    }

    async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<(), EventsError> {
        self.client_id()?;
        self.broker.publish(topic, payload, retain);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected(broker: &MemoryBroker) -> (MemoryTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let transport = broker.transport();
        let (tx, rx) = mpsc::unbounded_channel();
        transport.connect(tx).await.unwrap();
        (transport, rx)
    }

    #[tokio::test]
    async fn retained_message_replayed_on_subscribe() {
        let broker = MemoryBroker::new();
        let (publisher, _) = connected(&broker).await;
        publisher.publish("env/a/topic", b"hello", true).await.unwrap();

        let (subscriber, mut rx) = connected(&broker).await;
        subscriber.subscribe("env/#").await.unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            TransportEvent::Message {
                topic: "env/a/topic".to_string(),
                payload: b"hello".to_vec(),
            }
        );
    }

    #[tokio::test]
    async fn empty_retained_payload_clears_topic() {
        let broker = MemoryBroker::new();
        let (publisher, _) = connected(&broker).await;
        publisher.publish("t", b"x", true).await.unwrap();
        assert_eq!(broker.retained("t"), Some(b"x".to_vec()));

        publisher.publish("t", b"", true).await.unwrap();
        assert_eq!(broker.retained("t"), None);
        assert_eq!(broker.publish_count(), 2);
    }

    #[tokio::test]
    async fn overlapping_filters_deliver_once() {
        let broker = MemoryBroker::new();
        let (client, mut rx) = connected(&broker).await;
        client.subscribe("a/#").await.unwrap();
        client.subscribe("a/b").await.unwrap();

        client.publish("a/b", b"1", false).await.unwrap();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unconnected_transport_refuses() {
        let broker = MemoryBroker::new();
        let transport = broker.transport();
        let result = transport.publish("t", b"x", true).await;
        assert!(matches!(result, Err(EventsError::NotConnected)));
    }

    #[tokio::test]
    async fn disconnect_notifies_clients() {
        let broker = MemoryBroker::new();
        let (_client, mut rx) = connected(&broker).await;
        broker.disconnect_all("maintenance");
        assert_eq!(
            rx.try_recv().unwrap(),
            TransportEvent::ConnectionLost("maintenance".to_string())
        );
    }
}
