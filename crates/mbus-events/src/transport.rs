//! Transport seam between the connector and a retained pub/sub service

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::EventsError;

/// Inbound traffic from a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Message on a subscribed topic (empty payload = retained message cleared)
    Message { topic: String, payload: Vec<u8> },
    /// Established connection dropped
    ConnectionLost(String),
}

/// Retained-message publish/subscribe service
///
/// Implementations deliver every inbound message through the sender handed
/// to [`connect`](EventTransport::connect). They never call back into the
/// connector directly.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Open the connection, routing inbound traffic to `inbound`
    ///
    /// # Errors
    /// Returns error if the broker cannot be reached or refuses the session
    async fn connect(&self, inbound: mpsc::UnboundedSender<TransportEvent>)
        -> Result<(), EventsError>;

    /// Subscribe to a topic filter (`+` and `#` wildcards allowed)
    ///
    /// Retained messages matching the filter are delivered afterwards.
    ///
    /// # Errors
    /// Returns error if the subscription is rejected
    async fn subscribe(&self, filter: &str) -> Result<(), EventsError>;

    /// Publish a message
    ///
    /// # Errors
    /// Returns error if the message cannot be handed to the broker
    async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<(), EventsError>;
}
