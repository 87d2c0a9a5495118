//! Error types for the notification channel

use mbus_core::PathError;

/// Notification channel errors
#[derive(Debug, thiserror::Error)]
pub enum EventsError {
    /// Broker connection could not be established
    #[error("connection to broker failed: {0}")]
    Connection(String),

    /// Established connection dropped
    #[error("connection to broker lost: {0}")]
    ConnectionLost(String),

    /// Operation attempted before `connect` succeeded
    #[error("transport not connected")]
    NotConnected,

    /// Subscription rejected or not delivered
    #[error("subscribe to {filter} failed: {reason}")]
    Subscribe { filter: String, reason: String },

    /// Publish rejected or not delivered
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    /// Environment or agent not usable as topic segment
    #[error("invalid topic: {0}")]
    Path(#[from] PathError),
}

impl EventsError {
    /// Whether a later retry of the same call may succeed
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::NotConnected)
    }
}
