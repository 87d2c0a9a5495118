//! Repository event: the pointer published in place of a payload

use mbus_core::Timestamp;
use serde::{Deserialize, Serialize};

use crate::RepositoryError;

/// Location of a posted payload plus its timestamp
///
/// Server and port are left empty (and omitted on the wire) in single-server
/// mode, where every agent reads from the configured store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryEvent {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server: String,
    /// Port as decimal string
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub port: String,
    #[serde(rename = "file path")]
    pub file_path: String,
    pub timestamp: Timestamp,
}

impl RepositoryEvent {
    /// Whether the event names its own server
    #[inline]
    #[must_use]
    pub fn has_server(&self) -> bool {
        !self.server.is_empty()
    }

    /// Numeric port of the named server
    ///
    /// # Errors
    /// Returns error if the port field is not a valid port number
    pub fn port_number(&self) -> Result<u16, RepositoryError> {
        self.port
            .parse()
            .map_err(|_| RepositoryError::InvalidEvent(format!("bad port {:?}", self.port)))
    }

    /// Encode as JSON message
    ///
    /// # Errors
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<Vec<u8>, RepositoryError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from JSON message
    ///
    /// # Errors
    /// Returns error if the message is not a repository event
    pub fn from_json(message: &[u8]) -> Result<Self, RepositoryError> {
        let event: Self = serde_json::from_slice(message)?;
        if event.file_path.is_empty() {
            return Err(RepositoryError::InvalidEvent("empty file path".to_string()));
        }
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn stamp() -> Timestamp {
        "2025-11-27-10-00-00-00".parse().unwrap()
    }

    #[test]
    fn single_server_event_omits_endpoint() {
        let event = RepositoryEvent {
            server: String::new(),
            port: String::new(),
            file_path: "p/x/payload".to_string(),
            timestamp: stamp(),
        };
        let json = String::from_utf8(event.to_json().unwrap()).unwrap();
        assert_eq!(
            json,
            r#"{"file path":"p/x/payload","timestamp":"2025-11-27-10-00-00-00"}"#
        );
    }

    #[test]
    fn multi_server_event_carries_endpoint() {
        let json = br#"{"server":"files","port":"2121","file path":"a/payload","timestamp":"2025-11-27-10-00-00-00"}"#;
        let event = RepositoryEvent::from_json(json).unwrap();
        assert!(event.has_server());
        assert_eq!(event.port_number().unwrap(), 2121);
        assert_eq!(event.file_path, "a/payload");
    }

    #[test]
    fn rejects_non_events() {
        assert!(RepositoryEvent::from_json(b"not json").is_err());
        assert!(RepositoryEvent::from_json(br#"{"file path":"","timestamp":""}"#).is_err());
    }

    #[test]
    fn bad_port_is_reported() {
        let event = RepositoryEvent {
            server: "files".to_string(),
            port: "ftp".to_string(),
            file_path: "a".to_string(),
            timestamp: stamp(),
        };
        assert!(matches!(
            event.port_number(),
            Err(RepositoryError::InvalidEvent(_))
        ));
    }
}
