//! Modelling Bus Notification Channel
//!
//! Small retained messages per topic, addressed as
//! `<prefix>/<bus-version>/<environment>/<agent>/<topic path>`.
//!
//! # Components
//!
//! - [`EventsConnector`]: Connection lifecycle, posting, listening, deletion
//! - [`EventTransport`]: Seam to the pub/sub service
//! - [`MemoryBroker`]: In-process broker for tests and single-process setups
//! - `MqttTransport`: MQTT adapter (feature `mqtt`)
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use mbus_events::{EventsConnector, MemoryBroker};
//!
//! let broker = MemoryBroker::new();
//! let events = EventsConnector::connect(&config.mqtt, "env", "agent", Arc::new(broker.transport()), false).await?;
//! events.post_event(&"notes/today".parse()?, b"hello").await?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod connector;
mod error;
pub mod filter;
mod memory;
#[cfg(feature = "mqtt")]
mod mqtt;
mod transport;

pub use connector::{EventSubscription, EventsConnector};
pub use error::EventsError;
pub use memory::{MemoryBroker, MemoryTransport};
#[cfg(feature = "mqtt")]
pub use mqtt::MqttTransport;
pub use transport::{EventTransport, TransportEvent};
