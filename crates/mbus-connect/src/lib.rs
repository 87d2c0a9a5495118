//! Modelling Bus Connectors
//!
//! Agents share artifacts through a notification channel carrying small
//! retained events and a content store carrying the payloads.
//!
//! # Components
//!
//! - [`BusConnector`]: Postings by reference (content store plus pointer
//!   event) and inline streamed postings, with the matching listeners
//! - [`JsonArtifactConnector`]: Current, updated and considering tiers of a
//!   JSON artifact, synchronized through timestamped JSON-patch deltas
//! - Raw artifacts and observations as extra [`BusConnector`] operations
//!
//! # Example
//!
//! ```rust,ignore
//! use mbus_connect::prelude::*;
//!
//! let config = BusConfig::load("bus.toml")?;
//! let bus = BusConnector::connect(&config, BusTransports::network(&config), false).await?;
//!
//! let model = JsonArtifactConnector::new(bus.clone(), "model-1", "v1")?;
//! model.post_state(br#"{"name":"A"}"#).await?;
//! model.post_update(br#"{"name":"B"}"#).await?;
//!
//! let mirror = JsonArtifactConnector::new(bus, "model-1", "v1")?;
//! mirror
//!     .listen_for_update_postings("agent-b", |view| println!("{}", view.updated))
//!     .await?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod artifact;
mod bus;
mod error;
pub mod json_ops;
mod observation;
mod raw;
pub mod topics;

pub use artifact::{ArtifactView, DeltaOutcome, JsonArtifactConnector};
pub use bus::{BusConnector, BusTransports, StreamedEvent};
pub use error::{ArtifactError, BusError};
pub use json_ops::JsonDelta;
pub use topics::ArtifactTier;

pub mod prelude {
    //! Common imports for bus clients
    pub use crate::{
        ArtifactError, ArtifactTier, ArtifactView, BusConnector, BusError, BusTransports, DeltaOutcome,
        JsonArtifactConnector,
    };
    pub use mbus_core::{BusConfig, ProgressLevel, Timestamp, TimestampGenerator, TopicPath};
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
