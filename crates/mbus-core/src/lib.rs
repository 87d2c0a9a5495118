//! Modelling Bus Core
//!
//! Primitives shared by every bus layer.
//!
//! # Core Concepts
//!
//! - [`TopicPath`]: Hierarchical slash-separated key for topics and remote files
//! - [`Namespace`]: `<prefix>/<bus-version>/<environment>/<agent>` roots
//! - [`TimestampGenerator`]: Monotonic `YYYY-MM-DD-HH-MM-SS-NN` identifiers
//! - [`BusConfig`]: Typed TOML configuration for both transports
//! - [`ProgressLevel`]: Verbosity of progress reporting via `tracing`
//!
//! # Example
//!
//! ```rust,ignore
//! use mbus_core::{BusConfig, Namespace, TimestampGenerator};
//!
//! let config = BusConfig::load("bus.toml")?;
//! let ns = Namespace::new(&config.mqtt.prefix, &config.environment, &config.agent)?;
//! let stamps = TimestampGenerator::new();
//! println!("{} @ {}", ns.environment_root(), stamps.next());
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod config;
mod path;
pub mod reporting;
mod timestamp;

pub use config::{BusConfig, ConfigError, EventsConfig, RepositoryConfig, MQTT_MAX_PAYLOAD};
pub use path::{Namespace, PathError, TopicPath};
pub use reporting::{init_tracing, ProgressLevel};
pub use timestamp::{Clock, SystemClock, Timestamp, TimestampError, TimestampGenerator};

/// Version segment of every topic and remote path
pub const BUS_VERSION: &str = "bus-version-1.0";

/// Name of the remote file holding a posting's payload
pub const PAYLOAD_FILE_NAME: &str = "payload";

/// Default local name for downloaded JSON payloads
pub const JSON_FILE_NAME: &str = "message.json";

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
