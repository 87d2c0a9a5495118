//! Testing utilities for the modelling bus workspace
//!
//! In-process broker and content store shared by any number of agents, plus
//! helpers for waiting on listener output.

#![allow(missing_docs)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use mbus_connect::{BusConnector, BusTransports};
use mbus_core::{BusConfig, EventsConfig, RepositoryConfig, TimestampGenerator, TopicPath};
use mbus_events::MemoryBroker;
use mbus_repository::{MemoryDialer, MemoryRepository};
use tokio::sync::mpsc;

pub const ENVIRONMENT: &str = "test-env";
pub const PREFIX: &str = "mbus";
pub const STORE_SERVER: &str = "store.local";
pub const STORE_PORT: u16 = 2121;
pub const STREAMED_LIMIT: usize = 1024;

/// Configuration for `agent` against the in-process transports
#[must_use]
pub fn test_config(agent: &str, work_folder: &Path) -> BusConfig {
    BusConfig {
        environment: ENVIRONMENT.to_string(),
        agent: agent.to_string(),
        work_folder: work_folder.join(agent),
        mqtt: EventsConfig {
            broker: "broker.local".to_string(),
            port: 1883,
            user: String::new(),
            password: String::new(),
            prefix: PREFIX.to_string(),
            load_delay_ms: 25,
            retry_delay_secs: 0,
            streamed_payload_limit: STREAMED_LIMIT,
            abort_on_connection_loss: false,
        },
        ftp: RepositoryConfig {
            server: STORE_SERVER.to_string(),
            port: STORE_PORT,
            user: "modeller".to_string(),
            password: "secret".to_string(),
            prefix: PREFIX.to_string(),
            single_server_mode: false,
            active_transfers: false,
        },
    }
}

/// Shared broker, store and clock for a group of test agents
pub struct TestBus {
    pub broker: MemoryBroker,
    pub repository: MemoryRepository,
    pub dialer: MemoryDialer,
    pub timestamps: Arc<TimestampGenerator>,
    work: tempfile::TempDir,
}

impl TestBus {
    /// Fresh in-process environment
    ///
    /// # Panics
    /// Panics if the scratch directory cannot be created
    #[must_use]
    pub fn new() -> Self {
        let repository = MemoryRepository::new();
        let dialer = MemoryDialer::new();
        dialer.add_server(STORE_SERVER, STORE_PORT, repository.clone());
        Self {
            broker: MemoryBroker::new(),
            repository,
            dialer,
            timestamps: Arc::new(TimestampGenerator::new()),
            work: tempfile::tempdir().expect("scratch directory"),
        }
    }

    #[must_use]
    pub fn work_folder(&self) -> &Path {
        self.work.path()
    }

    #[must_use]
    pub fn config(&self, agent: &str) -> BusConfig {
        test_config(agent, self.work.path())
    }

    #[must_use]
    pub fn transports(&self) -> BusTransports {
        BusTransports::new(Arc::new(self.broker.transport()), Arc::new(self.dialer.clone()))
            .with_timestamps(Arc::clone(&self.timestamps))
    }

    /// Connected bus for `agent`
    ///
    /// # Panics
    /// Panics if the connection fails
    pub async fn connector(&self, agent: &str) -> BusConnector {
        self.connect(agent, false).await
    }

    /// Connected bus for `agent` that skips the environment snapshot
    ///
    /// # Panics
    /// Panics if the connection fails
    pub async fn posting_connector(&self, agent: &str) -> BusConnector {
        self.connect(agent, true).await
    }

    async fn connect(&self, agent: &str, posting_only: bool) -> BusConnector {
        BusConnector::connect(&self.config(agent), self.transports(), posting_only)
            .await
            .expect("bus connects")
    }

    /// Remote payload path of `agent`'s posting on `topic`
    #[must_use]
    pub fn payload_path(&self, agent: &str, topic: &str) -> String {
        format!("{}/payload", self.full_topic(agent, topic))
    }

    /// Full notification topic of `agent`'s posting on `topic`
    #[must_use]
    pub fn full_topic(&self, agent: &str, topic: &str) -> String {
        format!("{PREFIX}/{}/{ENVIRONMENT}/{agent}/{topic}", mbus_core::BUS_VERSION)
    }
}

impl Default for TestBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a topic path literal
///
/// # Panics
/// Panics on an invalid path
#[must_use]
pub fn topic(path: &str) -> TopicPath {
    path.parse().expect("valid topic path")
}

/// Listener output collector
pub fn collector<T: Send + 'static>() -> (impl FnMut(T) + Send + 'static, mpsc::UnboundedReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |item| {
            let _ = tx.send(item);
        },
        rx,
    )
}

/// Next listener output, failing the test after five seconds
///
/// # Panics
/// Panics on timeout or when the listener is gone
pub async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("listener timed out")
        .expect("listener closed")
}

/// Assert that no listener output arrives within `wait`
///
/// # Panics
/// Panics if something arrives
pub async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>, wait: Duration) {
    if let Ok(Some(item)) = tokio::time::timeout(wait, rx.recv()).await {
        panic!("unexpected listener output: {item:?}");
    }
}
