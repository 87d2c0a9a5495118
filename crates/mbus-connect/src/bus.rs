//! Bus connector: post by reference, post inline, and the matching pulls
//!
//! A posting by reference stores its payload in the content store and
//! publishes a [`RepositoryEvent`] pointing at it on the same topic path. A
//! streamed posting carries its payload inline in a [`StreamedEvent`].
//!
//! Listeners run one task per subscription and handle postings in arrival
//! order, across all topics of that subscription. Failures inside a listener
//! are logged and the posting is skipped.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use mbus_core::{BusConfig, Timestamp, TimestampGenerator, TopicPath};
use mbus_events::{EventTransport, EventsConnector};
use mbus_repository::{RepositoryConnector, RepositoryDialer, RepositoryEvent};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use crate::BusError;

/// Inline posting: timestamp plus raw JSON payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamedEvent {
    pub timestamp: Timestamp,
    pub payload: Box<RawValue>,
}

impl StreamedEvent {
    /// Wrap a JSON document
    ///
    /// # Errors
    /// Returns error if `json` is not valid JSON
    pub fn new(json: &[u8], timestamp: Timestamp) -> Result<Self, serde_json::Error> {
        let text = std::str::from_utf8(json).map_err(|e| {
            <serde_json::Error as serde::de::Error>::custom(format!("payload is not UTF-8: {e}"))
        })?;
        Ok(Self {
            timestamp,
            payload: RawValue::from_string(text.to_string())?,
        })
    }

    /// Payload bytes as posted
    #[must_use]
    pub fn payload_bytes(&self) -> Vec<u8> {
        self.payload.get().as_bytes().to_vec()
    }
}

/// Transports and timestamp source a [`BusConnector`] is built on
#[derive(Clone)]
pub struct BusTransports {
    pub events: Arc<dyn EventTransport>,
    pub repository: Arc<dyn RepositoryDialer>,
    pub timestamps: Arc<TimestampGenerator>,
}

impl BusTransports {
    /// Transports with a fresh timestamp generator
    #[must_use]
    pub fn new(events: Arc<dyn EventTransport>, repository: Arc<dyn RepositoryDialer>) -> Self {
        Self {
            events,
            repository,
            timestamps: Arc::new(TimestampGenerator::new()),
        }
    }

    /// Share `timestamps` with other connectors in this process
    #[must_use]
    pub fn with_timestamps(mut self, timestamps: Arc<TimestampGenerator>) -> Self {
        self.timestamps = timestamps;
        self
    }

    /// MQTT and FTP transports for `config`
    #[cfg(all(feature = "mqtt", feature = "ftp"))]
    #[must_use]
    pub fn network(config: &BusConfig) -> Self {
        Self::new(
            Arc::new(mbus_events::MqttTransport::new(&config.mqtt)),
            Arc::new(mbus_repository::FtpDialer::new()),
        )
    }
}

impl std::fmt::Debug for BusTransports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusTransports").finish_non_exhaustive()
    }
}

/// Connector composing the notification channel and the content store
///
/// Cheap to clone; clones share connections, caches and timestamps.
#[derive(Debug, Clone)]
pub struct BusConnector {
    events: EventsConnector,
    repository: Arc<RepositoryConnector>,
    timestamps: Arc<TimestampGenerator>,
    streamed_payload_limit: usize,
}

impl BusConnector {
    /// Connect both layers for the environment and agent in `config`
    ///
    /// Blocks until the notification broker accepts the connection.
    ///
    /// # Errors
    /// Returns error if the configuration is invalid or the environment
    /// snapshot cannot be subscribed
    pub async fn connect(
        config: &BusConfig,
        transports: BusTransports,
        posting_only: bool,
    ) -> Result<Self, BusError> {
        config
            .validate()
            .inspect_err(|e| error!(error = %e, "invalid bus configuration"))?;

        let repository = RepositoryConnector::new(
            &config.ftp,
            &config.environment,
            &config.agent,
            config.work_folder.clone(),
            transports.repository,
        )?;
        let events = EventsConnector::connect(
            &config.mqtt,
            &config.environment,
            &config.agent,
            transports.events,
            posting_only,
        )
        .await?;

        info!(environment = %config.environment, agent = %config.agent, posting_only, "bus connected");
        Ok(Self::from_parts(
            events,
            Arc::new(repository),
            transports.timestamps,
            config.mqtt.streamed_payload_limit,
        ))
    }

    /// Assemble from already connected layers
    #[must_use]
    pub fn from_parts(
        events: EventsConnector,
        repository: Arc<RepositoryConnector>,
        timestamps: Arc<TimestampGenerator>,
        streamed_payload_limit: usize,
    ) -> Self {
        Self {
            events,
            repository,
            timestamps,
            streamed_payload_limit,
        }
    }

    /// Notification channel layer
    #[inline]
    #[must_use]
    pub fn events(&self) -> &EventsConnector {
        &self.events
    }

    /// Content store layer
    #[inline]
    #[must_use]
    pub fn repository(&self) -> &RepositoryConnector {
        &self.repository
    }

    /// Agent this connector posts as
    #[inline]
    #[must_use]
    pub fn agent_id(&self) -> &str {
        self.events.agent_id()
    }

    /// Environment this connector is bound to
    #[inline]
    #[must_use]
    pub fn environment_id(&self) -> &str {
        self.events.environment_id()
    }

    /// Shared timestamp source
    #[inline]
    #[must_use]
    pub fn timestamps(&self) -> &Arc<TimestampGenerator> {
        &self.timestamps
    }

    /// Next posting timestamp
    #[must_use]
    pub fn next_timestamp(&self) -> Timestamp {
        self.timestamps.next()
    }

    /// Store `local_file` and announce it on `topic_path`
    ///
    /// # Errors
    /// Returns error if the upload or the announcement fails
    pub async fn post_file(
        &self,
        topic_path: &TopicPath,
        local_file: &Path,
        timestamp: &Timestamp,
    ) -> Result<(), BusError> {
        let event = self.repository.add_file(topic_path, local_file, timestamp).await?;
        self.announce(topic_path, &event).await
    }

    /// Store `json` and announce it on `topic_path`
    ///
    /// # Errors
    /// Returns error if the upload or the announcement fails
    pub async fn post_json_as_file(
        &self,
        topic_path: &TopicPath,
        json: &[u8],
        timestamp: &Timestamp,
    ) -> Result<(), BusError> {
        let event = self
            .repository
            .add_json_as_file(topic_path, json, timestamp)
            .await?;
        self.announce(topic_path, &event).await
    }

    /// Publish `json` inline on `topic_path`, bypassing the content store
    ///
    /// # Errors
    /// Returns error if `json` is malformed, the encoded message exceeds the
    /// configured streamed payload limit, or the publish fails
    pub async fn post_json_as_streamed(
        &self,
        topic_path: &TopicPath,
        json: &[u8],
        timestamp: &Timestamp,
    ) -> Result<(), BusError> {
        let message = StreamedEvent::new(json, timestamp.clone())
            .and_then(|event| serde_json::to_vec(&event))
            .inspect_err(|e| error!(topic = %topic_path, error = %e, "cannot encode streamed posting"))?;

        if message.len() > self.streamed_payload_limit {
            let err = BusError::StreamedPayloadTooLarge {
                size: message.len(),
                limit: self.streamed_payload_limit,
            };
            error!(topic = %topic_path, error = %err, "streamed posting refused");
            return Err(err);
        }

        self.events.post_event(topic_path, &message).await?;
        trace!(topic = %topic_path, bytes = message.len(), "streamed posting published");
        Ok(())
    }

    /// Fetch the file a pointer message refers to
    ///
    /// # Errors
    /// Returns error if the message is not a repository event or the
    /// download fails
    pub async fn get_linked_file_from_repository(
        &self,
        message: &[u8],
        local_file_name: &str,
    ) -> Result<(PathBuf, Timestamp), BusError> {
        let event = RepositoryEvent::from_json(message)
            .inspect_err(|e| error!(error = %e, "cannot decode repository event"))?;
        let local_path = self.repository.get_file(&event, local_file_name).await?;
        Ok((local_path, event.timestamp))
    }

    /// Fetch the file currently posted by `agent_id` on `topic_path`
    ///
    /// Returns `None` when nothing is posted.
    ///
    /// # Errors
    /// Returns error if the posting cannot be decoded or downloaded
    pub async fn get_file_from_posting(
        &self,
        agent_id: &str,
        topic_path: &TopicPath,
        local_file_name: &str,
    ) -> Result<Option<(PathBuf, Timestamp)>, BusError> {
        let Some(message) = self.events.message_from_event(agent_id, topic_path).await? else {
            debug!(agent = agent_id, topic = %topic_path, "no posting found");
            return Ok(None);
        };
        self.get_linked_file_from_repository(&message, local_file_name)
            .await
            .map(Some)
    }

    /// Fetch the JSON currently posted by reference by `agent_id` on `topic_path`
    ///
    /// # Errors
    /// Returns error if the posting cannot be decoded or downloaded
    pub async fn get_json(
        &self,
        agent_id: &str,
        topic_path: &TopicPath,
    ) -> Result<Option<(Vec<u8>, Timestamp)>, BusError> {
        let Some(message) = self.events.message_from_event(agent_id, topic_path).await? else {
            debug!(agent = agent_id, topic = %topic_path, "no posting found");
            return Ok(None);
        };
        self.json_from_message(&message).await.map(Some)
    }

    /// Fetch the JSON currently streamed by `agent_id` on `topic_path`
    ///
    /// # Errors
    /// Returns error if the posting is not a streamed event
    pub async fn get_streamed(
        &self,
        agent_id: &str,
        topic_path: &TopicPath,
    ) -> Result<Option<(Vec<u8>, Timestamp)>, BusError> {
        let Some(message) = self.events.message_from_event(agent_id, topic_path).await? else {
            return Ok(None);
        };
        let event = decode_streamed(&message)?;
        Ok(Some((event.payload_bytes(), event.timestamp)))
    }

    /// Call `handler` with each file posted by `agent_id` on `topic_path`
    ///
    /// Each download lands at `local_file_name` in the work folder.
    ///
    /// # Errors
    /// Returns error if the subscription is rejected
    pub async fn listen_for_file_postings<F>(
        &self,
        agent_id: &str,
        topic_path: &TopicPath,
        local_file_name: &str,
        mut handler: F,
    ) -> Result<JoinHandle<()>, BusError>
    where
        F: FnMut(PathBuf, Timestamp) + Send + 'static,
    {
        let mut subscription = self.events.listen_for_events(agent_id, topic_path).await?;
        let bus = self.clone();
        let local_file_name = local_file_name.to_string();

        Ok(tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                if let Ok((path, timestamp)) =
                    bus.get_linked_file_from_repository(&message, &local_file_name).await
                {
                    handler(path, timestamp);
                }
            }
            trace!(topics = ?subscription.topics(), "file listener stopped");
        }))
    }

    /// Call `handler` with each JSON document posted by reference
    ///
    /// The downloaded scratch file is removed before `handler` runs.
    ///
    /// # Errors
    /// Returns error if the subscription is rejected
    pub async fn listen_for_json_file_postings<F>(
        &self,
        agent_id: &str,
        topic_path: &TopicPath,
        mut handler: F,
    ) -> Result<JoinHandle<()>, BusError>
    where
        F: FnMut(Vec<u8>, Timestamp) + Send + 'static,
    {
        let mut subscription = self.events.listen_for_events(agent_id, topic_path).await?;
        let bus = self.clone();

        Ok(tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                if let Ok((json, timestamp)) = bus.json_from_message(&message).await {
                    handler(json, timestamp);
                }
            }
            trace!(topics = ?subscription.topics(), "JSON listener stopped");
        }))
    }

    /// Call `handler` with each JSON document posted by reference on any of
    /// `topic_paths`, one at a time in arrival order
    ///
    /// `handler` receives the index in `topic_paths` of the posting's topic.
    ///
    /// # Errors
    /// Returns error if a subscription is rejected
    pub async fn listen_for_json_file_postings_on<F>(
        &self,
        agent_id: &str,
        topic_paths: &[TopicPath],
        mut handler: F,
    ) -> Result<JoinHandle<()>, BusError>
    where
        F: FnMut(usize, Vec<u8>, Timestamp) + Send + 'static,
    {
        let mut subscription = self.events.listen_for_events_on(agent_id, topic_paths).await?;
        let bus = self.clone();

        Ok(tokio::spawn(async move {
            while let Some((topic, message)) = subscription.recv_from().await {
                let Some(index) = subscription.topics().iter().position(|t| *t == topic) else {
                    continue;
                };
                if let Ok((json, timestamp)) = bus.json_from_message(&message).await {
                    handler(index, json, timestamp);
                }
            }
            trace!(topics = ?subscription.topics(), "JSON listener stopped");
        }))
    }

    /// Call `handler` with each streamed JSON posting
    ///
    /// # Errors
    /// Returns error if the subscription is rejected
    pub async fn listen_for_streamed_postings<F>(
        &self,
        agent_id: &str,
        topic_path: &TopicPath,
        mut handler: F,
    ) -> Result<JoinHandle<()>, BusError>
    where
        F: FnMut(Vec<u8>, Timestamp) + Send + 'static,
    {
        let mut subscription = self.events.listen_for_events(agent_id, topic_path).await?;

        Ok(tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                if let Ok(event) = decode_streamed(&message) {
                    handler(event.payload_bytes(), event.timestamp);
                }
            }
            trace!(topics = ?subscription.topics(), "streamed listener stopped");
        }))
    }

    /// Remove this agent's posting on `topic_path` from both layers
    ///
    /// Both removals are attempted; the first failure is returned.
    ///
    /// # Errors
    /// Returns error if either removal fails
    pub async fn delete_posting(&self, topic_path: &TopicPath) -> Result<(), BusError> {
        let events = self.events.delete_posting_path(topic_path).await;
        let files = self.repository.delete_posting_path(topic_path).await;
        events?;
        files?;
        debug!(topic = %topic_path, "posting deleted");
        Ok(())
    }

    /// Remove this agent's postings and the environment's files
    ///
    /// Defaults to the connector's own environment.
    ///
    /// # Errors
    /// Returns error if either layer fails
    pub async fn delete_environment(&self, environment_id: Option<&str>) -> Result<(), BusError> {
        let environment_id = environment_id.unwrap_or_else(|| self.environment_id()).to_string();
        info!(environment = %environment_id, "deleting environment");

        self.events.delete_environment(&environment_id).await?;
        self.repository.delete_environment(&environment_id).await?;
        Ok(())
    }

    async fn announce(&self, topic_path: &TopicPath, event: &RepositoryEvent) -> Result<(), BusError> {
        let message = event
            .to_json()
            .inspect_err(|e| error!(error = %e, "cannot encode repository event"))?;
        self.events.post_event(topic_path, &message).await?;
        trace!(topic = %topic_path, file = %event.file_path, "posting announced");
        Ok(())
    }

    async fn json_from_message(&self, message: &[u8]) -> Result<(Vec<u8>, Timestamp), BusError> {
        let scratch = self.repository.scratch_file()?;
        let name = scratch
            .path()
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .unwrap_or_default();

        let (path, timestamp) = self.get_linked_file_from_repository(message, &name).await?;
        let json = tokio::fs::read(&path).await.map_err(|e| {
            error!(file = %path.display(), error = %e, "cannot read downloaded JSON");
            BusError::Io { path, source: e }
        })?;
        drop(scratch);
        Ok((json, timestamp))
    }
}

fn decode_streamed(message: &[u8]) -> Result<StreamedEvent, BusError> {
    serde_json::from_slice(message)
        .inspect_err(|e| error!(error = %e, "cannot decode streamed event"))
        .map_err(BusError::from)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use mbus_core::{EventsConfig, RepositoryConfig};
    use mbus_events::MemoryBroker;
    use mbus_repository::{MemoryDialer, MemoryRepository};
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Bus connector wired to in-process transports
    pub(crate) struct MemoryBus {
        pub(crate) bus: BusConnector,
        pub(crate) broker: MemoryBroker,
        pub(crate) repository: MemoryRepository,
        dialer: MemoryDialer,
        timestamps: Arc<TimestampGenerator>,
        work: tempfile::TempDir,
    }

    impl MemoryBus {
        /// Another agent on the same broker and store
        pub(crate) async fn peer(&self, agent: &str) -> BusConnector {
            connect(agent, &self.broker, &self.dialer, &self.timestamps, self.work.path()).await
        }
    }

    fn config(agent: &str, work_folder: &Path) -> BusConfig {
        BusConfig {
            environment: "env".to_string(),
            agent: agent.to_string(),
            work_folder: work_folder.join(agent),
            mqtt: EventsConfig {
                broker: "memory".to_string(),
                port: 1883,
                user: String::new(),
                password: String::new(),
                prefix: "test".to_string(),
                load_delay_ms: 20,
                retry_delay_secs: 0,
                streamed_payload_limit: 256,
                abort_on_connection_loss: false,
            },
            ftp: RepositoryConfig {
                server: "store".to_string(),
                port: 21,
                user: "bus".to_string(),
                password: "secret".to_string(),
                prefix: "test".to_string(),
                single_server_mode: true,
                active_transfers: false,
            },
        }
    }

    async fn connect(
        agent: &str,
        broker: &MemoryBroker,
        dialer: &MemoryDialer,
        timestamps: &Arc<TimestampGenerator>,
        work_folder: &Path,
    ) -> BusConnector {
        let transports = BusTransports::new(Arc::new(broker.transport()), Arc::new(dialer.clone()))
            .with_timestamps(Arc::clone(timestamps));
        BusConnector::connect(&config(agent, work_folder), transports, false)
            .await
            .unwrap()
    }

    pub(crate) async fn memory_bus(agent: &str) -> MemoryBus {
        let broker = MemoryBroker::new();
        let repository = MemoryRepository::new();
        let dialer = MemoryDialer::new();
        dialer.add_server("store", 21, repository.clone());
        let timestamps = Arc::new(TimestampGenerator::new());
        let work = tempfile::tempdir().unwrap();

        let bus = connect(agent, &broker, &dialer, &timestamps, work.path()).await;
        MemoryBus {
            bus,
            broker,
            repository,
            dialer,
            timestamps,
            work,
        }
    }

    fn topic(s: &str) -> TopicPath {
        s.parse().unwrap()
    }

    async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("listener timed out")
            .expect("listener closed")
    }

    #[tokio::test]
    async fn json_posted_by_reference_is_stored_and_announced() {
        let fixture = memory_bus("agent-a").await;
        let stamp = fixture.bus.next_timestamp();
        fixture
            .bus
            .post_json_as_file(&topic("notes/today"), br#"{"a":1}"#, &stamp)
            .await
            .unwrap();

        assert_eq!(
            fixture.repository.file("test/bus-version-1.0/env/agent-a/notes/today/payload"),
            Some(br#"{"a":1}"#.to_vec())
        );
        let announced = fixture
            .broker
            .retained("test/bus-version-1.0/env/agent-a/notes/today")
            .unwrap();
        let event = RepositoryEvent::from_json(&announced).unwrap();
        assert_eq!(event.file_path, "test/bus-version-1.0/env/agent-a/notes/today/payload");
        assert_eq!(event.timestamp, stamp);
        assert!(!event.has_server());
    }

    #[tokio::test]
    async fn peer_fetches_json_posting() {
        let fixture = memory_bus("agent-a").await;
        let reader = fixture.peer("agent-b").await;
        let stamp = fixture.bus.next_timestamp();
        fixture
            .bus
            .post_json_as_file(&topic("doc"), br#"[1,2,3]"#, &stamp)
            .await
            .unwrap();

        let (json, received) = reader.get_json("agent-a", &topic("doc")).await.unwrap().unwrap();
        assert_eq!(json, br#"[1,2,3]"#.to_vec());
        assert_eq!(received, stamp);
        assert!(reader.get_json("agent-a", &topic("missing")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn json_listener_receives_new_postings() {
        let fixture = memory_bus("agent-a").await;
        let reader = fixture.peer("agent-b").await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        reader
            .listen_for_json_file_postings("agent-a", &topic("doc"), move |json, stamp| {
                tx.send((json, stamp)).unwrap();
            })
            .await
            .unwrap();

        for body in [&br#"{"v":1}"#[..], &br#"{"v":2}"#[..]] {
            let stamp = fixture.bus.next_timestamp();
            fixture.bus.post_json_as_file(&topic("doc"), body, &stamp).await.unwrap();
            let (json, received) = next(&mut rx).await;
            assert_eq!(json, body.to_vec());
            assert_eq!(received, stamp);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn multi_topic_listener_handles_postings_in_posting_order() {
        let fixture = memory_bus("agent-a").await;
        let reader = fixture.peer("agent-b").await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        reader
            .listen_for_json_file_postings_on("agent-a", &[topic("m/first"), topic("m/second")], move |index, json, _| {
                tx.send((index, json)).unwrap();
            })
            .await
            .unwrap();

        let postings = [("m/first", 0), ("m/second", 1), ("m/second", 1), ("m/first", 0)];
        for (n, (path, _)) in postings.iter().enumerate() {
            let stamp = fixture.bus.next_timestamp();
            let body = format!("{n}");
            fixture
                .bus
                .post_json_as_file(&topic(path), body.as_bytes(), &stamp)
                .await
                .unwrap();
        }

        for (n, (_, index)) in postings.iter().enumerate() {
            assert_eq!(next(&mut rx).await, (*index, format!("{n}").into_bytes()));
        }
    }

    #[tokio::test]
    async fn file_listener_downloads_into_work_folder() {
        let fixture = memory_bus("agent-a").await;
        let reader = fixture.peer("agent-b").await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        reader
            .listen_for_file_postings("agent-a", &topic("pictures/cat"), "cat.png", move |path, _| {
                tx.send(path).unwrap();
            })
            .await
            .unwrap();

        let source = fixture.work.path().join("upload.png");
        std::fs::write(&source, b"\x89PNG").unwrap();
        let stamp = fixture.bus.next_timestamp();
        fixture.bus.post_file(&topic("pictures/cat"), &source, &stamp).await.unwrap();

        let path = next(&mut rx).await;
        assert_eq!(path, reader.repository().local_file_path("cat.png"));
        assert_eq!(std::fs::read(path).unwrap(), b"\x89PNG".to_vec());
    }

    #[tokio::test]
    async fn streamed_posting_travels_inline() {
        let fixture = memory_bus("agent-a").await;
        let reader = fixture.peer("agent-b").await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        reader
            .listen_for_streamed_postings("agent-a", &topic("live"), move |json, stamp| {
                tx.send((json, stamp)).unwrap();
            })
            .await
            .unwrap();

        let stamp = fixture.bus.next_timestamp();
        fixture
            .bus
            .post_json_as_streamed(&topic("live"), br#"{"x": [1, 2]}"#, &stamp)
            .await
            .unwrap();

        let (json, received) = next(&mut rx).await;
        assert_eq!(json, br#"{"x": [1, 2]}"#.to_vec());
        assert_eq!(received, stamp);
        assert!(fixture.repository.paths().is_empty());

        let (json, _) = reader.get_streamed("agent-a", &topic("live")).await.unwrap().unwrap();
        assert_eq!(json, br#"{"x": [1, 2]}"#.to_vec());
    }

    #[tokio::test]
    async fn oversized_streamed_posting_is_refused() {
        let fixture = memory_bus("agent-a").await;
        let body = format!("\"{}\"", "x".repeat(300));
        let stamp = fixture.bus.next_timestamp();

        let result = fixture
            .bus
            .post_json_as_streamed(&topic("live"), body.as_bytes(), &stamp)
            .await;
        assert!(matches!(
            result,
            Err(BusError::StreamedPayloadTooLarge { limit: 256, .. })
        ));
        assert!(fixture.broker.retained_topics().is_empty());
    }

    #[tokio::test]
    async fn malformed_streamed_json_is_refused() {
        let fixture = memory_bus("agent-a").await;
        let stamp = fixture.bus.next_timestamp();
        let result = fixture.bus.post_json_as_streamed(&topic("live"), b"{oops", &stamp).await;
        assert!(matches!(result, Err(BusError::Json(_))));
    }

    #[tokio::test]
    async fn delete_posting_clears_event_and_payload() {
        let fixture = memory_bus("agent-a").await;
        let stamp = fixture.bus.next_timestamp();
        fixture.bus.post_json_as_file(&topic("doc"), b"{}", &stamp).await.unwrap();

        fixture.bus.delete_posting(&topic("doc")).await.unwrap();
        assert!(fixture.broker.retained("test/bus-version-1.0/env/agent-a/doc").is_none());
        assert!(!fixture.repository.exists("test/bus-version-1.0/env/agent-a/doc"));
    }

    #[tokio::test]
    async fn delete_environment_defaults_to_own() {
        let fixture = memory_bus("agent-a").await;
        let stamp = fixture.bus.next_timestamp();
        fixture.bus.post_json_as_file(&topic("a/b"), b"1", &stamp).await.unwrap();
        fixture.bus.post_json_as_streamed(&topic("c"), b"2", &stamp).await.unwrap();

        fixture.bus.delete_environment(None).await.unwrap();
        assert!(fixture.broker.retained_topics().is_empty());
        assert!(!fixture.repository.exists("test/bus-version-1.0/env"));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let broker = MemoryBroker::new();
        let work = tempfile::tempdir().unwrap();
        let mut config = config("agent-a", work.path());
        config.environment.clear();

        let transports = BusTransports::new(Arc::new(broker.transport()), Arc::new(MemoryDialer::new()));
        let result = BusConnector::connect(&config, transports, false).await;
        assert!(matches!(result, Err(BusError::Config(_))));
    }

    #[test]
    fn streamed_event_wire_format() {
        let stamp: Timestamp = "2025-11-27-10-00-00-00".parse().unwrap();
        let event = StreamedEvent::new(br#"{"k":true}"#, stamp).unwrap();
        assert_eq!(
            serde_json::to_string(&event).unwrap(),
            r#"{"timestamp":"2025-11-27-10-00-00-00","payload":{"k":true}}"#
        );
    }
}
