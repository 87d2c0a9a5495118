//! Notification channel connector
//!
//! Owns topic naming, the connection lifecycle and the local picture of the
//! environment's retained messages.
//!
//! # Message maps
//!
//! - `opening`: what was retained when the connection was opened; topics first
//!   seen later are recorded with an empty payload
//! - `current`: latest payload per topic
//!
//! A listener fires for a non-empty payload that differs from the opening
//! snapshot of its topic and from the previous current payload, so retained
//! state the caller already had at start-up is not re-delivered.
//!
//! All inbound traffic passes through one dispatcher task, which is the only
//! writer of both maps.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use mbus_core::{EventsConfig, Namespace, TopicPath};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::filter::{topic_is_under, topic_matches};
use crate::{EventTransport, EventsError, TransportEvent};

struct Listener {
    topics: Vec<String>,
    sender: mpsc::UnboundedSender<(String, Vec<u8>)>,
}

struct ChannelState {
    being_opened: bool,
    closed: bool,
    opening: HashMap<String, Vec<u8>>,
    current: HashMap<String, Vec<u8>>,
    subscriptions: Vec<String>,
    listeners: Vec<Listener>,
}

impl ChannelState {
    fn new() -> Self {
        Self {
            being_opened: true,
            closed: false,
            opening: HashMap::new(),
            current: HashMap::new(),
            subscriptions: Vec::new(),
            listeners: Vec::new(),
        }
    }

    fn record(&mut self, topic: String, payload: Vec<u8>) {
        if payload.is_empty() {
            self.opening.remove(&topic);
            self.current.remove(&topic);
            return;
        }

        let previous = self.current.get(&topic).cloned();
        let opening = if self.being_opened {
            self.opening.insert(topic.clone(), payload.clone());
            payload.clone()
        } else {
            self.opening.entry(topic.clone()).or_default().clone()
        };
        self.current.insert(topic.clone(), payload.clone());

        if payload == opening || previous.as_ref() == Some(&payload) {
            return;
        }
        self.listeners.retain(|listener| {
            if !listener.topics.contains(&topic) {
                return !listener.sender.is_closed();
            }
            listener.sender.send((topic.clone(), payload.clone())).is_ok()
        });
    }

    fn covered(&self, filter: &str) -> bool {
        self.subscriptions.iter().any(|s| topic_matches(s, filter))
    }
}

struct Inner {
    namespace: Namespace,
    transport: Arc<dyn EventTransport>,
    load_delay: Duration,
    abort_on_connection_loss: bool,
    posting_only: bool,
    state: Mutex<ChannelState>,
}

/// Stream of payloads posted on one or more topics, in arrival order
///
/// Postings on different topics of one subscription keep the order the
/// broker delivered them in.
#[derive(Debug)]
pub struct EventSubscription {
    topics: Vec<String>,
    receiver: mpsc::UnboundedReceiver<(String, Vec<u8>)>,
}

impl EventSubscription {
    /// Full topics this subscription listens on
    #[inline]
    #[must_use]
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Next payload, or `None` once the connection is closed
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.receiver.recv().await.map(|(_, payload)| payload)
    }

    /// Next payload with the full topic it arrived on
    pub async fn recv_from(&mut self) -> Option<(String, Vec<u8>)> {
        self.receiver.recv().await
    }
}

/// Connector to the notification channel
///
/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct EventsConnector {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EventsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventsConnector")
            .field("namespace", &self.inner.namespace)
            .field("posting_only", &self.inner.posting_only)
            .finish_non_exhaustive()
    }
}

impl EventsConnector {
    /// Connect to the broker, retrying until it succeeds
    ///
    /// Unless `posting_only`, subscribes to the whole environment and waits
    /// the settle delay so retained messages form the opening snapshot.
    ///
    /// # Errors
    /// Returns error if `environment_id` or `agent_id` is not a valid topic
    /// segment, or if the environment subscription is rejected
    pub async fn connect(
        config: &EventsConfig,
        environment_id: &str,
        agent_id: &str,
        transport: Arc<dyn EventTransport>,
        posting_only: bool,
    ) -> Result<Self, EventsError> {
        let namespace = Namespace::new(&config.prefix, environment_id, agent_id)?;
        let inner = Arc::new(Inner {
            namespace,
            transport,
            load_delay: config.load_delay(),
            abort_on_connection_loss: config.abort_on_connection_loss,
            posting_only,
            state: Mutex::new(ChannelState::new()),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(Arc::downgrade(&inner), rx));

        loop {
            info!(broker = %config.broker, port = config.port, "connecting to notification broker");
            match inner.transport.connect(tx.clone()).await {
                Ok(()) => break,
                Err(e) => {
                    error!(error = %e, retry_in = ?config.retry_delay(), "failed to connect to notification broker");
                    tokio::time::sleep(config.retry_delay()).await;
                }
            }
        }
        info!("connected to notification broker");

        let connector = Self { inner };
        if !posting_only {
            connector.collect_environment(environment_id).await?;
        }
        connector.inner.state.lock().being_opened = false;

        Ok(connector)
    }

    /// Addressing roots of this connector
    #[inline]
    #[must_use]
    pub fn namespace(&self) -> &Namespace {
        &self.inner.namespace
    }

    /// Agent this connector posts as
    #[inline]
    #[must_use]
    pub fn agent_id(&self) -> &str {
        self.inner.namespace.agent_id()
    }

    /// Environment this connector is bound to
    #[inline]
    #[must_use]
    pub fn environment_id(&self) -> &str {
        self.inner.namespace.environment_id()
    }

    /// Whether the environment snapshot was skipped at connect
    #[inline]
    #[must_use]
    pub fn is_posting_only(&self) -> bool {
        self.inner.posting_only
    }

    /// Settle delay for retained messages
    #[inline]
    #[must_use]
    pub fn load_delay(&self) -> Duration {
        self.inner.load_delay
    }

    /// Publish a retained message on this agent's `topic_path`
    ///
    /// An empty payload removes the posting.
    ///
    /// # Errors
    /// Returns error if the transport rejects the publish
    pub async fn post_event(&self, topic_path: &TopicPath, payload: &[u8]) -> Result<(), EventsError> {
        let topic = self.inner.namespace.own_topic(topic_path).to_string();
        self.publish(&topic, payload).await
    }

    /// Remove this agent's posting on `topic_path`
    ///
    /// # Errors
    /// Returns error if the transport rejects the publish
    pub async fn delete_posting_path(&self, topic_path: &TopicPath) -> Result<(), EventsError> {
        self.post_event(topic_path, &[]).await
    }

    /// Listen for postings by `agent_id` on `topic_path`
    ///
    /// # Errors
    /// Returns error if the subscription is rejected
    pub async fn listen_for_events(
        &self,
        agent_id: &str,
        topic_path: &TopicPath,
    ) -> Result<EventSubscription, EventsError> {
        self.listen_for_events_on(agent_id, std::slice::from_ref(topic_path))
            .await
    }

    /// Listen for postings by `agent_id` on all of `topic_paths` through one queue
    ///
    /// # Errors
    /// Returns error if a subscription is rejected
    pub async fn listen_for_events_on(
        &self,
        agent_id: &str,
        topic_paths: &[TopicPath],
    ) -> Result<EventSubscription, EventsError> {
        let topics: Vec<String> = topic_paths
            .iter()
            .map(|path| self.inner.namespace.agent_topic(agent_id, path).to_string())
            .collect();
        let (sender, receiver) = mpsc::unbounded_channel();

        self.inner.state.lock().listeners.push(Listener {
            topics: topics.clone(),
            sender,
        });
        for topic in &topics {
            self.ensure_subscribed(topic).await?;
            debug!(%topic, "listening for events");
        }

        Ok(EventSubscription { topics, receiver })
    }

    /// Latest known posting by `agent_id` on `topic_path`
    ///
    /// Waits the settle delay once when nothing has arrived yet.
    ///
    /// # Errors
    /// Returns error if the topic subscription is rejected
    pub async fn message_from_event(
        &self,
        agent_id: &str,
        topic_path: &TopicPath,
    ) -> Result<Option<Vec<u8>>, EventsError> {
        let topic = self.inner.namespace.agent_topic(agent_id, topic_path).to_string();
        self.ensure_subscribed(&topic).await?;

        if let Some(message) = self.cached(&topic) {
            return Ok(Some(message));
        }
        trace!(%topic, "no message cached yet, waiting for retained messages");
        tokio::time::sleep(self.inner.load_delay).await;
        Ok(self.cached(&topic))
    }

    /// Remove every posting this agent holds in `environment_id`
    ///
    /// Returns the number of topics cleared.
    ///
    /// # Errors
    /// Returns the first failed subscribe or publish
    pub async fn delete_environment(&self, environment_id: &str) -> Result<usize, EventsError> {
        self.collect_environment(environment_id).await?;

        let root = self
            .inner
            .namespace
            .agent_root_for(environment_id, self.agent_id())
            .to_string();
        let topics: BTreeSet<String> = {
            let state = self.inner.state.lock();
            state
                .opening
                .keys()
                .chain(state.current.keys())
                .filter(|topic| topic_is_under(&root, topic))
                .cloned()
                .collect()
        };

        for topic in &topics {
            debug!(%topic, "deleting posting");
            self.publish(topic, &[]).await?;
        }
        info!(environment = environment_id, deleted = topics.len(), "environment postings deleted");
        Ok(topics.len())
    }

    async fn collect_environment(&self, environment_id: &str) -> Result<(), EventsError> {
        let filter = format!("{}/#", self.inner.namespace.environment_root_for(environment_id));
        self.ensure_subscribed(&filter).await?;

        debug!(delay = ?self.inner.load_delay, "collecting retained messages");
        tokio::time::sleep(self.inner.load_delay).await;

        let state = self.inner.state.lock();
        if state.current.is_empty() {
            debug!("no topics found");
        } else {
            let root = self.inner.namespace.environment_root_for(environment_id).to_string();
            for topic in state.current.keys().filter(|t| topic_is_under(&root, t)) {
                debug!(%topic, "found topic");
            }
        }
        Ok(())
    }

    async fn ensure_subscribed(&self, filter: &str) -> Result<(), EventsError> {
        if self.inner.state.lock().covered(filter) {
            return Ok(());
        }
        if let Err(e) = self.inner.transport.subscribe(filter).await {
            error!(%filter, error = %e, "subscription failed");
            return Err(e);
        }
        self.inner.state.lock().subscriptions.push(filter.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), EventsError> {
        trace!(%topic, bytes = payload.len(), "publishing");
        self.inner
            .transport
            .publish(topic, payload, true)
            .await
            .inspect_err(|e| error!(%topic, error = %e, "publish failed"))
    }

    fn cached(&self, topic: &str) -> Option<Vec<u8>> {
        self.inner.state.lock().current.get(topic).cloned()
    }
}

async fn dispatch(inner: Weak<Inner>, mut inbound: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = inbound.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            TransportEvent::Message { topic, payload } => {
                trace!(%topic, bytes = payload.len(), "inbound message");
                inner.state.lock().record(topic, payload);
            }
            TransportEvent::ConnectionLost(reason) => {
                let mut state = inner.state.lock();
                if state.closed {
                    continue;
                }
                error!(%reason, "connection to notification broker lost");
                if inner.abort_on_connection_loss {
                    std::process::abort();
                }
                warn!("closing all listeners");
                state.closed = true;
                state.listeners.clear();
            }
        }
    }
}
