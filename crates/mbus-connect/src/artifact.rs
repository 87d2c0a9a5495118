//! JSON artifact connector: three-tier synchronization over the bus
//!
//! Each artifact keeps three snapshots:
//!
//! - `current`: last full state posted or received
//! - `updated`: tentative edit on top of `current`
//! - `considering`: speculative edit on top of `updated`
//!
//! Full states travel on the `state` topic. Edits travel as JSON-patch
//! deltas on the `update` and `considering` topics, each carrying the
//! timestamp of the snapshot it was computed against. A receiver applies a
//! delta only when that baseline equals its own timestamp for the snapshot:
//! `current` for updates, `updated` for considerings. Anything else is stale
//! and dropped without reaching the caller's handler.
//!
//! All tiers listened for on one agent share a single subscription and one
//! worker, so a state and the deltas posted after it are applied in the order
//! they were posted. Local postings are serialized per artifact; a delta only
//! commits to the local snapshots when no received state replaced its
//! baseline while it was in flight.

use std::collections::HashMap;
use std::sync::Arc;

use mbus_core::{Timestamp, TopicPath};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use crate::json_ops::{json_apply_patch, JsonDelta};
use crate::topics::{self, ArtifactTier};
use crate::{ArtifactError, BusConnector};

/// Snapshot of an artifact's three tiers
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactView {
    pub current: Value,
    pub updated: Value,
    pub considering: Value,
    /// Timestamp of `current`; the baseline of update deltas
    pub current_timestamp: Timestamp,
    /// Timestamp of `updated`; the baseline of considering deltas
    pub updated_timestamp: Timestamp,
    pub state_communicated: bool,
}

impl Default for ArtifactView {
    fn default() -> Self {
        Self {
            current: Value::Null,
            updated: Value::Null,
            considering: Value::Null,
            current_timestamp: Timestamp::empty(),
            updated_timestamp: Timestamp::empty(),
            state_communicated: false,
        }
    }
}

/// Result of offering a delta to an artifact
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaOutcome {
    /// Baseline matched; the view after applying
    Applied(ArtifactView),
    /// Baseline did not match; nothing changed
    Stale {
        expected: Timestamp,
        received: Timestamp,
    },
}

impl DeltaOutcome {
    #[inline]
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

type ViewHandler = Box<dyn FnMut(ArtifactView) + Send>;

/// Handlers for the tiers listened for on one agent
#[derive(Default)]
struct TierListeners {
    handlers: [Option<ViewHandler>; 3],
    started: bool,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for TierListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tiers: Vec<&str> = ArtifactTier::ALL
            .iter()
            .filter(|tier| self.handlers[tier.index()].is_some())
            .map(|tier| tier.as_str())
            .collect();
        f.debug_struct("TierListeners")
            .field("tiers", &tiers)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

/// Connector for one JSON artifact at one schema version
///
/// Cheap to clone; clones and the listener tasks they spawn share the
/// artifact's snapshots, listeners and posting order.
#[derive(Debug, Clone)]
pub struct JsonArtifactConnector {
    bus: BusConnector,
    artifact_id: String,
    json_version: String,
    root: TopicPath,
    snapshots: Arc<Mutex<ArtifactView>>,
    listeners: Arc<Mutex<HashMap<String, TierListeners>>>,
    posting: Arc<tokio::sync::Mutex<()>>,
}

impl JsonArtifactConnector {
    /// Track `artifact_id` at `json_version` over `bus`
    ///
    /// # Errors
    /// Returns error if either identifier is not a single path segment
    pub fn new(bus: BusConnector, artifact_id: &str, json_version: &str) -> Result<Self, ArtifactError> {
        let root = topics::json_artifact_root(artifact_id)?;
        let json_version = topics::segment(json_version)?;
        Ok(Self {
            bus,
            artifact_id: artifact_id.to_string(),
            json_version,
            root,
            snapshots: Arc::new(Mutex::new(ArtifactView::default())),
            listeners: Arc::new(Mutex::new(HashMap::new())),
            posting: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    #[inline]
    #[must_use]
    pub fn artifact_id(&self) -> &str {
        &self.artifact_id
    }

    #[inline]
    #[must_use]
    pub fn json_version(&self) -> &str {
        &self.json_version
    }

    #[inline]
    #[must_use]
    pub fn bus(&self) -> &BusConnector {
        &self.bus
    }

    /// Copy of the three tiers
    #[must_use]
    pub fn view(&self) -> ArtifactView {
        self.snapshots.lock().clone()
    }

    /// Topic of `tier` postings for this artifact
    #[must_use]
    pub fn topic(&self, tier: ArtifactTier) -> TopicPath {
        self.root
            .child(self.json_version.clone())
            .child(tier.as_str())
    }

    /// Post `json` as the artifact's full state
    ///
    /// Resets all three tiers and both baselines to the posted state.
    /// Returns the state's timestamp.
    ///
    /// # Errors
    /// Returns error if `json` is malformed or the posting fails; local
    /// snapshots are unchanged then
    pub async fn post_state(&self, json: &[u8]) -> Result<Timestamp, ArtifactError> {
        let value = parse_artifact(json)?;
        let _posting = self.posting.lock().await;
        self.publish_state(json, value).await
    }

    /// Post `json` as a tentative edit of the current state
    ///
    /// Before any state was communicated, `json` is posted as state first
    /// and the update delta that follows is empty. If a received state
    /// replaces `current` while the delta is in flight, the local snapshots
    /// keep the received state.
    ///
    /// # Errors
    /// Returns error if `json` is malformed or a posting fails
    pub async fn post_update(&self, json: &[u8]) -> Result<Timestamp, ArtifactError> {
        let value = parse_artifact(json)?;
        let _posting = self.posting.lock().await;
        let communicated = self.snapshots.lock().state_communicated;
        if !communicated {
            debug!(artifact = %self.artifact_id, "no state communicated yet, posting update as state");
            self.publish_state(json, value.clone()).await?;
        }

        let (current, baseline) = {
            let snapshots = self.snapshots.lock();
            (snapshots.current.clone(), snapshots.current_timestamp.clone())
        };
        let timestamp = self.bus.next_timestamp();
        let delta = JsonDelta::between(&current, &value, timestamp.clone(), baseline.clone());
        self.post_delta(ArtifactTier::Update, &delta).await?;

        if !commit_update(&mut self.snapshots.lock(), &baseline, value, timestamp.clone()) {
            debug!(artifact = %self.artifact_id, %baseline, "state replaced while posting update, keeping it");
        }
        Ok(timestamp)
    }

    /// Post `json` as a speculative edit of the updated state
    ///
    /// Before any state was communicated, the current snapshot is posted as
    /// state first. If a received state or update replaces `updated` while
    /// the delta is in flight, the local snapshots keep what was received.
    ///
    /// # Errors
    /// Returns error if `json` is malformed or a posting fails
    pub async fn post_considering(&self, json: &[u8]) -> Result<Timestamp, ArtifactError> {
        let value = parse_artifact(json)?;
        let _posting = self.posting.lock().await;
        let pending_state = {
            let snapshots = self.snapshots.lock();
            (!snapshots.state_communicated).then(|| snapshots.current.clone())
        };
        if let Some(current) = pending_state {
            debug!(artifact = %self.artifact_id, "no state communicated yet, posting current state first");
            let encoded = serde_json::to_vec(&current).map_err(ArtifactError::InvalidJson)?;
            self.publish_state(&encoded, current).await?;
        }

        let (updated, baseline) = {
            let snapshots = self.snapshots.lock();
            (snapshots.updated.clone(), snapshots.updated_timestamp.clone())
        };
        let timestamp = self.bus.next_timestamp();
        let delta = JsonDelta::between(&updated, &value, timestamp.clone(), baseline.clone());
        self.post_delta(ArtifactTier::Considering, &delta).await?;

        if !commit_considering(&mut self.snapshots.lock(), &baseline, value) {
            debug!(artifact = %self.artifact_id, %baseline, "updated replaced while posting considering, keeping it");
        }
        Ok(timestamp)
    }

    /// Adopt a received full state
    ///
    /// # Errors
    /// Returns error if `json` is malformed; snapshots are unchanged then
    pub fn apply_state(&self, json: &[u8], timestamp: Timestamp) -> Result<ArtifactView, ArtifactError> {
        let value = parse_artifact(json)?;
        let mut snapshots = self.snapshots.lock();
        reset_to_state(&mut snapshots, value, timestamp);
        debug!(artifact = %self.artifact_id, timestamp = %snapshots.current_timestamp, "state received");
        Ok(snapshots.clone())
    }

    /// Offer a received update delta
    ///
    /// Applied to `current` when its baseline equals the current timestamp;
    /// the result becomes `updated` and `considering`.
    ///
    /// # Errors
    /// Returns error if the delta is malformed or does not fit `current`
    pub fn apply_update_delta(&self, message: &[u8]) -> Result<DeltaOutcome, ArtifactError> {
        let delta = parse_delta(message)?;
        let mut snapshots = self.snapshots.lock();

        if delta.current_timestamp != snapshots.current_timestamp {
            return Ok(self.stale(ArtifactTier::Update, &snapshots.current_timestamp, delta));
        }
        let patched = json_apply_patch(&snapshots.current, &delta.operations)
            .inspect_err(|e| error!(artifact = %self.artifact_id, error = %e, "cannot apply update delta"))?;

        snapshots.updated = patched.clone();
        snapshots.considering = patched;
        snapshots.updated_timestamp = delta.timestamp;
        trace!(artifact = %self.artifact_id, timestamp = %snapshots.updated_timestamp, "update applied");
        Ok(DeltaOutcome::Applied(snapshots.clone()))
    }

    /// Offer a received considering delta
    ///
    /// Applied to `updated` when its baseline equals the updated timestamp;
    /// the result becomes `considering`.
    ///
    /// # Errors
    /// Returns error if the delta is malformed or does not fit `updated`
    pub fn apply_considering_delta(&self, message: &[u8]) -> Result<DeltaOutcome, ArtifactError> {
        let delta = parse_delta(message)?;
        let mut snapshots = self.snapshots.lock();

        if delta.current_timestamp != snapshots.updated_timestamp {
            return Ok(self.stale(ArtifactTier::Considering, &snapshots.updated_timestamp, delta));
        }
        let patched = json_apply_patch(&snapshots.updated, &delta.operations)
            .inspect_err(|e| error!(artifact = %self.artifact_id, error = %e, "cannot apply considering delta"))?;

        snapshots.considering = patched;
        trace!(artifact = %self.artifact_id, timestamp = %delta.timestamp, "considering applied");
        Ok(DeltaOutcome::Applied(snapshots.clone()))
    }

    /// Call `handler` with the view after each state posted by `agent_id`
    ///
    /// Replaces any state handler already registered for `agent_id`.
    ///
    /// # Errors
    /// Returns error if the subscription is rejected
    pub async fn listen_for_state_postings<F>(&self, agent_id: &str, handler: F) -> Result<(), ArtifactError>
    where
        F: FnMut(ArtifactView) + Send + 'static,
    {
        self.listen_for_tier(agent_id, ArtifactTier::State, Box::new(handler))
            .await
    }

    /// Call `handler` with the view after each applied update by `agent_id`
    ///
    /// Stale deltas are dropped without calling `handler`. Replaces any
    /// update handler already registered for `agent_id`.
    ///
    /// # Errors
    /// Returns error if the subscription is rejected
    pub async fn listen_for_update_postings<F>(&self, agent_id: &str, handler: F) -> Result<(), ArtifactError>
    where
        F: FnMut(ArtifactView) + Send + 'static,
    {
        self.listen_for_tier(agent_id, ArtifactTier::Update, Box::new(handler))
            .await
    }

    /// Call `handler` with the view after each applied considering by `agent_id`
    ///
    /// Stale deltas are dropped without calling `handler`. Replaces any
    /// considering handler already registered for `agent_id`.
    ///
    /// # Errors
    /// Returns error if the subscription is rejected
    pub async fn listen_for_considering_postings<F>(&self, agent_id: &str, handler: F) -> Result<(), ArtifactError>
    where
        F: FnMut(ArtifactView) + Send + 'static,
    {
        self.listen_for_tier(agent_id, ArtifactTier::Considering, Box::new(handler))
            .await
    }

    /// Drop every handler registered for `agent_id` and stop its worker
    ///
    /// Returns `false` when nothing was listened for on `agent_id`.
    pub fn stop_listening(&self, agent_id: &str) -> bool {
        let Some(removed) = self.listeners.lock().remove(agent_id) else {
            return false;
        };
        if let Some(worker) = removed.worker {
            worker.abort();
        }
        debug!(artifact = %self.artifact_id, agent = agent_id, "stopped listening");
        true
    }

    async fn listen_for_tier(
        &self,
        agent_id: &str,
        tier: ArtifactTier,
        handler: ViewHandler,
    ) -> Result<(), ArtifactError> {
        let start = {
            let mut listeners = self.listeners.lock();
            let entry = listeners.entry(agent_id.to_string()).or_default();
            entry.handlers[tier.index()] = Some(handler);
            !std::mem::replace(&mut entry.started, true)
        };
        if !start {
            trace!(artifact = %self.artifact_id, agent = agent_id, %tier, "handler added to running worker");
            return Ok(());
        }

        let topics = ArtifactTier::ALL.map(|each| self.topic(each));
        let artifact = self.clone();
        let agent = agent_id.to_string();
        let worker = self
            .bus
            .listen_for_json_file_postings_on(agent_id, &topics, move |index, json, timestamp| {
                if let Some(tier) = ArtifactTier::ALL.get(index) {
                    artifact.deliver(&agent, *tier, &json, timestamp);
                }
            })
            .await
            .inspect_err(|_| {
                self.listeners.lock().remove(agent_id);
            })?;

        match self.listeners.lock().get_mut(agent_id) {
            Some(entry) => entry.worker = Some(worker),
            None => worker.abort(),
        }
        debug!(artifact = %self.artifact_id, agent = agent_id, "listening for artifact postings");
        Ok(())
    }

    fn deliver(&self, agent_id: &str, tier: ArtifactTier, json: &[u8], timestamp: Timestamp) {
        let handler = self
            .listeners
            .lock()
            .get_mut(agent_id)
            .and_then(|entry| entry.handlers[tier.index()].take());
        let Some(mut handler) = handler else {
            trace!(artifact = %self.artifact_id, agent = agent_id, %tier, "no handler for tier, posting skipped");
            return;
        };

        let view = match tier {
            ArtifactTier::State => self.apply_state(json, timestamp).ok(),
            ArtifactTier::Update => match self.apply_update_delta(json) {
                Ok(DeltaOutcome::Applied(view)) => Some(view),
                _ => None,
            },
            ArtifactTier::Considering => match self.apply_considering_delta(json) {
                Ok(DeltaOutcome::Applied(view)) => Some(view),
                _ => None,
            },
        };
        if let Some(view) = view {
            handler(view);
        }

        if let Some(entry) = self.listeners.lock().get_mut(agent_id) {
            let slot = &mut entry.handlers[tier.index()];
            if slot.is_none() {
                *slot = Some(handler);
            }
        }
    }

    /// Adopt the state currently posted by `agent_id`
    ///
    /// Returns `None` when no state is posted.
    ///
    /// # Errors
    /// Returns error if the posting cannot be retrieved or is malformed
    pub async fn fetch_state(&self, agent_id: &str) -> Result<Option<ArtifactView>, ArtifactError> {
        let Some((json, timestamp)) = self.bus.get_json(agent_id, &self.topic(ArtifactTier::State)).await? else {
            return Ok(None);
        };
        self.apply_state(&json, timestamp).map(Some)
    }

    /// Adopt the state, then the update currently posted by `agent_id`
    ///
    /// A missing or stale update leaves the fetched state in place.
    ///
    /// # Errors
    /// Returns error if a posting cannot be retrieved or applied
    pub async fn fetch_update(&self, agent_id: &str) -> Result<Option<ArtifactView>, ArtifactError> {
        if self.fetch_state(agent_id).await?.is_none() {
            return Ok(None);
        }
        if let Some((delta, _)) = self.bus.get_json(agent_id, &self.topic(ArtifactTier::Update)).await? {
            self.apply_update_delta(&delta)?;
        }
        Ok(Some(self.view()))
    }

    /// Adopt state, update, then the considering currently posted by `agent_id`
    ///
    /// # Errors
    /// Returns error if a posting cannot be retrieved or applied
    pub async fn fetch_considering(&self, agent_id: &str) -> Result<Option<ArtifactView>, ArtifactError> {
        if self.fetch_update(agent_id).await?.is_none() {
            return Ok(None);
        }
        if let Some((delta, _)) = self
            .bus
            .get_json(agent_id, &self.topic(ArtifactTier::Considering))
            .await?
        {
            self.apply_considering_delta(&delta)?;
        }
        Ok(Some(self.view()))
    }

    /// Remove this agent's postings of the artifact and its stored payloads
    ///
    /// Local snapshots return to the uncommunicated state.
    ///
    /// # Errors
    /// Returns the first failed removal
    pub async fn delete_artifact(&self) -> Result<(), ArtifactError> {
        let _posting = self.posting.lock().await;
        let mut first_error = None;
        for tier in ArtifactTier::ALL {
            if let Err(e) = self.bus.delete_posting(&self.topic(tier)).await {
                first_error.get_or_insert(e);
            }
        }
        let root = self.bus.repository().remote_path(&self.root);
        if let Err(e) = self.bus.repository().delete_path(&root).await {
            first_error.get_or_insert(e.into());
        }

        *self.snapshots.lock() = ArtifactView::default();
        match first_error {
            Some(e) => Err(e.into()),
            None => {
                info!(artifact = %self.artifact_id, "artifact deleted");
                Ok(())
            }
        }
    }

    async fn publish_state(&self, json: &[u8], value: Value) -> Result<Timestamp, ArtifactError> {
        let timestamp = self.bus.next_timestamp();
        self.bus
            .post_json_as_file(&self.topic(ArtifactTier::State), json, &timestamp)
            .await?;

        reset_to_state(&mut self.snapshots.lock(), value, timestamp.clone());
        info!(artifact = %self.artifact_id, %timestamp, "state posted");
        Ok(timestamp)
    }

    async fn post_delta(&self, tier: ArtifactTier, delta: &JsonDelta) -> Result<(), ArtifactError> {
        let encoded = serde_json::to_vec(delta).map_err(ArtifactError::MalformedDelta)?;
        self.bus
            .post_json_as_file(&self.topic(tier), &encoded, &delta.timestamp)
            .await?;
        debug!(
            artifact = %self.artifact_id,
            %tier,
            timestamp = %delta.timestamp,
            baseline = %delta.current_timestamp,
            operations = delta.operations.0.len(),
            "delta posted"
        );
        Ok(())
    }

    fn stale(&self, tier: ArtifactTier, expected: &Timestamp, delta: JsonDelta) -> DeltaOutcome {
        debug!(
            artifact = %self.artifact_id,
            %tier,
            expected = %expected,
            received = %delta.current_timestamp,
            "stale delta ignored"
        );
        DeltaOutcome::Stale {
            expected: expected.clone(),
            received: delta.current_timestamp,
        }
    }
}

fn reset_to_state(snapshots: &mut ArtifactView, value: Value, timestamp: Timestamp) {
    snapshots.current = value.clone();
    snapshots.updated = value.clone();
    snapshots.considering = value;
    snapshots.current_timestamp = timestamp.clone();
    snapshots.updated_timestamp = timestamp;
    snapshots.state_communicated = true;
}

/// Record a posted update unless `current` moved past `baseline` meanwhile
fn commit_update(snapshots: &mut ArtifactView, baseline: &Timestamp, value: Value, timestamp: Timestamp) -> bool {
    if snapshots.current_timestamp != *baseline {
        return false;
    }
    snapshots.updated = value.clone();
    snapshots.considering = value;
    snapshots.updated_timestamp = timestamp;
    true
}

/// Record a posted considering unless `updated` moved past `baseline` meanwhile
fn commit_considering(snapshots: &mut ArtifactView, baseline: &Timestamp, value: Value) -> bool {
    if snapshots.updated_timestamp != *baseline {
        return false;
    }
    snapshots.considering = value;
    true
}

fn parse_artifact(json: &[u8]) -> Result<Value, ArtifactError> {
    serde_json::from_slice(json)
        .inspect_err(|e| error!(error = %e, "artifact content is not valid JSON"))
        .map_err(ArtifactError::InvalidJson)
}

fn parse_delta(message: &[u8]) -> Result<JsonDelta, ArtifactError> {
    serde_json::from_slice(message)
        .inspect_err(|e| error!(error = %e, "malformed delta"))
        .map_err(ArtifactError::MalformedDelta)
}
