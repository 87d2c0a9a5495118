//! Observations: one-shot raw files or JSON documents, no tiers

use std::path::{Path, PathBuf};

use mbus_core::Timestamp;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::topics;
use crate::{BusConnector, BusError};

impl BusConnector {
    /// Post `local_file` as raw observation `observation_id`
    ///
    /// # Errors
    /// Returns error if the identifier is invalid or the posting fails
    pub async fn post_raw_observation(
        &self,
        observation_id: &str,
        local_file: &Path,
    ) -> Result<Timestamp, BusError> {
        let topic = topics::raw_observation(observation_id)?;
        let timestamp = self.next_timestamp();
        self.post_file(&topic, local_file, &timestamp).await?;
        debug!(observation = observation_id, %timestamp, "raw observation posted");
        Ok(timestamp)
    }

    /// Post `json` as JSON observation `observation_id`
    ///
    /// # Errors
    /// Returns error if `json` is malformed, the identifier is invalid or the
    /// posting fails
    pub async fn post_json_observation(&self, observation_id: &str, json: &[u8]) -> Result<Timestamp, BusError> {
        let topic = topics::json_observation(observation_id)?;
        serde_json::from_slice::<serde::de::IgnoredAny>(json)
            .inspect_err(|e| error!(observation = observation_id, error = %e, "observation is not valid JSON"))?;

        let timestamp = self.next_timestamp();
        self.post_json_as_file(&topic, json, &timestamp).await?;
        debug!(observation = observation_id, %timestamp, "JSON observation posted");
        Ok(timestamp)
    }

    /// Call `handler` with the local copy of each raw observation by `agent_id`
    ///
    /// # Errors
    /// Returns error if the identifier is invalid or the subscription is rejected
    pub async fn listen_for_raw_observation_postings<F>(
        &self,
        agent_id: &str,
        observation_id: &str,
        handler: F,
    ) -> Result<JoinHandle<()>, BusError>
    where
        F: FnMut(PathBuf, Timestamp) + Send + 'static,
    {
        let topic = topics::raw_observation(observation_id)?;
        self.listen_for_file_postings(agent_id, &topic, observation_id, handler)
            .await
    }

    /// Call `handler` with each JSON observation posted by `agent_id`
    ///
    /// # Errors
    /// Returns error if the identifier is invalid or the subscription is rejected
    pub async fn listen_for_json_observation_postings<F>(
        &self,
        agent_id: &str,
        observation_id: &str,
        handler: F,
    ) -> Result<JoinHandle<()>, BusError>
    where
        F: FnMut(Vec<u8>, Timestamp) + Send + 'static,
    {
        let topic = topics::json_observation(observation_id)?;
        self.listen_for_json_file_postings(agent_id, &topic, handler).await
    }

    /// JSON observation currently posted by `agent_id`
    ///
    /// # Errors
    /// Returns error if the identifier is invalid or the download fails
    pub async fn fetch_json_observation(
        &self,
        agent_id: &str,
        observation_id: &str,
    ) -> Result<Option<(Vec<u8>, Timestamp)>, BusError> {
        let topic = topics::json_observation(observation_id)?;
        self.get_json(agent_id, &topic).await
    }
}
