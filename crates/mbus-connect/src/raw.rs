//! Raw (non-JSON) artifacts, posted whole as files

use std::path::{Path, PathBuf};

use mbus_core::Timestamp;
use tokio::task::JoinHandle;
use tracing::info;

use crate::topics;
use crate::{BusConnector, BusError};

impl BusConnector {
    /// Post `local_file` as the state of raw artifact `artifact_id`
    ///
    /// # Errors
    /// Returns error if the identifier is invalid or the posting fails
    pub async fn post_raw_state(&self, artifact_id: &str, local_file: &Path) -> Result<Timestamp, BusError> {
        let topic = topics::raw_artifact(artifact_id)?;
        let timestamp = self.next_timestamp();
        self.post_file(&topic, local_file, &timestamp).await?;
        info!(artifact = artifact_id, %timestamp, "raw state posted");
        Ok(timestamp)
    }

    /// Call `handler` with the local copy of each raw state posted by `agent_id`
    ///
    /// Downloads land in the work folder under the artifact's identifier.
    ///
    /// # Errors
    /// Returns error if the identifier is invalid or the subscription is rejected
    pub async fn listen_for_raw_state_postings<F>(
        &self,
        agent_id: &str,
        artifact_id: &str,
        mut handler: F,
    ) -> Result<JoinHandle<()>, BusError>
    where
        F: FnMut(PathBuf) + Send + 'static,
    {
        let topic = topics::raw_artifact(artifact_id)?;
        self.listen_for_file_postings(agent_id, &topic, artifact_id, move |path, _| handler(path))
            .await
    }

    /// Download the raw state currently posted by `agent_id`
    ///
    /// # Errors
    /// Returns error if the identifier is invalid or the download fails
    pub async fn fetch_raw_state(
        &self,
        agent_id: &str,
        artifact_id: &str,
        local_file_name: &str,
    ) -> Result<Option<PathBuf>, BusError> {
        let topic = topics::raw_artifact(artifact_id)?;
        Ok(self
            .get_file_from_posting(agent_id, &topic, local_file_name)
            .await?
            .map(|(path, _)| path))
    }

    /// Remove this agent's posting of raw artifact `artifact_id`
    ///
    /// # Errors
    /// Returns error if the identifier is invalid or a removal fails
    pub async fn delete_raw_artifact(&self, artifact_id: &str) -> Result<(), BusError> {
        let topic = topics::raw_artifact(artifact_id)?;
        self.delete_posting(&topic).await
    }
}
