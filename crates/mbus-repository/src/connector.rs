//! Content store connector
//!
//! Remote layout mirrors the notification topics: a posting on
//! `<topic path>` stores its payload at
//! `<prefix>/<bus-version>/<environment>/<agent>/<topic path>/payload`.
//! Every operation opens a fresh session; connection failures are reported
//! and returned, never retried here.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashSet;
use mbus_core::{Namespace, RepositoryConfig, Timestamp, TopicPath, JSON_FILE_NAME, PAYLOAD_FILE_NAME};
use tracing::{debug, error, info, trace, warn};

use crate::{Credentials, Endpoint, RepositoryDialer, RepositoryError, RepositoryEvent, RepositorySession};

/// Connector to the content store
pub struct RepositoryConnector {
    namespace: Namespace,
    endpoint: Endpoint,
    single_server_mode: bool,
    work_folder: PathBuf,
    dialer: Arc<dyn RepositoryDialer>,
    created_paths: DashSet<String>,
}

impl std::fmt::Debug for RepositoryConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryConnector")
            .field("namespace", &self.namespace)
            .field("endpoint", &self.endpoint)
            .field("single_server_mode", &self.single_server_mode)
            .field("work_folder", &self.work_folder)
            .finish_non_exhaustive()
    }
}

impl RepositoryConnector {
    /// Create connector from `[ftp]` settings
    ///
    /// # Errors
    /// Returns error if `environment_id` or `agent_id` is not a valid path segment
    pub fn new(
        config: &RepositoryConfig,
        environment_id: &str,
        agent_id: &str,
        work_folder: impl Into<PathBuf>,
        dialer: Arc<dyn RepositoryDialer>,
    ) -> Result<Self, RepositoryError> {
        let namespace = Namespace::new(&config.prefix, environment_id, agent_id)?;
        let credentials = (!config.user.is_empty()).then(|| Credentials {
            user: config.user.clone(),
            password: config.password.clone(),
        });

        if config.single_server_mode {
            debug!("content store in single server mode");
        }
        if config.active_transfers {
            debug!("content store uses active transfers");
        }

        Ok(Self {
            namespace,
            endpoint: Endpoint {
                server: config.server.clone(),
                port: config.port,
                credentials,
                active_transfers: config.active_transfers,
            },
            single_server_mode: config.single_server_mode,
            work_folder: work_folder.into(),
            dialer,
            created_paths: DashSet::new(),
        })
    }

    /// Whether every agent shares the configured server
    #[inline]
    #[must_use]
    pub fn is_single_server_mode(&self) -> bool {
        self.single_server_mode
    }

    /// Local scratch-file directory
    #[inline]
    #[must_use]
    pub fn work_folder(&self) -> &Path {
        &self.work_folder
    }

    /// Local path for a scratch file named `file_name`
    #[must_use]
    pub fn local_file_path(&self, file_name: &str) -> PathBuf {
        self.work_folder.join(file_name)
    }

    /// Remote directory of this agent's posting on `topic_path`
    #[must_use]
    pub fn remote_path(&self, topic_path: &TopicPath) -> String {
        self.namespace.own_topic(topic_path).to_string()
    }

    /// Open a session on the configured server
    ///
    /// # Errors
    /// Returns the dial failure
    pub async fn connect(&self) -> Result<Box<dyn RepositorySession>, RepositoryError> {
        self.dial(&self.endpoint).await
    }

    /// Ensure every directory along `remote_path` exists
    ///
    /// Creation of a path is attempted once per connector; "already exists"
    /// and other per-level failures are tolerated.
    ///
    /// # Errors
    /// Returns error if the path is malformed or no session can be opened
    pub async fn mk_repository_file_path(&self, remote_path: &str) -> Result<(), RepositoryError> {
        if self.created_paths.contains(remote_path) {
            return Ok(());
        }
        let path: TopicPath = remote_path.parse()?;

        let mut session = self.connect().await?;
        for prefix in path.prefixes() {
            let dir = prefix.to_string();
            if let Err(e) = session.make_dir(&dir).await {
                trace!(%dir, error = %e, "mkdir not applied");
            }
        }
        close(session).await;

        self.created_paths.insert(remote_path.to_string());
        Ok(())
    }

    /// Upload `local_file` as the payload of this agent's posting on `topic_path`
    ///
    /// # Errors
    /// Returns error if the local file cannot be read or any remote step fails
    pub async fn add_file(
        &self,
        topic_path: &TopicPath,
        local_file: &Path,
        timestamp: &Timestamp,
    ) -> Result<RepositoryEvent, RepositoryError> {
        let data = tokio::fs::read(local_file).await.map_err(|e| {
            error!(file = %local_file.display(), error = %e, "cannot read file for upload");
            RepositoryError::io(local_file, e)
        })?;
        self.add_bytes(topic_path, data, timestamp).await
    }

    /// Upload `json` as the payload of this agent's posting on `topic_path`
    ///
    /// The JSON passes through a scratch file in the work folder, which is
    /// removed afterwards whatever the outcome.
    ///
    /// # Errors
    /// Returns error if the scratch file cannot be written or the upload fails
    pub async fn add_json_as_file(
        &self,
        topic_path: &TopicPath,
        json: &[u8],
        timestamp: &Timestamp,
    ) -> Result<RepositoryEvent, RepositoryError> {
        let scratch = self
            .scratch_file()
            .inspect_err(|e| error!(error = %e, "cannot create scratch file"))?;
        scratch
            .as_file()
            .write_all(json)
            .map_err(|e| {
                error!(file = %scratch.path().display(), error = %e, "cannot write scratch file");
                RepositoryError::io(scratch.path(), e)
            })?;

        self.add_file(topic_path, scratch.path(), timestamp).await
    }

    /// Download the payload an event points at into the work folder
    ///
    /// Single-server mode always reads from the configured server. Otherwise
    /// the event's server is used, anonymously unless it is the configured one.
    ///
    /// # Errors
    /// Returns error if the connection, transfer or local write fails
    pub async fn get_file(
        &self,
        event: &RepositoryEvent,
        local_file_name: &str,
    ) -> Result<PathBuf, RepositoryError> {
        let endpoint = self.endpoint_for(event).inspect_err(|e| {
            error!(error = %e, "unusable repository event");
        })?;

        let mut session = self.dial(&endpoint).await?;
        let retrieved = session.retrieve(&event.file_path).await;
        close(session).await;
        let data = retrieved.inspect_err(|e| {
            error!(file = %event.file_path, error = %e, "failed to retrieve file");
        })?;

        let local_path = self.local_file_path(local_file_name);
        write_local(&local_path, &data).await?;
        trace!(file = %event.file_path, local = %local_path.display(), "retrieved");
        Ok(local_path)
    }

    /// Recursively delete the remote `path`, file or directory
    ///
    /// Each entry is removed as a file first; when that fails it is listed
    /// and removed as a directory. Returns the number of entries removed;
    /// per-entry failures are logged.
    ///
    /// # Errors
    /// Returns error only if no session can be opened
    pub async fn delete_path(&self, path: &str) -> Result<usize, RepositoryError> {
        let root = path.trim_matches('/').to_string();
        let mut session = self.connect().await?;
        let mut removed = 0;
        let mut pending = vec![(root.clone(), false)];

        while let Some((path, expanded)) = pending.pop() {
            if expanded {
                match session.remove_dir(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(%path, error = %e, "failed to remove directory"),
                }
                continue;
            }

            if session.delete_file(&path).await.is_ok() {
                removed += 1;
                continue;
            }
            let children = session.list(&path).await.unwrap_or_default();
            if children.is_empty() {
                if session.remove_dir(&path).await.is_ok() {
                    removed += 1;
                } else {
                    debug!(%path, "nothing to delete");
                }
                continue;
            }

            pending.push((path.clone(), true));
            pending.extend(children.into_iter().map(|child| (format!("{path}/{child}"), false)));
        }
        close(session).await;

        self.created_paths.retain(|created| !is_under(&root, created));
        debug!(path = %root, removed, "deleted remote path");
        Ok(removed)
    }

    /// Delete this agent's remote posting on `topic_path`
    ///
    /// # Errors
    /// Returns error if no session can be opened
    pub async fn delete_posting_path(&self, topic_path: &TopicPath) -> Result<usize, RepositoryError> {
        self.delete_path(&self.remote_path(topic_path)).await
    }

    /// Delete the whole remote tree of `environment_id`
    ///
    /// # Errors
    /// Returns error if no session can be opened
    pub async fn delete_environment(&self, environment_id: &str) -> Result<usize, RepositoryError> {
        let root = self.namespace.environment_root_for(environment_id).to_string();
        let removed = self.delete_path(&root).await?;
        info!(environment = environment_id, removed, "environment files deleted");
        Ok(removed)
    }

    /// Fresh uniquely named scratch file in the work folder
    ///
    /// # Errors
    /// Returns error if the work folder cannot be created or written
    pub fn scratch_file(&self) -> Result<tempfile::NamedTempFile, RepositoryError> {
        std::fs::create_dir_all(&self.work_folder)
            .map_err(|e| RepositoryError::io(&self.work_folder, e))?;
        tempfile::Builder::new()
            .suffix(&format!("-{JSON_FILE_NAME}"))
            .tempfile_in(&self.work_folder)
            .map_err(|e| RepositoryError::io(&self.work_folder, e))
    }

    async fn add_bytes(
        &self,
        topic_path: &TopicPath,
        data: Vec<u8>,
        timestamp: &Timestamp,
    ) -> Result<RepositoryEvent, RepositoryError> {
        let remote_path = self.remote_path(topic_path);
        let payload_path = format!("{remote_path}/{PAYLOAD_FILE_NAME}");

        self.mk_repository_file_path(&remote_path).await?;

        let mut session = self.connect().await?;
        let stored = session.store(&payload_path, data).await;
        close(session).await;
        stored.inspect_err(|e| {
            error!(file = %payload_path, error = %e, "failed to upload file");
        })?;
        trace!(file = %payload_path, "uploaded");

        let (server, port) = if self.single_server_mode {
            (String::new(), String::new())
        } else {
            (self.endpoint.server.clone(), self.endpoint.port.to_string())
        };
        Ok(RepositoryEvent {
            server,
            port,
            file_path: payload_path,
            timestamp: timestamp.clone(),
        })
    }

    fn endpoint_for(&self, event: &RepositoryEvent) -> Result<Endpoint, RepositoryError> {
        if self.single_server_mode || !event.has_server() {
            return Ok(self.endpoint.clone());
        }
        let port = event.port_number()?;
        if self.endpoint.same_address(&event.server, port) {
            return Ok(self.endpoint.clone());
        }
        Ok(Endpoint {
            server: event.server.clone(),
            port,
            credentials: None,
            active_transfers: self.endpoint.active_transfers,
        })
    }

    async fn dial(&self, endpoint: &Endpoint) -> Result<Box<dyn RepositorySession>, RepositoryError> {
        self.dialer.dial(endpoint).await.inspect_err(|e| {
            error!(address = %endpoint.address(), error = %e, "failed to connect to content store");
        })
    }
}

async fn close(mut session: Box<dyn RepositorySession>) {
    if let Err(e) = session.close().await {
        trace!(error = %e, "session close failed");
    }
}

async fn write_local(path: &Path, data: &[u8]) -> Result<(), RepositoryError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| RepositoryError::io(parent, e))?;
    }
    tokio::fs::write(path, data).await.map_err(|e| {
        error!(file = %path.display(), error = %e, "cannot write local file");
        RepositoryError::io(path, e)
    })
}

fn is_under(root: &str, path: &str) -> bool {
    path.strip_prefix(root)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MockRepositoryDialer, MockRepositorySession};
    use crate::{MemoryDialer, MemoryRepository};
    use mbus_core::BUS_VERSION;
    use pretty_assertions::assert_eq;

    struct Fixture {
        connector: RepositoryConnector,
        repository: MemoryRepository,
        dialer: MemoryDialer,
        _work: tempfile::TempDir,
    }

    fn config(single_server_mode: bool) -> RepositoryConfig {
        RepositoryConfig {
            server: "files".to_string(),
            port: 21,
            user: "agent".to_string(),
            password: "secret".to_string(),
            prefix: "test".to_string(),
            single_server_mode,
            active_transfers: false,
        }
    }

    fn fixture(single_server_mode: bool) -> Fixture {
        let repository = MemoryRepository::new();
        let dialer = MemoryDialer::new();
        dialer.add_server("files", 21, repository.clone());
        let work = tempfile::tempdir().unwrap();
        let connector = RepositoryConnector::new(
            &config(single_server_mode),
            "env",
            "alice",
            work.path(),
            Arc::new(dialer.clone()),
        )
        .unwrap();
        Fixture {
            connector,
            repository,
            dialer,
            _work: work,
        }
    }

    fn topic(s: &str) -> TopicPath {
        s.parse().unwrap()
    }

    fn stamp() -> Timestamp {
        "2025-11-27-10-00-00-00".parse().unwrap()
    }

    #[tokio::test]
    async fn mkdir_runs_once_per_path() {
        let f = fixture(true);

        f.connector.mk_repository_file_path("a/b/c").await.unwrap();
        assert_eq!(f.repository.counts().make_dir, 3);
        assert!(f.repository.is_dir("a/b/c"));

        f.connector.mk_repository_file_path("a/b/c").await.unwrap();
        assert_eq!(f.repository.counts().make_dir, 3);
        assert_eq!(f.repository.counts().sessions, 1);
    }

    #[tokio::test]
    async fn mkdir_tolerates_existing_directories() {
        let f = fixture(true);
        f.connector.mk_repository_file_path("a/b").await.unwrap();
        f.connector.mk_repository_file_path("a/b/c").await.unwrap();
        assert!(f.repository.is_dir("a/b/c"));
    }

    #[tokio::test]
    async fn add_json_as_file_uploads_payload_and_cleans_scratch() {
        let f = fixture(false);
        let event = f
            .connector
            .add_json_as_file(&topic("observations/json/o1"), br#"{"a":1}"#, &stamp())
            .await
            .unwrap();

        let expected = format!("test/{BUS_VERSION}/env/alice/observations/json/o1/payload");
        assert_eq!(event.file_path, expected);
        assert_eq!(event.server, "files");
        assert_eq!(event.port, "21");
        assert_eq!(f.repository.file(&expected), Some(br#"{"a":1}"#.to_vec()));

        let leftovers = std::fs::read_dir(f.connector.work_folder()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn single_server_events_omit_endpoint() {
        let f = fixture(true);
        let event = f
            .connector
            .add_json_as_file(&topic("x"), b"{}", &stamp())
            .await
            .unwrap();
        assert!(!event.has_server());
        assert!(event.port.is_empty());
    }

    #[tokio::test]
    async fn add_file_missing_local_file() {
        let f = fixture(true);
        let result = f
            .connector
            .add_file(&topic("x"), Path::new("/no/such/file"), &stamp())
            .await;
        assert!(matches!(result, Err(RepositoryError::Io { .. })));
        assert_eq!(f.repository.counts().sessions, 0);
    }

    #[tokio::test]
    async fn get_file_downloads_into_work_folder() {
        let f = fixture(false);
        let event = f
            .connector
            .add_json_as_file(&topic("x"), b"[1,2]", &stamp())
            .await
            .unwrap();

        let local = f.connector.get_file(&event, "copy.json").await.unwrap();
        assert_eq!(local, f.connector.local_file_path("copy.json"));
        assert_eq!(std::fs::read(local).unwrap(), b"[1,2]".to_vec());
    }

    #[tokio::test]
    async fn get_file_from_foreign_server_is_anonymous() {
        let f = fixture(false);
        let other = MemoryRepository::new();
        {
            let mut session = other.session();
            session.make_dir("p").await.unwrap();
            session.store("p/payload", b"remote".to_vec()).await.unwrap();
        }
        f.dialer.add_server("elsewhere", 2121, other);

        let event = RepositoryEvent {
            server: "elsewhere".to_string(),
            port: "2121".to_string(),
            file_path: "p/payload".to_string(),
            timestamp: stamp(),
        };
        let local = f.connector.get_file(&event, "remote.bin").await.unwrap();
        assert_eq!(std::fs::read(local).unwrap(), b"remote".to_vec());

        let dialed = f.dialer.dialed();
        let last = dialed.last().unwrap();
        assert_eq!(last.server, "elsewhere");
        assert_eq!(last.credentials, None);
    }

    #[tokio::test]
    async fn single_server_mode_ignores_event_endpoint() {
        let f = fixture(true);
        let event = RepositoryEvent {
            server: "elsewhere".to_string(),
            port: "2121".to_string(),
            file_path: "missing/payload".to_string(),
            timestamp: stamp(),
        };
        let result = f.connector.get_file(&event, "x").await;
        assert!(matches!(result, Err(RepositoryError::Remote { .. })));
        assert_eq!(f.dialer.dialed().last().unwrap().server, "files");
    }

    #[tokio::test]
    async fn delete_path_on_plain_file() {
        let f = fixture(true);
        f.connector
            .add_json_as_file(&topic("x"), b"{}", &stamp())
            .await
            .unwrap();
        let payload = format!("test/{BUS_VERSION}/env/alice/x/payload");

        let removed = f.connector.delete_path(&payload).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!f.repository.exists(&payload));
        assert!(f.repository.is_dir(&format!("test/{BUS_VERSION}/env/alice/x")));
    }

    #[tokio::test]
    async fn delete_path_removes_nested_tree() {
        let f = fixture(true);
        for path in ["m/a", "m/a/b", "m/c"] {
            f.connector
                .add_json_as_file(&topic(path), b"{}", &stamp())
                .await
                .unwrap();
        }
        let root = f.connector.remote_path(&topic("m"));

        f.connector.delete_path(&root).await.unwrap();
        assert!(f
            .repository
            .paths()
            .iter()
            .all(|p| !is_under(&root, p)));
        assert!(f.repository.is_dir(&format!("test/{BUS_VERSION}/env/alice")));

        // cache was evicted, so posting again recreates the tree
        f.connector
            .add_json_as_file(&topic("m/a"), b"{}", &stamp())
            .await
            .unwrap();
        assert!(f.repository.exists(&format!("{root}/a/payload")));
    }

    #[tokio::test]
    async fn delete_path_descends_into_namesake_directory() {
        let f = fixture(true);
        f.connector
            .add_json_as_file(&topic("x/payload"), b"{}", &stamp())
            .await
            .unwrap();
        let root = f.connector.remote_path(&topic("x"));
        assert!(f.repository.is_dir(&format!("{root}/payload")));

        f.connector.delete_path(&root).await.unwrap();
        assert!(f.repository.paths().iter().all(|p| !is_under(&root, p)));
    }

    #[tokio::test]
    async fn delete_path_tolerates_files_listing_their_own_name() {
        // x/payload is a directory holding the file x/payload/payload, and
        // every listing answers with bare names
        let mut session = MockRepositorySession::new();
        session
            .expect_delete_file()
            .returning(|path| match path {
                "x/payload/payload" => Ok(()),
                _ => Err(RepositoryError::remote("delete", path, "is a directory")),
            });
        session
            .expect_list()
            .returning(|path| match path {
                "x" | "x/payload" => Ok(vec!["payload".to_string()]),
                _ => Ok(vec![path.rsplit('/').next().unwrap_or(path).to_string()]),
            });
        session
            .expect_remove_dir()
            .times(2)
            .returning(|_| Ok(()));
        session.expect_close().returning(|| Ok(()));

        let mut dialer = MockRepositoryDialer::new();
        dialer
            .expect_dial()
            .return_once(move |_| Ok(Box::new(session)));
        let work = tempfile::tempdir().unwrap();
        let connector =
            RepositoryConnector::new(&config(true), "env", "alice", work.path(), Arc::new(dialer))
                .unwrap();

        assert_eq!(connector.delete_path("x").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn delete_environment_removes_all_agents() {
        let f = fixture(true);
        f.connector
            .add_json_as_file(&topic("x"), b"{}", &stamp())
            .await
            .unwrap();
        {
            let mut session = f.repository.session();
            session
                .make_dir(&format!("test/{BUS_VERSION}/env/bob"))
                .await
                .unwrap();
        }

        f.connector.delete_environment("env").await.unwrap();
        assert_eq!(f.repository.paths(), vec!["test".to_string(), format!("test/{BUS_VERSION}")]);
    }

    #[tokio::test]
    async fn connect_failure_is_not_retried() {
        let mut dialer = MockRepositoryDialer::new();
        dialer.expect_dial().times(1).returning(|endpoint| {
            Err(RepositoryError::Connection {
                address: endpoint.address(),
                reason: "refused".to_string(),
            })
        });
        let work = tempfile::tempdir().unwrap();
        let connector =
            RepositoryConnector::new(&config(true), "env", "alice", work.path(), Arc::new(dialer))
                .unwrap();

        let result = connector.mk_repository_file_path("a/b").await;
        assert!(matches!(result, Err(RepositoryError::Connection { .. })));
    }
}
