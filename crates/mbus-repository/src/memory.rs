//! In-process file store
//!
//! A directory tree behind a mutex, with FTP-like rules: directories must be
//! created one level at a time, creating an existing directory fails, and
//! only empty directories can be removed. Operation counters make remote
//! round trips observable in tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{Endpoint, RepositoryDialer, RepositoryError, RepositorySession};

#[derive(Debug, Clone)]
enum Entry {
    Dir,
    File(Vec<u8>),
}

/// Remote operations performed on a [`MemoryRepository`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationCounts {
    pub sessions: usize,
    pub make_dir: usize,
    pub store: usize,
    pub retrieve: usize,
    pub list: usize,
    pub remove_dir: usize,
    pub delete_file: usize,
}

#[derive(Debug, Default)]
struct StoreState {
    entries: BTreeMap<String, Entry>,
    counts: OperationCounts,
}

/// Shared in-process file store
#[derive(Debug, Clone, Default)]
pub struct MemoryRepository {
    state: Arc<Mutex<StoreState>>,
}

fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}

fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(parent, _)| parent)
}

impl MemoryRepository {
    /// Create empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Contents of the file at `path`
    #[must_use]
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.state.lock().entries.get(&normalize(path)) {
            Some(Entry::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    /// Whether `path` is a directory
    #[must_use]
    pub fn is_dir(&self, path: &str) -> bool {
        let path = normalize(path);
        path.is_empty() || matches!(self.state.lock().entries.get(&path), Some(Entry::Dir))
    }

    /// Whether anything exists at `path`
    #[must_use]
    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().entries.contains_key(&normalize(path))
    }

    /// Every directory and file path, sorted
    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        self.state.lock().entries.keys().cloned().collect()
    }

    /// Operation counters so far
    #[must_use]
    pub fn counts(&self) -> OperationCounts {
        self.state.lock().counts
    }

    /// Open a session directly, bypassing any dialer
    #[must_use]
    pub fn session(&self) -> MemorySession {
        self.state.lock().counts.sessions += 1;
        MemorySession {
            repository: self.clone(),
            open: true,
        }
    }

    fn require_dir(entries: &BTreeMap<String, Entry>, path: &str) -> bool {
        path.is_empty() || matches!(entries.get(path), Some(Entry::Dir))
    }
}

/// Session on a [`MemoryRepository`]
#[derive(Debug)]
pub struct MemorySession {
    repository: MemoryRepository,
    open: bool,
}

impl MemorySession {
    fn check_open(&self) -> Result<(), RepositoryError> {
        if self.open {
            Ok(())
        } else {
            Err(RepositoryError::SessionClosed)
        }
    }
}

#[async_trait]
impl RepositorySession for MemorySession {
    async fn make_dir(&mut self, path: &str) -> Result<(), RepositoryError> {
        self.check_open()?;
        let path = normalize(path);
        let mut state = self.repository.state.lock();
        state.counts.make_dir += 1;

        if state.entries.contains_key(&path) {
            return Err(RepositoryError::remote("mkdir", &path, "already exists"));
        }
        if !MemoryRepository::require_dir(&state.entries, parent_of(&path)) {
            return Err(RepositoryError::remote("mkdir", &path, "no such parent directory"));
        }
        state.entries.insert(path, Entry::Dir);
        Ok(())
    }

    async fn store(&mut self, path: &str, data: Vec<u8>) -> Result<(), RepositoryError> {
        self.check_open()?;
        let path = normalize(path);
        let mut state = self.repository.state.lock();
        state.counts.store += 1;

        if !MemoryRepository::require_dir(&state.entries, parent_of(&path)) {
            return Err(RepositoryError::remote("store", &path, "no such parent directory"));
        }
        if matches!(state.entries.get(&path), Some(Entry::Dir)) {
            return Err(RepositoryError::remote("store", &path, "is a directory"));
        }
        state.entries.insert(path, Entry::File(data));
        Ok(())
    }

    async fn retrieve(&mut self, path: &str) -> Result<Vec<u8>, RepositoryError> {
        self.check_open()?;
        let path = normalize(path);
        let mut state = self.repository.state.lock();
        state.counts.retrieve += 1;

        match state.entries.get(&path) {
            Some(Entry::File(data)) => Ok(data.clone()),
            Some(Entry::Dir) => Err(RepositoryError::remote("retrieve", &path, "is a directory")),
            None => Err(RepositoryError::remote("retrieve", &path, "no such file")),
        }
    }

    async fn list(&mut self, path: &str) -> Result<Vec<String>, RepositoryError> {
        self.check_open()?;
        let path = normalize(path);
        let mut state = self.repository.state.lock();
        state.counts.list += 1;

        match state.entries.get(&path) {
            Some(Entry::File(_)) => Ok(Vec::new()),
            None if !path.is_empty() => Err(RepositoryError::remote("list", &path, "no such directory")),
            _ => Ok(state
                .entries
                .keys()
                .filter(|key| !key.is_empty() && parent_of(key) == path)
                .map(|key| key.rsplit('/').next().unwrap_or(key).to_string())
                .collect()),
        }
    }

    async fn remove_dir(&mut self, path: &str) -> Result<(), RepositoryError> {
        self.check_open()?;
        let path = normalize(path);
        let mut state = self.repository.state.lock();
        state.counts.remove_dir += 1;

        if !matches!(state.entries.get(&path), Some(Entry::Dir)) {
            return Err(RepositoryError::remote("rmdir", &path, "not a directory"));
        }
        if state.entries.keys().any(|key| parent_of(key) == path && key != &path) {
            return Err(RepositoryError::remote("rmdir", &path, "directory not empty"));
        }
        state.entries.remove(&path);
        Ok(())
    }

    async fn delete_file(&mut self, path: &str) -> Result<(), RepositoryError> {
        self.check_open()?;
        let path = normalize(path);
        let mut state = self.repository.state.lock();
        state.counts.delete_file += 1;

        if !matches!(state.entries.get(&path), Some(Entry::File(_))) {
            return Err(RepositoryError::remote("delete", &path, "not a file"));
        }
        state.entries.remove(&path);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), RepositoryError> {
        self.check_open()?;
        self.open = false;
        Ok(())
    }
}

/// Dialer resolving `server:port` to in-process stores
#[derive(Debug, Clone, Default)]
pub struct MemoryDialer {
    servers: Arc<Mutex<HashMap<String, MemoryRepository>>>,
    dialed: Arc<Mutex<Vec<Endpoint>>>,
}

impl MemoryDialer {
    /// Dialer with no servers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `repository` at `server:port`
    pub fn add_server(&self, server: &str, port: u16, repository: MemoryRepository) {
        self.servers
            .lock()
            .insert(format!("{server}:{port}"), repository);
    }

    /// Endpoints dialed so far, in order
    #[must_use]
    pub fn dialed(&self) -> Vec<Endpoint> {
        self.dialed.lock().clone()
    }
}

#[async_trait]
impl RepositoryDialer for MemoryDialer {
    async fn dial(&self, endpoint: &Endpoint) -> Result<Box<dyn RepositorySession>, RepositoryError> {
        self.dialed.lock().push(endpoint.clone());
        let address = endpoint.address();
        let repository = self
            .servers
            .lock()
            .get(&address)
            .cloned()
            .ok_or_else(|| RepositoryError::Connection {
                address,
                reason: "connection refused".to_string(),
            })?;
        Ok(Box::new(repository.session()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn directories_created_level_by_level() {
        let repo = MemoryRepository::new();
        let mut session = repo.session();

        assert!(session.make_dir("a/b").await.is_err());
        session.make_dir("a").await.unwrap();
        session.make_dir("a/b").await.unwrap();
        assert!(session.make_dir("a").await.is_err());
        assert!(repo.is_dir("a/b"));
    }

    #[tokio::test]
    async fn store_and_retrieve() {
        let repo = MemoryRepository::new();
        let mut session = repo.session();
        session.make_dir("d").await.unwrap();
        session.store("d/payload", b"data".to_vec()).await.unwrap();

        assert_eq!(session.retrieve("d/payload").await.unwrap(), b"data".to_vec());
        assert!(session.retrieve("d").await.is_err());
        assert!(session.store("missing/payload", vec![]).await.is_err());
    }

    #[tokio::test]
    async fn list_children_and_files() {
        let repo = MemoryRepository::new();
        let mut session = repo.session();
        session.make_dir("d").await.unwrap();
        session.make_dir("d/sub").await.unwrap();
        session.store("d/file", vec![1]).await.unwrap();

        let mut children = session.list("d").await.unwrap();
        children.sort();
        assert_eq!(children, vec!["file".to_string(), "sub".to_string()]);
        assert!(session.list("d/file").await.unwrap().is_empty());
        assert!(session.list("nowhere").await.is_err());
    }

    #[tokio::test]
    async fn remove_dir_requires_empty() {
        let repo = MemoryRepository::new();
        let mut session = repo.session();
        session.make_dir("d").await.unwrap();
        session.store("d/file", vec![1]).await.unwrap();

        assert!(session.remove_dir("d").await.is_err());
        session.delete_file("d/file").await.unwrap();
        session.remove_dir("d").await.unwrap();
        assert!(repo.paths().is_empty());
    }

    #[tokio::test]
    async fn closed_session_refuses() {
        let repo = MemoryRepository::new();
        let mut session = repo.session();
        session.close().await.unwrap();
        assert!(matches!(
            session.make_dir("a").await,
            Err(RepositoryError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn dialer_routes_by_address() {
        let dialer = MemoryDialer::new();
        dialer.add_server("files", 21, MemoryRepository::new());

        let endpoint = Endpoint {
            server: "files".to_string(),
            port: 21,
            credentials: None,
            active_transfers: false,
        };
        assert!(dialer.dial(&endpoint).await.is_ok());

        let other = Endpoint {
            port: 2121,
            ..endpoint
        };
        assert!(matches!(
            dialer.dial(&other).await,
            Err(RepositoryError::Connection { .. })
        ));
        assert_eq!(dialer.dialed().len(), 2);
    }
}
