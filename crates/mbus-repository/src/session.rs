//! Transport seam between the connector and a remote file store

use std::fmt;

use async_trait::async_trait;

use crate::RepositoryError;

/// Login credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// Where and how to open a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub server: String,
    pub port: u16,
    /// `None` logs in anonymously
    pub credentials: Option<Credentials>,
    pub active_transfers: bool,
}

impl Endpoint {
    /// `server:port`
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }

    /// Whether `server:port` names this endpoint
    #[must_use]
    pub fn same_address(&self, server: &str, port: u16) -> bool {
        self.server == server && self.port == port
    }
}

/// Opens sessions to remote file stores
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RepositoryDialer: Send + Sync {
    /// Open a fresh session
    ///
    /// # Errors
    /// Returns [`RepositoryError::Connection`] if the server cannot be reached
    /// or refuses the login
    async fn dial(&self, endpoint: &Endpoint) -> Result<Box<dyn RepositorySession>, RepositoryError>;
}

/// One open session on a remote file store
///
/// Paths are slash-separated and relative to the store root.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RepositorySession: Send {
    /// Create a single directory (parent must exist)
    async fn make_dir(&mut self, path: &str) -> Result<(), RepositoryError>;

    /// Upload `data` to the file at `path`, replacing it
    async fn store(&mut self, path: &str, data: Vec<u8>) -> Result<(), RepositoryError>;

    /// Download the file at `path`
    async fn retrieve(&mut self, path: &str) -> Result<Vec<u8>, RepositoryError>;

    /// Names of the entries directly under `path`
    ///
    /// A plain file yields either an error or no entries, depending on the store.
    async fn list(&mut self, path: &str) -> Result<Vec<String>, RepositoryError>;

    /// Remove an empty directory
    async fn remove_dir(&mut self, path: &str) -> Result<(), RepositoryError>;

    /// Remove a file
    async fn delete_file(&mut self, path: &str) -> Result<(), RepositoryError>;

    /// End the session
    async fn close(&mut self) -> Result<(), RepositoryError>;
}
