//! FTP transport on `suppaftp`
//!
//! `suppaftp`'s synchronous client runs on the blocking pool; the session
//! moves its stream into each blocking call and takes it back afterwards.

use std::io::Cursor;

use async_trait::async_trait;
use suppaftp::types::FileType;
use suppaftp::{FtpResult, FtpStream, Mode};
use tracing::{debug, trace};

use crate::{Endpoint, RepositoryDialer, RepositoryError, RepositorySession};

const ANONYMOUS: &str = "anonymous";

/// Dialer opening FTP sessions
#[derive(Debug, Clone, Copy, Default)]
pub struct FtpDialer;

impl FtpDialer {
    /// Create dialer
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RepositoryDialer for FtpDialer {
    async fn dial(&self, endpoint: &Endpoint) -> Result<Box<dyn RepositorySession>, RepositoryError> {
        let address = endpoint.address();
        let target = endpoint.clone();

        let stream = tokio::task::spawn_blocking(move || -> FtpResult<FtpStream> {
            let mut stream = FtpStream::connect(target.address())?;
            match &target.credentials {
                Some(credentials) => stream.login(&credentials.user, &credentials.password)?,
                None => stream.login(ANONYMOUS, ANONYMOUS)?,
            }
            if target.active_transfers {
                stream.set_mode(Mode::Active);
            }
            stream.transfer_type(FileType::Binary)?;
            Ok(stream)
        })
        .await
        .map_err(|e| RepositoryError::Connection {
            address: address.clone(),
            reason: e.to_string(),
        })?
        .map_err(|e| RepositoryError::Connection {
            address: address.clone(),
            reason: e.to_string(),
        })?;

        debug!(%address, active = endpoint.active_transfers, "FTP session opened");
        Ok(Box::new(FtpSession {
            stream: Some(stream),
        }))
    }
}

/// Open FTP session
pub struct FtpSession {
    stream: Option<FtpStream>,
}

impl std::fmt::Debug for FtpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpSession")
            .field("open", &self.stream.is_some())
            .finish()
    }
}

impl FtpSession {
    async fn run<T, F>(&mut self, op: &'static str, path: &str, call: F) -> Result<T, RepositoryError>
    where
        T: Send + 'static,
        F: FnOnce(&mut FtpStream) -> FtpResult<T> + Send + 'static,
    {
        let mut stream = self.stream.take().ok_or(RepositoryError::SessionClosed)?;
        trace!(op, path, "FTP call");

        let (stream, result) = tokio::task::spawn_blocking(move || {
            let result = call(&mut stream);
            (stream, result)
        })
        .await
        .map_err(|e| RepositoryError::remote(op, path, e))?;

        self.stream = Some(stream);
        result.map_err(|e| RepositoryError::remote(op, path, e))
    }
}

#[async_trait]
impl RepositorySession for FtpSession {
    async fn make_dir(&mut self, path: &str) -> Result<(), RepositoryError> {
        let target = path.to_string();
        self.run("mkdir", path, move |s| s.mkdir(&target)).await
    }

    async fn store(&mut self, path: &str, data: Vec<u8>) -> Result<(), RepositoryError> {
        let target = path.to_string();
        self.run("store", path, move |s| {
            s.put_file(&target, &mut Cursor::new(data)).map(|_| ())
        })
        .await
    }

    async fn retrieve(&mut self, path: &str) -> Result<Vec<u8>, RepositoryError> {
        let target = path.to_string();
        self.run("retrieve", path, move |s| {
            s.retr_as_buffer(&target).map(Cursor::into_inner)
        })
        .await
    }

    async fn list(&mut self, path: &str) -> Result<Vec<String>, RepositoryError> {
        let target = path.to_string();
        let entries = self.run("list", path, move |s| s.nlst(Some(target.as_str()))).await?;

        Ok(child_names(path, &entries))
    }

    async fn remove_dir(&mut self, path: &str) -> Result<(), RepositoryError> {
        let target = path.to_string();
        self.run("rmdir", path, move |s| s.rmdir(&target)).await
    }

    async fn delete_file(&mut self, path: &str) -> Result<(), RepositoryError> {
        let target = path.to_string();
        self.run("delete", path, move |s| s.rm(&target)).await
    }

    async fn close(&mut self) -> Result<(), RepositoryError> {
        let result = self.run("quit", "", |s| s.quit()).await;
        self.stream = None;
        result
    }
}

/// Entry names under `path` from an NLST reply
///
/// NLST yields bare names or full paths depending on the server. A plain
/// file may list itself, which only counts when the entry is its full path.
fn child_names(path: &str, entries: &[String]) -> Vec<String> {
    let own = path.trim_matches('/');
    entries
        .iter()
        .map(|entry| entry.trim_end_matches('/'))
        .filter(|entry| entry.trim_start_matches('/') != own)
        .filter_map(|entry| entry.rsplit('/').next())
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .map(str::to_string)
        .collect()
}
