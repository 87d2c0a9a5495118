//! Modelling Bus Content Store
//!
//! Bulk payload storage for postings, addressed like the notification topics.
//!
//! # Components
//!
//! - [`RepositoryConnector`]: Directory creation, upload, download, deletion
//! - [`RepositoryEvent`]: Pointer record published in place of a payload
//! - [`RepositoryDialer`] / [`RepositorySession`]: Seam to the file store
//! - [`MemoryRepository`] / [`MemoryDialer`]: In-process store
//! - `FtpDialer`: FTP adapter (feature `ftp`)

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod connector;
mod error;
mod event;
#[cfg(feature = "ftp")]
mod ftp;
mod memory;
mod session;

pub use connector::RepositoryConnector;
pub use error::RepositoryError;
pub use event::RepositoryEvent;
#[cfg(feature = "ftp")]
pub use ftp::{FtpDialer, FtpSession};
pub use memory::{MemoryDialer, MemoryRepository, MemorySession, OperationCounts};
pub use session::{Credentials, Endpoint, RepositoryDialer, RepositorySession};
