//! Progress and error reporting
//!
//! Progress is reported through `tracing` at three verbosity levels; errors
//! always go through `error!`/`warn!`, so filtering progress never hides them.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Verbosity of progress reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ProgressLevel {
    /// Connection lifecycle and environment-wide operations
    #[default]
    Basic,
    /// Snapshot collection, transfer modes, per-posting activity
    Detailed,
    /// Every message and transfer
    Noisy,
}

impl ProgressLevel {
    /// Tracing level progress of this verbosity is emitted at
    #[inline]
    #[must_use]
    pub const fn tracing_level(self) -> Level {
        match self {
            Self::Basic => Level::INFO,
            Self::Detailed => Level::DEBUG,
            Self::Noisy => Level::TRACE,
        }
    }

    /// Filter directive showing progress up to this verbosity
    #[inline]
    #[must_use]
    pub const fn filter_directive(self) -> &'static str {
        match self {
            Self::Basic => "info",
            Self::Detailed => "debug",
            Self::Noisy => "trace",
        }
    }

    /// Level as number (1 = basic, 3 = noisy)
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Basic => 1,
            Self::Detailed => 2,
            Self::Noisy => 3,
        }
    }
}

impl Display for ProgressLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Basic => "basic",
            Self::Detailed => "detailed",
            Self::Noisy => "noisy",
        };
        f.write_str(name)
    }
}

impl FromStr for ProgressLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "basic" | "1" => Ok(Self::Basic),
            "detailed" | "2" => Ok(Self::Detailed),
            "noisy" | "3" => Ok(Self::Noisy),
            other => Err(format!("unknown progress level: {other}")),
        }
    }
}

/// Install a global fmt subscriber showing progress up to `level`
///
/// `RUST_LOG` overrides the level when set. Returns `false` if a global
/// subscriber was already installed.
pub fn init_tracing(level: ProgressLevel) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.filter_directive()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
