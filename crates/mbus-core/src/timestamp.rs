//! Monotonic, lexically sortable posting timestamps
//!
//! Format: `YYYY-MM-DD-HH-MM-SS-NN`, where `NN` counts postings within the
//! same second. [`TimestampGenerator`] is the single source of these values
//! and is shared by handle between all components of one process.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use chrono::{Duration, NaiveDateTime, Timelike};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

const SECOND_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";
const MAX_COUNTER: u32 = 99;

/// Timestamp of a posting, delta, or snapshot baseline
///
/// Serialized as a plain string on the wire.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(String);

impl Timestamp {
    /// Borrow as string slice
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Empty timestamp (never produced by the generator)
    #[inline]
    #[must_use]
    pub fn empty() -> Self {
        Self(String::new())
    }

    /// Check for the empty timestamp
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Timestamp {
    type Err = TimestampError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (seconds, counter) = s
            .rsplit_once('-')
            .ok_or_else(|| TimestampError::Malformed(s.to_string()))?;

        if counter.len() != 2 || !counter.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TimestampError::Malformed(s.to_string()));
        }
        NaiveDateTime::parse_from_str(seconds, SECOND_FORMAT)
            .map_err(|_| TimestampError::Malformed(s.to_string()))?;

        Ok(Self(s.to_string()))
    }
}

/// Errors related to timestamps
#[derive(Debug, thiserror::Error)]
pub enum TimestampError {
    /// Not of the form `YYYY-MM-DD-HH-MM-SS-NN`
    #[error("malformed timestamp: {0}")]
    Malformed(String),
}

/// Source of wall-clock time for the generator
pub trait Clock: Send + Sync {
    /// Current local wall-clock time
    fn now(&self) -> NaiveDateTime;
}

/// Local system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

#[derive(Debug, Default)]
struct GeneratorState {
    second: Option<NaiveDateTime>,
    counter: u32,
}

/// Monotonic timestamp generator
///
/// Construct once per process and pass an `Arc` to every component that
/// stamps postings. Internally synchronized.
///
/// # Invariants
/// - Every call returns a value strictly greater (lexically) than the last
/// - The counter resets whenever the wall-clock second advances
/// - If the counter would exceed `99` within one second, or the clock moves
///   backwards, the logical second is advanced instead
pub struct TimestampGenerator {
    clock: Box<dyn Clock>,
    state: Mutex<GeneratorState>,
}

impl TimestampGenerator {
    /// Generator on the local system clock
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Generator on a custom clock
    #[must_use]
    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        Self {
            clock: Box::new(clock),
            state: Mutex::new(GeneratorState::default()),
        }
    }

    /// Produce the next timestamp
    pub fn next(&self) -> Timestamp {
        let wall = truncate_to_second(self.clock.now());
        let mut state = self.state.lock();
        let previous = state.second;

        match previous {
            Some(last) if wall <= last => {
                if state.counter < MAX_COUNTER {
                    state.counter += 1;
                } else {
                    state.second = Some(last + Duration::seconds(1));
                    state.counter = 0;
                }
            }
            _ => {
                state.second = Some(wall);
                state.counter = 0;
            }
        }

        let second = state.second.unwrap_or(wall);
        Timestamp(format!(
            "{}-{:02}",
            second.format(SECOND_FORMAT),
            state.counter
        ))
    }
}

impl Default for TimestampGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TimestampGenerator {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TimestampGenerator")
            .field("second", &state.second)
            .field("counter", &state.counter)
            .finish_non_exhaustive()
    }
}

fn truncate_to_second(time: NaiveDateTime) -> NaiveDateTime {
    time.with_nanosecond(0).unwrap_or(time)
}
