//! Topic paths for addressing postings on the bus
//!
//! Provides [`TopicPath`] for hierarchical, slash-separated keys and
//! [`Namespace`] for the `<prefix>/<bus-version>/<environment>/<agent>` roots
//! shared by the notification channel and the content store.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use crate::BUS_VERSION;

/// Hierarchical key identifying a notification topic or a content-store location
///
/// # Examples
/// - `["artefacts", "json", "model-1", "v1", "state"]` → `artefacts/json/model-1/v1/state`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TopicPath(Vec<String>);

impl TopicPath {
    /// Create new path from segments
    #[inline]
    #[must_use]
    pub fn new(segments: Vec<String>) -> Self {
        Self(segments)
    }

    /// Create path from a single segment
    #[inline]
    #[must_use]
    pub fn single(segment: impl Into<String>) -> Self {
        Self(vec![segment.into()])
    }

    /// Empty path (root)
    #[inline]
    #[must_use]
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Get path segments
    #[inline]
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Get number of segments
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if path is empty (root)
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Get parent path (if not root)
    #[inline]
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// Get last segment (if not root)
    #[inline]
    #[must_use]
    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// Append a segment, returning new path
    #[inline]
    #[must_use]
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut new = self.clone();
        new.0.push(segment.into());
        new
    }

    /// Append all segments of another path
    #[inline]
    #[must_use]
    pub fn join_path(&self, other: &Self) -> Self {
        let mut new = self.clone();
        new.0.extend(other.0.iter().cloned());
        new
    }

    /// Check if this path is a prefix of another (segment-wise)
    ///
    /// `env/agent1` is a prefix of `env/agent1/x` but not of `env/agent10/x`.
    #[inline]
    #[must_use]
    pub fn is_prefix_of(&self, other: &Self) -> bool {
        if self.0.len() > other.0.len() {
            return false;
        }
        self.0 == other.0[..self.0.len()]
    }

    /// Successively longer prefixes, ending with the path itself
    ///
    /// `a/b/c` yields `a`, `a/b`, `a/b/c`.
    pub fn prefixes(&self) -> impl Iterator<Item = Self> + '_ {
        (1..=self.0.len()).map(move |n| Self(self.0[..n].to_vec()))
    }

    /// Iterator over segments from root to leaf
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl Display for TopicPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

impl FromStr for TopicPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }

        let segments: Vec<String> = trimmed
            .split('/')
            .map(|seg| {
                if seg.is_empty() {
                    Err(PathError::EmptySegment)
                } else if seg.contains(['+', '#', '\0']) {
                    Err(PathError::InvalidSegment(seg.to_string()))
                } else {
                    Ok(seg.to_string())
                }
            })
            .collect::<Result<_, _>>()?;

        Ok(Self(segments))
    }
}

impl From<Vec<String>> for TopicPath {
    fn from(segments: Vec<String>) -> Self {
        Self(segments)
    }
}

impl Default for TopicPath {
    fn default() -> Self {
        Self::root()
    }
}

/// Errors related to topic paths
#[derive(Debug, thiserror::Error)]
pub enum PathError {
    /// Empty segment in path
    #[error("path contains empty segment")]
    EmptySegment,

    /// Segment contains wildcard or NUL characters
    #[error("invalid segment: {0} (must not contain '+', '#' or NUL)")]
    InvalidSegment(String),
}

/// Addressing roots for one agent inside one modelling environment
///
/// Every notification topic and every content-store path has the shape
/// `<prefix>/<bus-version>/<environment>/<agent>/<topic path>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    prefix: TopicPath,
    environment_id: String,
    agent_id: String,
}

impl Namespace {
    /// Create namespace from a (possibly multi-segment) prefix
    ///
    /// # Errors
    /// Returns error if the prefix, environment or agent is not a valid path segment
    pub fn new(
        prefix: &str,
        environment_id: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> Result<Self, PathError> {
        let environment_id = environment_id.into();
        let agent_id = agent_id.into();
        validate_segment(&environment_id)?;
        validate_segment(&agent_id)?;

        Ok(Self {
            prefix: prefix.parse()?,
            environment_id,
            agent_id,
        })
    }

    /// Environment this namespace is bound to
    #[inline]
    #[must_use]
    pub fn environment_id(&self) -> &str {
        &self.environment_id
    }

    /// Agent this namespace posts as
    #[inline]
    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// `<prefix>/<bus-version>/<environment>`
    #[must_use]
    pub fn environment_root_for(&self, environment_id: &str) -> TopicPath {
        self.prefix.child(BUS_VERSION).child(environment_id)
    }

    /// `<prefix>/<bus-version>/<own environment>`
    #[must_use]
    pub fn environment_root(&self) -> TopicPath {
        self.environment_root_for(&self.environment_id)
    }

    /// `<prefix>/<bus-version>/<environment>/<agent>`
    #[must_use]
    pub fn agent_root_for(&self, environment_id: &str, agent_id: &str) -> TopicPath {
        self.environment_root_for(environment_id).child(agent_id)
    }

    /// Full path of `topic_path` as posted by `agent_id` in the own environment
    #[must_use]
    pub fn agent_topic(&self, agent_id: &str, topic_path: &TopicPath) -> TopicPath {
        self.agent_root_for(&self.environment_id, agent_id)
            .join_path(topic_path)
    }

    /// Full path of `topic_path` as posted by this agent
    #[must_use]
    pub fn own_topic(&self, topic_path: &TopicPath) -> TopicPath {
        self.agent_topic(&self.agent_id, topic_path)
    }
}

fn validate_segment(segment: &str) -> Result<(), PathError> {
    if segment.is_empty() {
        Err(PathError::EmptySegment)
    } else if segment.contains(['/', '+', '#', '\0']) {
        Err(PathError::InvalidSegment(segment.to_string()))
    } else {
        Ok(())
    }
}
