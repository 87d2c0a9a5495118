//! Topic paths of artifact and observation postings

use mbus_core::{PathError, TopicPath};

/// Kind of JSON artifact posting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactTier {
    State,
    Update,
    Considering,
}

impl ArtifactTier {
    /// Last topic segment of this tier
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::State => "state",
            Self::Update => "update",
            Self::Considering => "considering",
        }
    }

    pub const ALL: [Self; 3] = [Self::State, Self::Update, Self::Considering];

    /// Position of this tier in [`Self::ALL`]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for ArtifactTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `artefacts/json/<artifact>`
///
/// # Errors
/// Returns error if `artifact_id` is not a single valid segment
pub fn json_artifact_root(artifact_id: &str) -> Result<TopicPath, PathError> {
    Ok(TopicPath::new(vec![
        "artefacts".to_string(),
        "json".to_string(),
        segment(artifact_id)?,
    ]))
}

/// `artefacts/json/<artifact>/<version>/<tier>`
///
/// # Errors
/// Returns error if `artifact_id` or `json_version` is not a single valid segment
pub fn json_artifact(artifact_id: &str, json_version: &str, tier: ArtifactTier) -> Result<TopicPath, PathError> {
    Ok(json_artifact_root(artifact_id)?
        .child(segment(json_version)?)
        .child(tier.as_str()))
}

/// `artefacts/raw/<artifact>`
///
/// # Errors
/// Returns error if `artifact_id` is not a single valid segment
pub fn raw_artifact(artifact_id: &str) -> Result<TopicPath, PathError> {
    under(&["artefacts", "raw"], artifact_id)
}

/// `observation/raw/<observation>`
///
/// # Errors
/// Returns error if `observation_id` is not a single valid segment
pub fn raw_observation(observation_id: &str) -> Result<TopicPath, PathError> {
    under(&["observation", "raw"], observation_id)
}

/// `observation/json/<observation>`
///
/// # Errors
/// Returns error if `observation_id` is not a single valid segment
pub fn json_observation(observation_id: &str) -> Result<TopicPath, PathError> {
    under(&["observation", "json"], observation_id)
}

fn under(parents: &[&str], id: &str) -> Result<TopicPath, PathError> {
    let mut segments: Vec<String> = parents.iter().map(|s| (*s).to_string()).collect();
    segments.push(segment(id)?);
    Ok(TopicPath::new(segments))
}

/// Validate `value` as exactly one topic segment
pub(crate) fn segment(value: &str) -> Result<String, PathError> {
    if value.is_empty() {
        return Err(PathError::EmptySegment);
    }
    if value.contains(['/', '+', '#', '\0']) {
        return Err(PathError::InvalidSegment(value.to_string()));
    }
    Ok(value.to_string())
}
