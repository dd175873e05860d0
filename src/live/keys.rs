//! Cache key layout shared by every live accounting backend.
//!
//! Keys are raw bytes, not text: the 16 project id bytes, optionally followed
//! by a suffix. The layout has to stay byte-compatible with the tally process
//! reading the same keyspace.

use chrono::{DateTime, Datelike, Utc};

use super::{LiveAccountingError, ProjectId};

const SEGMENT_SUFFIX: &[u8] = b":segment";
const BANDWIDTH_SUFFIX: &[u8] = b":bandwidth";

const PROJECT_ID_LEN: usize = 16;
const SEGMENT_KEY_LEN: usize = PROJECT_ID_LEN + SEGMENT_SUFFIX.len();
const BANDWIDTH_KEY_LEN: usize = PROJECT_ID_LEN + 2 + BANDWIDTH_SUFFIX.len();

pub fn storage_key(project_id: &ProjectId) -> Vec<u8> {
    project_id.as_bytes().to_vec()
}

pub fn segment_key(project_id: &ProjectId) -> Vec<u8> {
    let mut key = Vec::with_capacity(SEGMENT_KEY_LEN);
    key.extend_from_slice(project_id.as_bytes());
    key.extend_from_slice(SEGMENT_SUFFIX);
    key
}

/// The period is encoded as one month byte and one day-of-month byte taken
/// from `now`, never from the wall clock.
pub fn bandwidth_key(project_id: &ProjectId, now: DateTime<Utc>) -> Vec<u8> {
    let mut key = Vec::with_capacity(BANDWIDTH_KEY_LEN);
    key.extend_from_slice(project_id.as_bytes());
    key.push(now.month() as u8);
    key.push(now.day() as u8);
    key.extend_from_slice(BANDWIDTH_SUFFIX);
    key
}

/// A decoded key from the shared keyspace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheKey {
    Storage(ProjectId),
    Segment(ProjectId),
    Bandwidth {
        project_id: ProjectId,
        month: u8,
        day: u8,
    },
}

impl CacheKey {
    pub fn decode(raw: &[u8]) -> Result<Self, LiveAccountingError> {
        if raw.len() == BANDWIDTH_KEY_LEN && raw.ends_with(BANDWIDTH_SUFFIX) {
            return Ok(Self::Bandwidth {
                project_id: project_id_from(&raw[..PROJECT_ID_LEN], raw)?,
                month: raw[PROJECT_ID_LEN],
                day: raw[PROJECT_ID_LEN + 1],
            });
        }
        if raw.len() == SEGMENT_KEY_LEN && raw.ends_with(SEGMENT_SUFFIX) {
            return Ok(Self::Segment(project_id_from(&raw[..PROJECT_ID_LEN], raw)?));
        }
        Ok(Self::Storage(project_id_from(raw, raw)?))
    }

    pub fn project_id(&self) -> ProjectId {
        match self {
            Self::Storage(id) | Self::Segment(id) => *id,
            Self::Bandwidth { project_id, .. } => *project_id,
        }
    }
}

fn project_id_from(bytes: &[u8], key: &[u8]) -> Result<ProjectId, LiveAccountingError> {
    ProjectId::from_slice(bytes).map_err(|_| {
        LiveAccountingError::UnexpectedValue(format!(
            "cannot parse the key as project id; key={}",
            display_key(key)
        ))
    })
}

/// Renders a binary key for error messages.
pub fn display_key(key: &[u8]) -> String {
    key.escape_ascii().to_string()
}
