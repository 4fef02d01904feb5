use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use time::OffsetDateTime;

/// A job as recorded in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: i64,
    pub created_at: OffsetDateTime,
    pub name: String,
    pub unit: String,
    pub cwd: PathBuf,
    pub argv: Vec<String>,
    pub env: Option<BTreeMap<String, String>>,
    pub properties: Option<BTreeMap<String, String>>,
    pub host: Option<String>,
    pub user: Option<String>,
    pub notes: Option<String>,
    pub last_known_state: Option<JobState>,
    pub last_state_at: Option<OffsetDateTime>,
}

/// Everything the registry needs to record a freshly launched job.
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub name: String,
    pub unit: String,
    pub cwd: PathBuf,
    pub argv: Vec<String>,
    pub env: Option<BTreeMap<String, String>>,
    pub properties: Option<BTreeMap<String, String>>,
    pub host: Option<String>,
    pub user: Option<String>,
}

/// Point-in-time view of a unit as reported by the supervisor.
///
/// Empty strings from the supervisor are normalised to `None`, so a unit the
/// supervisor has never heard of comes back as a snapshot with every field
/// unset except `unit`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnitSnapshot {
    pub unit: String,
    pub active_state: Option<String>,
    pub sub_state: Option<String>,
    pub exit_status: Option<String>,
    pub main_pid: Option<u32>,
    pub started_at: Option<String>,
    pub exited_at: Option<String>,
}

impl UnitSnapshot {
    pub fn empty(unit: &str) -> Self {
        Self {
            unit: unit.to_string(),
            ..Default::default()
        }
    }
}

/// Normalised job state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobState {
    Active,
    Activating,
    Exited,
    Failed,
    /// Recorded by `stop`; never derived from a live snapshot.
    Stopped,
    Unknown,
    /// Any other supervisor activity value, kept verbatim (e.g. `deactivating`).
    Other(String),
}

impl JobState {
    pub fn as_str(&self) -> &str {
        match self {
            JobState::Active => "active",
            JobState::Activating => "activating",
            JobState::Exited => "exited",
            JobState::Failed => "failed",
            JobState::Stopped => "stopped",
            JobState::Unknown => "unknown",
            JobState::Other(raw) => raw,
        }
    }

    /// Parse a stored or raw state string. Never fails: unrecognised values
    /// become `Other`, and the empty string is `Unknown`.
    pub fn from_raw(raw: &str) -> Self {
        match raw {
            "active" => JobState::Active,
            "activating" => JobState::Activating,
            "exited" => JobState::Exited,
            "failed" => JobState::Failed,
            "stopped" => JobState::Stopped,
            "" | "unknown" => JobState::Unknown,
            other => JobState::Other(other.to_string()),
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for JobState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for JobState {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(JobState::from_raw(&raw))
    }
}

/// Registry record merged with whatever the supervisor said about it.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub job: Job,
    pub live: Option<UnitSnapshot>,
    pub state: JobState,
    /// True when `state` came from the registry cache because no live
    /// snapshot was available.
    pub cached: bool,
}
