use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type JobId = String;
pub type WorkerId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Active,
    Canceled,
    Deleted,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Active => write!(f, "active"),
            JobStatus::Canceled => write!(f, "canceled"),
            JobStatus::Deleted => write!(f, "deleted"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessMode {
    Active,
    Passive,
}

impl std::fmt::Display for ProcessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessMode::Active => write!(f, "active"),
            ProcessMode::Passive => write!(f, "passive"),
        }
    }
}

/// Execution state of a job on one worker, as reported in heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionState {
    Idle,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionState::Idle => write!(f, "idle"),
            ExecutionState::Starting => write!(f, "starting"),
            ExecutionState::Running => write!(f, "running"),
            ExecutionState::Stopping => write!(f, "stopping"),
            ExecutionState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DemandOperator {
    #[default]
    Equals,
    NotEquals,
    /// Anchored regular expression on the capability value.
    Match,
    Exists,
    NotExists,
}

/// A predicate over a worker's capability map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Demand {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub operator: DemandOperator,
}

impl Demand {
    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            operator: DemandOperator::Equals,
        }
    }

    pub fn with_operator(
        key: impl Into<String>,
        operator: DemandOperator,
        value: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            operator,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedundancyConfig {
    pub desired_active: u32,
    pub desired_passive: u32,
}

impl Default for RedundancyConfig {
    fn default() -> Self {
        Self {
            desired_active: 1,
            desired_passive: 0,
        }
    }
}

/// Per-worker processing state of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingStatus {
    pub last_heartbeat: DateTime<Utc>,
    pub last_known_state: ExecutionState,
    pub process_mode: ProcessMode,
    /// When this entry first appeared; orders promotion candidates.
    pub since: DateTime<Utc>,
    /// Heartbeat period the worker reported, used for the staleness threshold.
    pub heartbeat_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLifetime {
    pub status: JobStatus,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub processing_status: BTreeMap<WorkerId, ProcessingStatus>,
}

/// Opaque configuration bytes tagged with the codec that produced them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfigPayload {
    pub type_tag: String,
    pub data: Vec<u8>,
}

impl JobConfigPayload {
    pub fn new(type_tag: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            type_tag: type_tag.into(),
            data,
        }
    }

    /// True for the placeholder payload of a freshly synthesized job.
    pub fn is_empty(&self) -> bool {
        self.type_tag.is_empty() && self.data.is_empty()
    }

    /// Hex SHA-256 over tag and bytes. Workers echo it so the orchestrator
    /// can tell whether they run the current configuration.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.type_tag.as_bytes());
        hasher.update([0u8]);
        hasher.update(&self.data);
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub config: JobConfigPayload,
    pub demands: Vec<Demand>,
    pub redundancy: RedundancyConfig,
    pub lifetime: JobLifetime,
}

impl Job {
    /// An empty job with no work: `Canceled` until configuration arrives.
    pub fn new(id: impl Into<JobId>) -> Self {
        let id = id.into();
        let now = Utc::now();
        Self {
            name: id.clone(),
            id,
            config: JobConfigPayload::default(),
            demands: Vec::new(),
            redundancy: RedundancyConfig::default(),
            lifetime: JobLifetime {
                status: JobStatus::Canceled,
                created: now,
                updated: now,
                processing_status: BTreeMap::new(),
            },
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_demand(mut self, demand: Demand) -> Self {
        self.demands.push(demand);
        self
    }

    pub fn with_redundancy(mut self, desired_active: u32, desired_passive: u32) -> Self {
        self.redundancy = RedundancyConfig {
            desired_active,
            desired_passive,
        };
        self
    }

    pub fn status(&self) -> JobStatus {
        self.lifetime.status
    }

    pub fn config_hash(&self) -> String {
        self.config.hash()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_is_canceled_and_empty() {
        let job = Job::new("ep1");
        assert_eq!(job.id, "ep1");
        assert_eq!(job.name, "ep1");
        assert_eq!(job.status(), JobStatus::Canceled);
        assert!(job.config.is_empty());
        assert!(job.demands.is_empty());
        assert_eq!(job.redundancy, RedundancyConfig::default());
    }

    #[test]
    fn hash_depends_on_tag_and_data() {
        let a = JobConfigPayload::new("A", b"{}".to_vec());
        let b = JobConfigPayload::new("B", b"{}".to_vec());
        let c = JobConfigPayload::new("A", b"{}".to_vec());
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.hash(), c.hash());
        assert_eq!(a.hash().len(), 64);
    }

    #[test]
    fn demand_defaults_to_equals() {
        let d: Demand = serde_json::from_str(r#"{"key":"Type","value":"Publisher"}"#).unwrap();
        assert_eq!(d.operator, DemandOperator::Equals);
        assert_eq!(d, Demand::equals("Type", "Publisher"));
    }
}
