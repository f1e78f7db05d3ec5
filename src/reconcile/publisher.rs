//! Publisher job configuration: writer groups of published items, keyed by
//! connection and publishing interval.

use serde::{Deserialize, Serialize};

use crate::reconcile::codec::JobConfiguration;

pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_BATCH_TRIGGER_INTERVAL_MS: u64 = 500;
pub const DEFAULT_MAX_EGRESS_MESSAGE_QUEUE: usize = 4096;
pub const DEFAULT_DIAGNOSTICS_INTERVAL_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityMode {
    #[default]
    None,
    Sign,
    SignAndEncrypt,
    /// Strongest mode the endpoint offers.
    Best,
}

/// Everything that decides how a session to a data source is opened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionIdentity {
    pub endpoint_url: String,
    #[serde(default)]
    pub security_mode: SecurityMode,
    #[serde(default)]
    pub security_policy: Option<String>,
    /// User name for user-token authentication; anonymous when unset.
    #[serde(default)]
    pub user: Option<String>,
}

impl ConnectionIdentity {
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            ..Default::default()
        }
    }

    pub fn with_security(mut self, mode: SecurityMode, policy: Option<String>) -> Self {
        self.security_mode = mode;
        self.security_policy = policy;
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }
}

/// Identity of a writer group. Two groups with equal keys are the same group
/// whatever items they carry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupKey {
    pub connection: ConnectionIdentity,
    pub publishing_interval_ms: Option<u64>,
}

impl GroupKey {
    pub fn new(connection: ConnectionIdentity, publishing_interval_ms: Option<u64>) -> Self {
        Self {
            connection,
            publishing_interval_ms,
        }
    }
}

/// One monitored data point. `node_id` is the item key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedItem {
    pub node_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub sampling_interval_ms: Option<u64>,
    #[serde(default)]
    pub heartbeat_interval_ms: Option<u64>,
}

impl PublishedItem {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            display_name: None,
            sampling_interval_ms: None,
            heartbeat_interval_ms: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_sampling_interval(mut self, ms: u64) -> Self {
        self.sampling_interval_ms = Some(ms);
        self
    }

    pub fn with_heartbeat_interval(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = Some(ms);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterGroup {
    pub connection: ConnectionIdentity,
    pub publishing_interval_ms: Option<u64>,
    pub items: Vec<PublishedItem>,
}

impl WriterGroup {
    pub fn new(key: GroupKey) -> Self {
        Self {
            connection: key.connection,
            publishing_interval_ms: key.publishing_interval_ms,
            items: Vec::new(),
        }
    }

    pub fn key(&self) -> GroupKey {
        GroupKey::new(self.connection.clone(), self.publishing_interval_ms)
    }

    pub fn matches(&self, key: &GroupKey) -> bool {
        self.connection == key.connection && self.publishing_interval_ms == key.publishing_interval_ms
    }

    pub fn item(&self, node_id: &str) -> Option<&PublishedItem> {
        self.items.iter().find(|i| i.node_id == node_id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessagingMode {
    #[default]
    Samples,
    PubSub,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageEncoding {
    #[default]
    Json,
    Uadp,
}

/// Settings handed to the processing engine on the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub batch_size: usize,
    pub batch_trigger_interval_ms: u64,
    pub max_egress_message_queue: usize,
    pub diagnostics_interval_ms: u64,
    pub messaging_mode: MessagingMode,
    pub encoding: MessageEncoding,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_trigger_interval_ms: DEFAULT_BATCH_TRIGGER_INTERVAL_MS,
            max_egress_message_queue: DEFAULT_MAX_EGRESS_MESSAGE_QUEUE,
            diagnostics_interval_ms: DEFAULT_DIAGNOSTICS_INTERVAL_MS,
            messaging_mode: MessagingMode::default(),
            encoding: MessageEncoding::default(),
        }
    }
}

/// Configuration payload of a publisher job.
///
/// Groups and items keep insertion order and no field is a hash map, so two
/// equal configurations serialize to the same bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherJobConfig {
    pub groups: Vec<WriterGroup>,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl JobConfiguration for PublisherJobConfig {
    const TYPE_TAG: &'static str = "PublisherJob";

    fn unit_count(&self) -> usize {
        self.groups.iter().map(|g| g.items.len()).sum()
    }
}
