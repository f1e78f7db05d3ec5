//! Loader for published-nodes files: a JSON array of endpoints, each with
//! the nodes to publish from it.
//!
//! ```json
//! [{
//!   "EndpointUrl": "opc.tcp://plc1:4840",
//!   "UseSecurity": false,
//!   "OpcNodes": [
//!     { "Id": "ns=2;s=Temperature", "OpcSamplingInterval": 1000,
//!       "OpcPublishingInterval": 1000, "DisplayName": "temp" }
//!   ]
//! }]
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::error::{JobError, Result};
use crate::reconcile::publisher::{ConnectionIdentity, GroupKey, PublishedItem, SecurityMode};
use crate::reconcile::service::PublisherJobService;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthenticationMode {
    #[default]
    Anonymous,
    UsernamePassword,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OpcNode {
    #[serde(alias = "ExpandedNodeId")]
    pub id: String,
    #[serde(default)]
    pub opc_sampling_interval: Option<u64>,
    #[serde(default)]
    pub opc_publishing_interval: Option<u64>,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Seconds.
    #[serde(default)]
    pub heartbeat_interval: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PublishedNodesEntry {
    pub endpoint_url: String,
    #[serde(default)]
    pub use_security: bool,
    #[serde(default)]
    pub opc_authentication_mode: AuthenticationMode,
    #[serde(default)]
    pub opc_authentication_username: Option<String>,
    /// Overrides the job id; defaults to the endpoint url.
    #[serde(default)]
    pub data_set_writer_group: Option<String>,
    #[serde(default)]
    pub opc_nodes: Vec<OpcNode>,
}

impl PublishedNodesEntry {
    pub fn endpoint_id(&self) -> &str {
        self.data_set_writer_group
            .as_deref()
            .filter(|g| !g.trim().is_empty())
            .unwrap_or(&self.endpoint_url)
    }

    pub fn connection(&self) -> ConnectionIdentity {
        let mut connection = ConnectionIdentity::new(self.endpoint_url.clone());
        if self.use_security {
            connection = connection.with_security(SecurityMode::Best, None);
        }
        if self.opc_authentication_mode == AuthenticationMode::UsernamePassword {
            if let Some(user) = &self.opc_authentication_username {
                connection = connection.with_user(user.clone());
            }
        }
        connection
    }

    /// Group key and item for every node, in file order.
    pub fn items(&self) -> Vec<(GroupKey, PublishedItem)> {
        let connection = self.connection();
        self.opc_nodes
            .iter()
            .map(|node| {
                let key = GroupKey::new(connection.clone(), node.opc_publishing_interval);
                let item = PublishedItem {
                    node_id: node.id.clone(),
                    display_name: node.display_name.clone(),
                    sampling_interval_ms: node.opc_sampling_interval,
                    heartbeat_interval_ms: node.heartbeat_interval.map(|s| s.saturating_mul(1000)),
                };
                (key, item)
            })
            .collect()
    }
}

pub fn parse(content: &str) -> Result<Vec<PublishedNodesEntry>> {
    let entries: Vec<PublishedNodesEntry> = serde_json::from_str(content)?;
    for entry in &entries {
        if entry.endpoint_url.trim().is_empty() {
            return Err(JobError::Validation("EndpointUrl is required".to_string()));
        }
        if let Some(node) = entry.opc_nodes.iter().find(|n| n.id.trim().is_empty()) {
            return Err(JobError::Validation(format!(
                "node without Id under {} ({:?})",
                entry.endpoint_url, node.display_name
            )));
        }
    }
    Ok(entries)
}

pub fn load(path: &Path) -> Result<Vec<PublishedNodesEntry>> {
    let content = std::fs::read_to_string(path)?;
    let entries = parse(&content)?;
    tracing::info!(path = %path.display(), entries = entries.len(), "Read published nodes file");
    Ok(entries)
}

/// Make the service publish exactly what `entries` list. Each endpoint's
/// node set is replaced; endpoints no longer in the file are unpublished.
/// Returns the number of nodes in the file.
pub async fn apply(service: &PublisherJobService, entries: &[PublishedNodesEntry]) -> Result<usize> {
    let mut endpoints: BTreeMap<&str, Vec<(GroupKey, PublishedItem)>> = BTreeMap::new();
    for entry in entries {
        endpoints
            .entry(entry.endpoint_id())
            .or_default()
            .extend(entry.items());
    }

    let mut applied = 0;
    for (endpoint_id, items) in &endpoints {
        service.replace_published_items(endpoint_id, items).await?;
        applied += items.len();
    }

    let listed: BTreeSet<&str> = endpoints.keys().copied().collect();
    for endpoint_id in service.list_endpoints().await? {
        if !listed.contains(endpoint_id.as_str()) {
            tracing::info!(endpoint_id = %endpoint_id, "Endpoint no longer in published nodes file");
            service.unpublish_all(&endpoint_id).await?;
        }
    }
    Ok(applied)
}

/// A published-nodes file that is re-applied whenever its content changes.
pub struct PublishedNodesFile {
    path: PathBuf,
    last_hash: Option<String>,
}

impl PublishedNodesFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_hash: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file and apply it if its content hash changed. Returns the
    /// number of nodes applied, or `None` when the file is unchanged. A file
    /// that fails to parse or apply is retried on the next call.
    pub async fn refresh(&mut self, service: &PublisherJobService) -> Result<Option<usize>> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        let hash = hex::encode(Sha256::digest(content.as_bytes()));
        if self.last_hash.as_deref() == Some(hash.as_str()) {
            return Ok(None);
        }

        let entries = parse(&content)?;
        let applied = apply(service, &entries).await?;
        tracing::info!(
            path = %self.path.display(),
            endpoints = entries.len(),
            nodes = applied,
            "Applied published nodes file"
        );
        self.last_hash = Some(hash);
        Ok(Some(applied))
    }

    /// Refresh every `interval` until `shutdown` fires.
    pub async fn watch(
        mut self,
        service: PublisherJobService,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh(&service).await {
                        tracing::warn!(path = %self.path.display(), error = %e, "Published nodes refresh failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pascal_case_entries() {
        let entries = parse(
            r#"[{
                "EndpointUrl": "opc.tcp://plc1:4840",
                "UseSecurity": true,
                "OpcNodes": [
                    { "Id": "ns=2;s=A", "OpcPublishingInterval": 1000, "HeartbeatInterval": 5 },
                    { "ExpandedNodeId": "nsu=http://x;s=B", "DisplayName": "b" }
                ]
            }]"#,
        )
        .unwrap();

        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.endpoint_id(), "opc.tcp://plc1:4840");
        assert_eq!(entry.connection().security_mode, SecurityMode::Best);

        let items = entry.items();
        assert_eq!(items[0].0.publishing_interval_ms, Some(1000));
        assert_eq!(items[0].1.heartbeat_interval_ms, Some(5000));
        assert_eq!(items[1].1.node_id, "nsu=http://x;s=B");
        assert_eq!(items[1].0.publishing_interval_ms, None);
    }

    #[test]
    fn writer_group_overrides_endpoint_id() {
        let entries = parse(
            r#"[{ "EndpointUrl": "opc.tcp://a", "DataSetWriterGroup": "line-3",
                  "OpcAuthenticationMode": "UsernamePassword",
                  "OpcAuthenticationUsername": "operator" }]"#,
        )
        .unwrap();
        assert_eq!(entries[0].endpoint_id(), "line-3");
        assert_eq!(entries[0].connection().user.as_deref(), Some("operator"));
    }

    #[test]
    fn rejects_missing_endpoint_and_node_id() {
        assert!(matches!(
            parse(r#"[{ "EndpointUrl": "" }]"#),
            Err(JobError::Validation(_))
        ));
        assert!(matches!(
            parse(r#"[{ "EndpointUrl": "opc.tcp://a", "OpcNodes": [{ "Id": " " }] }]"#),
            Err(JobError::Validation(_))
        ));
        assert!(matches!(parse("{"), Err(JobError::Serialization(_))));
    }
}
