//! Diff-based edits of a publisher job's writer groups.
//!
//! Every edit touches a single item and leaves the rest of the
//! configuration untouched, so concurrent producers editing different items
//! of the same job converge through the upsert loop.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::reconcile::codec::{JobConfiguration, TypeTagRegistry};
use crate::reconcile::publisher::{
    ConnectionIdentity, GroupKey, PublishedItem, PublisherJobConfig, WriterGroup,
};
use crate::scheduler::job::Job;
use crate::scheduler::lifecycle::derive_status;

/// An item together with the group it is published in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedNode {
    pub group: GroupKey,
    pub item: PublishedItem,
}

/// Place `item` in the group identified by `key`, replacing any previous
/// entry with the same node id wherever it lived. Returns whether the
/// configuration changed.
pub fn add_or_update_item(config: &mut PublisherJobConfig, key: &GroupKey, item: PublishedItem) -> bool {
    let unchanged = config
        .groups
        .iter()
        .find(|g| g.matches(key))
        .and_then(|g| g.item(&item.node_id))
        .is_some_and(|existing| *existing == item);
    if unchanged {
        return false;
    }

    for group in &mut config.groups {
        group.items.retain(|i| i.node_id != item.node_id);
    }
    match config.groups.iter_mut().find(|g| g.matches(key)) {
        Some(group) => group.items.push(item),
        None => {
            let mut group = WriterGroup::new(key.clone());
            group.items.push(item);
            config.groups.push(group);
        }
    }
    config.groups.retain(|g| !g.items.is_empty());
    true
}

/// Remove `node_id` from every group on `connection`, dropping groups left
/// empty. Returns whether anything was removed.
pub fn remove_item(config: &mut PublisherJobConfig, connection: &ConnectionIdentity, node_id: &str) -> bool {
    let mut removed = false;
    for group in config.groups.iter_mut().filter(|g| &g.connection == connection) {
        let before = group.items.len();
        group.items.retain(|i| i.node_id != node_id);
        removed |= group.items.len() != before;
    }
    if removed {
        config.groups.retain(|g| !g.items.is_empty());
    }
    removed
}

/// Make `items` the complete item set, in order, keeping the engine
/// settings. Returns whether the configuration changed.
pub fn replace_items(config: &mut PublisherJobConfig, items: &[(GroupKey, PublishedItem)]) -> bool {
    let mut next = PublisherJobConfig {
        groups: Vec::new(),
        engine: config.engine.clone(),
    };
    for (key, item) in items {
        add_or_update_item(&mut next, key, item.clone());
    }
    if next == *config {
        return false;
    }
    *config = next;
    true
}

/// Drop every group. Returns whether there was anything to drop.
pub fn clear_items(config: &mut PublisherJobConfig) -> bool {
    if config.groups.is_empty() {
        return false;
    }
    config.groups.clear();
    true
}

/// Connection of the group currently holding `node_id`.
pub fn find_connection(config: &PublisherJobConfig, node_id: &str) -> Option<ConnectionIdentity> {
    config
        .groups
        .iter()
        .find(|g| g.item(node_id).is_some())
        .map(|g| g.connection.clone())
}

pub fn list_items(config: &PublisherJobConfig) -> Vec<PublishedNode> {
    config
        .groups
        .iter()
        .flat_map(|group| {
            let key = group.key();
            group.items.iter().map(move |item| PublishedNode {
                group: key.clone(),
                item: item.clone(),
            })
        })
        .collect()
}

/// Decode the job's publisher configuration, apply `edit`, and write the
/// result back with the job status derived from the remaining work.
///
/// A job whose payload is still the empty placeholder starts from the
/// default configuration. Returns `false` without touching the job when
/// `edit` reports no change.
pub fn apply_to_job<F>(job: &mut Job, codecs: &TypeTagRegistry, edit: F) -> Result<bool>
where
    F: FnOnce(&mut PublisherJobConfig) -> bool,
{
    let mut config: PublisherJobConfig = codecs.decode_or_default(&job.config)?;
    if !edit(&mut config) {
        return Ok(false);
    }
    job.config = codecs.encode(&config)?;
    let status = derive_status(job.lifetime.status, config.unit_count());
    if status != job.lifetime.status {
        tracing::info!(job_id = %job.id, from = %job.lifetime.status, to = %status, "Job status changed");
        job.lifetime.status = status;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(url: &str, interval: u64) -> GroupKey {
        GroupKey::new(ConnectionIdentity::new(url), Some(interval))
    }

    #[test]
    fn add_appends_to_matching_group() {
        let mut config = PublisherJobConfig::default();
        assert!(add_or_update_item(&mut config, &key("ep1", 1000), PublishedItem::new("A")));
        assert!(add_or_update_item(&mut config, &key("ep1", 1000), PublishedItem::new("B")));
        assert_eq!(config.groups.len(), 1);
        let ids: Vec<_> = config.groups[0].items.iter().map(|i| i.node_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);
    }

    #[test]
    fn replace_keeps_engine_and_drops_missing_items() {
        let mut config = PublisherJobConfig::default();
        config.engine.batch_size = 7;
        add_or_update_item(&mut config, &key("ep1", 1000), PublishedItem::new("A"));
        add_or_update_item(&mut config, &key("ep1", 500), PublishedItem::new("B"));

        let items = vec![(key("ep1", 1000), PublishedItem::new("A"))];
        assert!(replace_items(&mut config, &items));
        assert_eq!(config.groups.len(), 1);
        assert_eq!(config.engine.batch_size, 7);
        assert!(!replace_items(&mut config, &items));

        assert!(clear_items(&mut config));
        assert!(!clear_items(&mut config));
        assert_eq!(config.unit_count(), 0);
    }

    #[test]
    fn identical_add_is_no_change() {
        let mut config = PublisherJobConfig::default();
        let item = PublishedItem::new("A").with_sampling_interval(100);
        assert!(add_or_update_item(&mut config, &key("ep1", 1000), item.clone()));
        let snapshot = config.clone();
        assert!(!add_or_update_item(&mut config, &key("ep1", 1000), item));
        assert_eq!(config, snapshot);
    }

    #[test]
    fn moving_item_to_other_interval_drops_old_group() {
        let mut config = PublisherJobConfig::default();
        add_or_update_item(&mut config, &key("ep1", 1000), PublishedItem::new("A"));
        assert!(add_or_update_item(&mut config, &key("ep1", 500), PublishedItem::new("A")));
        assert_eq!(config.groups.len(), 1);
        assert_eq!(config.groups[0].publishing_interval_ms, Some(500));
    }

    #[test]
    fn update_in_place_keeps_position() {
        let mut config = PublisherJobConfig::default();
        add_or_update_item(&mut config, &key("ep1", 1000), PublishedItem::new("A"));
        add_or_update_item(&mut config, &key("ep2", 1000), PublishedItem::new("B"));
        assert!(add_or_update_item(
            &mut config,
            &key("ep1", 1000),
            PublishedItem::new("A").with_display_name("pump")
        ));
        assert_eq!(config.groups[0].connection.endpoint_url, "ep1");
        assert_eq!(config.groups[0].items[0].display_name.as_deref(), Some("pump"));
    }

    #[test]
    fn remove_only_touches_matching_connection() {
        let mut config = PublisherJobConfig::default();
        add_or_update_item(&mut config, &key("ep1", 1000), PublishedItem::new("A"));
        add_or_update_item(&mut config, &key("ep2", 1000), PublishedItem::new("B"));

        assert!(!remove_item(&mut config, &ConnectionIdentity::new("ep1"), "B"));
        assert!(remove_item(&mut config, &ConnectionIdentity::new("ep1"), "A"));
        assert_eq!(config.groups.len(), 1);
        assert_eq!(config.groups[0].connection.endpoint_url, "ep2");
        assert_eq!(find_connection(&config, "B"), Some(ConnectionIdentity::new("ep2")));
        assert_eq!(find_connection(&config, "A"), None);
    }

    #[test]
    fn list_projects_group_keys() {
        let mut config = PublisherJobConfig::default();
        add_or_update_item(&mut config, &key("ep1", 1000), PublishedItem::new("A"));
        add_or_update_item(&mut config, &key("ep1", 250), PublishedItem::new("B"));
        let listed = list_items(&config);
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].group, key("ep1", 250));
        assert_eq!(listed[1].item.node_id, "B");
    }
}
