//! Producer side of job configuration: typed payload codecs and diff-based
//! edits of publisher jobs.

pub mod codec;
pub mod published_nodes;
pub mod publisher;
pub mod reconciler;
pub mod service;

pub use codec::{JobConfiguration, TypeTagRegistry};
pub use publisher::{ConnectionIdentity, GroupKey, PublishedItem, PublisherJobConfig, WriterGroup};
pub use reconciler::PublishedNode;
pub use service::{PublisherJobDefaults, PublisherJobService};
