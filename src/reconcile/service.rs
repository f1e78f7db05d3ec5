use std::sync::Arc;

use crate::error::{JobError, Result};
use crate::reconcile::codec::JobConfiguration;
use crate::reconcile::publisher::{EngineConfig, GroupKey, PublishedItem, PublisherJobConfig};
use crate::reconcile::reconciler::{self, PublishedNode};
use crate::scheduler::job::{Demand, Job, JobStatus, RedundancyConfig};
use crate::scheduler::orchestrator::{JobOrchestrator, UpsertOutcome};
use crate::store::JobQuery;

/// Settings stamped on a publisher job when its first item arrives.
#[derive(Debug, Clone, Default)]
pub struct PublisherJobDefaults {
    pub demands: Vec<Demand>,
    pub redundancy: RedundancyConfig,
    pub engine: EngineConfig,
}

/// Producer-facing API for publisher jobs. One job per endpoint; the
/// endpoint id is the job id.
#[derive(Clone)]
pub struct PublisherJobService {
    orchestrator: Arc<JobOrchestrator>,
    defaults: PublisherJobDefaults,
}

impl PublisherJobService {
    pub fn new(orchestrator: Arc<JobOrchestrator>) -> Self {
        Self::with_defaults(orchestrator, PublisherJobDefaults::default())
    }

    pub fn with_defaults(orchestrator: Arc<JobOrchestrator>, defaults: PublisherJobDefaults) -> Self {
        Self {
            orchestrator,
            defaults,
        }
    }

    /// Add or replace one published item. Returns the job as written.
    pub async fn add_published_item(
        &self,
        endpoint_id: &str,
        group: &GroupKey,
        item: PublishedItem,
    ) -> Result<Job> {
        require(endpoint_id, "endpoint id")?;
        require(&group.connection.endpoint_url, "endpoint url")?;
        require(&item.node_id, "node id")?;

        let outcome = self
            .upsert_config(endpoint_id, |config| {
                reconciler::add_or_update_item(config, group, item.clone())
            })
            .await?;

        if outcome.written {
            tracing::info!(endpoint_id, node_id = %item.node_id, "Published item added");
        }
        Ok(outcome.job)
    }

    /// Make `items` the endpoint's whole node set. Nodes not listed are
    /// removed; an empty list unpublishes everything. Returns whether the job
    /// changed.
    pub async fn replace_published_items(
        &self,
        endpoint_id: &str,
        items: &[(GroupKey, PublishedItem)],
    ) -> Result<bool> {
        require(endpoint_id, "endpoint id")?;
        for (group, item) in items {
            require(&group.connection.endpoint_url, "endpoint url")?;
            require(&item.node_id, "node id")?;
        }
        if items.is_empty() {
            return self.unpublish_all(endpoint_id).await;
        }

        let outcome = self
            .upsert_config(endpoint_id, |config| reconciler::replace_items(config, items))
            .await?;
        if outcome.written {
            tracing::info!(endpoint_id, nodes = items.len(), "Published items replaced");
        }
        Ok(outcome.written)
    }

    /// Remove every item of the endpoint, leaving its job `Canceled`.
    /// Returns whether the job changed.
    pub async fn unpublish_all(&self, endpoint_id: &str) -> Result<bool> {
        require(endpoint_id, "endpoint id")?;

        let codecs = Arc::clone(self.orchestrator.codecs());
        let outcome = self
            .orchestrator
            .update_job(endpoint_id, |job| {
                reconciler::apply_to_job(job, &codecs, reconciler::clear_items)
            })
            .await;
        match outcome {
            Ok(outcome) => {
                if outcome.written {
                    tracing::info!(endpoint_id, "All published items removed");
                }
                Ok(outcome.written)
            }
            Err(JobError::JobNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Endpoints that currently publish at least one item.
    pub async fn list_endpoints(&self) -> Result<Vec<String>> {
        let jobs = self
            .orchestrator
            .query_all_jobs(JobQuery {
                status: Some(JobStatus::Active),
                type_tag: Some(PublisherJobConfig::TYPE_TAG.to_string()),
                ..Default::default()
            })
            .await?;
        Ok(jobs.into_iter().map(|job| job.id).collect())
    }

    /// Upsert the endpoint's job, stamping the defaults on a fresh one before
    /// `edit` runs against its configuration.
    async fn upsert_config<F>(&self, endpoint_id: &str, edit: F) -> Result<UpsertOutcome>
    where
        F: Fn(&mut PublisherJobConfig) -> bool + Send + Sync,
    {
        let codecs = Arc::clone(self.orchestrator.codecs());
        let defaults = &self.defaults;
        self.orchestrator
            .upsert_job(endpoint_id, |job| {
                let fresh = job.config.is_empty();
                if fresh {
                    job.demands = defaults.demands.clone();
                    job.redundancy = defaults.redundancy;
                }
                reconciler::apply_to_job(job, &codecs, |config: &mut PublisherJobConfig| {
                    if fresh {
                        config.engine = defaults.engine.clone();
                    }
                    edit(config)
                })
            })
            .await
    }

    /// Remove one published item. Returns whether the job changed; a missing
    /// job or item is not an error.
    pub async fn remove_published_item(&self, endpoint_id: &str, node_id: &str) -> Result<bool> {
        require(endpoint_id, "endpoint id")?;
        require(node_id, "node id")?;

        let codecs = Arc::clone(self.orchestrator.codecs());
        let outcome = self
            .orchestrator
            .update_job(endpoint_id, |job| {
                reconciler::apply_to_job(job, &codecs, |config| {
                    match reconciler::find_connection(config, node_id) {
                        Some(connection) => reconciler::remove_item(config, &connection, node_id),
                        None => false,
                    }
                })
            })
            .await;

        match outcome {
            Ok(outcome) => {
                if outcome.written {
                    tracing::info!(endpoint_id, node_id, "Published item removed");
                }
                Ok(outcome.written)
            }
            Err(JobError::JobNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn list_published_items(&self, endpoint_id: &str) -> Result<Vec<PublishedNode>> {
        require(endpoint_id, "endpoint id")?;

        let job = match self.orchestrator.get_job(endpoint_id).await {
            Ok(job) => job,
            Err(JobError::JobNotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let config: PublisherJobConfig = self.orchestrator.codecs().decode_or_default(&job.config)?;
        Ok(reconciler::list_items(&config))
    }
}

fn require(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(JobError::Validation(format!("{field} is required")));
    }
    Ok(())
}
