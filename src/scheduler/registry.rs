use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{JobError, Result};
use crate::retry::RetryPolicy;
use crate::scheduler::job::WorkerId;
use crate::scheduler::lifecycle::LivenessPolicy;
use crate::store::{collect_all, paginate, Page, WorkerStore};

/// A known worker and what it can do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub worker_id: WorkerId,
    pub capabilities: HashMap<String, String>,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub heartbeat_interval_ms: Option<u64>,
}

impl WorkerInfo {
    pub fn new(worker_id: impl Into<WorkerId>, capabilities: HashMap<String, String>) -> Self {
        let now = Utc::now();
        Self {
            worker_id: worker_id.into(),
            capabilities,
            registered_at: now,
            last_seen: now,
            heartbeat_interval_ms: None,
        }
    }

    pub fn is_alive(&self, liveness: &LivenessPolicy, now: DateTime<Utc>) -> bool {
        liveness.is_fresh(self.last_seen, self.heartbeat_interval_ms, now)
    }
}

/// Tracks workers and their liveness. Records are created on first contact,
/// refreshed on every heartbeat, and removed only on request.
#[derive(Clone)]
pub struct WorkerRegistry {
    store: Arc<dyn WorkerStore>,
    liveness: LivenessPolicy,
    retry: RetryPolicy,
    page_size: usize,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn WorkerStore>, liveness: LivenessPolicy, page_size: usize) -> Self {
        Self {
            store,
            liveness,
            retry: RetryPolicy::Unbounded,
            page_size: page_size.max(1),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Record contact from a worker, creating it on first sight. Capabilities
    /// replace the stored set when given.
    pub async fn heartbeat(
        &self,
        worker_id: &str,
        capabilities: Option<&HashMap<String, String>>,
        heartbeat_interval_ms: Option<u64>,
    ) -> Result<WorkerInfo> {
        if worker_id.trim().is_empty() {
            return Err(JobError::Validation("worker id is required".to_string()));
        }

        let mut retries = 0;
        loop {
            let now = Utc::now();
            let attempt = match self.store.get_worker(worker_id).await? {
                None => {
                    let mut worker =
                        WorkerInfo::new(worker_id, capabilities.cloned().unwrap_or_default());
                    worker.heartbeat_interval_ms = heartbeat_interval_ms;
                    let created = self.store.try_create_worker(worker).await;
                    if created.is_ok() {
                        tracing::info!(worker_id, "Worker registered");
                    }
                    created
                }
                Some(current) => {
                    let mut worker = current.value;
                    worker.last_seen = now;
                    if let Some(caps) = capabilities {
                        worker.capabilities = caps.clone();
                    }
                    if heartbeat_interval_ms.is_some() {
                        worker.heartbeat_interval_ms = heartbeat_interval_ms;
                    }
                    self.store.try_update_worker(worker, current.version).await
                }
            };

            match attempt {
                Ok(written) => return Ok(written.value),
                Err(e)
                    if (e.is_conflict() || matches!(e, JobError::WorkerNotFound(_)))
                        && self.retry.allows(retries) =>
                {
                    retries += 1;
                    tracing::debug!(worker_id, retries, error = %e, "Retrying worker heartbeat");
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn get_worker(&self, worker_id: &str) -> Result<WorkerInfo> {
        self.store
            .get_worker(worker_id)
            .await?
            .map(|v| v.value)
            .ok_or_else(|| JobError::WorkerNotFound(worker_id.to_string()))
    }

    /// Explicit removal; workers are never dropped automatically.
    pub async fn remove_worker(&self, worker_id: &str) -> Result<()> {
        if self.store.remove_worker(worker_id).await? {
            tracing::info!(worker_id, "Worker removed");
            Ok(())
        } else {
            Err(JobError::WorkerNotFound(worker_id.to_string()))
        }
    }

    pub async fn list_workers(
        &self,
        continuation: Option<&str>,
        page_size: usize,
    ) -> Result<Page<WorkerInfo>> {
        self.store.list_workers(continuation, page_size).await
    }

    pub async fn list_all_workers(&self) -> Result<Vec<WorkerInfo>> {
        let store = Arc::clone(&self.store);
        collect_all(paginate(self.page_size, move |token, size| {
            let store = Arc::clone(&store);
            async move { store.list_workers(token.as_deref(), size).await }
        }))
        .await
    }

    pub async fn live_workers(&self, now: DateTime<Utc>) -> Result<Vec<WorkerInfo>> {
        Ok(self
            .list_all_workers()
            .await?
            .into_iter()
            .filter(|w| w.is_alive(&self.liveness, now))
            .collect())
    }

    pub async fn is_alive(&self, worker_id: &str, now: DateTime<Utc>) -> Result<bool> {
        Ok(self.get_worker(worker_id).await?.is_alive(&self.liveness, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    fn registry() -> WorkerRegistry {
        let liveness = LivenessPolicy::new(3, Duration::from_millis(1_000));
        WorkerRegistry::new(Arc::new(MemoryStore::new()), liveness, 2)
    }

    fn caps(key: &str, value: &str) -> HashMap<String, String> {
        HashMap::from([(key.to_string(), value.to_string())])
    }

    #[tokio::test]
    async fn first_contact_registers_worker() {
        let registry = registry();
        let worker = registry
            .heartbeat("w1", Some(&caps("site", "north")), Some(500))
            .await
            .unwrap();
        assert_eq!(worker.capabilities["site"], "north");
        assert_eq!(worker.heartbeat_interval_ms, Some(500));
        assert_eq!(registry.get_worker("w1").await.unwrap(), worker);
    }

    #[tokio::test]
    async fn heartbeat_keeps_fields_not_reported() {
        let registry = registry();
        registry
            .heartbeat("w1", Some(&caps("site", "north")), Some(500))
            .await
            .unwrap();
        let worker = registry.heartbeat("w1", None, None).await.unwrap();
        assert_eq!(worker.capabilities["site"], "north");
        assert_eq!(worker.heartbeat_interval_ms, Some(500));

        let worker = registry
            .heartbeat("w1", Some(&caps("site", "south")), None)
            .await
            .unwrap();
        assert_eq!(worker.capabilities["site"], "south");
    }

    #[tokio::test]
    async fn liveness_uses_reported_interval() {
        let registry = registry();
        let worker = registry.heartbeat("w1", None, Some(100)).await.unwrap();
        registry.heartbeat("w2", None, None).await.unwrap();

        let later = worker.last_seen + ChronoDuration::milliseconds(500);
        assert!(!registry.is_alive("w1", later).await.unwrap());
        assert!(registry.is_alive("w2", later).await.unwrap());

        let live = registry.live_workers(later).await.unwrap();
        let ids: Vec<_> = live.iter().map(|w| w.worker_id.as_str()).collect();
        assert_eq!(ids, vec!["w2"]);
    }

    #[tokio::test]
    async fn listing_spans_pages_and_removal_is_explicit() {
        let registry = registry();
        for id in ["w1", "w2", "w3", "w4", "w5"] {
            registry.heartbeat(id, None, None).await.unwrap();
        }
        assert_eq!(registry.list_all_workers().await.unwrap().len(), 5);

        let first = registry.list_workers(None, 2).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert!(first.continuation.is_some());

        registry.remove_worker("w3").await.unwrap();
        assert_eq!(registry.list_all_workers().await.unwrap().len(), 4);
        assert!(matches!(
            registry.remove_worker("w3").await,
            Err(JobError::WorkerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn empty_worker_id_is_rejected() {
        let err = registry().heartbeat(" ", None, None).await.unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
    }
}
