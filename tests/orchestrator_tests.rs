
use std::collections::BTreeSet;
use std::sync::Arc;

use proptest::prelude::*;

use edge_jobs::config::OrchestratorConfig;
use edge_jobs::error::JobError;
use edge_jobs::reconcile::codec::TypeTagRegistry;
use edge_jobs::scheduler::job::{Demand, JobConfigPayload, JobStatus};
use edge_jobs::scheduler::orchestrator::JobOrchestrator;
use edge_jobs::store::{JobQuery, MemoryStore};

use test_harness::{publish, test_orchestrator, test_service};

fn orchestrator_with_scan_factor(factor: usize) -> JobOrchestrator {
    let store = Arc::new(MemoryStore::with_scan_factor(factor));
    JobOrchestrator::new(
        store.clone(),
        store,
        Arc::new(TypeTagRegistry::with_defaults()),
        OrchestratorConfig::default(),
    )
}

#[tokio::test]
async fn test_upsert_creates_missing_job() {
    let orchestrator = test_orchestrator();

    let outcome = orchestrator
        .upsert_job("job-1", |job| {
            job.name = "line 1".to_string();
            Ok(true)
        })
        .await
        .unwrap();

    assert!(outcome.written);
    assert!(outcome.version.is_some());
    assert_eq!(outcome.job.id, "job-1");
    assert_eq!(orchestrator.get_job("job-1").await.unwrap().name, "line 1");
}

#[tokio::test]
async fn test_upsert_noop_skips_write() {
    let orchestrator = test_orchestrator();
    let first = orchestrator
        .upsert_job("job-1", |_| Ok(true))
        .await
        .unwrap();

    let second = orchestrator
        .upsert_job("job-1", |_| Ok(false))
        .await
        .unwrap();
    assert!(!second.written);
    assert_eq!(second.version, first.version);

    // A mutation that changes nothing is not written either.
    let third = orchestrator
        .upsert_job("job-1", |_| Ok(true))
        .await
        .unwrap();
    assert!(!third.written);
    assert_eq!(third.version, first.version);
}

#[tokio::test]
async fn test_noop_on_missing_job_creates_nothing() {
    let orchestrator = test_orchestrator();
    let outcome = orchestrator
        .upsert_job("ghost", |_| Ok(false))
        .await
        .unwrap();
    assert!(!outcome.written);
    assert!(outcome.version.is_none());
    assert!(matches!(
        orchestrator.get_job("ghost").await,
        Err(JobError::JobNotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_upserts_lose_no_update() {
    let orchestrator = test_orchestrator();

    let mut handles = Vec::new();
    for i in 0..16 {
        let orchestrator = Arc::clone(&orchestrator);
        handles.push(tokio::spawn(async move {
            orchestrator
                .upsert_job("shared", |job| {
                    job.demands.push(Demand::equals(format!("key-{i}"), "v"));
                    Ok(true)
                })
                .await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().unwrap().written);
    }

    let job = orchestrator.get_job("shared").await.unwrap();
    let keys: BTreeSet<String> = job.demands.into_iter().map(|d| d.key).collect();
    assert_eq!(keys.len(), 16);
}

#[tokio::test]
async fn test_update_job_requires_existing_job() {
    let orchestrator = test_orchestrator();
    let err = orchestrator
        .update_job("missing", |_| Ok(true))
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::JobNotFound(_)));
}

#[tokio::test]
async fn test_empty_id_is_validation_error() {
    let orchestrator = test_orchestrator();
    let err = orchestrator.upsert_job("  ", |_| Ok(true)).await.unwrap_err();
    assert!(matches!(err, JobError::Validation(_)));
}

#[tokio::test]
async fn test_unknown_config_type_surfaces() {
    let orchestrator = test_orchestrator();
    let err = orchestrator
        .upsert_job("legacy", |job| {
            job.config = JobConfigPayload::new("LegacyJob", b"{}".to_vec());
            Ok(true)
        })
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::UnknownJobType(_)));
}

#[tokio::test]
async fn test_active_without_work_is_canceled() {
    let orchestrator = test_orchestrator();
    let outcome = orchestrator
        .upsert_job("empty", |job| {
            job.lifetime.status = JobStatus::Active;
            Ok(true)
        })
        .await
        .unwrap();
    assert_eq!(outcome.job.status(), JobStatus::Canceled);
}

#[tokio::test]
async fn test_delete_is_explicit_and_sticks() {
    let orchestrator = test_orchestrator();
    let service = test_service(&orchestrator);
    let job = publish(&service, "ep1", "A").await;
    assert_eq!(job.status(), JobStatus::Active);

    let deleted = orchestrator.delete_job("ep1").await.unwrap();
    assert_eq!(deleted.status(), JobStatus::Deleted);

    let job = publish(&service, "ep1", "B").await;
    assert_eq!(job.status(), JobStatus::Deleted);

    assert!(matches!(
        orchestrator.delete_job("nope").await,
        Err(JobError::JobNotFound(_))
    ));
}

#[tokio::test]
async fn test_query_filters_by_status() {
    let orchestrator = test_orchestrator();
    let service = test_service(&orchestrator);
    publish(&service, "ep1", "A").await;
    publish(&service, "ep2", "A").await;
    orchestrator.upsert_job("idle", |_| Ok(true)).await.unwrap();

    let active = orchestrator
        .query_all_jobs(JobQuery::with_status(JobStatus::Active))
        .await
        .unwrap();
    let ids: Vec<_> = active.iter().map(|j| j.id.as_str()).collect();
    assert_eq!(ids, vec!["ep1", "ep2"]);
    assert_eq!(orchestrator.list_all_jobs().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_sparse_filter_tolerates_empty_pages() {
    let orchestrator = orchestrator_with_scan_factor(1);
    for i in 0..10 {
        orchestrator
            .upsert_job(&format!("job-{i:02}"), |job| {
                job.name = if i == 9 { "wanted" } else { "other" }.to_string();
                Ok(true)
            })
            .await
            .unwrap();
    }

    let query = JobQuery {
        name: Some("wanted".to_string()),
        ..Default::default()
    };
    let first = orchestrator.query_jobs(&query, None, 2).await.unwrap();
    assert!(first.items.is_empty());
    assert!(first.continuation.is_some());

    let all = orchestrator.query_all_jobs(query).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].id, "job-09");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Following continuation tokens yields every job exactly once, for
    /// any page size.
    #[test]
    fn pagination_is_complete(count in 0usize..40, page_size in 1usize..12, scan_factor in 1usize..4) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let (expected, listed) = rt.block_on(async {
            let orchestrator = orchestrator_with_scan_factor(scan_factor);
            let mut expected = Vec::new();
            for i in 0..count {
                let id = format!("job-{i:03}");
                orchestrator
                    .upsert_job(&id, |job| {
                        job.name = if i % 3 == 0 { "a" } else { "b" }.to_string();
                        Ok(true)
                    })
                    .await
                    .unwrap();
                if i % 3 == 0 {
                    expected.push(id);
                }
            }

            let query = JobQuery { name: Some("a".to_string()), ..Default::default() };
            let mut listed = Vec::new();
            let mut token: Option<String> = None;
            loop {
                let page = orchestrator.query_jobs(&query, token.as_deref(), page_size).await.unwrap();
                prop_assert!(page.items.len() <= page_size);
                listed.extend(page.items.into_iter().map(|j| j.id));
                match page.continuation {
                    Some(next) => token = Some(next),
                    None => break,
                }
            }
            Ok((expected, listed))
        })?;

        let unique: BTreeSet<_> = listed.iter().cloned().collect();
        prop_assert_eq!(unique.len(), listed.len());
        prop_assert_eq!(listed, expected);
    }
}
