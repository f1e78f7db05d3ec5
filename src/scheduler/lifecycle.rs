//! Redundancy accounting over a job's per-worker processing status.
//!
//! Every decision here is recomputed from the heartbeat map on each call; no
//! counters are kept between calls. Two workers racing for the same active
//! slot may both run briefly, and the next heartbeat round demotes whichever
//! entry is younger. Stale entries stay in the map until a live replacement
//! of the same mode exists, so a slow heartbeat does not make a job flap.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::OrchestratorConfig;
use crate::scheduler::job::{
    ExecutionState, Job, JobStatus, ProcessMode, ProcessingStatus, WorkerId,
};

/// Turns a worker's heartbeat interval into a staleness threshold.
#[derive(Debug, Clone, Copy)]
pub struct LivenessPolicy {
    multiplier: u32,
    default_interval: Duration,
}

impl LivenessPolicy {
    pub fn new(multiplier: u32, default_interval: Duration) -> Self {
        Self {
            multiplier: multiplier.max(1),
            default_interval,
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(
            config.liveness_multiplier,
            Duration::from_millis(config.default_heartbeat_interval_ms),
        )
    }

    pub fn threshold(&self, interval_ms: Option<u64>) -> Duration {
        interval_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_interval)
            .saturating_mul(self.multiplier)
    }

    /// Whether a heartbeat at `last` is still fresh at `now`.
    pub fn is_fresh(&self, last: DateTime<Utc>, interval_ms: Option<u64>, now: DateTime<Utc>) -> bool {
        let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
        elapsed <= self.threshold(interval_ms)
    }

    pub fn is_live(&self, status: &ProcessingStatus, now: DateTime<Utc>) -> bool {
        self.is_fresh(status.last_heartbeat, status.heartbeat_interval_ms, now)
    }
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

/// Live and stale workers of one job, each list ordered oldest entry first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedundancySnapshot {
    pub live_active: Vec<WorkerId>,
    pub live_passive: Vec<WorkerId>,
    pub stale: Vec<WorkerId>,
}

/// What a worker reports about one job in a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub state: ExecutionState,
    pub mode: ProcessMode,
    pub heartbeat_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JobLifecycleTracker {
    liveness: LivenessPolicy,
}

impl JobLifecycleTracker {
    pub fn new(liveness: LivenessPolicy) -> Self {
        Self { liveness }
    }

    pub fn liveness(&self) -> &LivenessPolicy {
        &self.liveness
    }

    pub fn snapshot(&self, job: &Job, now: DateTime<Utc>) -> RedundancySnapshot {
        let mut entries: Vec<(&WorkerId, &ProcessingStatus)> =
            job.lifetime.processing_status.iter().collect();
        entries.sort_by(|a, b| a.1.since.cmp(&b.1.since).then_with(|| a.0.cmp(b.0)));

        let mut snapshot = RedundancySnapshot::default();
        for (worker_id, status) in entries {
            if !self.liveness.is_live(status, now) {
                snapshot.stale.push(worker_id.clone());
                continue;
            }
            match status.process_mode {
                ProcessMode::Active => snapshot.live_active.push(worker_id.clone()),
                ProcessMode::Passive => snapshot.live_passive.push(worker_id.clone()),
            }
        }
        snapshot
    }

    /// The role `worker_id` should hold for `job`, or `None` if it should not
    /// run the job at all.
    pub fn decide_role(&self, job: &Job, worker_id: &str, now: DateTime<Utc>) -> Option<ProcessMode> {
        let snapshot = self.snapshot(job, now);
        let desired_active = job.redundancy.desired_active as usize;
        let desired_passive = job.redundancy.desired_passive as usize;
        let active_deficit = desired_active.saturating_sub(snapshot.live_active.len());

        if let Some(pos) = snapshot.live_active.iter().position(|w| w == worker_id) {
            if pos < desired_active {
                return Some(ProcessMode::Active);
            }
            // Over-provisioned after a race: the youngest actives step down.
            return (snapshot.live_passive.len() < desired_passive).then_some(ProcessMode::Passive);
        }

        if let Some(pos) = snapshot.live_passive.iter().position(|w| w == worker_id) {
            if pos < active_deficit {
                return Some(ProcessMode::Active);
            }
            return (pos < active_deficit + desired_passive).then_some(ProcessMode::Passive);
        }

        if active_deficit > snapshot.live_passive.len() {
            return Some(ProcessMode::Active);
        }
        let passive_after_promotion = snapshot.live_passive.len() - active_deficit;
        (passive_after_promotion < desired_passive).then_some(ProcessMode::Passive)
    }

    /// Apply one heartbeat to the job's processing map and return the role
    /// the worker should continue in. `None` means the entry was dropped and
    /// the worker should stop the job.
    pub fn record_heartbeat(
        &self,
        job: &mut Job,
        worker_id: &str,
        report: HeartbeatReport,
        now: DateTime<Utc>,
    ) -> Option<ProcessMode> {
        if matches!(report.state, ExecutionState::Idle | ExecutionState::Failed)
            || job.lifetime.status != JobStatus::Active
        {
            job.lifetime.processing_status.remove(worker_id);
            return None;
        }

        let liveness = self.liveness;
        let entry = job
            .lifetime
            .processing_status
            .entry(worker_id.to_string())
            .or_insert_with(|| ProcessingStatus {
                last_heartbeat: now,
                last_known_state: report.state,
                process_mode: report.mode,
                since: now,
                heartbeat_interval_ms: report.heartbeat_interval_ms,
            });
        if !liveness.is_live(entry, now) {
            // Rejoining after going stale counts as a fresh entry.
            entry.since = now;
        }
        entry.last_heartbeat = now;
        entry.last_known_state = report.state;
        entry.process_mode = report.mode;
        entry.heartbeat_interval_ms = report.heartbeat_interval_ms;

        let role = self.decide_role(job, worker_id, now);
        match role {
            Some(mode) => {
                if let Some(entry) = job.lifetime.processing_status.get_mut(worker_id) {
                    if entry.process_mode != mode {
                        tracing::info!(
                            job_id = %job.id,
                            worker_id,
                            from = %entry.process_mode,
                            to = %mode,
                            "Switching process mode"
                        );
                    }
                    entry.process_mode = mode;
                }
            }
            None => {
                job.lifetime.processing_status.remove(worker_id);
            }
        }
        self.prune_stale(job, now);
        role
    }

    /// Drop stale entries whose mode already has enough live replacements.
    pub fn prune_stale(&self, job: &mut Job, now: DateTime<Utc>) -> usize {
        let snapshot = self.snapshot(job, now);
        let active_covered = snapshot.live_active.len() >= job.redundancy.desired_active as usize;
        let passive_covered = snapshot.live_passive.len() >= job.redundancy.desired_passive as usize;

        let map = &mut job.lifetime.processing_status;
        let before = map.len();
        for worker_id in &snapshot.stale {
            let covered = match map.get(worker_id).map(|s| s.process_mode) {
                Some(ProcessMode::Active) => active_covered,
                Some(ProcessMode::Passive) => passive_covered,
                None => false,
            };
            if covered {
                map.remove(worker_id);
                tracing::debug!(job_id = %job.id, worker_id = %worker_id, "Pruned stale processing entry");
            }
        }
        before - map.len()
    }
}

/// Aggregate status given how many units of work the configuration holds.
/// `Deleted` only ever comes from an explicit delete and is never undone here.
pub fn derive_status(current: JobStatus, unit_count: usize) -> JobStatus {
    match current {
        JobStatus::Deleted => JobStatus::Deleted,
        _ if unit_count > 0 => JobStatus::Active,
        _ => JobStatus::Canceled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_job(desired_active: u32, desired_passive: u32) -> Job {
        let mut job = Job::new("job-1").with_redundancy(desired_active, desired_passive);
        job.lifetime.status = JobStatus::Active;
        job
    }

    fn report(mode: ProcessMode) -> HeartbeatReport {
        HeartbeatReport {
            state: ExecutionState::Running,
            mode,
            heartbeat_interval_ms: Some(1_000),
        }
    }

    #[test]
    fn threshold_uses_reported_interval() {
        let policy = LivenessPolicy::new(3, Duration::from_secs(30));
        assert_eq!(policy.threshold(Some(1_000)), Duration::from_secs(3));
        assert_eq!(policy.threshold(None), Duration::from_secs(90));
    }

    #[test]
    fn derive_status_never_resurrects_deleted() {
        assert_eq!(derive_status(JobStatus::Canceled, 1), JobStatus::Active);
        assert_eq!(derive_status(JobStatus::Active, 0), JobStatus::Canceled);
        assert_eq!(derive_status(JobStatus::Deleted, 5), JobStatus::Deleted);
    }

    #[test]
    fn first_worker_gets_active_second_passive() {
        let tracker = JobLifecycleTracker::default();
        let now = Utc::now();
        let mut job = active_job(1, 1);

        assert_eq!(tracker.decide_role(&job, "w1", now), Some(ProcessMode::Active));
        tracker.record_heartbeat(&mut job, "w1", report(ProcessMode::Active), now);

        assert_eq!(tracker.decide_role(&job, "w2", now), Some(ProcessMode::Passive));
        tracker.record_heartbeat(&mut job, "w2", report(ProcessMode::Passive), now);

        assert_eq!(tracker.decide_role(&job, "w3", now), None);
    }

    #[test]
    fn stale_active_lets_passive_promote() {
        let tracker = JobLifecycleTracker::default();
        let t0 = Utc::now();
        let mut job = active_job(1, 1);
        tracker.record_heartbeat(&mut job, "w1", report(ProcessMode::Active), t0);
        tracker.record_heartbeat(&mut job, "w2", report(ProcessMode::Passive), t0);

        let later = t0 + chrono::Duration::seconds(10);
        let role = tracker.record_heartbeat(&mut job, "w2", report(ProcessMode::Passive), later);
        assert_eq!(role, Some(ProcessMode::Active));
        // The stale active entry is gone once its replacement is live.
        assert!(!job.lifetime.processing_status.contains_key("w1"));
    }

    #[test]
    fn stale_entry_kept_without_replacement() {
        let tracker = JobLifecycleTracker::default();
        let t0 = Utc::now();
        let mut job = active_job(1, 0);
        tracker.record_heartbeat(&mut job, "w1", report(ProcessMode::Active), t0);

        let later = t0 + chrono::Duration::seconds(10);
        assert_eq!(tracker.prune_stale(&mut job, later), 0);
        assert!(job.lifetime.processing_status.contains_key("w1"));
        assert_eq!(tracker.snapshot(&job, later).stale, vec!["w1".to_string()]);
    }

    #[test]
    fn over_provisioned_active_is_released() {
        let tracker = JobLifecycleTracker::default();
        let now = Utc::now();
        let mut job = active_job(1, 0);
        tracker.record_heartbeat(&mut job, "a", report(ProcessMode::Active), now);
        let role = tracker.record_heartbeat(&mut job, "b", report(ProcessMode::Active), now);
        assert_eq!(role, None);
        assert_eq!(tracker.snapshot(&job, now).live_active, vec!["a".to_string()]);
    }

    #[test]
    fn idle_report_removes_entry() {
        let tracker = JobLifecycleTracker::default();
        let now = Utc::now();
        let mut job = active_job(1, 0);
        tracker.record_heartbeat(&mut job, "w1", report(ProcessMode::Active), now);
        let idle = HeartbeatReport {
            state: ExecutionState::Idle,
            ..report(ProcessMode::Active)
        };
        assert_eq!(tracker.record_heartbeat(&mut job, "w1", idle, now), None);
        assert!(job.lifetime.processing_status.is_empty());
    }
}
