use std::sync::Arc;

use crate::error::JobError;
use crate::scheduler::job::ProcessMode;

/// Observer of job host transitions. Every method defaults to a no-op.
pub trait JobEventListener: Send + Sync {
    fn on_job_started(&self, _job_id: &str, _mode: ProcessMode) {}

    fn on_job_stopped(&self, _job_id: &str) {}

    fn on_job_failed(&self, _job_id: &str, _error: &JobError) {}
}

/// Fan-out to a fixed list of listeners, in registration order.
#[derive(Clone, Default)]
pub struct JobEvents {
    listeners: Vec<Arc<dyn JobEventListener>>,
}

impl JobEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listener(mut self, listener: Arc<dyn JobEventListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn started(&self, job_id: &str, mode: ProcessMode) {
        for listener in &self.listeners {
            listener.on_job_started(job_id, mode);
        }
    }

    pub fn stopped(&self, job_id: &str) {
        for listener in &self.listeners {
            listener.on_job_stopped(job_id);
        }
    }

    pub fn failed(&self, job_id: &str, error: &JobError) {
        for listener in &self.listeners {
            listener.on_job_failed(job_id, error);
        }
    }
}

/// Writes every transition to the log.
pub struct LoggingListener;

impl JobEventListener for LoggingListener {
    fn on_job_started(&self, job_id: &str, mode: ProcessMode) {
        tracing::info!(job_id, mode = %mode, "Job started");
    }

    fn on_job_stopped(&self, job_id: &str) {
        tracing::info!(job_id, "Job stopped");
    }

    fn on_job_failed(&self, job_id: &str, error: &JobError) {
        tracing::error!(job_id, error = %error, "Job failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl JobEventListener for Recorder {
        fn on_job_started(&self, job_id: &str, mode: ProcessMode) {
            self.0.lock().unwrap().push(format!("started {job_id} {mode}"));
        }

        fn on_job_failed(&self, job_id: &str, _error: &JobError) {
            self.0.lock().unwrap().push(format!("failed {job_id}"));
        }
    }

    #[test]
    fn dispatches_to_every_listener_in_order() {
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let events = JobEvents::new()
            .with_listener(first.clone())
            .with_listener(second.clone());

        events.started("j1", ProcessMode::Active);
        events.stopped("j1");
        events.failed("j1", &JobError::Transient("x".into()));

        let expected = vec!["started j1 active".to_string(), "failed j1".to_string()];
        assert_eq!(*first.0.lock().unwrap(), expected);
        assert_eq!(*second.0.lock().unwrap(), expected);
        assert_eq!(events.len(), 2);
    }
}
