//! Tracking of cluster jobs launched on behalf of workers.
//!
//! Some runners hand the worker to a cluster scheduler and print
//! `Submitted application <id>` while launching. The job id is picked up
//! from the launch output and tracked here, so that an external stop of
//! that job (reported explicitly or found by polling) terminates the
//! owning worker handle.

use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use regex::Regex;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;

use super::handle::RemoteWorkerHandle;

static SUBMITTED_APP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Submitted application (\w+)").expect("static regex is valid")
});

/// Extract a cluster job id from a launch output line.
pub fn scan_job_id(line: &str) -> Option<&str> {
    SUBMITTED_APP
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// State of a cluster job as reported by a [`JobStatusProbe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Running,
    Finished,
    Failed(String),
    Killed(String),
    Unknown,
}

impl JobState {
    /// The stop reason, if the job is no longer running.
    pub fn stop_reason(&self) -> Option<String> {
        match self {
            JobState::Finished => Some("job finished".to_string()),
            JobState::Failed(why) => Some(format!("job failed: {why}")),
            JobState::Killed(why) => Some(format!("job killed: {why}")),
            JobState::Running | JobState::Unknown => None,
        }
    }
}

/// Queries the cluster for a job's state.
pub trait JobStatusProbe: Send + Sync {
    fn job_state<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, Result<JobState>>;
}

/// Job id -> owning worker handle.
#[derive(Default)]
pub struct JobMonitor {
    jobs: Mutex<FxHashMap<String, Weak<RemoteWorkerHandle>>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl JobMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn jobs_map(&self) -> MutexGuard<'_, FxHashMap<String, Weak<RemoteWorkerHandle>>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_job(&self, job_id: impl Into<String>, owner: Weak<RemoteWorkerHandle>) {
        let job_id = job_id.into();
        info!(%job_id, "tracking cluster job");
        self.jobs_map().insert(job_id, owner);
    }

    pub fn remove_job(&self, job_id: &str) -> bool {
        self.jobs_map().remove(job_id).is_some()
    }

    /// Forget every job owned by `owner`, and any job whose owner is gone.
    ///
    /// Compares by pointer so it is usable from the owner's `Drop`.
    pub fn remove_owner(&self, owner: &Weak<RemoteWorkerHandle>) {
        self.jobs_map()
            .retain(|_, tracked| !Weak::ptr_eq(tracked, owner) && tracked.strong_count() > 0);
    }

    pub fn owner(&self, job_id: &str) -> Option<Arc<RemoteWorkerHandle>> {
        self.jobs_map().get(job_id)?.upgrade()
    }

    /// Tracked job ids, sorted.
    pub fn jobs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs_map().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// A job was observed stopping. Returns whether an owner was notified.
    pub fn report_job_stopped(&self, job_id: &str, reason: &str) -> bool {
        let owner = self.jobs_map().remove(job_id).and_then(|w| w.upgrade());
        match owner {
            Some(handle) => {
                warn!(%job_id, group_id = handle.group_id(), reason, "cluster job stopped");
                handle.process_stopped(format!("{job_id}: {reason}"));
                true
            }
            None => {
                debug!(%job_id, "stop reported for untracked job");
                false
            }
        }
    }

    fn prune(&self) {
        self.jobs_map().retain(|_, owner| owner.strong_count() > 0);
    }

    /// Poll `probe` for every tracked job every `interval`.
    ///
    /// Replaces a previously started poller. The poller holds only a weak
    /// reference and exits once the monitor is dropped.
    pub fn spawn_polling(self: &Arc<Self>, probe: Arc<dyn JobStatusProbe>, interval: Duration) {
        let monitor = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(monitor) = monitor.upgrade() else {
                    return;
                };
                monitor.poll_once(probe.as_ref()).await;
            }
        });
        let previous = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Check every tracked job once.
    pub async fn poll_once(&self, probe: &dyn JobStatusProbe) {
        self.prune();
        for job_id in self.jobs() {
            match probe.job_state(&job_id).await {
                Ok(state) => {
                    if let Some(reason) = state.stop_reason() {
                        self.report_job_stopped(&job_id, &reason);
                    }
                }
                Err(e) => debug!(%job_id, error = %e, "job status probe failed"),
            }
        }
    }

    pub fn shutdown(&self) {
        let poller = self.poller.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(poller) = poller {
            poller.abort();
        }
    }
}

impl Drop for JobMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_job_id() {
        assert_eq!(
            scan_job_id("INFO Client: Submitted application application_1700000000000_0042"),
            Some("application_1700000000000_0042")
        );
        assert_eq!(scan_job_id("Submitting application to ResourceManager"), None);
        assert_eq!(scan_job_id(""), None);
    }

    #[test]
    fn test_stop_reasons() {
        assert!(JobState::Running.stop_reason().is_none());
        assert!(JobState::Unknown.stop_reason().is_none());
        assert_eq!(
            JobState::Killed("by admin".to_string()).stop_reason().as_deref(),
            Some("job killed: by admin")
        );
    }

    #[test]
    fn test_untracked_job_report() {
        let monitor = JobMonitor::new();
        assert!(!monitor.report_job_stopped("application_1_1", "killed"));
    }

    #[test]
    fn test_dead_owner_is_pruned() {
        let monitor = JobMonitor::new();
        monitor.add_job("application_1_2", Weak::new());
        assert_eq!(monitor.jobs(), vec!["application_1_2".to_string()]);
        assert!(monitor.owner("application_1_2").is_none());
        monitor.prune();
        assert!(monitor.jobs().is_empty());
    }
}
