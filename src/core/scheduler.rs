//! "Run this at that time" collaborators.
//!
//! - [`TokioScheduler`]: in-process timers on the tokio runtime, for the
//!   long-running `watch` mode
//! - [`ManualScheduler`]: keeps jobs until an explicit sweep runs the due
//!   ones, for one-shot CLI invocations and tests
//!
//! Jobs are keyed; scheduling a key that is already pending keeps the
//! existing job and drops the new one.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::task::AbortHandle;
use tracing::debug;

use super::clock::Clock;

/// A unit of deferred work
pub type ScheduledJob = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Identifies a scheduled job for cancellation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScheduleHandle {
    pub key: String,
    pub run_at: DateTime<Utc>,
}

/// Deferred execution of jobs at a wall-clock time
pub trait Scheduler: Send + Sync {
    /// Register `job` to run at `run_at`. Does not block.
    fn schedule(&self, key: &str, run_at: DateTime<Utc>, job: ScheduledJob) -> ScheduleHandle;

    /// Cancel a pending job; false if it already ran or was never scheduled
    fn cancel(&self, handle: &ScheduleHandle) -> bool;

    /// Whether a job is pending under this key
    fn is_scheduled(&self, key: &str) -> bool;
}

/// Tokio timer per job
pub struct TokioScheduler {
    clock: Arc<dyn Clock>,
    timers: Arc<Mutex<HashMap<String, (DateTime<Utc>, AbortHandle)>>>,
}

impl TokioScheduler {
    /// Create a new scheduler (must be used inside a tokio runtime)
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of pending timers
    pub fn pending(&self) -> usize {
        let timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        timers.values().filter(|(_, h)| !h.is_finished()).count()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, key: &str, run_at: DateTime<Utc>, job: ScheduledJob) -> ScheduleHandle {
        // Held across spawn so the timer cannot fire and deregister before
        // it is registered
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());

        if let Some((existing_at, handle)) = timers.get(key) {
            if !handle.is_finished() {
                debug!(key, "Job already scheduled");
                return ScheduleHandle {
                    key: key.to_string(),
                    run_at: *existing_at,
                };
            }
        }

        let delay = (run_at - self.clock.now()).to_std().unwrap_or_default();
        let registry = Arc::clone(&self.timers);
        let owned_key = key.to_string();

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            registry
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&owned_key);
            job.await;
        });

        timers.insert(key.to_string(), (run_at, task.abort_handle()));
        debug!(key, %run_at, delay_secs = delay.as_secs(), "Job scheduled");

        ScheduleHandle {
            key: key.to_string(),
            run_at,
        }
    }

    fn cancel(&self, handle: &ScheduleHandle) -> bool {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        match timers.remove(&handle.key) {
            Some((_, abort)) if !abort.is_finished() => {
                abort.abort();
                true
            }
            _ => false,
        }
    }

    fn is_scheduled(&self, key: &str) -> bool {
        let timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        timers.get(key).is_some_and(|(_, h)| !h.is_finished())
    }
}

/// Holds jobs until [`ManualScheduler::run_due`] is called
#[derive(Default)]
pub struct ManualScheduler {
    jobs: Mutex<BTreeMap<String, (DateTime<Utc>, ScheduledJob)>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every job whose time has come, in key order. Returns how many ran.
    pub async fn run_due(&self, now: DateTime<Utc>) -> usize {
        let due: Vec<ScheduledJob> = {
            let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            let keys: Vec<String> = jobs
                .iter()
                .filter(|(_, (run_at, _))| *run_at <= now)
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter()
                .filter_map(|key| jobs.remove(key).map(|(_, job)| job))
                .collect()
        };

        let count = due.len();
        for job in due {
            job.await;
        }
        count
    }

    /// Number of pending jobs
    pub fn pending(&self) -> usize {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, key: &str, run_at: DateTime<Utc>, job: ScheduledJob) -> ScheduleHandle {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let run_at = match jobs.get(key) {
            Some((existing_at, _)) => *existing_at,
            None => {
                jobs.insert(key.to_string(), (run_at, job));
                run_at
            }
        };

        ScheduleHandle {
            key: key.to_string(),
            run_at,
        }
    }

    fn cancel(&self, handle: &ScheduleHandle) -> bool {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle.key)
            .is_some()
    }

    fn is_scheduled(&self, key: &str) -> bool {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }
}
