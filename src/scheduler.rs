//! Periodic job scheduler
//!
//! Named interval jobs with run statistics: poll reconciles, update
//! sweeps, session sweeps, token cleanup and the alert retry wake all
//! hang off this.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info};

type JobFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<(), String>> + Send>> + Send + Sync>;

/// Job execution statistics
#[derive(Debug, Clone, Default)]
pub struct JobStats {
    pub run_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_duration_ms: u64,
}

/// A scheduled job
pub struct Job {
    pub name: String,
    pub interval: Duration,
    pub enabled: AtomicBool,
    pub run_immediately: bool,
    stats: RwLock<JobStats>,
    run: JobFn,
}

impl Job {
    pub fn stats(&self) -> JobStats {
        self.stats.read().clone()
    }
}

/// Scheduler over all periodic jobs
#[derive(Default)]
pub struct Scheduler {
    jobs: RwLock<Vec<Arc<Job>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_job<F, Fut>(
        &self,
        name: impl Into<String>,
        interval: Duration,
        run_immediately: bool,
        f: F,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let job = Arc::new(Job {
            name: name.into(),
            interval,
            enabled: AtomicBool::new(true),
            run_immediately,
            stats: RwLock::new(JobStats::default()),
            run: Arc::new(move || Box::pin(f())),
        });
        self.jobs.write().push(job);
    }

    pub fn job_names(&self) -> Vec<String> {
        self.jobs.read().iter().map(|j| j.name.clone()).collect()
    }

    pub fn stats_for(&self, name: &str) -> Option<JobStats> {
        self.jobs
            .read()
            .iter()
            .find(|j| j.name == name)
            .map(|j| j.stats())
    }

    /// Spawn one loop per registered job. Jobs registered after start
    /// are not picked up; register everything at boot.
    pub fn start(self: &Arc<Self>) {
        for job in self.jobs.read().iter().cloned() {
            tokio::spawn(run_job(job));
        }
        info!("scheduler started: {:?}", self.job_names());
    }
}

async fn run_job(job: Arc<Job>) {
    let mut interval = tokio::time::interval(job.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    if !job.run_immediately {
        interval.tick().await; // consume the immediate first tick
    }

    loop {
        interval.tick().await;

        if !job.enabled.load(Ordering::SeqCst) {
            continue;
        }

        let started = Instant::now();
        let result = (job.run)().await;
        let elapsed = started.elapsed().as_millis() as u64;

        let mut stats = job.stats.write();
        stats.run_count += 1;
        stats.last_duration_ms = elapsed;
        match result {
            Ok(()) => {
                stats.success_count += 1;
                debug!(job = %job.name, elapsed_ms = elapsed, "job completed");
            }
            Err(e) => {
                stats.failure_count += 1;
                error!(job = %job.name, "job failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_job_runs_and_records_stats() {
        let scheduler = Arc::new(Scheduler::new());
        let counter = Arc::new(AtomicU32::new(0));
        let job_counter = counter.clone();

        scheduler.add_job("tick", Duration::from_millis(10), true, move || {
            let counter = job_counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        scheduler.start();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(counter.load(Ordering::SeqCst) >= 2);

        let stats = scheduler.stats_for("tick").unwrap();
        assert!(stats.run_count >= 2);
        assert_eq!(stats.failure_count, 0);
    }

    #[tokio::test]
    async fn test_failures_counted() {
        let scheduler = Arc::new(Scheduler::new());
        scheduler.add_job("flaky", Duration::from_millis(10), true, || async {
            Err("boom".to_string())
        });
        scheduler.start();

        tokio::time::sleep(Duration::from_millis(40)).await;
        let stats = scheduler.stats_for("flaky").unwrap();
        assert!(stats.failure_count >= 1);
        assert_eq!(stats.success_count, 0);
    }

    #[tokio::test]
    async fn test_disabled_job_skips() {
        let scheduler = Arc::new(Scheduler::new());
        let counter = Arc::new(AtomicU32::new(0));
        let job_counter = counter.clone();

        scheduler.add_job("off", Duration::from_millis(10), true, move || {
            let counter = job_counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        for job in scheduler.jobs.read().iter() {
            job.enabled.store(false, Ordering::SeqCst);
        }
        scheduler.start();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
