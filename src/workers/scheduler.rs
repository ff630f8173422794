//! Cron-driven job scheduler.

use async_trait::async_trait;
use chrono::Utc;
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::{Result, WorkerError};

/// Base backoff after a job failure
const BACKOFF_BASE_SECS: u64 = 5;
/// Backoff ceiling
const BACKOFF_MAX_SECS: u64 = 600;

/// One schedulable background job
#[async_trait]
pub trait Job: Send + Sync {
    /// Job name for logs
    fn name(&self) -> &str;

    /// Run one cycle
    async fn run(&self) -> anyhow::Result<()>;
}

struct Registered {
    schedule: Schedule,
    job: Arc<dyn Job>,
}

/// Registers jobs against cron cadences and spawns one task per job
#[derive(Default)]
pub struct Scheduler {
    jobs: Vec<Registered>,
}

impl Scheduler {
    /// Create an empty scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job on a cadence
    pub fn register(&mut self, cron_expr: &str, job: Arc<dyn Job>) -> Result<()> {
        let schedule =
            Schedule::from_str(cron_expr).map_err(|e| WorkerError::InvalidCronExpression {
                expr: cron_expr.to_string(),
                detail: e.to_string(),
            })?;
        self.jobs.push(Registered { schedule, job });
        Ok(())
    }

    /// Spawn every registered job onto the runtime. Each job loops
    /// forever: sleep until the next cron firing, run, and on failure back
    /// off exponentially before resuming the cadence.
    pub fn spawn_all(self) -> Vec<JoinHandle<()>> {
        self.jobs
            .into_iter()
            .map(|registered| tokio::spawn(run_loop(registered)))
            .collect()
    }

    /// Number of registered jobs
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether no jobs are registered
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

async fn run_loop(registered: Registered) {
    let name = registered.job.name().to_string();
    let mut consecutive_failures = 0u32;

    loop {
        let Some(next) = registered.schedule.upcoming(Utc).next() else {
            log::error!("Job {name}: cadence yields no future firings, stopping");
            return;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(wait).await;

        match registered.job.run().await {
            Ok(()) => {
                consecutive_failures = 0;
            }
            Err(e) => {
                consecutive_failures += 1;
                let backoff = backoff_secs(consecutive_failures);
                log::error!(
                    "Job {name} failed ({consecutive_failures} consecutive): {e}; \
                     backing off {backoff}s"
                );
                tokio::time::sleep(Duration::from_secs(backoff)).await;
            }
        }
    }
}

fn backoff_secs(consecutive_failures: u32) -> u64 {
    BACKOFF_BASE_SECS
        .saturating_mul(2u64.saturating_pow(consecutive_failures.saturating_sub(1).min(16)))
        .min(BACKOFF_MAX_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl Job for Noop {
        fn name(&self) -> &str {
            "noop"
        }
        async fn run(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_register_valid_cadence() {
        let mut scheduler = Scheduler::new();
        scheduler.register("0 * * * * *", Arc::new(Noop)).unwrap();
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn test_register_rejects_garbage() {
        let mut scheduler = Scheduler::new();
        assert!(matches!(
            scheduler.register("every five minutes", Arc::new(Noop)),
            Err(WorkerError::InvalidCronExpression { .. })
        ));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        assert_eq!(backoff_secs(1), 5);
        assert_eq!(backoff_secs(2), 10);
        assert_eq!(backoff_secs(3), 20);
        assert_eq!(backoff_secs(20), BACKOFF_MAX_SECS);
    }
}
