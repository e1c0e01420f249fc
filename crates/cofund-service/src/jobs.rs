//! Periodic batch jobs: withdrawal scheduling and processing, boost expiry and
//! the stale pending pledge sweep.

use crate::config::JobsConfig;
use chrono::{DateTime, Utc};
use cofund_core::{CofundEngine, CofundError};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    WithdrawalSchedule,
    WithdrawalProcess,
    BoostExpiry,
    StalePledgeSweep,
}

impl Job {
    pub const ALL: [Job; 4] = [
        Job::WithdrawalSchedule,
        Job::WithdrawalProcess,
        Job::BoostExpiry,
        Job::StalePledgeSweep,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Job::WithdrawalSchedule => "withdrawal_schedule",
            Job::WithdrawalProcess => "withdrawal_process",
            Job::BoostExpiry => "boost_expiry",
            Job::StalePledgeSweep => "stale_pledge_sweep",
        }
    }

    fn period(self, config: &JobsConfig) -> Duration {
        let secs = match self {
            Job::WithdrawalSchedule => config.withdrawal_schedule_interval_secs,
            Job::WithdrawalProcess => config.withdrawal_process_interval_secs,
            Job::BoostExpiry => config.boost_expiry_interval_secs,
            Job::StalePledgeSweep => config.stale_pledge_sweep_interval_secs,
        };
        Duration::from_secs(secs.max(1))
    }
}

/// Runs every [`Job`] on its own interval until stopped.
pub struct JobScheduler {
    engine: CofundEngine,
    config: JobsConfig,
    stop_tx: watch::Sender<bool>,
}

impl JobScheduler {
    pub fn new(engine: CofundEngine, config: JobsConfig) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            engine,
            config,
            stop_tx,
        })
    }

    /// Spawn one loop per job.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        tracing::info!("job scheduler started");
        Job::ALL
            .into_iter()
            .map(|job| {
                let scheduler = Arc::clone(self);
                let stop_rx = self.stop_tx.subscribe();
                tokio::spawn(async move { scheduler.job_loop(job, stop_rx).await })
            })
            .collect()
    }

    pub fn stop(&self) {
        // No receivers means no loop is running.
        let _ = self.stop_tx.send(true);
    }

    async fn job_loop(&self, job: Job, mut stop_rx: watch::Receiver<bool>) {
        let mut ticker = interval(job.period(&self.config));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once(job, Utc::now()).await {
                        tracing::error!(job = job.name(), error = %e, "background job failed");
                    }
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::debug!(job = job.name(), "job loop stopped");
    }

    /// Run one pass of `job` as of `now`.
    pub async fn run_once(&self, job: Job, now: DateTime<Utc>) -> Result<(), CofundError> {
        match job {
            Job::WithdrawalSchedule => {
                self.engine.withdrawals().schedule(now).await?;
            }
            Job::WithdrawalProcess => {
                self.engine.withdrawals().process(now).await?;
            }
            Job::BoostExpiry => {
                self.engine.boosts().expire_due(now).await?;
            }
            Job::StalePledgeSweep => {
                self.engine.expire_stale_pledges(now).await?;
            }
        }
        Ok(())
    }
}
