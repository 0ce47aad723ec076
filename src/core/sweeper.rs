//! Reconciliation sweeper for events recorded before their job record existed.
//!
//! Each sweep walks the logger's pending set. For every job whose record is now
//! visible in the store, all held events are appended in original order as one
//! write, under the same per-job guard the logger's own flushes use. Entries
//! older than the pending TTL whose record never appeared are dropped with a
//! warning.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::SweeperSettings;

use super::background::BackgroundTask;
use super::logger::EventLogger;

/// Outcome of a single sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Jobs whose pending events were written this sweep
    pub reconciled_jobs: usize,
    pub persisted_events: usize,
    /// Jobs still waiting for a record (or for a failing store)
    pub still_pending: usize,
    /// Events dropped because their record never appeared
    pub expired_events: usize,
}

impl SweepReport {
    pub fn is_idle(&self) -> bool {
        *self == SweepReport::default()
    }
}

/// Periodically drains the logger's pending set into the job store
#[derive(Clone)]
pub struct ReconciliationSweeper {
    logger: EventLogger,
    interval: Duration,
}

impl ReconciliationSweeper {
    pub fn new(logger: EventLogger, settings: &SweeperSettings) -> Self {
        Self {
            logger,
            interval: settings.interval(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one reconciliation pass
    pub async fn sweep_once(&self) -> SweepReport {
        let ttl = self.logger.settings().pending_ttl();
        let store = self.logger.store().clone();
        let mut report = SweepReport::default();

        let mut finished = Vec::new();
        for job_id in self.logger.pending_job_ids() {
            let _guard = self.logger.write_guard(&job_id).await;

            // A logger flush may have drained it while we waited for the guard
            let Some(entry) = self.logger.take_pending(&job_id) else {
                continue;
            };

            match store.get(&job_id).await {
                Ok(Some(_)) => match store.append_events(&job_id, &entry.events).await {
                    Ok(()) => {
                        debug!(%job_id, count = entry.events.len(), "Reconciled pending events");
                        report.reconciled_jobs += 1;
                        report.persisted_events += entry.events.len();
                        if self.logger.hub().completion(&job_id).is_some() {
                            finished.push(job_id.clone());
                        }
                    }
                    Err(e) => {
                        warn!(%job_id, error = %e, "Reconciliation write failed, will retry");
                        self.logger.stash_pending(&job_id, entry);
                        report.still_pending += 1;
                    }
                },
                Ok(None) if entry.first_seen.elapsed() >= ttl => {
                    warn!(
                        %job_id,
                        dropped = entry.events.len(),
                        "Job record never appeared, dropping pending events"
                    );
                    report.expired_events += entry.events.len();
                    self.logger.forget(&job_id);
                }
                Ok(None) => {
                    self.logger.stash_pending(&job_id, entry);
                    report.still_pending += 1;
                }
                Err(e) => {
                    warn!(%job_id, error = %e, "Could not look up job record during reconciliation");
                    self.logger.stash_pending(&job_id, entry);
                    report.still_pending += 1;
                }
            }
        }

        // Completed jobs record nothing further
        for job_id in finished {
            self.logger.release(&job_id);
        }

        if report.reconciled_jobs > 0 || report.expired_events > 0 {
            info!(
                reconciled = report.reconciled_jobs,
                persisted = report.persisted_events,
                expired = report.expired_events,
                pending = report.still_pending,
                "Reconciliation sweep"
            );
        }
        report
    }

    /// Run sweeps on the configured interval until stopped
    pub fn start(self) -> BackgroundTask {
        BackgroundTask::spawn("reconciliation-sweeper", move |token| async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep_once().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::{HubSettings, LoggerSettings};
    use crate::core::hub::BroadcastHub;
    use crate::core::job_store::{JobStore, MemoryJobStore};
    use crate::domain::{Job, JobParams, Outcome};

    fn setup(ttl_secs: u64) -> (Arc<MemoryJobStore>, EventLogger, ReconciliationSweeper) {
        let store = Arc::new(MemoryJobStore::new());
        let logger = EventLogger::new(
            store.clone(),
            BroadcastHub::new(HubSettings::default()),
            LoggerSettings {
                batch_size: 100,
                flush_interval_ms: 60_000,
                pending_ttl_secs: ttl_secs,
                ..Default::default()
            },
        );
        let sweeper = ReconciliationSweeper::new(logger.clone(), &SweeperSettings::default());
        (store, logger, sweeper)
    }

    #[tokio::test]
    async fn test_reconciles_once_record_exists() {
        let (store, logger, sweeper) = setup(600);
        let job = Job::new(JobParams::default());

        logger.info(&job.id, "first");
        logger.info(&job.id, "second");
        let _ = logger.wait_for_flush(&job.id).await;

        let report = sweeper.sweep_once().await;
        assert_eq!(report.still_pending, 1);
        assert_eq!(report.persisted_events, 0);

        store.create(&job).await.unwrap();
        let report = sweeper.sweep_once().await;
        assert_eq!(report.reconciled_jobs, 1);
        assert_eq!(report.persisted_events, 2);
        assert_eq!(logger.pending_count(&job.id), 0);

        let seqs: Vec<u64> = store.events(&job.id).await.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1]);

        assert!(sweeper.sweep_once().await.is_idle());
    }

    #[tokio::test]
    async fn test_completed_job_released_after_reconcile() {
        let (store, logger, sweeper) = setup(600);
        let job = Job::new(JobParams::default());

        logger.info(&job.id, "queued");
        logger.record_terminal(&job.id, Outcome::Failed, "Deployment failed: clone failed");
        let _ = logger.wait_for_flush(&job.id).await;
        assert!(logger.is_tracked(&job.id));

        store.create(&job).await.unwrap();
        let report = sweeper.sweep_once().await;
        assert_eq!(report.persisted_events, 2);
        assert!(!logger.is_tracked(&job.id));
    }

    #[tokio::test]
    async fn test_expired_entries_are_dropped() {
        let (_store, logger, sweeper) = setup(0);

        logger.info("never-created", "orphan");
        let _ = logger.wait_for_flush("never-created").await;

        let report = sweeper.sweep_once().await;
        assert_eq!(report.expired_events, 1);
        assert!(logger.pending_job_ids().is_empty());
    }

    #[tokio::test]
    async fn test_background_sweeper_stops() {
        let (_store, logger, _) = setup(600);
        let sweeper = ReconciliationSweeper::new(
            logger,
            &SweeperSettings { interval_ms: 10 },
        );

        let task = sweeper.start();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!task.is_finished());
        task.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_interval_sweeper_keeps_running() {
        let (_store, logger, _) = setup(600);
        let sweeper = ReconciliationSweeper::new(logger, &SweeperSettings { interval_ms: 0 });

        let task = sweeper.start();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!task.is_finished());
        task.stop().await.unwrap();
    }
}
