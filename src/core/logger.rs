//! Event logger: immediate broadcast, batched persistence.
//!
//! `record` stamps an event, hands it to the broadcast hub and queues it in the
//! job's batch. Batches are written to the job store when they reach the size
//! threshold or when the flush interval elapses, whichever comes first. Writes
//! for a job are serialized, so stored order always equals recorded order.
//!
//! A write that fails (most often because the job record has not been committed
//! yet) moves the events into the pending set instead of surfacing an error.
//! Later flushes and the reconciliation sweeper drain the pending set first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::config::LoggerSettings;
use crate::domain::{LogEvent, LogKind, Outcome};
use crate::error::StoreError;

use super::hub::BroadcastHub;
use super::job_store::JobStore;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Events waiting for their job record (or for a failed write to be retried)
#[derive(Debug, Clone)]
pub(crate) struct PendingEntry {
    pub(crate) events: Vec<LogEvent>,
    pub(crate) first_seen: Instant,
}

struct JobLogState {
    next_seq: u64,
    last_timestamp: Option<DateTime<Utc>>,
    batch: Vec<LogEvent>,
    timer_armed: bool,
}

struct JobLog {
    state: Mutex<JobLogState>,
    /// Held for the duration of every write to the store for this job
    flush_lock: Arc<AsyncMutex<()>>,
}

struct LoggerInner {
    store: Arc<dyn JobStore>,
    hub: BroadcastHub,
    settings: LoggerSettings,
    jobs: Mutex<HashMap<String, Arc<JobLog>>>,
    pending: Mutex<HashMap<String, PendingEntry>>,
}

/// Records job events, broadcasting them and persisting them in batches
#[derive(Clone)]
pub struct EventLogger {
    inner: Arc<LoggerInner>,
}

impl EventLogger {
    pub fn new(store: Arc<dyn JobStore>, hub: BroadcastHub, settings: LoggerSettings) -> Self {
        Self {
            inner: Arc::new(LoggerInner {
                store,
                hub,
                settings,
                jobs: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.store
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.inner.hub
    }

    pub fn settings(&self) -> &LoggerSettings {
        &self.inner.settings
    }

    /// Record a progress event
    pub fn record(&self, job_id: &str, kind: LogKind, message: impl Into<String>) -> LogEvent {
        self.emit(job_id, kind, message.into(), None)
    }

    /// Record the job's final event, carrying the explicit completion marker
    pub fn record_terminal(&self, job_id: &str, outcome: Outcome, message: impl Into<String>) -> LogEvent {
        self.emit(job_id, outcome.kind(), message.into(), Some(outcome))
    }

    pub fn info(&self, job_id: &str, message: impl Into<String>) -> LogEvent {
        self.record(job_id, LogKind::Info, message)
    }

    pub fn success(&self, job_id: &str, message: impl Into<String>) -> LogEvent {
        self.record(job_id, LogKind::Success, message)
    }

    pub fn error(&self, job_id: &str, message: impl Into<String>) -> LogEvent {
        self.record(job_id, LogKind::Error, message)
    }

    fn job_log(&self, job_id: &str) -> Arc<JobLog> {
        let mut jobs = lock(&self.inner.jobs);
        jobs.entry(job_id.to_string())
            .or_insert_with(|| {
                // Continue numbering if the hub still remembers this job
                let next_seq = self
                    .inner
                    .hub
                    .last_seq(job_id)
                    .map_or(0, |seq| seq + 1);
                Arc::new(JobLog {
                    state: Mutex::new(JobLogState {
                        next_seq,
                        last_timestamp: None,
                        batch: Vec::new(),
                        timer_armed: false,
                    }),
                    flush_lock: Arc::new(AsyncMutex::new(())),
                })
            })
            .clone()
    }

    fn emit(&self, job_id: &str, kind: LogKind, message: String, terminal: Option<Outcome>) -> LogEvent {
        let log = self.job_log(job_id);

        let (event, flush_now, arm_timer) = {
            let mut state = lock(&log.state);

            let mut event = LogEvent::new(job_id, state.next_seq, kind, message);
            if let Some(last) = state.last_timestamp {
                if event.timestamp < last {
                    event.timestamp = last;
                }
            }
            event.terminal = terminal;

            state.next_seq += 1;
            state.last_timestamp = Some(event.timestamp);

            // Publishing under the job lock keeps broadcast order equal to seq order
            self.inner.hub.publish(event.clone());

            state.batch.push(event.clone());
            let flush_now = state.batch.len() >= self.inner.settings.batch_size.max(1);
            let arm_timer = !flush_now && !state.timer_armed;
            if arm_timer {
                state.timer_armed = true;
            }
            (event, flush_now, arm_timer)
        };

        if flush_now {
            self.spawn_flush(job_id, None);
        } else if arm_timer {
            self.spawn_flush(job_id, Some(self.inner.settings.flush_interval()));
        }

        event
    }

    fn spawn_flush(&self, job_id: &str, delay: Option<std::time::Duration>) {
        // Without a runtime the batch simply waits for the next explicit flush
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let logger = self.clone();
        let job_id = job_id.to_string();
        runtime.spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            // A released job has nothing left to write
            let Some(log) = logger.tracked_log(&job_id) else {
                return;
            };
            let _ = logger.flush_log(&job_id, &log).await;
        });
    }

    fn tracked_log(&self, job_id: &str) -> Option<Arc<JobLog>> {
        lock(&self.inner.jobs).get(job_id).cloned()
    }

    /// Whether the logger still holds per-job state for `job_id`
    pub fn is_tracked(&self, job_id: &str) -> bool {
        lock(&self.inner.jobs).contains_key(job_id)
    }

    /// Write the job's pending and batched events to the store.
    ///
    /// Returns the number of events persisted. On failure the events are kept in
    /// the pending set for a later attempt and the error is returned for
    /// information only.
    pub async fn flush(&self, job_id: &str) -> Result<usize, StoreError> {
        let log = self.job_log(job_id);
        self.flush_log(job_id, &log).await
    }

    async fn flush_log(&self, job_id: &str, log: &JobLog) -> Result<usize, StoreError> {
        let _in_flight = log.flush_lock.lock().await;

        let batch = {
            let mut state = lock(&log.state);
            state.timer_armed = false;
            std::mem::take(&mut state.batch)
        };

        let (mut events, first_seen) = match self.take_pending(job_id) {
            Some(entry) => (entry.events, entry.first_seen),
            None => (Vec::new(), Instant::now()),
        };
        events.extend(batch);
        if events.is_empty() {
            return Ok(0);
        }

        match self.inner.store.append_events(job_id, &events).await {
            Ok(()) => {
                debug!(%job_id, count = events.len(), "Flushed events");
                Ok(events.len())
            }
            Err(e) => {
                if e.is_not_found() {
                    debug!(%job_id, count = events.len(), "Job record not committed yet, holding events");
                } else {
                    warn!(%job_id, count = events.len(), error = %e, "Failed to persist events, holding for reconciliation");
                }
                self.stash_pending(job_id, PendingEntry { events, first_seen });
                Err(e)
            }
        }
    }

    /// Drain the job's batch and wait for any in-flight write.
    ///
    /// Returns `Ok` once every event recorded before the call is durably
    /// stored. An error means some events are still held in the pending set.
    pub async fn wait_for_flush(&self, job_id: &str) -> Result<(), StoreError> {
        self.flush(job_id).await.map(|_| ())
    }

    /// Forget per-job bookkeeping once nothing is left to persist
    pub fn release(&self, job_id: &str) -> bool {
        let mut jobs = lock(&self.inner.jobs);
        let drained = jobs
            .get(job_id)
            .map(|log| lock(&log.state).batch.is_empty())
            .unwrap_or(true);

        if drained && !lock(&self.inner.pending).contains_key(job_id) {
            jobs.remove(job_id);
            return true;
        }
        false
    }

    /// Number of events held for a job awaiting reconciliation
    pub fn pending_count(&self, job_id: &str) -> usize {
        lock(&self.inner.pending)
            .get(job_id)
            .map(|entry| entry.events.len())
            .unwrap_or(0)
    }

    /// Jobs with events awaiting reconciliation
    pub fn pending_job_ids(&self) -> Vec<String> {
        lock(&self.inner.pending).keys().cloned().collect()
    }

    /// Acquire the job's write guard; stored order depends on holding it
    pub(crate) async fn write_guard(&self, job_id: &str) -> OwnedMutexGuard<()> {
        self.job_log(job_id).flush_lock.clone().lock_owned().await
    }

    pub(crate) fn take_pending(&self, job_id: &str) -> Option<PendingEntry> {
        lock(&self.inner.pending).remove(job_id)
    }

    /// Put events back into the pending set, enforcing the per-job cap
    pub(crate) fn stash_pending(&self, job_id: &str, mut entry: PendingEntry) {
        let cap = self.inner.settings.max_pending_per_job.max(1);
        if entry.events.len() > cap {
            let excess = entry.events.len() - cap;
            entry.events.drain(..excess);
            warn!(%job_id, dropped = excess, "Pending event cap reached, dropped oldest events");
        }

        let mut pending = lock(&self.inner.pending);
        match pending.get_mut(job_id) {
            // Only reachable if a writer bypassed the guard; keep stashed events first
            Some(existing) => {
                let newer = std::mem::take(&mut existing.events);
                existing.events = entry.events;
                existing.events.extend(newer);
                existing.first_seen = existing.first_seen.min(entry.first_seen);
            }
            None => {
                pending.insert(job_id.to_string(), entry);
            }
        }
    }

    /// Drop per-job bookkeeping for a job that will never exist
    pub(crate) fn forget(&self, job_id: &str) {
        lock(&self.inner.jobs).remove(job_id);
    }
}
