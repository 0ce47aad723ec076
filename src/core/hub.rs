//! Per-job broadcast hub with replay buffering.
//!
//! Each job id gets its own channel: a bounded FIFO of recent events for late
//! subscribers plus the set of live subscriber queues. Publishing never waits
//! on a subscriber; every subscriber has its own bounded queue and one that
//! stays full is disconnected. Channels are guarded individually, so jobs never
//! contend with each other beyond a short registry lookup.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use futures::Stream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::config::HubSettings;
use crate::domain::{CompletionEvent, LogEvent};
use crate::error::DeliveryError;

use super::background::BackgroundTask;

/// Message delivered to a subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// A recorded log event
    Event(LogEvent),

    /// The job finished; the stream closes after the grace delay
    Completion(CompletionEvent),

    /// Keepalive for idle connections
    Heartbeat,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct SubscriberSlot {
    tx: mpsc::Sender<HubMessage>,
    /// Consecutive deliveries that found the queue full
    strikes: u32,
}

#[derive(Default)]
struct JobChannel {
    buffer: VecDeque<LogEvent>,
    subscribers: HashMap<u64, SubscriberSlot>,
    completion: Option<CompletionEvent>,
    completed_at: Option<Instant>,
    last_seq: Option<u64>,
    /// Set once removed from the registry; holders must re-resolve
    evicted: bool,
}

impl JobChannel {
    fn is_idle(&self) -> bool {
        self.subscribers.is_empty() && self.buffer.is_empty() && self.completion.is_none()
    }
}

struct HubInner {
    settings: HubSettings,
    channels: Mutex<HashMap<String, Arc<Mutex<JobChannel>>>>,
    next_subscriber_id: AtomicU64,
}

impl HubInner {
    fn channel(&self, job_id: &str) -> Arc<Mutex<JobChannel>> {
        lock(&self.channels)
            .entry(job_id.to_string())
            .or_default()
            .clone()
    }

    fn existing_channel(&self, job_id: &str) -> Option<Arc<Mutex<JobChannel>>> {
        lock(&self.channels).get(job_id).cloned()
    }

    /// Run `f` against the live (non-evicted) channel for `job_id`
    fn with_channel<R>(&self, job_id: &str, mut f: impl FnMut(&mut JobChannel) -> R) -> R {
        loop {
            let channel = self.channel(job_id);
            let mut guard = lock(&channel);
            if guard.evicted {
                continue;
            }
            return f(&mut guard);
        }
    }

    fn remove_subscriber(&self, job_id: &str, subscriber_id: u64) -> bool {
        match self.existing_channel(job_id) {
            Some(channel) => lock(&channel).subscribers.remove(&subscriber_id).is_some(),
            None => false,
        }
    }

    /// Drop every subscriber of a job; their streams end once drained
    fn close_subscribers(&self, job_id: &str) -> usize {
        match self.existing_channel(job_id) {
            Some(channel) => {
                let mut guard = lock(&channel);
                let closed = guard.subscribers.len();
                guard.subscribers.clear();
                closed
            }
            None => 0,
        }
    }
}

/// Try to hand a message to a subscriber without blocking
fn deliver(slot: &mut SubscriberSlot, message: HubMessage, max_strikes: u32) -> Result<(), DeliveryError> {
    match slot.tx.try_send(message) {
        Ok(()) => {
            slot.strikes = 0;
            Ok(())
        }
        Err(TrySendError::Full(_)) => {
            slot.strikes += 1;
            if slot.strikes >= max_strikes {
                Err(DeliveryError::QueueFull)
            } else {
                Ok(())
            }
        }
        Err(TrySendError::Closed(_)) => Err(DeliveryError::Closed),
    }
}

/// Send to every subscriber, pruning the ones that cannot keep up or are gone
fn fan_out(job_id: &str, channel: &mut JobChannel, message: &HubMessage, max_strikes: u32) -> usize {
    let mut dead = Vec::new();
    for (id, slot) in channel.subscribers.iter_mut() {
        if let Err(e) = deliver(slot, message.clone(), max_strikes) {
            dead.push((*id, e));
        }
    }
    for (id, reason) in &dead {
        channel.subscribers.remove(id);
        debug!(%job_id, subscriber = id, %reason, "Subscriber pruned");
    }
    channel.subscribers.len()
}

/// In-process pub/sub for job log events
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    pub fn new(settings: HubSettings) -> Self {
        Self {
            inner: Arc::new(HubInner {
                settings,
                channels: Mutex::new(HashMap::new()),
                next_subscriber_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn settings(&self) -> &HubSettings {
        &self.inner.settings
    }

    /// Attach to a job's stream.
    ///
    /// Returns the handle for live delivery plus the events currently buffered.
    /// Nothing published after the snapshot is missed and nothing in the
    /// snapshot is delivered again live. If the job already completed, the
    /// completion is queued immediately and the subscription closes after the
    /// grace delay.
    pub fn subscribe(&self, job_id: &str) -> (Subscription, Vec<LogEvent>) {
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.settings.queue_capacity.max(1));

        let (replay, already_completed) = self.inner.with_channel(job_id, |channel| {
            let replay: Vec<LogEvent> = channel.buffer.iter().cloned().collect();
            let completed = match channel.completion {
                Some(ref completion) => {
                    let _ = tx.try_send(HubMessage::Completion(completion.clone()));
                    true
                }
                None => false,
            };
            channel.subscribers.insert(
                id,
                SubscriberSlot {
                    tx: tx.clone(),
                    strikes: 0,
                },
            );
            (replay, completed)
        });
        drop(tx);

        if already_completed {
            self.schedule_subscriber_close(job_id, id);
        }

        debug!(%job_id, subscriber = id, replayed = replay.len(), "Subscriber attached");

        let subscription = Subscription {
            job_id: job_id.to_string(),
            id,
            rx,
            hub: Arc::downgrade(&self.inner),
        };
        (subscription, replay)
    }

    /// Buffer an event and push it to every live subscriber of its job.
    ///
    /// Returns the number of subscribers still attached after delivery. An event
    /// carrying a completion signal also synthesizes the completion message and
    /// schedules the force-close of all subscriptions.
    pub fn publish(&self, event: LogEvent) -> usize {
        let settings = &self.inner.settings;
        let job_id = event.job_id.clone();
        let outcome = event.completion_outcome(settings.legacy_completion_matching);

        let (attached, completed_now) = self.inner.with_channel(&job_id, |channel| {
            channel.last_seq = Some(
                channel
                    .last_seq
                    .map_or(event.seq, |last| last.max(event.seq)),
            );
            channel.buffer.push_back(event.clone());
            while channel.buffer.len() > settings.replay_capacity {
                channel.buffer.pop_front();
            }

            let message = HubMessage::Event(event.clone());
            let mut attached = fan_out(&job_id, channel, &message, settings.max_full_strikes);

            let mut completed_now = false;
            if let (Some(outcome), None) = (outcome, channel.completion.as_ref()) {
                let completion = CompletionEvent::for_outcome(outcome, &event.message);
                attached = fan_out(
                    &job_id,
                    channel,
                    &HubMessage::Completion(completion.clone()),
                    settings.max_full_strikes,
                );
                channel.completion = Some(completion);
                channel.completed_at = Some(Instant::now());
                completed_now = true;
            }
            (attached, completed_now)
        });

        if completed_now {
            info!(%job_id, subscribers = attached, "Job completed, closing streams after grace period");
            self.schedule_job_close(&job_id);
        }
        attached
    }

    /// Detach a subscription without affecting the job or other subscribers
    pub fn unsubscribe(&self, subscription: Subscription) {
        drop(subscription);
    }

    /// Events currently buffered for a job
    pub fn replay(&self, job_id: &str) -> Vec<LogEvent> {
        self.inner
            .existing_channel(job_id)
            .map(|channel| lock(&channel).buffer.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Highest sequence number published for a job
    pub fn last_seq(&self, job_id: &str) -> Option<u64> {
        self.inner
            .existing_channel(job_id)
            .and_then(|channel| lock(&channel).last_seq)
    }

    pub fn subscriber_count(&self, job_id: &str) -> usize {
        self.inner
            .existing_channel(job_id)
            .map(|channel| lock(&channel).subscribers.len())
            .unwrap_or(0)
    }

    /// Whether the hub still tracks a job
    pub fn is_tracked(&self, job_id: &str) -> bool {
        self.inner.existing_channel(job_id).is_some()
    }

    pub fn completion(&self, job_id: &str) -> Option<CompletionEvent> {
        self.inner
            .existing_channel(job_id)
            .and_then(|channel| lock(&channel).completion.clone())
    }

    /// Send keepalives, prune dead subscribers and evict expired channels.
    ///
    /// Returns the number of subscribers pruned.
    pub fn heartbeat(&self) -> usize {
        let settings = &self.inner.settings;
        let expiry = settings.completion_grace() + settings.retention();
        let now = Instant::now();
        let mut pruned = 0;

        let mut channels = lock(&self.inner.channels);
        channels.retain(|job_id, channel| {
            let mut guard = lock(channel);

            let before = guard.subscribers.len();
            fan_out(job_id, &mut guard, &HubMessage::Heartbeat, settings.max_full_strikes);
            pruned += before - guard.subscribers.len();

            let expired = guard
                .completed_at
                .is_some_and(|at| now.duration_since(at) >= expiry)
                && guard.subscribers.is_empty();
            let evict = expired || guard.is_idle();
            if evict {
                guard.evicted = true;
                debug!(%job_id, "Channel evicted");
            }
            !evict
        });

        if pruned > 0 {
            warn!(pruned, "Pruned unresponsive subscribers");
        }
        pruned
    }

    /// Start the periodic heartbeat task
    pub fn start_heartbeats(&self) -> BackgroundTask {
        let hub = self.clone();
        let interval = self.inner.settings.heartbeat_interval();

        BackgroundTask::spawn("hub-heartbeat", move |token| async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        hub.heartbeat();
                    }
                    _ = token.cancelled() => break,
                }
            }
        })
    }

    fn schedule_job_close(&self, job_id: &str) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(%job_id, "No runtime available, closing streams immediately");
            self.inner.close_subscribers(job_id);
            return;
        };

        let hub = Arc::downgrade(&self.inner);
        let grace = self.inner.settings.completion_grace();
        let job_id = job_id.to_string();
        runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(hub) = hub.upgrade() {
                let closed = hub.close_subscribers(&job_id);
                debug!(%job_id, closed, "Closed subscriptions after completion");
            }
        });
    }

    fn schedule_subscriber_close(&self, job_id: &str, subscriber_id: u64) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.inner.remove_subscriber(job_id, subscriber_id);
            return;
        };

        let hub = Arc::downgrade(&self.inner);
        let grace = self.inner.settings.completion_grace();
        let job_id = job_id.to_string();
        runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(hub) = hub.upgrade() {
                hub.remove_subscriber(&job_id, subscriber_id);
            }
        });
    }
}

/// A live subscription to one job's events; detaches on drop
pub struct Subscription {
    job_id: String,
    id: u64,
    rx: mpsc::Receiver<HubMessage>,
    hub: Weak<HubInner>,
}

impl Subscription {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next message, or `None` once the hub closed the subscription
    pub async fn recv(&mut self) -> Option<HubMessage> {
        self.rx.recv().await
    }

    /// Convert into a stream of messages
    pub fn into_stream(self) -> impl Stream<Item = HubMessage> + Send + 'static {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription
                .recv()
                .await
                .map(|message| (message, subscription))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            if hub.remove_subscriber(&self.job_id, self.id) {
                debug!(job_id = %self.job_id, subscriber = self.id, "Subscriber detached");
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("job_id", &self.job_id)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LogKind, Outcome};

    fn settings() -> HubSettings {
        HubSettings {
            replay_capacity: 3,
            queue_capacity: 8,
            max_full_strikes: 2,
            completion_grace_ms: 50,
            retention_secs: 0,
            ..Default::default()
        }
    }

    fn event(seq: u64) -> LogEvent {
        LogEvent::new("job-1", seq, LogKind::Info, format!("step {}", seq))
    }

    #[tokio::test]
    async fn test_replay_buffer_is_bounded() {
        let hub = BroadcastHub::new(settings());
        for seq in 0..5 {
            hub.publish(event(seq));
        }

        let (_sub, replay) = hub.subscribe("job-1");
        let seqs: Vec<u64> = replay.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
        assert_eq!(hub.last_seq("job-1"), Some(4));
    }

    #[tokio::test]
    async fn test_live_delivery_after_replay() {
        let hub = BroadcastHub::new(settings());
        hub.publish(event(0));

        let (mut sub, replay) = hub.subscribe("job-1");
        assert_eq!(replay.len(), 1);

        let next = event(1);
        hub.publish(next.clone());
        assert_eq!(sub.recv().await, Some(HubMessage::Event(next)));
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_disconnected() {
        let hub = BroadcastHub::new(HubSettings {
            queue_capacity: 1,
            max_full_strikes: 2,
            replay_capacity: 10,
            ..Default::default()
        });

        let (_slow, _) = hub.subscribe("job-1");
        let (mut fast, _) = hub.subscribe("job-1");

        hub.publish(event(0));
        assert!(matches!(fast.recv().await, Some(HubMessage::Event(_))));
        hub.publish(event(1));
        assert!(matches!(fast.recv().await, Some(HubMessage::Event(_))));
        hub.publish(event(2));

        // The slow subscriber never drained its single-slot queue
        assert_eq!(hub.subscriber_count("job-1"), 1);
        assert!(matches!(fast.recv().await, Some(HubMessage::Event(_))));
    }

    #[tokio::test]
    async fn test_completion_closes_streams_after_grace() {
        let hub = BroadcastHub::new(settings());
        let (mut sub, _) = hub.subscribe("job-1");

        hub.publish(event(0).with_terminal(Outcome::Succeeded));

        assert!(matches!(sub.recv().await, Some(HubMessage::Event(_))));
        match sub.recv().await {
            Some(HubMessage::Completion(c)) => assert_eq!(c.kind, LogKind::Success),
            other => panic!("expected completion, got {:?}", other),
        }
        assert_eq!(sub.recv().await, None);
        assert_eq!(hub.subscriber_count("job-1"), 0);
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let hub = BroadcastHub::new(settings());
        let (sub, _) = hub.subscribe("job-1");
        let (other, _) = hub.subscribe("job-1");
        assert_eq!(hub.subscriber_count("job-1"), 2);

        hub.unsubscribe(sub);
        assert_eq!(hub.subscriber_count("job-1"), 1);
        drop(other);
        assert_eq!(hub.subscriber_count("job-1"), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_prunes_closed_and_evicts_idle() {
        let hub = BroadcastHub::new(settings());
        let (mut live, _) = hub.subscribe("job-1");

        assert_eq!(hub.heartbeat(), 0);
        assert_eq!(live.recv().await, Some(HubMessage::Heartbeat));

        drop(live);
        hub.heartbeat();
        assert!(!hub.is_tracked("job-1"));
    }
}
