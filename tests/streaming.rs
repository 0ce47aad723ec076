//! Streaming Integration Tests
//!
//! Live delivery through the event logger and broadcast hub: ordering across
//! subscribers, catch-up for late subscribers, and completion handling.

mod common;

use std::sync::Arc;
use std::time::Duration;

use launchpad::config::HubSettings;
use launchpad::core::{BroadcastHub, EventLogger, HubMessage, MemoryJobStore, Subscription};
use launchpad::domain::{LogKind, Outcome};
use tokio_test::{assert_pending, assert_ready};

fn logger_with(hub: BroadcastHub) -> EventLogger {
    EventLogger::new(Arc::new(MemoryJobStore::new()), hub, common::logger_settings())
}

/// Collect messages until the hub closes the subscription
async fn drain(mut subscription: Subscription) -> Vec<HubMessage> {
    let mut messages = Vec::new();
    let collected = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(message) = subscription.recv().await {
            messages.push(message);
        }
    })
    .await;
    assert!(collected.is_ok(), "subscription was never closed");
    messages
}

fn event_seqs(messages: &[HubMessage]) -> Vec<u64> {
    messages
        .iter()
        .filter_map(|m| match m {
            HubMessage::Event(e) => Some(e.seq),
            _ => None,
        })
        .collect()
}

#[test]
fn test_subscriber_wakes_on_publish() {
    let hub = BroadcastHub::new(common::hub_settings());
    let logger = logger_with(hub.clone());

    let (mut subscription, replay) = hub.subscribe("job-1");
    assert!(replay.is_empty());

    let mut next = tokio_test::task::spawn(subscription.recv());
    assert_pending!(next.poll());

    logger.info("job-1", "Fetching source");
    assert!(next.is_woken());
    match assert_ready!(next.poll()) {
        Some(HubMessage::Event(event)) => {
            assert_eq!(event.seq, 0);
            assert_eq!(event.message, "Fetching source");
        }
        other => panic!("unexpected message: {:?}", other),
    }
}

#[tokio::test]
async fn test_concurrent_subscribers_see_identical_order() {
    let hub = BroadcastHub::new(common::hub_settings());
    let logger = logger_with(hub.clone());

    let (first, _) = hub.subscribe("job-1");
    let (second, _) = hub.subscribe("job-1");
    let first = tokio::spawn(drain(first));
    let second = tokio::spawn(drain(second));

    // Several producers racing on the same job
    let producers: Vec<_> = (0..4)
        .map(|worker| {
            let logger = logger.clone();
            tokio::spawn(async move {
                for i in 0..10 {
                    logger.info("job-1", format!("worker {} line {}", worker, i));
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }
    logger.record_terminal("job-1", Outcome::Succeeded, "Deployment completed successfully");

    let first = first.await.unwrap();
    let second = second.await.unwrap();

    let expected: Vec<u64> = (0..41).collect();
    assert_eq!(event_seqs(&first), expected);
    assert_eq!(event_seqs(&second), expected);
    assert!(matches!(first.last(), Some(HubMessage::Completion(_))));
    assert!(matches!(second.last(), Some(HubMessage::Completion(_))));
}

#[tokio::test]
async fn test_mid_run_subscriber_catches_up_without_gaps() {
    let hub = BroadcastHub::new(common::hub_settings());
    let logger = logger_with(hub.clone());

    for i in 0..5 {
        logger.info("job-1", format!("early {}", i));
    }

    let (subscription, replay) = hub.subscribe("job-1");
    let live = tokio::spawn(drain(subscription));

    for i in 0..5 {
        logger.info("job-1", format!("late {}", i));
    }
    logger.record_terminal("job-1", Outcome::Failed, "Deployment failed: Build failed");

    let mut seqs: Vec<u64> = replay.iter().map(|e| e.seq).collect();
    seqs.extend(event_seqs(&live.await.unwrap()));
    assert_eq!(seqs, (0..11).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_late_subscriber_gets_buffer_then_completion() {
    let settings = HubSettings {
        replay_capacity: 4,
        ..common::hub_settings()
    };
    let hub = BroadcastHub::new(settings);
    let logger = logger_with(hub.clone());

    for i in 0..9 {
        logger.info("job-1", format!("line {}", i));
    }
    logger.record_terminal("job-1", Outcome::Failed, "Deployment failed: Build failed: exit 1");

    let (subscription, replay) = hub.subscribe("job-1");

    // Only the most recent events are retained, terminal event included
    let seqs: Vec<u64> = replay.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![6, 7, 8, 9]);
    assert_eq!(replay.last().unwrap().terminal, Some(Outcome::Failed));

    let messages = drain(subscription).await;
    assert_eq!(messages.len(), 1);
    match &messages[0] {
        HubMessage::Completion(completion) => {
            assert_eq!(completion.kind, LogKind::Error);
            assert_eq!(completion.message, "Deployment failed: Build failed: exit 1");
        }
        other => panic!("expected completion, got {:?}", other),
    }
}

#[tokio::test]
async fn test_stalled_subscriber_does_not_block_others() {
    let settings = HubSettings {
        queue_capacity: 2,
        max_full_strikes: 2,
        ..common::hub_settings()
    };
    let hub = BroadcastHub::new(settings);
    let logger = logger_with(hub.clone());

    let (_stalled, _) = hub.subscribe("job-1");
    let (healthy, _) = hub.subscribe("job-1");
    let healthy = tokio::spawn(drain(healthy));

    for i in 0..20 {
        logger.info("job-1", format!("line {}", i));
        tokio::task::yield_now().await;
    }
    // The stalled queue filled up and was cut loose
    assert_eq!(hub.subscriber_count("job-1"), 1);

    logger.record_terminal("job-1", Outcome::Succeeded, "Deployment completed successfully");
    let messages = healthy.await.unwrap();
    assert_eq!(event_seqs(&messages), (0..21).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_jobs_are_isolated() {
    let hub = BroadcastHub::new(common::hub_settings());
    let logger = logger_with(hub.clone());

    let (subscription, _) = hub.subscribe("job-a");
    let collected = tokio::spawn(drain(subscription));

    logger.info("job-b", "other job");
    logger.info("job-a", "mine");
    logger.record_terminal("job-b", Outcome::Succeeded, "Deployment completed successfully");
    logger.record_terminal("job-a", Outcome::Succeeded, "Deployment completed successfully");

    let messages = collected.await.unwrap();
    assert!(messages.iter().all(|m| match m {
        HubMessage::Event(e) => e.job_id == "job-a",
        _ => true,
    }));
    assert_eq!(event_seqs(&messages), vec![0, 1]);
}
