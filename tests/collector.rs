//! Timing behavior of the collector, run against tokio's paused clock.

mod common;

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::anyhow;
use collector_bot::{
    collector::{Collector, CollectorOptions, ConversationId, DispatchState, Responder},
    service::db::DbClient,
};
use common::{MockDb, Outcome, RecordingResponder, event, limits, settle};
use tokio::time::{Instant, sleep};

const FALLBACK: &str = "Sorry, something went wrong. Please try again.";

fn with_fallback() -> CollectorOptions {
    CollectorOptions {
        fallback_message: Some(FALLBACK.to_string()),
        ..Default::default()
    }
}

fn texts(range: std::ops::RangeInclusive<usize>) -> Vec<String> {
    range.map(|i| i.to_string()).collect()
}

// Closing rules.

#[tokio::test(start_paused = true)]
async fn test_burst_closes_after_quiet_window() {
    let responder = Arc::new(RecordingResponder::new());
    let collector = common::collector(limits(3_000, 30_000, 20), CollectorOptions::default(), &responder);
    let start = Instant::now();

    collector.deliver(event("X", "A"));
    sleep(Duration::from_secs(1)).await;
    collector.deliver(event("X", "B"));
    sleep(Duration::from_secs(1)).await;
    collector.deliver(event("X", "C"));

    settle().await;

    let calls = responder.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].texts, vec!["A", "B", "C"]);
    assert_eq!(calls[0].started_at - start, Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn test_nothing_closes_before_quiet_window() {
    let responder = Arc::new(RecordingResponder::new());
    let collector = common::collector(limits(3_000, 30_000, 20), CollectorOptions::default(), &responder);

    collector.deliver(event("X", "A"));
    sleep(Duration::from_millis(2_999)).await;

    assert!(responder.calls().is_empty());

    sleep(Duration::from_millis(10)).await;

    assert_eq!(responder.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_messages_at_same_instant_keep_delivery_order() {
    let responder = Arc::new(RecordingResponder::new());
    let collector = common::collector(limits(1_000, 30_000, 20), CollectorOptions::default(), &responder);

    for i in 1..=5 {
        collector.deliver(event("X", &i.to_string()));
    }

    settle().await;

    let calls = responder.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].texts, texts(1..=5));
    assert!(calls[0].sequences.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test(start_paused = true)]
async fn test_size_cap_closes_immediately() {
    let responder = Arc::new(RecordingResponder::new());
    let collector = common::collector(limits(3_000, 30_000, 20), CollectorOptions::default(), &responder);
    let start = Instant::now();

    for i in 1..=50 {
        collector.deliver(event("X", &i.to_string()));
        sleep(Duration::from_millis(100)).await;
    }

    settle().await;

    let calls = responder.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0].texts, texts(1..=20));
    assert_eq!(calls[1].texts, texts(21..=40));
    assert_eq!(calls[2].texts, texts(41..=50));

    assert_eq!(calls[0].started_at - start, Duration::from_millis(1_900));
    assert_eq!(calls[1].started_at - start, Duration::from_millis(3_900));

    // The last message arrives at 4.9s; the remainder waits out the quiet window.
    assert_eq!(calls[2].started_at - start, Duration::from_millis(7_900));
}

#[tokio::test(start_paused = true)]
async fn test_age_cap_closes_a_steady_stream() {
    let responder = Arc::new(RecordingResponder::new());
    let collector = common::collector(limits(3_000, 10_000, 100), CollectorOptions::default(), &responder);
    let start = Instant::now();

    for i in 1..=9 {
        collector.deliver(event("X", &i.to_string()));
        sleep(Duration::from_millis(1_500)).await;
    }

    settle().await;

    let calls = responder.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].texts, texts(1..=7));
    assert_eq!(calls[0].started_at - start, Duration::from_secs(10));

    // Messages at 10.5s and 12s; the second batch goes quiet at 15s.
    assert_eq!(calls[1].texts, texts(8..=9));
    assert_eq!(calls[1].started_at - start, Duration::from_secs(15));
}

// Dispatch gate.

#[tokio::test(start_paused = true)]
async fn test_batches_wait_for_in_flight_call() {
    let responder = Arc::new(RecordingResponder::new().with_latency(Duration::from_secs(4)));
    let collector = common::collector(limits(500, 30_000, 20), CollectorOptions::default(), &responder);
    let start = Instant::now();

    collector.deliver(event("X", "e0"));
    sleep(Duration::from_millis(1_500)).await;
    collector.deliver(event("X", "e1"));
    sleep(Duration::from_secs(1)).await;
    collector.deliver(event("X", "e2"));

    sleep(Duration::from_secs(1)).await;
    assert_eq!(collector.dispatch_state(&ConversationId::from("X")), Some(DispatchState::Dispatching));

    settle().await;

    let calls = responder.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].texts, vec!["e0"]);
    assert_eq!(calls[0].started_at - start, Duration::from_millis(500));
    assert_eq!(calls[1].texts, vec!["e1", "e2"]);
    assert_eq!(calls[1].started_at - start, Duration::from_millis(4_500));

    assert_eq!(responder.max_in_flight("X"), 1);
    assert_eq!(collector.dispatch_state(&ConversationId::from("X")), Some(DispatchState::Idle));
}

#[tokio::test(start_paused = true)]
async fn test_open_batch_joins_held_batch_on_completion() {
    let responder = Arc::new(RecordingResponder::new().with_latency(Duration::from_secs(5)));
    let collector = common::collector(limits(1_000, 30_000, 20), CollectorOptions::default(), &responder);
    let start = Instant::now();

    collector.deliver(event("X", "e0"));
    sleep(Duration::from_secs(2)).await;
    collector.deliver(event("X", "e1"));
    sleep(Duration::from_millis(3_500)).await;
    collector.deliver(event("X", "e2"));

    settle().await;

    let calls = responder.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].texts, vec!["e0"]);
    assert_eq!(calls[1].texts, vec!["e1", "e2"]);
    assert_eq!(calls[1].started_at - start, Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn test_open_batch_without_held_batch_keeps_its_timer() {
    let responder = Arc::new(RecordingResponder::new().with_latency(Duration::from_secs(2)));
    let collector = common::collector(limits(1_000, 30_000, 20), CollectorOptions::default(), &responder);
    let start = Instant::now();

    collector.deliver(event("X", "e0"));
    sleep(Duration::from_millis(2_500)).await;
    collector.deliver(event("X", "e1"));

    settle().await;

    // The first call ends at 3s, while e1 is still within its quiet window.
    let calls = responder.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].texts, vec!["e1"]);
    assert_eq!(calls[1].started_at - start, Duration::from_millis(3_500));
}

#[tokio::test(start_paused = true)]
async fn test_held_overflow_may_exceed_size_cap() {
    let responder = Arc::new(RecordingResponder::new().with_latency(Duration::from_secs(10)));
    let collector = common::collector(limits(1_000, 30_000, 2), CollectorOptions::default(), &responder);

    for i in 1..=6 {
        collector.deliver(event("X", &i.to_string()));
    }

    settle().await;

    let sizes: Vec<usize> = responder.calls().iter().map(|c| c.texts.len()).collect();
    assert_eq!(sizes, vec![2, 4]);
    assert_eq!(responder.calls()[1].texts, texts(3..=6));
}

#[tokio::test(start_paused = true)]
async fn test_conversations_do_not_block_each_other() {
    let responder = Arc::new(RecordingResponder::new().with_latency_for("X", Duration::from_secs(10)));
    let collector = common::collector(limits(1_000, 30_000, 20), CollectorOptions::default(), &responder);
    let start = Instant::now();

    collector.deliver(event("X", "x1"));
    collector.deliver(event("Y", "y1"));
    sleep(Duration::from_secs(2)).await;
    collector.deliver(event("Y", "y2"));

    settle().await;

    let y = responder.calls_for("Y");
    assert_eq!(y.len(), 2);
    assert_eq!(y[1].texts, vec!["y2"]);
    assert_eq!(y[1].started_at - start, Duration::from_secs(3));

    assert_eq!(responder.calls_for("X").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_every_message_delivered_once_in_order() {
    let responder = Arc::new(RecordingResponder::new().with_latency(Duration::from_millis(700)));
    let collector = common::collector(limits(400, 2_000, 5), CollectorOptions::default(), &responder);

    let conversations = ["X", "Y", "Z"];
    let mut sent: HashMap<&str, Vec<u64>> = HashMap::new();
    let mut seed: u64 = 42;

    for _ in 0..90 {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let conversation = conversations[(seed >> 33) as usize % conversations.len()];
        let gap = (seed >> 40) % 900;

        let message = event(conversation, "m");
        sent.entry(conversation).or_default().push(message.sequence);
        collector.deliver(message);

        sleep(Duration::from_millis(gap)).await;
    }

    settle().await;

    for conversation in conversations {
        let delivered: Vec<u64> = responder.calls_for(conversation).into_iter().flat_map(|c| c.sequences).collect();

        assert_eq!(delivered, sent.remove(conversation).unwrap_or_default());
        assert!(responder.max_in_flight(conversation) <= 1);
    }
}

// Failures.

#[tokio::test(start_paused = true)]
async fn test_failed_call_sends_fallback_without_retry() {
    let responder = Arc::new(RecordingResponder::new().with_outcomes(vec![Outcome::Fail]));
    let collector = common::collector(limits(1_000, 30_000, 20), with_fallback(), &responder);

    collector.deliver(event("X", "A"));
    settle().await;

    assert_eq!(responder.calls().len(), 1);
    assert!(responder.posts().is_empty());
    assert_eq!(responder.fallbacks(), vec![("X".to_string(), FALLBACK.to_string())]);
    assert_eq!(collector.dispatch_state(&ConversationId::from("X")), Some(DispatchState::Idle));

    collector.deliver(event("X", "B"));
    settle().await;

    let calls = responder.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].texts, vec!["B"]);
    assert_eq!(responder.fallbacks().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failure_without_fallback_is_silent() {
    let responder = Arc::new(RecordingResponder::new().with_outcomes(vec![Outcome::Fail]));
    let collector = common::collector(limits(1_000, 30_000, 20), CollectorOptions::default(), &responder);

    collector.deliver(event("X", "A"));
    settle().await;

    assert_eq!(responder.calls().len(), 1);
    assert!(responder.fallbacks().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_held_batch_still_goes_out_after_failure() {
    let responder = Arc::new(
        RecordingResponder::new()
            .with_latency(Duration::from_secs(3))
            .with_outcomes(vec![Outcome::Fail]),
    );
    let collector = common::collector(limits(500, 30_000, 20), with_fallback(), &responder);

    collector.deliver(event("X", "A"));
    sleep(Duration::from_secs(1)).await;
    collector.deliver(event("X", "B"));

    settle().await;

    let calls = responder.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].texts, vec!["B"]);
    assert_eq!(responder.fallbacks().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_counts_as_failure() {
    let responder = Arc::new(RecordingResponder::new().with_latency_for("X", Duration::from_secs(10)));
    let options = CollectorOptions {
        generator_timeout: Some(Duration::from_secs(2)),
        ..with_fallback()
    };
    let collector = common::collector(limits(1_000, 30_000, 20), options, &responder);
    let start = Instant::now();

    collector.deliver(event("X", "A"));
    sleep(Duration::from_millis(3_500)).await;

    assert_eq!(responder.fallbacks().len(), 1);
    assert_eq!(collector.dispatch_state(&ConversationId::from("X")), Some(DispatchState::Idle));

    collector.deliver(event("X", "B"));
    settle().await;

    let calls = responder.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].started_at - start, Duration::from_millis(4_500));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_never_interrupts_posting() {
    let responder = Arc::new(RecordingResponder::new().with_post_latency(Duration::from_secs(5)));
    let options = CollectorOptions {
        generator_timeout: Some(Duration::from_secs(2)),
        ..with_fallback()
    };
    let collector = common::collector(limits(1_000, 30_000, 20), options, &responder);

    collector.deliver(event("X", "A"));
    settle().await;

    assert_eq!(responder.posts(), vec![("X".to_string(), "1 message(s) answered".to_string())]);
    assert!(responder.fallbacks().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_panic_counts_as_failure() {
    let responder = Arc::new(RecordingResponder::new().with_outcomes(vec![Outcome::Panic]));
    let collector = common::collector(limits(1_000, 30_000, 20), with_fallback(), &responder);

    collector.deliver(event("X", "A"));
    settle().await;

    assert_eq!(responder.fallbacks().len(), 1);
    assert_eq!(collector.dispatch_state(&ConversationId::from("X")), Some(DispatchState::Idle));

    collector.deliver(event("X", "B"));
    settle().await;

    assert_eq!(responder.calls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_persistence_failure_does_not_affect_batching() {
    let attempts = Arc::new(AtomicUsize::new(0));

    let mut db = MockDb::new();
    let counter = attempts.clone();
    db.expect_record_event().returning(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(anyhow!("database is down"))
    });

    let responder = Arc::new(RecordingResponder::new());
    let collector = Collector::new(
        limits(1_000, 30_000, 20),
        CollectorOptions::default(),
        DbClient::new(Arc::new(db)),
        Responder::new(responder.clone()),
    );

    for text in ["A", "B", "C"] {
        collector.deliver(event("X", text));
    }

    settle().await;

    let calls = responder.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].texts, vec!["A", "B", "C"]);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

// Retention.

#[tokio::test(start_paused = true)]
async fn test_sweep_drops_idle_conversations() {
    let responder = Arc::new(RecordingResponder::new());
    let options = CollectorOptions {
        idle_eviction: Some(Duration::from_secs(10)),
        ..Default::default()
    };
    let collector = common::collector(limits(1_000, 30_000, 20), options, &responder);

    collector.deliver(event("X", "A"));
    sleep(Duration::from_secs(5)).await;

    assert_eq!(collector.sweep_idle(Instant::now()), 0);

    settle().await;

    assert_eq!(collector.sweep_idle(Instant::now()), 1);
    assert_eq!(collector.conversation_count(), 0);

    collector.deliver(event("X", "B"));
    settle().await;

    let calls = responder.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].texts, vec!["B"]);
}

#[tokio::test(start_paused = true)]
async fn test_sweep_keeps_busy_conversations() {
    let responder = Arc::new(RecordingResponder::new().with_latency(Duration::from_secs(100)));
    let options = CollectorOptions {
        idle_eviction: Some(Duration::from_secs(10)),
        ..Default::default()
    };
    let collector = common::collector(limits(1_000, 30_000, 20), options, &responder);

    collector.deliver(event("X", "A"));
    sleep(Duration::from_secs(30)).await;
    collector.deliver(event("X", "B"));
    sleep(Duration::from_secs(30)).await;

    assert_eq!(collector.sweep_idle(Instant::now()), 0);
    assert_eq!(collector.conversation_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_runs_periodically() {
    let responder = Arc::new(RecordingResponder::new());
    let options = CollectorOptions {
        idle_eviction: Some(Duration::from_secs(10)),
        sweep_interval: Duration::from_secs(5),
        ..Default::default()
    };
    let collector = common::collector(limits(1_000, 30_000, 20), options, &responder);
    let sweeper = collector.spawn_sweeper();

    assert!(sweeper.is_some());

    collector.deliver(event("X", "A"));
    collector.deliver(event("Y", "B"));
    settle().await;

    assert_eq!(collector.conversation_count(), 0);
    assert_eq!(responder.calls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_disabled_without_eviction() {
    let responder = Arc::new(RecordingResponder::new());
    let collector = common::collector(limits(1_000, 30_000, 20), CollectorOptions::default(), &responder);

    assert!(collector.spawn_sweeper().is_none());
    assert_eq!(collector.sweep_idle(Instant::now()), 0);
}
