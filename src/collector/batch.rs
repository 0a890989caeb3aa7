//! Messages and batches as the collector sees them.

use std::{
    fmt,
    sync::{
        LazyLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Process-wide arrival counter, used as a tie-breaker when two messages share an instant.
static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Identifies this process run; sequence numbers restart with every run.
///
/// Taken from the wall clock at first use, so later runs sort after earlier ones.
static CURRENT_RUN: LazyLock<u64> = LazyLock::new(|| Utc::now().timestamp_micros().max(0) as u64);

/// Upper bound applied to batch windows so deadlines stay representable.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// The run id stamped on every event of this process.
pub fn current_run() -> u64 {
    *CURRENT_RUN
}

/// Identifies a private chat or a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ConversationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// One inbound message, stamped at ingress and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEvent {
    pub conversation_id: ConversationId,
    pub sender_id: String,
    pub text: String,
    /// Opaque references to attached files.
    pub attachments: Vec<String>,
    /// Process run the event arrived in; `(run, sequence)` is unique across restarts.
    pub run: u64,
    /// Monotonic arrival counter across the whole process.
    pub sequence: u64,
    /// Local monotonic arrival time; this is what batching runs on.
    pub arrival_time: Instant,
    /// Wall-clock arrival time, kept for persistence only.
    pub received_at: DateTime<Utc>,
}

impl ChatEvent {
    /// Stamps a new event with the current arrival time and the next sequence number.
    pub fn stamp(conversation_id: impl Into<ConversationId>, sender_id: impl Into<String>, text: impl Into<String>, attachments: Vec<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            text: text.into(),
            attachments,
            run: current_run(),
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            arrival_time: Instant::now(),
            received_at: Utc::now(),
        }
    }
}

/// Thresholds that decide when an open batch closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    /// Trailing quiet period after the most recent message.
    pub debounce_window: Duration,
    /// Unconditional close, measured from the first message of the batch.
    pub max_batch_age: Duration,
    /// Unconditional close once this many messages are in the batch.
    pub max_batch_size: usize,
}

/// Messages of one conversation, accumulated in arrival order.
#[derive(Debug, Clone)]
pub struct ConversationBatch {
    conversation_id: ConversationId,
    events: Vec<ChatEvent>,
    opened_at: Instant,
    last_event_at: Instant,
}

impl ConversationBatch {
    /// Opens a batch holding only `event`.
    pub fn open(event: ChatEvent) -> Self {
        Self {
            conversation_id: event.conversation_id.clone(),
            opened_at: event.arrival_time,
            last_event_at: event.arrival_time,
            events: vec![event],
        }
    }

    pub fn push(&mut self, event: ChatEvent) {
        self.last_event_at = self.last_event_at.max(event.arrival_time);
        self.events.push(event);
    }

    /// Appends every event of `later` after the events already held.
    pub fn absorb(&mut self, later: ConversationBatch) {
        self.opened_at = self.opened_at.min(later.opened_at);
        self.last_event_at = self.last_event_at.max(later.last_event_at);
        self.events.extend(later.events);
    }

    /// The instant at which this batch closes if nothing else arrives.
    pub fn flush_deadline(&self, limits: &BatchLimits) -> Instant {
        let quiet = self.last_event_at + limits.debounce_window.min(FAR_FUTURE);
        let cap = self.opened_at + limits.max_batch_age.min(FAR_FUTURE);

        quiet.min(cap)
    }

    pub fn is_full(&self, limits: &BatchLimits) -> bool {
        self.events.len() >= limits.max_batch_size
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn events(&self) -> &[ChatEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<ChatEvent> {
        self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub fn last_event_at(&self) -> Instant {
        self.last_event_at
    }
}

// Tests.
