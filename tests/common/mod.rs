#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use collector_bot::{
    base::types::{LlmResponse, ReplyContext, Res, Void},
    collector::{BatchLimits, ChatEvent, Collector, CollectorOptions, ConversationId, GenericResponder, Responder},
    service::{
        chat::GenericChatClient,
        db::{DbClient, GenericDbClient, StoredEvent, StoredReply},
        llm::GenericLlmClient,
    },
};
use mockall::mock;
use tokio::time::Instant;

// Mocks.

mock! {
    pub Db {}

    #[async_trait]
    impl GenericDbClient for Db {
        async fn record_event(&self, event: &StoredEvent) -> Void;
        async fn record_reply(&self, reply: &StoredReply) -> Void;
        async fn get_recent_events(&self, conversation_id: &str, limit: usize) -> Res<Vec<StoredEvent>>;
        async fn get_recent_replies(&self, conversation_id: &str, limit: usize) -> Res<Vec<StoredReply>>;
    }
}

mock! {
    pub Chat {}

    #[async_trait]
    impl GenericChatClient for Chat {
        fn bot_user_id(&self) -> &str;
        async fn start(&self, collector: Collector) -> Void;
        async fn send_message(&self, conversation_id: &str, text: &str) -> Void;
    }
}

mock! {
    pub Llm {}

    #[async_trait]
    impl GenericLlmClient for Llm {
        async fn generate_reply(&self, context: &ReplyContext) -> Res<LlmResponse>;
    }
}

/// A database mock that accepts everything and remembers nothing.
pub fn quiet_db() -> DbClient {
    let mut mock = MockDb::new();

    mock.expect_record_event().returning(|_| Ok(()));
    mock.expect_record_reply().returning(|_| Ok(()));
    mock.expect_get_recent_events().returning(|_, _| Ok(Vec::new()));
    mock.expect_get_recent_replies().returning(|_, _| Ok(Vec::new()));

    DbClient::new(Arc::new(mock))
}

/// A database mock backed by a shared list, so recorded messages can be read back.
pub fn memory_db(store: Arc<Mutex<Vec<StoredEvent>>>, replies: Arc<Mutex<Vec<StoredReply>>>) -> DbClient {
    let mut mock = MockDb::new();

    let events = store.clone();
    mock.expect_record_event().returning(move |event| {
        events.lock().unwrap().push(event.clone());
        Ok(())
    });

    let recorded = replies.clone();
    mock.expect_record_reply().returning(move |reply| {
        recorded.lock().unwrap().push(reply.clone());
        Ok(())
    });

    mock.expect_get_recent_events().returning(move |conversation_id, limit| {
        let events = store.lock().unwrap();
        let mut matching: Vec<StoredEvent> = events.iter().filter(|e| e.conversation_id == conversation_id).cloned().collect();
        matching.sort_by_key(StoredEvent::timeline_key);
        let skip = matching.len().saturating_sub(limit);

        Ok(matching.into_iter().skip(skip).collect())
    });

    mock.expect_get_recent_replies().returning(move |conversation_id, limit| {
        let replies = replies.lock().unwrap();
        let mut matching: Vec<StoredReply> = replies.iter().filter(|r| r.conversation_id == conversation_id).cloned().collect();
        matching.sort_by_key(StoredReply::timeline_key);
        let skip = matching.len().saturating_sub(limit);

        Ok(matching.into_iter().skip(skip).collect())
    });

    DbClient::new(Arc::new(mock))
}

// Recording responder.

/// What a scripted call does once its latency has passed.
#[derive(Debug, Clone, Copy)]
pub enum Outcome {
    Succeed,
    Fail,
    Panic,
}

/// One response generator call as observed by [`RecordingResponder`].
#[derive(Debug, Clone)]
pub struct Call {
    pub conversation_id: String,
    pub texts: Vec<String>,
    pub sequences: Vec<u64>,
    pub started_at: Instant,
}

/// Response generator that records every call and tracks how many overlap.
#[derive(Default)]
pub struct RecordingResponder {
    latency: Duration,
    latency_for: HashMap<String, Duration>,
    post_latency: Duration,
    outcomes: Mutex<VecDeque<Outcome>>,
    calls: Mutex<Vec<Call>>,
    posts: Mutex<Vec<(String, String)>>,
    fallbacks: Mutex<Vec<(String, String)>>,
    in_flight: Mutex<HashMap<String, usize>>,
    max_in_flight: Mutex<HashMap<String, usize>>,
}

impl RecordingResponder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_latency_for(mut self, conversation_id: &str, latency: Duration) -> Self {
        self.latency_for.insert(conversation_id.to_string(), latency);
        self
    }

    pub fn with_post_latency(mut self, latency: Duration) -> Self {
        self.post_latency = latency;
        self
    }

    /// Outcomes of the first calls, in call order; later calls succeed.
    pub fn with_outcomes(self, outcomes: Vec<Outcome>) -> Self {
        *self.outcomes.lock().unwrap() = outcomes.into();
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, conversation_id: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.conversation_id == conversation_id).collect()
    }

    pub fn posts(&self) -> Vec<(String, String)> {
        self.posts.lock().unwrap().clone()
    }

    pub fn fallbacks(&self) -> Vec<(String, String)> {
        self.fallbacks.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self, conversation_id: &str) -> usize {
        self.max_in_flight.lock().unwrap().get(conversation_id).copied().unwrap_or(0)
    }
}

/// Decrements the in-flight count when a call ends, including when it is cancelled.
struct InFlight<'a> {
    counts: &'a Mutex<HashMap<String, usize>>,
    conversation_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(count) = self.counts.lock().unwrap().get_mut(&self.conversation_id) {
            *count -= 1;
        }
    }
}

#[async_trait]
impl GenericResponder for RecordingResponder {
    async fn generate(&self, conversation_id: &ConversationId, events: &[ChatEvent]) -> Res<Option<String>> {
        let id = conversation_id.0.clone();

        self.calls.lock().unwrap().push(Call {
            conversation_id: id.clone(),
            texts: events.iter().map(|e| e.text.clone()).collect(),
            sequences: events.iter().map(|e| e.sequence).collect(),
            started_at: Instant::now(),
        });

        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let count = in_flight.entry(id.clone()).or_default();
            *count += 1;

            let mut max = self.max_in_flight.lock().unwrap();
            let peak = max.entry(id.clone()).or_default();
            *peak = (*peak).max(*count);
        }

        let _guard = InFlight {
            counts: &self.in_flight,
            conversation_id: id.clone(),
        };

        let latency = self.latency_for.get(&id).copied().unwrap_or(self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let outcome = self.outcomes.lock().unwrap().pop_front().unwrap_or(Outcome::Succeed);

        match outcome {
            Outcome::Succeed => Ok(Some(format!("{} message(s) answered", events.len()))),
            Outcome::Fail => Err(anyhow!("Scripted failure.")),
            Outcome::Panic => panic!("Scripted panic."),
        }
    }

    async fn post_reply(&self, conversation_id: &ConversationId, _events: &[ChatEvent], text: &str) -> Void {
        if !self.post_latency.is_zero() {
            tokio::time::sleep(self.post_latency).await;
        }

        self.posts.lock().unwrap().push((conversation_id.0.clone(), text.to_string()));
        Ok(())
    }

    async fn send_fallback(&self, conversation_id: &ConversationId, text: &str) -> Void {
        self.fallbacks.lock().unwrap().push((conversation_id.0.clone(), text.to_string()));
        Ok(())
    }
}

// Helpers.

pub fn limits(debounce_ms: u64, max_age_ms: u64, max_size: usize) -> BatchLimits {
    BatchLimits {
        debounce_window: Duration::from_millis(debounce_ms),
        max_batch_age: Duration::from_millis(max_age_ms),
        max_batch_size: max_size,
    }
}

pub fn collector(limits: BatchLimits, options: CollectorOptions, responder: &Arc<RecordingResponder>) -> Collector {
    Collector::new(limits, options, quiet_db(), Responder::new(responder.clone()))
}

pub fn event(conversation_id: &str, text: &str) -> ChatEvent {
    ChatEvent::stamp(conversation_id, "U1", text, vec![])
}

/// Lets every timer and dispatch settle; with paused time this returns immediately.
pub async fn settle() {
    tokio::time::sleep(Duration::from_secs(600)).await;
}
