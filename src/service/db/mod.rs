use std::{ops::Deref, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    base::types::{ContextMessage, Res, Role, Void},
    collector::ChatEvent,
};

pub mod surreal;

// Traits.

/// Generic database client trait that clients must implement.
///
/// This trait defines the persistence surface used by the bot: every inbound
/// message is recorded, every posted reply is recorded, and recent messages
/// can be read back as context. Implementing this trait allows different
/// database backends to be used with the collector-bot.
#[async_trait]
pub trait GenericDbClient: Send + Sync + 'static {
    /// Records an inbound message.
    ///
    /// This is called once per message, independently of how the message is batched.
    async fn record_event(&self, event: &StoredEvent) -> Void;

    /// Records a reply the bot posted.
    async fn record_reply(&self, reply: &StoredReply) -> Void;

    /// Gets the most recent `limit` messages of a conversation, oldest first.
    ///
    /// Recency follows `(run, sequence)`, so messages from a later process run
    /// are always newer than those of an earlier one.
    async fn get_recent_events(&self, conversation_id: &str, limit: usize) -> Res<Vec<StoredEvent>>;

    /// Gets the most recent `limit` replies the bot posted in a conversation, oldest first.
    async fn get_recent_replies(&self, conversation_id: &str, limit: usize) -> Res<Vec<StoredReply>>;
}

/// Database client for collector-bot.
///
/// This is trivially cloneable and can be passed around without the need for `Arc` or `Mutex`.
#[derive(Clone)]
pub struct DbClient {
    /// The database client instance.
    pub inner: Arc<dyn GenericDbClient>,
}

impl Deref for DbClient {
    type Target = dyn GenericDbClient;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl DbClient {
    pub fn new(inner: Arc<dyn GenericDbClient>) -> Self {
        Self { inner }
    }
}

// Data types.

/// An inbound message as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub conversation_id: String,
    pub sender_id: String,
    pub text: String,
    pub attachments: Vec<String>,
    pub run: u64,
    pub sequence: u64,
    pub received_at: DateTime<Utc>,
}

impl StoredEvent {
    /// Position in the conversation timeline.
    pub fn timeline_key(&self) -> (u64, u64, u8) {
        (self.run, self.sequence, 0)
    }
}

impl From<&ChatEvent> for StoredEvent {
    fn from(event: &ChatEvent) -> Self {
        Self {
            conversation_id: event.conversation_id.0.clone(),
            sender_id: event.sender_id.clone(),
            text: event.text.clone(),
            attachments: event.attachments.clone(),
            run: event.run,
            sequence: event.sequence,
            received_at: event.received_at,
        }
    }
}

impl From<&StoredEvent> for ContextMessage {
    fn from(event: &StoredEvent) -> Self {
        Self {
            role: Role::User,
            sender_id: event.sender_id.clone(),
            text: event.text.clone(),
            attachments: event.attachments.clone(),
        }
    }
}

/// A reply the bot posted, with the sequence numbers of the messages it answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredReply {
    pub conversation_id: String,
    pub text: String,
    pub run: u64,
    /// Sequence of the latest message answered; the reply sorts right after it.
    pub after_sequence: u64,
    pub in_reply_to: Vec<u64>,
    pub sent_at: DateTime<Utc>,
}

impl StoredReply {
    /// Position in the conversation timeline.
    pub fn timeline_key(&self) -> (u64, u64, u8) {
        (self.run, self.after_sequence, 1)
    }
}

impl From<&StoredReply> for ContextMessage {
    fn from(reply: &StoredReply) -> Self {
        Self {
            role: Role::Assistant,
            sender_id: String::new(),
            text: reply.text.clone(),
            attachments: Vec::new(),
        }
    }
}
