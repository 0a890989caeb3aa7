//! Ingress: turns raw inbound messages into stamped events for the collector.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::collector::{ChatEvent, Collector};

/// Message subtypes that still carry a new, user-authored message.
const ACCEPTED_SUBTYPES: &[&str] = &["file_share", "thread_broadcast"];

/// A message as a chat adapter received it, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub conversation_id: Option<String>,
    pub sender_id: Option<String>,
    pub from_bot: bool,
    pub subtype: Option<String>,
    pub text: String,
    pub attachments: Vec<String>,
}

/// Why an inbound message never reached the collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    MissingConversation,
    MissingSender,
    OwnMessage,
    FromBot,
    Subtype(String),
    Empty,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::MissingConversation => write!(f, "no conversation id"),
            Rejection::MissingSender => write!(f, "no sender id"),
            Rejection::OwnMessage => write!(f, "sent by this bot"),
            Rejection::FromBot => write!(f, "sent by another bot"),
            Rejection::Subtype(subtype) => write!(f, "unsupported subtype `{subtype}`"),
            Rejection::Empty => write!(f, "no text and no attachments"),
        }
    }
}

/// Validates a message and stamps it with its arrival time and sequence number.
pub fn to_chat_event(message: InboundMessage, bot_user_id: &str) -> Result<ChatEvent, Rejection> {
    if let Some(subtype) = &message.subtype
        && !ACCEPTED_SUBTYPES.contains(&subtype.as_str())
    {
        return Err(Rejection::Subtype(subtype.clone()));
    }

    if message.from_bot {
        return Err(Rejection::FromBot);
    }

    let conversation_id = message.conversation_id.filter(|c| !c.is_empty()).ok_or(Rejection::MissingConversation)?;
    let sender_id = message.sender_id.filter(|s| !s.is_empty()).ok_or(Rejection::MissingSender)?;

    if sender_id == bot_user_id {
        return Err(Rejection::OwnMessage);
    }

    if message.text.trim().is_empty() && message.attachments.is_empty() {
        return Err(Rejection::Empty);
    }

    Ok(ChatEvent::stamp(conversation_id, sender_id, message.text, message.attachments))
}

/// Handles an inbound chat message.
///
/// Accepted messages are delivered to the collector synchronously, which keeps
/// them in the order the adapter received them.
#[instrument(skip_all)]
pub fn handle_chat_event(message: InboundMessage, bot_user_id: &str, collector: &Collector) {
    match to_chat_event(message, bot_user_id) {
        Ok(event) => collector.deliver(event),
        Err(rejection) => debug!("Rejected inbound message: {}.", rejection),
    }
}

// Tests.
