//! Turns a closed batch into a posted reply.

use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::{
    base::types::{ContextMessage, LlmResponse, ReplyContext, Res, Role, Void},
    collector::{ChatEvent, ConversationId, GenericResponder, Responder, current_run},
    service::{
        chat::ChatClient,
        db::{DbClient, StoredReply},
        llm::LlmClient,
    },
};

// Extra methods on `Responder` applied by the reply implementation.

impl Responder {
    /// Creates the responder that answers batches through the LLM and posts to chat.
    pub fn replier(history_length: usize, db: DbClient, llm: LlmClient, chat: ChatClient) -> Self {
        Self::new(Arc::new(Replier { history_length, db, llm, chat }))
    }
}

/// Response generator backed by the LLM, chat, and database clients.
pub struct Replier {
    history_length: usize,
    db: DbClient,
    llm: LlmClient,
    chat: ChatClient,
}

impl Replier {
    /// Builds the model context for a batch.
    ///
    /// History is best-effort: if it cannot be loaded, the batch is answered without it.
    async fn build_context(&self, conversation_id: &ConversationId, events: &[ChatEvent]) -> ReplyContext {
        let history = match self.load_history(conversation_id, events).await {
            Ok(history) => history,
            Err(err) => {
                warn!("Failed to load conversation history: {}", err);
                Vec::new()
            }
        };

        ReplyContext {
            conversation_id: conversation_id.0.clone(),
            bot_user_id: self.chat.bot_user_id().to_string(),
            history,
            batch: events.iter().map(context_message).collect(),
        }
    }

    /// Loads the recent conversation timeline, leaving out the messages being answered.
    ///
    /// Recorded messages and the bot's own earlier replies are merged in timeline
    /// order, and the last `history_length` entries are kept.
    async fn load_history(&self, conversation_id: &ConversationId, events: &[ChatEvent]) -> Res<Vec<ContextMessage>> {
        if self.history_length == 0 {
            return Ok(Vec::new());
        }

        let in_batch: HashSet<(u64, u64)> = events.iter().map(|e| (e.run, e.sequence)).collect();
        let recent = self.db.get_recent_events(&conversation_id.0, self.history_length + events.len()).await?;
        let replies = self.db.get_recent_replies(&conversation_id.0, self.history_length).await?;

        let mut timeline: Vec<_> = recent
            .iter()
            .filter(|e| !in_batch.contains(&(e.run, e.sequence)))
            .map(|e| (e.timeline_key(), ContextMessage::from(e)))
            .chain(replies.iter().map(|r| (r.timeline_key(), ContextMessage::from(r))))
            .collect();

        timeline.sort_by_key(|(key, _)| *key);

        let skip = timeline.len().saturating_sub(self.history_length);

        Ok(timeline.into_iter().skip(skip).map(|(_, message)| message).collect())
    }
}

#[async_trait]
impl GenericResponder for Replier {
    #[instrument(skip_all, fields(conversation_id = %conversation_id, batch_size = events.len()))]
    async fn generate(&self, conversation_id: &ConversationId, events: &[ChatEvent]) -> Res<Option<String>> {
        let context = self.build_context(conversation_id, events).await;

        match self.llm.generate_reply(&context).await? {
            LlmResponse::NoAction => Ok(None),
            LlmResponse::Reply { message } => Ok(Some(message)),
        }
    }

    #[instrument(skip_all, fields(conversation_id = %conversation_id))]
    async fn post_reply(&self, conversation_id: &ConversationId, events: &[ChatEvent], text: &str) -> Void {
        info!("Replying ...");

        self.chat.send_message(&conversation_id.0, text).await?;

        let reply = StoredReply {
            conversation_id: conversation_id.0.clone(),
            text: text.to_string(),
            run: current_run(),
            after_sequence: events.iter().map(|e| e.sequence).max().unwrap_or_default(),
            in_reply_to: events.iter().map(|e| e.sequence).collect(),
            sent_at: Utc::now(),
        };

        // The reply is already out; failing to record it must not count as a failed call.
        if let Err(err) = self.db.record_reply(&reply).await {
            warn!("Failed to record reply: {}", err);
        }

        Ok(())
    }

    #[instrument(skip_all, fields(conversation_id = %conversation_id))]
    async fn send_fallback(&self, conversation_id: &ConversationId, text: &str) -> Void {
        self.chat.send_message(&conversation_id.0, text).await
    }
}

fn context_message(event: &ChatEvent) -> ContextMessage {
    ContextMessage {
        role: Role::User,
        sender_id: event.sender_id.clone(),
        text: event.text.clone(),
        attachments: event.attachments.clone(),
    }
}
