//! Dispatch gate: at most one response generator call per conversation.
//!
//! A conversation that closes a batch while `Idle` gets a dispatch task. That task
//! runs calls back to back until the state reports nothing pending, so calls for
//! one conversation never overlap and go out in the order their batches closed.

use std::{ops::Deref, panic::AssertUnwindSafe, sync::Arc};

use anyhow::anyhow;
use async_trait::async_trait;
use futures::FutureExt;
use tracing::{Instrument, debug, error, info, instrument, warn};

use crate::base::types::{Res, Void};

use super::{
    Collector, Slot,
    batch::{ChatEvent, ConversationBatch, ConversationId},
};

// Traits.

/// Generic response generator trait that the collector hands closed batches to.
///
/// A call has two phases. `generate` decides on a reply and is bounded by the
/// generator timeout; `post_reply` delivers it and runs to completion once started,
/// so a timeout can never land after a reply went out.
#[async_trait]
pub trait GenericResponder: Send + Sync + 'static {
    /// Produce a reply for `events`, which are in arrival order. `None` means no reply is needed.
    async fn generate(&self, conversation_id: &ConversationId, events: &[ChatEvent]) -> Res<Option<String>>;

    /// Deliver a reply produced by `generate` for the same `events`.
    async fn post_reply(&self, conversation_id: &ConversationId, events: &[ChatEvent], text: &str) -> Void;

    /// Post a best-effort notice after a failed call.
    async fn send_fallback(&self, conversation_id: &ConversationId, text: &str) -> Void;
}

// Structs.

/// Response generator handle for the collector.
///
/// This is trivially cloneable and can be passed around without the need for `Arc` or `Mutex`.
#[derive(Clone)]
pub struct Responder {
    inner: Arc<dyn GenericResponder>,
}

impl Deref for Responder {
    type Target = dyn GenericResponder;

    fn deref(&self) -> &Self::Target {
        &*self.inner
    }
}

impl Responder {
    pub fn new(inner: Arc<dyn GenericResponder>) -> Self {
        Self { inner }
    }
}

// Dispatch.

/// Starts the dispatch task for a conversation that just left `Idle`.
pub(super) fn dispatch(collector: Collector, slot: Slot, batch: ConversationBatch) {
    tokio::spawn(run(collector, slot, batch).in_current_span());
}

#[instrument(skip_all, fields(conversation_id = %batch.conversation_id()))]
async fn run(collector: Collector, slot: Slot, mut batch: ConversationBatch) {
    loop {
        let conversation_id = batch.conversation_id().clone();

        info!(batch_size = batch.len(), "Dispatching batch ...");

        if let Err(err) = call(&collector, &batch).await {
            error!("Reply generation failed: {}", err);

            if let Some(text) = collector.options().fallback_message.as_deref()
                && let Err(err) = collector.responder().send_fallback(&conversation_id, text).await
            {
                warn!("Failed to send fallback message: {}", err);
            }
        }

        let Some(next) = collector.with_state(&slot, |state| state.complete()) else {
            return;
        };

        match next {
            Ok(Some(next)) => batch = next,
            Ok(None) => return,
            Err(err) => {
                error!("{}", err);
                collector.fault(&slot);
                return;
            }
        }
    }
}

/// One response generator call; a timeout or a panic counts as a failure.
///
/// The timeout covers generation only. A failed post counts as a failure too,
/// but by then nothing has reached the conversation.
async fn call(collector: &Collector, batch: &ConversationBatch) -> Void {
    let responder = collector.responder();
    let generation = AssertUnwindSafe(responder.generate(batch.conversation_id(), batch.events())).catch_unwind();

    let outcome = match collector.options().generator_timeout {
        Some(limit) => tokio::time::timeout(limit, generation)
            .await
            .map_err(|_| anyhow!("Reply generation timed out after {:?}.", limit))?,
        None => generation.await,
    };

    let Some(text) = outcome.map_err(|_| anyhow!("Reply generation panicked."))?? else {
        debug!("No reply needed.");
        return Ok(());
    };

    AssertUnwindSafe(responder.post_reply(batch.conversation_id(), batch.events(), &text))
        .catch_unwind()
        .await
        .map_err(|_| anyhow!("Posting the reply panicked."))?
}
