//! Per-conversation batching and dispatch bookkeeping.
//!
//! Everything here is synchronous: the collector takes the conversation's lock,
//! applies one transition, releases the lock, and then acts on the returned [`Step`]
//! (arming a timer or starting a dispatch) outside the critical section.

use anyhow::anyhow;
use tokio::time::Instant;

use crate::base::types::Res;

use super::batch::{BatchLimits, ChatEvent, ConversationBatch, ConversationId};

/// Whether a response generator call is currently running for the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Dispatching,
}

/// What the caller has to do after a transition.
#[derive(Debug)]
pub enum Step {
    /// Arm a flush check tagged with `generation` for `deadline`.
    Schedule { generation: u64, deadline: Instant },
    /// Hand the closed batch to the response generator.
    Dispatch(ConversationBatch),
    /// The batch closed while a call was in flight and now waits as pending overflow.
    Held,
    /// A flush check whose generation was superseded.
    Stale,
}

/// Bookkeeping for one conversation.
#[derive(Debug)]
pub struct ConversationState {
    conversation_id: ConversationId,
    open: Option<ConversationBatch>,
    pending: Option<ConversationBatch>,
    dispatch: DispatchState,
    generation: u64,
    last_activity: Instant,
    evicted: bool,
}

impl ConversationState {
    pub fn new(conversation_id: ConversationId, now: Instant) -> Self {
        Self {
            conversation_id,
            open: None,
            pending: None,
            dispatch: DispatchState::Idle,
            generation: 0,
            last_activity: now,
            evicted: false,
        }
    }

    /// Adds an event to the open batch, opening one if needed.
    ///
    /// Every push bumps the generation, so only the flush check armed for the
    /// newest event can close the batch.
    pub fn push(&mut self, event: ChatEvent, limits: &BatchLimits) -> Step {
        self.last_activity = self.last_activity.max(event.arrival_time);
        self.generation += 1;

        let batch = match self.open.take() {
            Some(mut batch) => {
                batch.push(event);
                batch
            }
            None => ConversationBatch::open(event),
        };

        if batch.is_full(limits) {
            return self.close(batch);
        }

        let deadline = batch.flush_deadline(limits);
        self.open = Some(batch);

        Step::Schedule { generation: self.generation, deadline }
    }

    /// Runs a flush check armed earlier for `generation`.
    pub fn fire(&mut self, generation: u64) -> Step {
        if self.evicted || generation != self.generation {
            return Step::Stale;
        }

        match self.open.take() {
            Some(batch) => self.close(batch),
            None => Step::Stale,
        }
    }

    /// Records that the in-flight call returned, successfully or not.
    ///
    /// Returns the next batch to dispatch when overflow was waiting. Events still
    /// accumulating in the open batch are folded into it first, so they go out with it.
    pub fn complete(&mut self) -> Res<Option<ConversationBatch>> {
        if self.dispatch != DispatchState::Dispatching {
            return Err(anyhow!("Completion reported for `{}` with no dispatch in flight.", self.conversation_id));
        }

        let Some(mut next) = self.pending.take() else {
            self.dispatch = DispatchState::Idle;
            return Ok(None);
        };

        if let Some(open) = self.open.take() {
            self.generation += 1;
            next.absorb(open);
        }

        Ok(Some(next))
    }

    /// Whether the state holds nothing and has seen no activity since `cutoff`.
    pub fn is_idle_since(&self, cutoff: Instant) -> bool {
        self.open.is_none() && self.pending.is_none() && self.dispatch == DispatchState::Idle && self.last_activity <= cutoff
    }

    pub fn mark_evicted(&mut self) {
        self.evicted = true;
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn dispatch_state(&self) -> DispatchState {
        self.dispatch
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn open_len(&self) -> usize {
        self.open.as_ref().map_or(0, ConversationBatch::len)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.as_ref().map_or(0, ConversationBatch::len)
    }

    fn close(&mut self, batch: ConversationBatch) -> Step {
        // Any flush check still armed for this batch is now stale.
        self.generation += 1;

        match self.dispatch {
            DispatchState::Idle => {
                self.dispatch = DispatchState::Dispatching;
                Step::Dispatch(batch)
            }
            DispatchState::Dispatching => {
                match self.pending.as_mut() {
                    Some(pending) => pending.absorb(batch),
                    None => self.pending = Some(batch),
                }
                Step::Held
            }
        }
    }
}

// Tests.
