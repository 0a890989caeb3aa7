//! Batching of inbound messages per conversation.
//!
//! The collector groups bursts of messages from the same conversation into one
//! batch and hands each closed batch to the response generator:
//! - A batch closes after a quiet `debounce_window` following its latest message,
//!   or unconditionally at `max_batch_age` or `max_batch_size`, whichever comes first.
//! - At most one response generator call runs per conversation; batches closing
//!   meanwhile are held and go out right after it, in order.
//! - Every message is mirrored to the database independently of batching.
//!
//! Conversations are independent: each has its own state slot, timers, and
//! dispatch task, and a failure in one never touches another.

pub mod batch;
pub mod gate;
mod scheduler;
pub mod state;

use std::{
    collections::HashMap,
    ops::Deref,
    sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError},
    time::Duration,
};

use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, error, instrument, trace};

use crate::{interaction::message_storage, service::db::DbClient};

pub use batch::{BatchLimits, ChatEvent, ConversationBatch, ConversationId, current_run};
pub use gate::{GenericResponder, Responder};
pub use state::{ConversationState, DispatchState, Step};

/// A conversation's state, shared between its ingress path, timers, and dispatch task.
pub(crate) type Slot = Arc<Mutex<ConversationState>>;

/// Dispatch and retention options of the collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorOptions {
    /// Upper bound on generating one reply; exceeding it counts as a failure.
    pub generator_timeout: Option<Duration>,
    /// Notice posted to the conversation when a call fails.
    pub fallback_message: Option<String>,
    /// Idle time after which a conversation's state is dropped.
    pub idle_eviction: Option<Duration>,
    /// How often the sweeper looks for idle conversations.
    pub sweep_interval: Duration,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            generator_timeout: None,
            fallback_message: None,
            idle_eviction: None,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Collector for the application.
///
/// This is trivially cloneable and can be passed around without the need for `Arc` or `Mutex`.
#[derive(Clone)]
pub struct Collector {
    inner: Arc<CollectorInner>,
}

impl Deref for Collector {
    type Target = CollectorInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// Inner implementation of the collector.
pub struct CollectorInner {
    limits: BatchLimits,
    options: CollectorOptions,
    conversations: Mutex<HashMap<ConversationId, Slot>>,
    db: DbClient,
    responder: Responder,
}

impl CollectorInner {
    pub fn limits(&self) -> &BatchLimits {
        &self.limits
    }

    pub fn options(&self) -> &CollectorOptions {
        &self.options
    }

    pub fn responder(&self) -> &Responder {
        &self.responder
    }

    /// Number of conversations currently holding state.
    pub fn conversation_count(&self) -> usize {
        self.conversations().len()
    }

    /// Dispatch state of a conversation, if it has state.
    pub fn dispatch_state(&self, conversation_id: &ConversationId) -> Option<DispatchState> {
        let slot = self.conversations().get(conversation_id).cloned()?;
        let state = slot.lock().ok()?;

        Some(state.dispatch_state())
    }

    /// Drops the state of every conversation that holds nothing and has been quiet
    /// for at least the idle eviction period. Returns how many were dropped.
    pub fn sweep_idle(&self, now: Instant) -> usize {
        let Some(cutoff) = self.options.idle_eviction.and_then(|idle| now.checked_sub(idle)) else {
            return 0;
        };

        let mut conversations = self.conversations();
        let before = conversations.len();

        conversations.retain(|_, slot| match slot.try_lock() {
            Ok(mut state) if state.is_idle_since(cutoff) => {
                state.mark_evicted();
                false
            }
            Ok(_) | Err(TryLockError::WouldBlock) => true,
            Err(TryLockError::Poisoned(_)) => false,
        });

        before - conversations.len()
    }

    /// The map itself only ever sees whole inserts and removes, so a poisoned lock is still consistent.
    fn conversations(&self) -> MutexGuard<'_, HashMap<ConversationId, Slot>> {
        self.conversations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Gets the slot for a conversation, creating it if absent.
    fn slot(&self, conversation_id: &ConversationId, now: Instant) -> Slot {
        self.conversations()
            .entry(conversation_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ConversationState::new(conversation_id.clone(), now))))
            .clone()
    }
}

impl Collector {
    pub fn new(limits: BatchLimits, options: CollectorOptions, db: DbClient, responder: Responder) -> Self {
        Self {
            inner: Arc::new(CollectorInner {
                limits,
                options,
                conversations: Mutex::new(HashMap::new()),
                db,
                responder,
            }),
        }
    }

    /// Accepts one inbound message.
    ///
    /// This never waits: the message is mirrored to the database in the background
    /// and appended to its conversation's open batch before returning, so messages
    /// delivered in order are batched in order.
    #[instrument(skip_all, fields(conversation_id = %event.conversation_id, sequence = event.sequence))]
    pub fn deliver(&self, event: ChatEvent) {
        message_storage::handle_message_storage(&event, self.db.clone());

        let (slot, step) = loop {
            let slot = self.slot(&event.conversation_id, event.arrival_time);

            let mut state = match slot.lock() {
                Ok(state) => state,
                Err(poisoned) => {
                    drop(poisoned);
                    self.fault(&slot);
                    continue;
                }
            };

            // Lost a race with the sweeper; the next lookup creates a fresh slot.
            if state.is_evicted() {
                continue;
            }

            let step = state.push(event, &self.limits);
            drop(state);

            break (slot, step);
        };

        self.act(slot, step);
    }

    /// Starts the periodic idle sweep, if eviction is enabled.
    pub fn spawn_sweeper(&self) -> Option<JoinHandle<()>> {
        self.options.idle_eviction?;

        let collector = self.clone();

        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(collector.options.sweep_interval);

            loop {
                interval.tick().await;

                let evicted = collector.sweep_idle(Instant::now());
                if evicted > 0 {
                    debug!(evicted, "Evicted idle conversations.");
                }
            }
        }))
    }

    /// Carries out what a state transition asked for.
    pub(crate) fn act(&self, slot: Slot, step: Step) {
        match step {
            Step::Schedule { generation, deadline } => scheduler::arm(self.clone(), slot, generation, deadline),
            Step::Dispatch(batch) => gate::dispatch(self.clone(), slot, batch),
            Step::Held => debug!("Batch closed while a reply is in flight; holding it."),
            Step::Stale => trace!("Ignoring stale flush check."),
        }
    }

    /// Applies `f` to a conversation's state. A poisoned lock faults the conversation instead.
    pub(crate) fn with_state<R>(&self, slot: &Slot, f: impl FnOnce(&mut ConversationState) -> R) -> Option<R> {
        let result = slot.lock().map(|mut state| f(&mut state)).ok();

        if result.is_none() {
            self.fault(slot);
        }

        result
    }

    /// Discards a conversation whose state can no longer be trusted.
    ///
    /// Its in-memory batches are dropped and the next message for the same id
    /// starts over with fresh state. Other conversations are not touched.
    pub(crate) fn fault(&self, slot: &Slot) {
        let conversation_id = {
            let mut state = slot.lock().unwrap_or_else(PoisonError::into_inner);
            state.mark_evicted();
            state.conversation_id().clone()
        };

        error!(%conversation_id, "Conversation state is inconsistent; discarding it.");

        let mut conversations = self.conversations();
        if conversations.get(&conversation_id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            conversations.remove(&conversation_id);
        }
    }
}

// Tests.
