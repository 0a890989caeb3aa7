//! Per-conversation flush timers.
//!
//! Timers are never cancelled. Each one carries the generation it was armed for
//! and is ignored on firing if the conversation has moved on since.

use tokio::time::Instant;
use tracing::{Instrument, trace};

use super::{Collector, Slot};

/// Arms a flush check for `generation` that runs at `deadline`.
pub(super) fn arm(collector: Collector, slot: Slot, generation: u64, deadline: Instant) {
    trace!(generation, "Arming flush check.");

    tokio::spawn(
        async move {
            tokio::time::sleep_until(deadline).await;
            fire(&collector, slot, generation);
        }
        .in_current_span(),
    );
}

/// Runs a flush check; closes the open batch if `generation` is still current.
pub(super) fn fire(collector: &Collector, slot: Slot, generation: u64) {
    if let Some(step) = collector.with_state(&slot, |state| state.fire(generation)) {
        collector.act(slot, step);
    }
}
