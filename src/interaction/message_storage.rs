//! This module handles the storage of messages in the database.

use tracing::{Instrument, error, instrument};

use crate::{
    base::types::Void,
    collector::ChatEvent,
    service::db::{DbClient, StoredEvent},
};

/// Handles the message storage event.
///
/// This function is responsible for recording every inbound message in the database.
/// It spawns a new task so that a slow or failing database never holds up batching.
#[instrument(skip_all)]
pub fn handle_message_storage(event: &ChatEvent, db: DbClient) {
    let stored = StoredEvent::from(event);

    tokio::spawn(
        async move {
            // Process the event.
            let result = handle_message_storage_internal(stored, &db).await;

            // Log any errors.
            if let Err(err) = &result {
                error!("Error while storing message: {}", err);
            }
        }
        .in_current_span(),
    );
}

/// Internal function to handle the message storage event.
#[instrument(skip_all, fields(conversation_id = %event.conversation_id, sequence = event.sequence))]
async fn handle_message_storage_internal(event: StoredEvent, db: &DbClient) -> Void {
    db.record_event(&event).await?;

    Ok(())
}
