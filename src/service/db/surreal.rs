//! SurrealDB implementation for collector-bot data storage.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use surrealdb::{
    RecordId, Surreal,
    engine::any::{self, Any},
    opt::auth::Root,
};
use tracing::{info, instrument};

use crate::base::{
    config::Config,
    types::{Res, Void},
};

use super::{DbClient, GenericDbClient, StoredEvent, StoredReply};

// Extra methods on `DbClient` applied by the surreal implementation.

impl DbClient {
    /// Connects to the SurrealDB endpoint named in the configuration.
    pub async fn surreal(config: &Config) -> Res<Self> {
        let client = SurrealDbClient::connect(&config.db_endpoint, &config.db_username, &config.db_password, &config.db_namespace, &config.db_database).await?;
        Ok(Self { inner: Arc::new(client) })
    }

    /// Creates a client backed by an in-memory SurrealDB instance.
    pub async fn surreal_memory() -> Res<Self> {
        let client = SurrealDbClient::connect("mem://", "", "", "collector_bot", "collector_bot").await?;
        Ok(Self { inner: Arc::new(client) })
    }
}

// Structs.

/// Shape of the record SurrealDB hands back on create.
#[derive(Debug, Deserialize)]
struct Record {
    #[allow(dead_code)]
    id: RecordId,
}

/// SurrealDB client implementation.
#[derive(Clone)]
struct SurrealDbClient {
    db: Surreal<Any>,
}

impl SurrealDbClient {
    #[instrument(name = "SurrealDbClient::connect", skip(password))]
    async fn connect(endpoint: &str, username: &str, password: &str, namespace: &str, database: &str) -> Res<Self> {
        let db = any::connect(endpoint).await?;

        if !username.is_empty() {
            db.signin(Root { username, password }).await?;
        }

        db.use_ns(namespace).use_db(database).await?;

        info!("Connected to SurrealDB at `{}`.", endpoint);

        Ok(Self { db })
    }
}

#[async_trait]
impl GenericDbClient for SurrealDbClient {
    #[instrument(skip_all)]
    async fn record_event(&self, event: &StoredEvent) -> Void {
        let _: Option<Record> = self.db.create("event").content(event.clone()).await?;

        Ok(())
    }

    #[instrument(skip_all)]
    async fn record_reply(&self, reply: &StoredReply) -> Void {
        let _: Option<Record> = self.db.create("reply").content(reply.clone()).await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_recent_events(&self, conversation_id: &str, limit: usize) -> Res<Vec<StoredEvent>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut response = self
            .db
            .query("SELECT conversation_id, sender_id, text, attachments, run, sequence, received_at FROM event WHERE conversation_id = $conversation_id ORDER BY run DESC, sequence DESC LIMIT $limit")
            .bind(("conversation_id", conversation_id.to_string()))
            .bind(("limit", limit as u64))
            .await?;

        let mut events: Vec<StoredEvent> = response.take(0)?;
        events.reverse();

        Ok(events)
    }

    #[instrument(skip(self))]
    async fn get_recent_replies(&self, conversation_id: &str, limit: usize) -> Res<Vec<StoredReply>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut response = self
            .db
            .query("SELECT conversation_id, text, run, after_sequence, in_reply_to, sent_at FROM reply WHERE conversation_id = $conversation_id ORDER BY run DESC, after_sequence DESC LIMIT $limit")
            .bind(("conversation_id", conversation_id.to_string()))
            .bind(("limit", limit as u64))
            .await?;

        let mut replies: Vec<StoredReply> = response.take(0)?;
        replies.reverse();

        Ok(replies)
    }
}

// Tests.
