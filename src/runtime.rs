//! Runtime services and shared state for the collector-bot.

use tracing::instrument;

use crate::{
    base::{
        config::Config,
        types::{Res, Void},
    },
    collector::{Collector, Responder},
    service::{chat::ChatClient, db::DbClient, llm::LlmClient},
};

/// Runtime service context that can be shared across the application.
///
/// This struct holds the service clients, the collector, and configuration.
/// It is designed to be trivially cloneable, allowing it to be passed around
/// without the need for `Arc` or `Mutex`.
#[derive(Clone)]
pub struct Runtime {
    /// The configuration for the application.
    pub config: Config,
    /// The database client instance.
    pub db: DbClient,
    /// The LLM client instance.
    pub llm: LlmClient,
    /// The chat client instance.
    pub chat: ChatClient,
    /// The message collector instance.
    pub collector: Collector,
}

impl Runtime {
    /// Create a new runtime instance.
    #[instrument(skip_all)]
    pub async fn new(config: Config) -> Res<Self> {
        // Initialize the database.
        let db = DbClient::surreal(&config).await?;

        // Initialize the LLM client.
        let llm = LlmClient::openai(&config);

        // Initialize the slack client.
        let chat = ChatClient::slack(&config).await?;

        Ok(Self::with_clients(config, db, llm, chat))
    }

    /// Wire a runtime around already constructed clients.
    pub fn with_clients(config: Config, db: DbClient, llm: LlmClient, chat: ChatClient) -> Self {
        let responder = Responder::replier(config.history_length, db.clone(), llm.clone(), chat.clone());
        let collector = Collector::new(config.batch_limits(), config.collector_options(), db.clone(), responder);

        Self { config, db, llm, chat, collector }
    }

    pub async fn start(&self) -> Void {
        let _sweeper = self.collector.spawn_sweeper();

        self.chat.start(self.collector.clone()).await
    }
}
