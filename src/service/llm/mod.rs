pub mod openai;

use std::{ops::Deref, sync::Arc};

use async_trait::async_trait;

use crate::base::types::{LlmResponse, ReplyContext, Res};

// Traits.

/// Generic LLM client trait that clients must implement.
///
/// This trait defines the core functionality for interacting with large language models.
/// Implementing this trait allows different LLM providers to be used with the collector-bot.
#[async_trait]
pub trait GenericLlmClient: Send + Sync + 'static {
    /// Generate a reply for one batch of messages.
    ///
    /// The context carries the batch (in arrival order) and earlier messages of the
    /// conversation. The model may decide that the batch needs no reply.
    async fn generate_reply(&self, context: &ReplyContext) -> Res<LlmResponse>;
}

// Structs.

/// LLM client for the application.
///
/// This is trivially cloneable and can be passed around without the need for `Arc` or `Mutex`.
#[derive(Clone)]
pub struct LlmClient {
    inner: Arc<dyn GenericLlmClient>,
}

impl Deref for LlmClient {
    type Target = dyn GenericLlmClient;

    fn deref(&self) -> &Self::Target {
        &*self.inner
    }
}

impl LlmClient {
    pub fn new(inner: Arc<dyn GenericLlmClient>) -> Self {
        Self { inner }
    }
}
