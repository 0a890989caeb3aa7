//! Integration with Large Language Model services.
//!
//! This module provides a thin wrapper around the OpenAI chat completions API
//! for answering a batch of chat messages.
//!
//! The module implements the `GenericLlmClient` trait for OpenAI.

use std::{fmt::Write, sync::Arc, time::Duration};

use anyhow::anyhow;
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs, CreateChatCompletionResponse,
        ResponseFormat,
    },
};
use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{info, instrument, warn};

use crate::base::{
    config::Config,
    types::{ContextMessage, LlmResponse, ReplyContext, Res, Role},
};

use super::{GenericLlmClient, LlmClient};

// Extra methods on `LlmClient` applied by the openai implementation.

impl LlmClient {
    pub fn openai(config: &Config) -> Self {
        let client = OpenAiLlmClient::new(config);
        Self { inner: Arc::new(client) }
    }
}

// Specific implementations.

/// OpenAI LLM client implementation.
#[derive(Clone)]
pub struct OpenAiLlmClient {
    client: Client<OpenAIConfig>,
    config: Config,
}

impl OpenAiLlmClient {
    /// Create a new OpenAI LLM client.
    #[instrument(name = "OpenAiLlmClient::new", skip_all)]
    pub fn new(config: &Config) -> Self {
        let cfg = OpenAIConfig::new().with_api_key(config.openai_api_key.clone());

        Self {
            client: Client::with_config(cfg),
            config: config.clone(),
        }
    }

    /// Build the message list for a reply.
    #[instrument(name = "OpenAiLlmClient::build_reply_input", skip_all)]
    fn build_reply_input(&self, context: &ReplyContext) -> Res<Vec<ChatCompletionRequestMessage>> {
        Ok(vec![
            ChatCompletionRequestSystemMessageArgs::default().content(self.config.system_directive.clone()).build()?.into(),
            ChatCompletionRequestSystemMessageArgs::default()
                .content(format!(
                    "## Your User ID: `{}`\n\n## Conversation: `{}`\n\n## Earlier Messages\n\n{}\n\n",
                    context.bot_user_id,
                    context.conversation_id,
                    render_messages(&context.history)
                ))
                .build()?
                .into(),
            ChatCompletionRequestUserMessageArgs::default()
                .content(format!("# New Messages\n\n{}\n\n", render_messages(&context.batch)))
                .build()?
                .into(),
        ])
    }

    /// Helper function to make OpenAI API calls with retry logic and timeout handling.
    async fn call_openai_api(&self, request_builder: CreateChatCompletionRequestArgs) -> Res<CreateChatCompletionResponse> {
        const MAX_RETRIES: u32 = 3;
        const RETRY_DELAY_MS: u64 = 1000;

        let attempt_timeout = Duration::from_secs(self.config.openai_request_timeout_secs);
        let mut retries = 0;

        loop {
            let request = request_builder.build()?;
            let result = timeout(attempt_timeout, self.client.chat().create(request)).await;

            match result {
                Ok(Ok(response)) => {
                    info!("OpenAI API call succeeded after {} attempts", retries + 1);
                    return Ok(response);
                }
                Ok(Err(err)) => {
                    if retries >= MAX_RETRIES {
                        return Err(anyhow!("OpenAI API call failed after {MAX_RETRIES} retries: {err}"));
                    }
                    retries += 1;
                    warn!("OpenAI API call failed, retrying {retries}/{MAX_RETRIES}: {err}");

                    let delay = Duration::from_millis(RETRY_DELAY_MS * 2_u64.pow(retries - 1));
                    tokio::time::sleep(delay).await;
                }
                Err(_) => {
                    if retries >= MAX_RETRIES {
                        return Err(anyhow!("OpenAI API call timed out after {MAX_RETRIES} attempts"));
                    }
                    retries += 1;
                    warn!("OpenAI API call timed out, retrying {retries}/{MAX_RETRIES}");

                    let delay = Duration::from_millis(RETRY_DELAY_MS * 2_u64.pow(retries - 1));
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[async_trait]
impl GenericLlmClient for OpenAiLlmClient {
    #[instrument(name = "OpenAiLlmClient::generate_reply", skip_all)]
    async fn generate_reply(&self, context: &ReplyContext) -> Res<LlmResponse> {
        let messages = self.build_reply_input(context)?;

        let mut request = CreateChatCompletionRequestArgs::default();
        request
            .model(&self.config.openai_model)
            .max_completion_tokens(self.config.openai_max_tokens)
            .response_format(ResponseFormat::JsonObject)
            .messages(messages);

        // Reasoning models reject a sampling temperature.
        if self.config.openai_model.starts_with("gpt") {
            request.temperature(self.config.openai_temperature);
        }

        let response = self.call_openai_api(request).await?;

        let text = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(anyhow!("OpenAI response contained no message content."))?;

        parse_llm_response(&text)
    }
}

// Helpers.

/// Renders messages as one labeled line each; the bot's own replies are labeled `you`.
fn render_messages(messages: &[ContextMessage]) -> String {
    if messages.is_empty() {
        return "(none)".to_string();
    }

    let mut out = String::new();

    for message in messages {
        match message.role {
            Role::User => {
                let _ = write!(out, "[{}] {}", message.sender_id, message.text);
            }
            Role::Assistant => {
                let _ = write!(out, "[you] {}", message.text);
            }
        }

        if !message.attachments.is_empty() {
            let _ = write!(out, " (attachments: {})", message.attachments.join(", "));
        }

        out.push('\n');
    }

    out
}

/// Parses the model's JSON answer, tolerating a surrounding code fence.
fn parse_llm_response(text: &str) -> Res<LlmResponse> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    serde_json::from_str(body).map_err(|e| anyhow!("Failed to parse LLM response `{body}`: {e}"))
}

// Tests.
