//! Library root for `collector-bot`.
//!
//! Collector-bot is an LLM-powered chat assistant designed to:
//! - Collect bursts of messages from the same conversation into one batch
//! - Answer each batch as a whole instead of replying message by message
//! - Never run two replies for the same conversation at once
//! - Keep a record of every message it sees
//!
//! The bot integrates with Slack for chat, SurrealDB for storage,
//! and OpenAI for responses. The architecture is built around
//! extensible traits that allow for different implementations of each service.

pub mod base;
pub mod collector;
pub mod interaction;
pub mod runtime;
pub mod service;

use anyhow::anyhow;
use base::{config::Config, types::Void};
use rustls::crypto;
use tracing::info;

/// Public async entry for the binary crate.
///
/// Sets up necessary services and starts the collector-bot runtime:
/// - Initializes the crypto provider
/// - Creates the runtime context with database, LLM, and chat clients
/// - Starts the main event loop for processing messages
pub async fn start(config: Config) -> Void {
    info!("Starting collector-bot ...");

    // Start the crypto provider.
    crypto::ring::default_provider().install_default().map_err(|_| anyhow!("Failed to install the crypto provider."))?;

    // Initialize the runtime.
    let runtime = runtime::Runtime::new(config).await?;

    // Start the runtime.
    runtime.start().await?;

    Ok(())
}
