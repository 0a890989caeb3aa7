//! Event handling and user interactions for collector-bot.
//!
//! This module provides functionality for handling chat messages:
//! - Validating inbound messages and handing them to the collector
//! - Recording every message in the database
//! - Answering closed batches through the LLM and posting the reply

pub mod chat_event;
pub mod message_storage;
pub mod reply;
