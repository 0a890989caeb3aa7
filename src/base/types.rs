use serde::{Deserialize, Serialize};

pub type Err = anyhow::Error;
pub type Res<T> = Result<T, Err>;
pub type Void = Res<()>;

/// What the model decided to do with a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LlmResponse {
    NoAction,
    Reply { message: String },
}

/// Who wrote a message the model sees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[default]
    User,
    /// The bot itself, in an earlier reply.
    Assistant,
}

/// A previously recorded message, as presented to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: Role,
    pub sender_id: String,
    pub text: String,
    pub attachments: Vec<String>,
}

/// Everything the model sees for one batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplyContext {
    pub conversation_id: String,
    pub bot_user_id: String,
    /// Earlier messages in the conversation, oldest first.
    pub history: Vec<ContextMessage>,
    /// The batch being answered, in arrival order.
    pub batch: Vec<ContextMessage>,
}
