//! Language-model interface used by the rewrite, classify, grade and generate
//! stages, plus an Ollama-backed implementation.

pub mod ollama;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use medrag_core::CollaboratorError;

pub use ollama::OllamaModel;

/// Speaker of a prompt message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message of a chat-style prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Structured input to a single inference call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferenceRequest {
    pub messages: Vec<PromptMessage>,
    /// Overrides the configured sampling temperature for this call.
    pub temperature: Option<f32>,
}

impl InferenceRequest {
    /// A system instruction followed by one user message.
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            messages: vec![PromptMessage::system(system), PromptMessage::user(user)],
            temperature: None,
        }
    }

    /// Insert prior conversation between the system instruction and the
    /// final user message.
    pub fn with_history(mut self, history: Vec<PromptMessage>) -> Self {
        let insert_at = self
            .messages
            .iter()
            .rposition(|m| m.role == Role::User)
            .unwrap_or(self.messages.len());
        self.messages.splice(insert_at..insert_at, history);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Content of the last user message.
    pub fn user_content(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

/// A language model reachable by the pipeline.
///
/// Implementations return the raw completion text; each stage parses it into
/// its own typed result.
#[async_trait]
pub trait InferenceModel: Send + Sync {
    async fn infer(&self, request: &InferenceRequest) -> Result<String, CollaboratorError>;

    /// Model identifier for logs.
    fn model_name(&self) -> &str;
}
