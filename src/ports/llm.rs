//! The LLM port.
//!
//! One call, one conversation: the core never holds an LLM dialogue across
//! issues, and every prompt that frames untrusted text carries its own
//! boundary and canary tokens (see `security::boundary`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::PipelineError;

/// Role tag on a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One message in an LLM request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Abstraction over a large language model for testability.
/// Test double: `ScriptedLlm` in the integration tests.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a request; the receiver yields response chunks in order and
    /// closes when the response is complete. Implementations must stop
    /// producing when `cancel` fires.
    async fn send(
        &self,
        messages: Vec<ChatMessage>,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<String>, PipelineError>;

    /// Send a request and collect the full response text.
    async fn send_text(
        &self,
        messages: Vec<ChatMessage>,
        cancel: CancellationToken,
    ) -> Result<String, PipelineError> {
        let mut rx = self.send(messages, cancel).await?;
        let mut out = String::new();
        while let Some(chunk) = rx.recv().await {
            out.push_str(&chunk);
        }
        Ok(out)
    }
}
