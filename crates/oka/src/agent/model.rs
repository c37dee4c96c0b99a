//! The language model capability used by sessions.

use anyhow::Result;
use async_trait::async_trait;

use super::message::{Message, ToolCall};
use crate::mcp::ToolDescriptor;

/// One model turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelResponse {
    pub content: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl ModelResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }
}

/// Generates the next assistant turn from the full conversation.
#[async_trait]
pub trait Model: Send + Sync {
    async fn generate(&self, messages: &[Message], tools: &[ToolDescriptor])
        -> Result<ModelResponse>;
}

#[cfg(test)]
pub(crate) mod scripted {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Plays back queued responses and records what it was asked.
    #[derive(Default)]
    pub struct ScriptedModel {
        responses: Mutex<VecDeque<Result<ModelResponse>>>,
        pub calls: Mutex<Vec<Vec<Message>>>,
        pub delay: Option<Duration>,
    }

    impl ScriptedModel {
        pub fn new(responses: Vec<ModelResponse>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().map(Ok).collect()),
                ..Default::default()
            }
        }

        pub fn with_delay(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Default::default()
            }
        }

        pub fn push_error(&self, message: &str) {
            self.responses
                .lock()
                .unwrap()
                .push_back(Err(anyhow::anyhow!(message.to_string())));
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Model for ScriptedModel {
        async fn generate(
            &self,
            messages: &[Message],
            _tools: &[ToolDescriptor],
        ) -> Result<ModelResponse> {
            self.calls.lock().unwrap().push(messages.to_vec());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ModelResponse::text("Still looking.")))
        }
    }
}
