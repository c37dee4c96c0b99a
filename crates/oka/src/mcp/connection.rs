use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use super::protocol::{McpToolDef, ToolCallResult};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Http,
    InProcess,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Stdio => write!(f, "stdio"),
            TransportKind::Http => write!(f, "http"),
            TransportKind::InProcess => write!(f, "in-process"),
        }
    }
}

/// A live link to one MCP server.
///
/// Implementations must allow concurrent `call_tool` invocations on a shared
/// reference; shared connections are used by many sessions at once.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connection: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Bring the transport up (spawn the process, open the endpoint).
    async fn start(&self) -> Result<()>;

    /// Perform the MCP handshake, bounded by `timeout`.
    async fn initialize(&self, timeout: Duration) -> Result<()>;

    async fn list_tools(&self) -> Result<Vec<McpToolDef>>;

    /// Invoke a tool by its provider-local name.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult>;

    async fn close(&self) -> Result<()>;

    /// Extra context for failed handshakes, such as a child's stderr.
    async fn diagnostics(&self) -> Option<String>;
}

/// Text handed back to the model for one tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub text: String,
    pub is_error: bool,
}

impl From<ToolCallResult> for ToolOutput {
    fn from(result: ToolCallResult) -> Self {
        if result.is_error {
            let text = result
                .content
                .iter()
                .find_map(|content| content.as_text())
                .unwrap_or("Unknown error")
                .to_string();
            return Self {
                text,
                is_error: true,
            };
        }

        let text = result
            .content
            .iter()
            .map(|content| content.to_string())
            .collect::<String>();
        Self {
            text,
            is_error: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::McpContent;

    #[test]
    fn test_output_concatenates_parts() {
        let output = ToolOutput::from(ToolCallResult {
            content: vec![McpContent::text("line one\n"), McpContent::text("line two")],
            is_error: false,
        });
        assert_eq!(output.text, "line one\nline two");
        assert!(!output.is_error);
    }

    #[test]
    fn test_error_output_uses_first_text_part() {
        let output = ToolOutput::from(ToolCallResult {
            content: vec![
                McpContent::Image {
                    mime_type: "image/png".to_string(),
                },
                McpContent::text("namespace not found"),
                McpContent::text("ignored"),
            ],
            is_error: true,
        });
        assert_eq!(output.text, "namespace not found");
        assert!(output.is_error);

        let output = ToolOutput::from(ToolCallResult {
            content: vec![],
            is_error: true,
        });
        assert_eq!(output.text, "Unknown error");
    }
}
