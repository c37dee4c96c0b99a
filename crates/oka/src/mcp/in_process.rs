use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::connection::{Connection, TransportKind};
use super::protocol::{McpToolDef, ToolCallResult};
use crate::{Error, Result};

/// A tool server living inside this process.
#[async_trait]
pub trait ToolServer: Send + Sync {
    fn list_tools(&self) -> Vec<McpToolDef>;

    /// Application-level failures belong in the returned result with
    /// `is_error` set; `Err` is reserved for the bridge itself failing.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult>;
}

const IDLE: u8 = 0;
const STARTED: u8 = 1;
const READY: u8 = 2;
const CLOSED: u8 = 3;

/// Bridges a [`ToolServer`] to the [`Connection`] capability.
pub struct InProcessConnection {
    name: String,
    server: Arc<dyn ToolServer>,
    state: AtomicU8,
}

impl InProcessConnection {
    pub fn new(name: impl Into<String>, server: Arc<dyn ToolServer>) -> Self {
        Self {
            name: name.into(),
            server,
            state: AtomicU8::new(IDLE),
        }
    }

    fn ensure(&self, expected: u8) -> Result<()> {
        let state = self.state.load(Ordering::SeqCst);
        if state == expected {
            return Ok(());
        }
        let reason = match state {
            IDLE => "not started",
            STARTED => "not initialized",
            CLOSED => "closed",
            _ => "already initialized",
        };
        Err(Error::Transport(format!("{} is {}", self.name, reason)))
    }
}

#[async_trait]
impl Connection for InProcessConnection {
    fn kind(&self) -> TransportKind {
        TransportKind::InProcess
    }

    async fn start(&self) -> Result<()> {
        self.state
            .compare_exchange(IDLE, STARTED, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .or_else(|_| self.ensure(STARTED))
    }

    async fn initialize(&self, _timeout: Duration) -> Result<()> {
        self.ensure(STARTED)?;
        self.state.store(READY, Ordering::SeqCst);
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<McpToolDef>> {
        self.ensure(READY)?;
        Ok(self.server.list_tools())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult> {
        self.ensure(READY)?;
        self.server.call_tool(name, arguments).await
    }

    async fn close(&self) -> Result<()> {
        self.state.store(CLOSED, Ordering::SeqCst);
        Ok(())
    }

    async fn diagnostics(&self) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl ToolServer for Echo {
        fn list_tools(&self) -> Vec<McpToolDef> {
            vec![McpToolDef {
                name: "echo".to_string(),
                description: Some("Echo the arguments".to_string()),
                input_schema: json!({"type": "object"}),
            }]
        }

        async fn call_tool(&self, _name: &str, arguments: Value) -> Result<ToolCallResult> {
            Ok(ToolCallResult::text(arguments.to_string()))
        }
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let connection = InProcessConnection::new("echo", Arc::new(Echo));
        assert!(connection.list_tools().await.is_err());

        connection.start().await.unwrap();
        connection.initialize(Duration::from_secs(1)).await.unwrap();
        assert_eq!(connection.list_tools().await.unwrap().len(), 1);

        let result = connection.call_tool("echo", json!({"a": 1})).await.unwrap();
        assert_eq!(result.content[0].as_text(), Some(r#"{"a":1}"#));

        connection.close().await.unwrap();
        let err = connection.call_tool("echo", json!({})).await.unwrap_err();
        assert!(err.to_string().contains("closed"));
    }
}
