//! Flat tool namespace over many MCP servers.
//!
//! Each tool is exposed as `<server>_<tool>`. The first registration of a
//! qualified name wins; later duplicates are skipped with a warning.
//!
//! A registry owns the connections it registered and closes them in
//! [`ToolRegistry::close`]. A [`ToolRegistry::snapshot`] references the same
//! connections without owning them, so session registries can be seeded from
//! the shared one and closed without touching shared servers.

use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::connection::{Connection, ToolOutput};
use super::in_process::{InProcessConnection, ToolServer};
use crate::config::McpServerConfig;
use crate::metrics::TOOL_CALLS_TOTAL;
use crate::{Error, Result};

pub const DEFAULT_INITIALIZE_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(180);

/// A tool as presented to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Clone)]
struct RegisteredTool {
    descriptor: ToolDescriptor,
    original_name: String,
    connection: Arc<dyn Connection>,
}

struct OwnedConnection {
    name: String,
    connection: Arc<dyn Connection>,
}

pub struct ToolRegistry {
    order: Vec<String>,
    tools: HashMap<String, RegisteredTool>,
    owned: Vec<OwnedConnection>,
    call_timeout: Duration,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CALL_TIMEOUT)
    }
}

impl ToolRegistry {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            order: Vec::new(),
            tools: HashMap::new(),
            owned: Vec::new(),
            call_timeout,
        }
    }

    /// Independent copy of the tool map that shares, but does not own, the
    /// underlying connections.
    pub fn snapshot(&self) -> Self {
        Self {
            order: self.order.clone(),
            tools: self.tools.clone(),
            owned: Vec::new(),
            call_timeout: self.call_timeout,
        }
    }

    /// Register every enabled server, in name order. Stops at the first
    /// failure; servers registered before it stay owned by this registry.
    pub async fn register_servers(
        &mut self,
        servers: &BTreeMap<String, McpServerConfig>,
    ) -> Result<()> {
        for (name, config) in servers {
            if config.disabled {
                debug!(server = %name, "Skipping disabled MCP server");
                continue;
            }
            let connection = super::connect(name, config)?;
            self.register_connection(name, connection, config.initialize_timeout())
                .await?;
        }
        Ok(())
    }

    /// Register an in-process tool server.
    pub async fn register_server(&mut self, name: &str, server: Arc<dyn ToolServer>) -> Result<usize> {
        let connection: Arc<dyn Connection> = Arc::new(InProcessConnection::new(name, server));
        self.register_connection(name, connection, None).await
    }

    /// Start, handshake and list tools on `connection`, adding its tools to
    /// the namespace. Returns how many tools were added.
    ///
    /// A server without tools is closed and dropped. A failed handshake or
    /// listing closes the connection and returns
    /// [`Error::ProviderRegistration`].
    pub async fn register_connection(
        &mut self,
        name: &str,
        connection: Arc<dyn Connection>,
        initialize_timeout: Option<Duration>,
    ) -> Result<usize> {
        let timeout = initialize_timeout.unwrap_or(DEFAULT_INITIALIZE_TIMEOUT);

        let tools = match handshake(connection.as_ref(), name, timeout).await {
            Ok(tools) => tools,
            Err(e) => {
                let mut message = e.to_string();
                if let Some(stderr) = connection.diagnostics().await {
                    message.push_str("\nstderr:\n");
                    message.push_str(&stderr);
                }
                if let Err(close_err) = connection.close().await {
                    warn!(server = %name, "Failed to close MCP server after failed registration: {}", close_err);
                }
                return Err(Error::ProviderRegistration {
                    provider: name.to_string(),
                    message,
                });
            }
        };

        if tools.is_empty() {
            warn!(server = %name, "MCP server has no tools, skipping it");
            if let Err(e) = connection.close().await {
                warn!(server = %name, "Failed to close MCP server: {}", e);
            }
            return Ok(0);
        }

        let mut added = 0;
        for tool in tools {
            let qualified = format!("{}_{}", name, tool.name);
            if self.tools.contains_key(&qualified) {
                warn!(server = %name, tool = %qualified, "Duplicate tool name, skipping it");
                continue;
            }
            let descriptor = ToolDescriptor {
                name: qualified.clone(),
                description: tool.description.unwrap_or_default(),
                parameters: tool.input_schema,
            };
            self.tools.insert(
                qualified.clone(),
                RegisteredTool {
                    descriptor,
                    original_name: tool.name,
                    connection: connection.clone(),
                },
            );
            self.order.push(qualified);
            added += 1;
        }

        info!(server = %name, transport = %connection.kind(), tools = added, "Registered MCP server");
        self.owned.push(OwnedConnection {
            name: name.to_string(),
            connection,
        });
        Ok(added)
    }

    /// Tool descriptors in registration order.
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.descriptor.clone())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Remove a tool from this registry only.
    pub fn remove(&mut self, name: &str) -> bool {
        if self.tools.remove(name).is_none() {
            return false;
        }
        self.order.retain(|tool| tool != name);
        true
    }

    /// Invoke a tool by its qualified name.
    ///
    /// Transport and protocol failures are errors. A tool reporting its own
    /// failure yields an output with `is_error` set.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| Error::NoClient(name.to_string()))?;

        let call = tool.connection.call_tool(&tool.original_name, arguments);
        let result = match tokio::time::timeout(self.call_timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                TOOL_CALLS_TOTAL.with_label_values(&["failed"]).inc();
                return Err(Error::ToolInvocation {
                    tool: name.to_string(),
                    message: e.to_string(),
                });
            }
            Err(_) => {
                TOOL_CALLS_TOTAL.with_label_values(&["timeout"]).inc();
                return Err(Error::Timeout(format!("tool {}", name), self.call_timeout));
            }
        };

        let output = ToolOutput::from(result);
        let status = if output.is_error { "error" } else { "ok" };
        TOOL_CALLS_TOTAL.with_label_values(&[status]).inc();
        Ok(output)
    }

    /// Close every connection this registry owns, exactly once. All
    /// connections are attempted, each bounded by the call timeout; failures
    /// are reported together.
    pub async fn close(&mut self) -> Result<()> {
        let owned = std::mem::take(&mut self.owned);
        let is_owned = |connection: &Arc<dyn Connection>| {
            owned
                .iter()
                .any(|entry| Arc::ptr_eq(&entry.connection, connection))
        };
        self.order.retain(|tool| {
            self.tools
                .get(tool)
                .map_or(true, |entry| !is_owned(&entry.connection))
        });
        self.tools.retain(|_, entry| !is_owned(&entry.connection));

        let timeout = self.call_timeout;
        let results = join_all(owned.iter().map(|entry| async move {
            let result = tokio::time::timeout(timeout, entry.connection.close()).await;
            (entry.name.as_str(), result)
        }))
        .await;
        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|(name, result)| match result {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("{}: {}", name, e)),
                Err(_) => Some(format!("{}: close timed out after {:?}", name, timeout)),
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::ConnectionClose(failures))
        }
    }
}

async fn handshake(
    connection: &dyn Connection,
    name: &str,
    timeout: Duration,
) -> Result<Vec<super::protocol::McpToolDef>> {
    connection.start().await?;
    connection.initialize(timeout).await?;
    tokio::time::timeout(timeout, connection.list_tools())
        .await
        .map_err(|_| Error::Timeout(format!("listing tools of {}", name), timeout))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::connection::{MockConnection, TransportKind};
    use crate::mcp::protocol::{McpToolDef, ToolCallResult};
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Barrier;

    fn tool(name: &str) -> McpToolDef {
        McpToolDef {
            name: name.to_string(),
            description: Some(format!("{} tool", name)),
            input_schema: json!({"type": "object"}),
        }
    }

    /// A connection that starts and lists `tools`, and expects to be closed
    /// `closes` times.
    fn mock_connection(tools: Vec<McpToolDef>, closes: usize) -> MockConnection {
        let mut mock = MockConnection::new();
        mock.expect_kind().return_const(TransportKind::Stdio);
        mock.expect_start().times(1).returning(|| Ok(()));
        mock.expect_initialize().times(1).returning(|_| Ok(()));
        mock.expect_list_tools()
            .times(1)
            .returning(move || Ok(tools.clone()));
        mock.expect_close().times(closes).returning(|| Ok(()));
        mock
    }

    #[tokio::test]
    async fn test_tools_are_prefixed_and_routed_by_original_name() {
        let mut mock = mock_connection(vec![tool("list_pods"), tool("get_logs")], 1);
        mock.expect_call_tool()
            .withf(|name, args| name == "get_logs" && args["pod"] == "api-0")
            .times(1)
            .returning(|_, _| Ok(ToolCallResult::text("line 1")));

        let mut registry = ToolRegistry::default();
        let added = registry
            .register_connection("k8s", Arc::new(mock), None)
            .await
            .unwrap();
        assert_eq!(added, 2);

        let names: Vec<_> = registry.tools().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["k8s_list_pods", "k8s_get_logs"]);

        let output = registry
            .call_tool("k8s_get_logs", json!({"pod": "api-0"}))
            .await
            .unwrap();
        assert_eq!(output.text, "line 1");
        assert!(!output.is_error);

        registry.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_tool_never_reaches_a_transport() {
        let mut mock = mock_connection(vec![tool("list_pods")], 0);
        mock.expect_call_tool().never();

        let mut registry = ToolRegistry::default();
        registry
            .register_connection("k8s", Arc::new(mock), None)
            .await
            .unwrap();

        let err = registry
            .call_tool("unknown_tool", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no client found for tool unknown_tool");
    }

    #[tokio::test]
    async fn test_server_without_tools_is_closed_and_dropped() {
        let mock = mock_connection(vec![], 1);

        let mut registry = ToolRegistry::default();
        let added = registry
            .register_connection("empty", Arc::new(mock), None)
            .await
            .unwrap();

        assert_eq!(added, 0);
        assert!(registry.is_empty());
        // Already closed, so closing the registry must not close it again
        registry.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_first_registration_wins_on_collision() {
        let mut first = mock_connection(vec![tool("b_status")], 1);
        first
            .expect_call_tool()
            .times(1)
            .returning(|_, _| Ok(ToolCallResult::text("from first")));
        let mut second = mock_connection(vec![tool("status"), tool("other")], 1);
        second.expect_call_tool().never();

        let mut registry = ToolRegistry::default();
        registry
            .register_connection("a", Arc::new(first), None)
            .await
            .unwrap();
        let added = registry
            .register_connection("a_b", Arc::new(second), None)
            .await
            .unwrap();

        assert_eq!(added, 1);
        assert_eq!(registry.len(), 2);
        let output = registry.call_tool("a_b_status", json!({})).await.unwrap();
        assert_eq!(output.text, "from first");

        registry.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_handshake_includes_diagnostics_and_closes() {
        let mut mock = MockConnection::new();
        mock.expect_kind().return_const(TransportKind::Stdio);
        mock.expect_start().returning(|| Ok(()));
        mock.expect_initialize()
            .returning(|timeout| Err(Error::Timeout("initialize broken".to_string(), timeout)));
        mock.expect_list_tools().never();
        mock.expect_diagnostics()
            .returning(|| Some("panic: missing credentials".to_string()));
        mock.expect_close().times(1).returning(|| Ok(()));

        let mut registry = ToolRegistry::default();
        let err = registry
            .register_connection("broken", Arc::new(mock), Some(Duration::from_millis(50)))
            .await
            .unwrap_err();

        match err {
            Error::ProviderRegistration { provider, message } => {
                assert_eq!(provider, "broken");
                assert!(message.contains("timed out"));
                assert!(message.contains("panic: missing credentials"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_register_servers_is_fail_fast() {
        let mut servers = BTreeMap::new();
        servers.insert(
            "a_disabled".to_string(),
            McpServerConfig {
                command: Some("oka-test-never-spawned".to_string()),
                disabled: true,
                ..Default::default()
            },
        );
        servers.insert(
            "b_missing".to_string(),
            McpServerConfig {
                command: Some("oka-test-command-that-does-not-exist".to_string()),
                ..Default::default()
            },
        );

        let mut registry = ToolRegistry::default();
        let err = registry.register_servers(&servers).await.unwrap_err();
        assert!(err.to_string().contains("b_missing"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_is_independent_and_does_not_own() {
        let mock = mock_connection(vec![tool("list_pods"), tool("get_logs")], 1);

        let mut shared = ToolRegistry::default();
        shared
            .register_connection("k8s", Arc::new(mock), None)
            .await
            .unwrap();

        let mut session = shared.snapshot();
        assert!(session.remove("k8s_get_logs"));
        assert!(!session.contains("k8s_get_logs"));
        assert!(shared.contains("k8s_get_logs"));
        assert_eq!(shared.len(), 2);

        // The snapshot owns nothing; only the shared registry closes the server
        session.close().await.unwrap();
        shared.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_aggregates_failures_and_runs_once() {
        let mut registry = ToolRegistry::default();
        for name in ["alpha", "beta"] {
            let mut mock = MockConnection::new();
            mock.expect_kind().return_const(TransportKind::Http);
            mock.expect_start().returning(|| Ok(()));
            mock.expect_initialize().returning(|_| Ok(()));
            mock.expect_list_tools().returning(|| Ok(vec![tool("query")]));
            mock.expect_close()
                .times(1)
                .returning(|| Err(Error::Transport("broken pipe".to_string())));
            registry
                .register_connection(name, Arc::new(mock), None)
                .await
                .unwrap();
        }

        match registry.close().await.unwrap_err() {
            Error::ConnectionClose(failures) => {
                assert_eq!(failures.len(), 2);
                assert!(failures[0].starts_with("alpha: "));
                assert!(failures[1].starts_with("beta: "));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(registry.is_empty());
        registry.close().await.unwrap();
    }

    /// Handshakes normally but never finishes closing.
    struct StuckOnClose;

    #[async_trait]
    impl Connection for StuckOnClose {
        fn kind(&self) -> TransportKind {
            TransportKind::Stdio
        }

        async fn start(&self) -> Result<()> {
            Ok(())
        }

        async fn initialize(&self, _timeout: Duration) -> Result<()> {
            Ok(())
        }

        async fn list_tools(&self) -> Result<Vec<McpToolDef>> {
            Ok(vec![tool("status")])
        }

        async fn call_tool(&self, _name: &str, _arguments: Value) -> Result<ToolCallResult> {
            Ok(ToolCallResult::text("ok"))
        }

        async fn close(&self) -> Result<()> {
            std::future::pending().await
        }

        async fn diagnostics(&self) -> Option<String> {
            None
        }
    }

    #[tokio::test]
    async fn test_close_does_not_wait_forever_on_a_stuck_server() {
        let mut registry = ToolRegistry::new(Duration::from_millis(50));
        registry
            .register_connection("stuck", Arc::new(StuckOnClose), None)
            .await
            .unwrap();
        registry
            .register_connection("healthy", Arc::new(mock_connection(vec![tool("query")], 1)), None)
            .await
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), registry.close())
            .await
            .expect("close returned");
        match result.unwrap_err() {
            Error::ConnectionClose(failures) => {
                assert_eq!(failures.len(), 1);
                assert!(failures[0].starts_with("stuck: close timed out"));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_call_timeout() {
        struct Slow;

        #[async_trait]
        impl ToolServer for Slow {
            fn list_tools(&self) -> Vec<McpToolDef> {
                vec![tool("wait")]
            }

            async fn call_tool(&self, _name: &str, _arguments: Value) -> Result<ToolCallResult> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(ToolCallResult::text("late"))
            }
        }

        let mut registry = ToolRegistry::new(Duration::from_millis(20));
        registry.register_server("slow", Arc::new(Slow)).await.unwrap();
        let err = registry.call_tool("slow_wait", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_, _)));
    }

    /// Both calls must be in flight at once to pass the barrier.
    struct Rendezvous {
        barrier: Barrier,
    }

    #[async_trait]
    impl ToolServer for Rendezvous {
        fn list_tools(&self) -> Vec<McpToolDef> {
            vec![tool("echo")]
        }

        async fn call_tool(&self, _name: &str, arguments: Value) -> Result<ToolCallResult> {
            self.barrier.wait().await;
            Ok(ToolCallResult::text(arguments["session"].to_string()))
        }
    }

    #[tokio::test]
    async fn test_concurrent_calls_on_shared_server() {
        let mut shared = ToolRegistry::new(Duration::from_secs(5));
        shared
            .register_server(
                "shared",
                Arc::new(Rendezvous {
                    barrier: Barrier::new(2),
                }),
            )
            .await
            .unwrap();

        let first = shared.snapshot();
        let second = shared.snapshot();
        let (a, b) = tokio::join!(
            first.call_tool("shared_echo", json!({"session": "a"})),
            second.call_tool("shared_echo", json!({"session": "b"})),
        );

        assert_eq!(a.unwrap().text, "\"a\"");
        assert_eq!(b.unwrap().text, "\"b\"");
        shared.close().await.unwrap();
    }
}
