//! Tool providers reachable over the Model Context Protocol.

pub mod connection;
pub mod http;
pub mod in_process;
pub mod kubeconfig;
pub mod protocol;
pub mod registry;
pub mod stdio;

use std::sync::Arc;

use crate::config::McpServerConfig;
use crate::{Error, Result};

pub use connection::{Connection, ToolOutput, TransportKind};
pub use in_process::{InProcessConnection, ToolServer};
pub use registry::{ToolDescriptor, ToolRegistry};

/// Build an unstarted connection for a configured server.
pub fn connect(name: &str, config: &McpServerConfig) -> Result<Arc<dyn Connection>> {
    match (&config.command, &config.url) {
        (_, Some(url)) => Ok(Arc::new(http::HttpConnection::new(name, url.clone()))),
        (Some(command), None) => Ok(Arc::new(
            stdio::StdioConnection::new(
                name,
                command.clone(),
                config.args.clone(),
                config.resolved_env(),
            )
            .with_isolated_kubeconfig(config.wants_isolated_kubeconfig()),
        )),
        (None, None) => Err(Error::Config(format!(
            "MCP server {} needs either command or url",
            name
        ))),
    }
}
