pub mod agent;
pub mod config;
pub mod logging;
pub mod mcp;
pub mod metrics;
pub mod runbook;
pub mod server;
pub mod sources;
pub mod supervisor;
pub mod template;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("failed to register MCP server {provider}: {message}")]
    ProviderRegistration { provider: String, message: String },
    #[error("no client found for tool {0}")]
    NoClient(String),
    #[error("failed to call tool {tool}: {message}")]
    ToolInvocation { tool: String, message: String },
    #[error("Model inference error: {0}")]
    ModelInference(String),
    #[error("failed to parse tool call arguments: {0}")]
    ArgumentParse(String),
    #[error("failed to close connections:\n{}", .0.join("\n"))]
    ConnectionClose(Vec<String>),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("{0} timed out after {1:?}")]
    Timeout(String, std::time::Duration),
    #[error("Template error: {0}")]
    Template(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("YAML error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_client_error_names_the_tool() {
        let err = Error::NoClient("unknown_tool".to_string());
        assert_eq!(err.to_string(), "no client found for tool unknown_tool");
    }

    #[test]
    fn close_errors_are_listed_one_per_line() {
        let err = Error::ConnectionClose(vec!["a: broken pipe".into(), "b: timeout".into()]);
        assert_eq!(
            err.to_string(),
            "failed to close connections:\na: broken pipe\nb: timeout"
        );
    }
}
