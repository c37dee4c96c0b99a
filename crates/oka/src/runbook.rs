//! In-process tool server that fetches runbooks linked from alerts.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::mcp::protocol::{McpToolDef, ToolCallResult};
use crate::mcp::ToolServer;
use crate::Result;

pub const SERVER_NAME: &str = "runbook";
pub const GET_RUNBOOK: &str = "get_runbook";

pub struct RunbookServer {
    client: reqwest::Client,
}

impl RunbookServer {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    async fn fetch(&self, url: &Url) -> std::result::Result<String, String> {
        match url.scheme() {
            "http" | "https" => {
                let response = self
                    .client
                    .get(url.clone())
                    .send()
                    .await
                    .map_err(|e| format!("failed to fetch runbook: {}", e))?;
                let status = response.status();
                if !status.is_success() {
                    return Err(format!("runbook request returned {}", status));
                }
                response
                    .text()
                    .await
                    .map_err(|e| format!("failed to read runbook: {}", e))
            }
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| format!("invalid file url: {}", url))?;
                tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| format!("failed to read {}: {}", path.display(), e))
            }
            other => Err(format!("unsupported runbook url scheme: {}", other)),
        }
    }
}

#[async_trait]
impl ToolServer for RunbookServer {
    fn list_tools(&self) -> Vec<McpToolDef> {
        vec![McpToolDef {
            name: GET_RUNBOOK.to_string(),
            description: Some(
                "Fetch the runbook linked from an alert. Use it before other tools when the alert has a runbook URL."
                    .to_string(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "url": {
                        "type": "string",
                        "description": "Runbook URL (http, https or file)"
                    }
                },
                "required": ["url"]
            }),
        }]
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult> {
        if name != GET_RUNBOOK {
            return Ok(ToolCallResult::error(format!("unknown tool: {}", name)));
        }

        let Some(raw) = arguments.get("url").and_then(Value::as_str) else {
            return Ok(ToolCallResult::error("missing required argument: url"));
        };
        let url = match Url::parse(raw) {
            Ok(url) => url,
            Err(e) => return Ok(ToolCallResult::error(format!("invalid url {}: {}", raw, e))),
        };

        debug!(url = %url, "Fetching runbook");
        Ok(match self.fetch(&url).await {
            Ok(body) => ToolCallResult::text(body),
            Err(message) => ToolCallResult::error(message),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn server() -> RunbookServer {
        RunbookServer::new(Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_reads_file_runbooks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# Disk full\nCheck /var/log first.").unwrap();
        let url = Url::from_file_path(file.path()).unwrap();

        let result = server()
            .call_tool(GET_RUNBOOK, json!({"url": url.as_str()}))
            .await
            .unwrap();
        assert!(!result.is_error);
        assert!(result.content[0].as_text().unwrap().contains("Check /var/log"));
    }

    #[tokio::test]
    async fn test_invalid_input_is_a_tool_error() {
        let server = server();
        let missing = server.call_tool(GET_RUNBOOK, json!({})).await.unwrap();
        assert!(missing.is_error);

        let invalid = server
            .call_tool(GET_RUNBOOK, json!({"url": "not a url"}))
            .await
            .unwrap();
        assert!(invalid.is_error);

        let scheme = server
            .call_tool(GET_RUNBOOK, json!({"url": "ftp://example.com/runbook"}))
            .await
            .unwrap();
        assert!(scheme.is_error);
        assert_eq!(
            scheme.content[0].as_text(),
            Some("unsupported runbook url scheme: ftp")
        );
    }

    #[test]
    fn test_lists_single_tool() {
        let tools = server().list_tools();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, GET_RUNBOOK);
        assert_eq!(tools[0].input_schema["required"][0], "url");
    }
}
