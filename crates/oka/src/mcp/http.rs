//! MCP over streamable HTTP.
//!
//! Every JSON-RPC message is POSTed to the endpoint. Replies come back either
//! as a JSON body or as a short server-sent event stream.

use async_trait::async_trait;
use reqwest::header::{HeaderValue, ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info};

use super::connection::{Connection, TransportKind};
use super::protocol::{
    InitializeParams, InitializeResult, McpNotification, McpRequest, McpResponse, McpToolDef,
    ToolCallParams, ToolCallResult, ToolsListResult,
};
use crate::{Error, Result};

pub const SESSION_HEADER: &str = "Mcp-Session-Id";

pub struct HttpConnection {
    name: String,
    url: String,
    client: reqwest::Client,
    next_id: AtomicI64,
    session_id: RwLock<Option<String>>,
}

impl HttpConnection {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            client: reqwest::Client::new(),
            next_id: AtomicI64::new(1),
            session_id: RwLock::new(None),
        }
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.read().ok().and_then(|id| id.clone())
    }

    fn post(&self, body: String) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .body(body);
        if let Some(id) = self.session_id() {
            builder = builder.header(SESSION_HEADER, id);
        }
        builder
    }

    async fn request<R: for<'de> serde::Deserialize<'de>>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<R> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = serde_json::to_string(&McpRequest::new(id, method, params))?;
        debug!(server = %self.name, id, method, "MCP request");

        let response = self.post(body).send().await?;
        let status = response.status();
        if let Some(session) = response.headers().get(SESSION_HEADER) {
            if let (Ok(session), Ok(mut current)) = (session.to_str(), self.session_id.write()) {
                *current = Some(session.to_string());
            }
        }

        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("text/event-stream"));
        let text = response.text().await?;

        if !status.is_success() {
            return Err(Error::Transport(format!(
                "{} returned {}: {}",
                self.name,
                status,
                text.trim()
            )));
        }

        let reply = if is_stream {
            find_response(id, parse_sse_data(&text))
        } else {
            serde_json::from_str::<McpResponse>(&text)
                .ok()
                .filter(|response| response.id == Some(id))
        }
        .ok_or_else(|| {
            Error::Transport(format!("{} sent no response to request {}", self.name, id))
        })?;

        let value = reply
            .into_result()
            .map_err(|e| Error::Transport(format!("{}: {}", self.name, e)))?;
        Ok(serde_json::from_value(value)?)
    }

    async fn notify(&self, method: &str) -> Result<()> {
        let body = serde_json::to_string(&McpNotification::new(method))?;
        let response = self.post(body).send().await?;
        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "{} rejected {}: {}",
                self.name,
                method,
                response.status()
            )));
        }
        Ok(())
    }
}

/// Extract the `data` payload of every event in an SSE body.
pub fn parse_sse_data(body: &str) -> Vec<String> {
    let mut events = Vec::new();
    let mut data: Vec<&str> = Vec::new();

    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            if !data.is_empty() {
                events.push(data.join("\n"));
                data.clear();
            }
            continue;
        }
        if let Some(value) = line.strip_prefix("data:") {
            data.push(value.strip_prefix(' ').unwrap_or(value));
        }
    }
    if !data.is_empty() {
        events.push(data.join("\n"));
    }
    events
}

fn find_response(id: i64, events: Vec<String>) -> Option<McpResponse> {
    events
        .iter()
        .filter_map(|event| serde_json::from_str::<McpResponse>(event).ok())
        .find(|response| response.id == Some(id))
}

#[async_trait]
impl Connection for HttpConnection {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn start(&self) -> Result<()> {
        let url = url::Url::parse(&self.url)
            .map_err(|e| Error::Config(format!("invalid MCP url {}: {}", self.url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "unsupported MCP url scheme: {}",
                url.scheme()
            )));
        }
        Ok(())
    }

    async fn initialize(&self, timeout: Duration) -> Result<()> {
        let handshake = async {
            let params = serde_json::to_value(InitializeParams::default())?;
            let result: InitializeResult = self.request("initialize", Some(params)).await?;
            info!(
                server = %self.name,
                protocol = %result.protocol_version,
                session = ?self.session_id(),
                "MCP handshake complete"
            );
            self.notify("notifications/initialized").await
        };

        tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| Error::Timeout(format!("initialize {}", self.name), timeout))?
    }

    async fn list_tools(&self) -> Result<Vec<McpToolDef>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.take().map(|cursor| serde_json::json!({ "cursor": cursor }));
            let page: ToolsListResult = self.request("tools/list", params).await?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult> {
        let params = serde_json::to_value(ToolCallParams {
            name: name.to_string(),
            arguments,
        })?;
        self.request("tools/call", Some(params)).await
    }

    async fn close(&self) -> Result<()> {
        let session = self.session_id.write().ok().and_then(|mut id| id.take());
        let Some(session) = session else {
            return Ok(());
        };

        let header = HeaderValue::from_str(&session)
            .map_err(|e| Error::Transport(format!("invalid session id: {}", e)))?;
        let response = self
            .client
            .delete(&self.url)
            .header(SESSION_HEADER, header)
            .send()
            .await?;

        // Servers without session termination answer 405.
        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::METHOD_NOT_ALLOWED {
            debug!(server = %self.name, "Terminated MCP session");
            Ok(())
        } else {
            Err(Error::Transport(format!(
                "{} refused session termination: {}",
                self.name, status
            )))
        }
    }

    async fn diagnostics(&self) -> Option<String> {
        None
    }
}
