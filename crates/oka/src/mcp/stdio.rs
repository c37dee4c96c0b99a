//! MCP over a child process's standard streams.
//!
//! Messages are newline-delimited JSON. A background reader routes responses
//! to waiting requests by id, so one process serves many concurrent calls.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStderr, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::{Connection, TransportKind};
use super::kubeconfig;
use super::protocol::{
    InitializeParams, InitializeResult, McpNotification, McpRequest, McpResponse, McpToolDef,
    ToolCallParams, ToolCallResult, ToolsListResult,
};
use crate::{Error, Result};

/// Stderr kept for diagnostics, in bytes.
const STDERR_LIMIT: usize = 16 * 1024;

type Reply = std::result::Result<Value, String>;
type PendingMap = StdMutex<HashMap<i64, oneshot::Sender<Reply>>>;

pub struct StdioConnection {
    name: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    isolate_kubeconfig: bool,
    running: RwLock<Option<Arc<Running>>>,
    stderr: Arc<StdMutex<String>>,
}

struct Running {
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    pending: Arc<PendingMap>,
    next_id: AtomicI64,
    disconnected: Arc<AtomicBool>,
    shutdown: CancellationToken,
    kubeconfig: StdMutex<Option<NamedTempFile>>,
}

/// Drops the pending entry when a request is abandoned (for example by an
/// outer timeout).
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: i64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

impl StdioConnection {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        env: HashMap<String, String>,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
            env,
            isolate_kubeconfig: false,
            running: RwLock::new(None),
            stderr: Arc::new(StdMutex::new(String::new())),
        }
    }

    /// Hand the process a private copy of the current kubeconfig.
    pub fn with_isolated_kubeconfig(mut self, isolate: bool) -> Self {
        self.isolate_kubeconfig = isolate;
        self
    }

    async fn running(&self) -> Result<Arc<Running>> {
        self.running
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Transport(format!("MCP server {} is not running", self.name)))
    }

    async fn request<R: for<'de> serde::Deserialize<'de>>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<R> {
        let running = self.running().await?;
        let id = running.next_id.fetch_add(1, Ordering::SeqCst);
        let line = serde_json::to_string(&McpRequest::new(id, method, params))?;

        let (tx, rx) = oneshot::channel();
        running
            .pending
            .lock()
            .map_err(|_| Error::Internal("pending request map poisoned".to_string()))?
            .insert(id, tx);
        let _guard = PendingGuard {
            pending: &running.pending,
            id,
        };

        if running.disconnected.load(Ordering::SeqCst) {
            return Err(Error::Transport(format!(
                "MCP server {} closed its output",
                self.name
            )));
        }

        debug!(server = %self.name, id, method, "MCP request");
        running.send(&line).await.map_err(|e| {
            Error::Transport(format!("failed to write to MCP server {}: {}", self.name, e))
        })?;

        match rx.await {
            Ok(Ok(value)) => Ok(serde_json::from_value(value)?),
            Ok(Err(message)) => Err(Error::Transport(format!("{}: {}", self.name, message))),
            Err(_) => Err(Error::Transport(format!(
                "MCP server {} dropped request {}",
                self.name, id
            ))),
        }
    }

    async fn notify(&self, method: &str) -> Result<()> {
        let running = self.running().await?;
        let line = serde_json::to_string(&McpNotification::new(method))?;
        running.send(&line).await.map_err(|e| {
            Error::Transport(format!("failed to write to MCP server {}: {}", self.name, e))
        })
    }
}

impl Running {
    async fn send(&self, line: &str) -> std::io::Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await
    }

    fn fail_pending(&self, reason: &str) {
        fail_pending(&self.pending, reason);
    }
}

fn fail_pending(pending: &PendingMap, reason: &str) {
    if let Ok(mut pending) = pending.lock() {
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(reason.to_string()));
        }
    }
}

fn route_message(name: &str, line: &str, pending: &PendingMap) {
    let response: McpResponse = match serde_json::from_str(line) {
        Ok(response) => response,
        Err(e) => {
            debug!(server = %name, "Ignoring malformed MCP message: {}", e);
            return;
        }
    };

    let Some(id) = response.id else {
        if let Some(method) = &response.method {
            debug!(server = %name, method = %method, "MCP notification");
        }
        return;
    };

    let waiter = pending.lock().ok().and_then(|mut pending| pending.remove(&id));
    match waiter {
        Some(tx) => {
            let _ = tx.send(response.into_result().map_err(|e| e.to_string()));
        }
        None => debug!(server = %name, id, "Response for unknown request"),
    }
}

async fn read_stdout(
    name: String,
    stdout: ChildStdout,
    pending: Arc<PendingMap>,
    disconnected: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    if !line.starts_with('{') {
                        debug!(server = %name, "Skipping non-JSON line: {}", line);
                        continue;
                    }
                    route_message(&name, line, &pending);
                }
                Ok(None) => {
                    warn!(server = %name, "MCP server closed stdout");
                    break;
                }
                Err(e) => {
                    warn!(server = %name, "Error reading from MCP server: {}", e);
                    break;
                }
            }
        }
    }
    disconnected.store(true, Ordering::SeqCst);
    fail_pending(&pending, "connection closed");
}

async fn read_stderr(name: String, stderr: ChildStderr, buffer: Arc<StdMutex<String>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(server = %name, "stderr: {}", line);
        if let Ok(mut buffer) = buffer.lock() {
            if buffer.len() + line.len() < STDERR_LIMIT {
                buffer.push_str(&line);
                buffer.push('\n');
            }
        }
    }
}

#[async_trait]
impl Connection for StdioConnection {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn start(&self) -> Result<()> {
        let mut running = self.running.write().await;
        if running.is_some() {
            return Ok(());
        }

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let kubeconfig = if self.isolate_kubeconfig {
            let file = kubeconfig::isolated_copy()?;
            debug!(server = %self.name, path = %file.path().display(), "Using isolated kubeconfig");
            cmd.env("KUBECONFIG", file.path());
            Some(file)
        } else {
            None
        };

        info!(server = %self.name, "Spawning MCP server: {} {}", self.command, self.args.join(" "));
        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::Transport(format!("command not found: {}", self.command))
            } else {
                Error::Transport(format!("failed to spawn {}: {}", self.command, e))
            }
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transport("child has no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("child has no stdout".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(read_stderr(self.name.clone(), stderr, self.stderr.clone()));
        }

        let pending = Arc::new(PendingMap::default());
        let disconnected = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();
        tokio::spawn(read_stdout(
            self.name.clone(),
            stdout,
            pending.clone(),
            disconnected.clone(),
            shutdown.clone(),
        ));

        *running = Some(Arc::new(Running {
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            pending,
            next_id: AtomicI64::new(1),
            disconnected,
            shutdown,
            kubeconfig: StdMutex::new(kubeconfig),
        }));
        Ok(())
    }

    async fn initialize(&self, timeout: Duration) -> Result<()> {
        let handshake = async {
            let params = serde_json::to_value(InitializeParams::default())?;
            let result: InitializeResult = self.request("initialize", Some(params)).await?;
            debug!(
                server = %self.name,
                protocol = %result.protocol_version,
                server_info = ?result.server_info.as_ref().map(|info| &info.name),
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
        let Some(running) = self.running.write().await.take() else {
            return Ok(());
        };

        running.shutdown.cancel();
        running.fail_pending("connection closed");

        let mut errors = Vec::new();
        {
            let mut child = running.child.lock().await;
            match child.try_wait() {
                Ok(Some(status)) => debug!(server = %self.name, "MCP server already exited with {}", status),
                _ => {
                    if let Err(e) = child.kill().await {
                        errors.push(format!("failed to stop {}: {}", self.command, e));
                    }
                }
            }
        }

        let kubeconfig = running.kubeconfig.lock().ok().and_then(|mut file| file.take());
        if let Some(file) = kubeconfig {
            if let Err(e) = file.close() {
                errors.push(format!("failed to remove kubeconfig copy: {}", e));
            }
        }

        info!(server = %self.name, "Closed MCP server");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Transport(errors.join("; ")))
        }
    }

    async fn diagnostics(&self) -> Option<String> {
        let stderr = self.stderr.lock().ok()?;
        let trimmed = stderr.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}
