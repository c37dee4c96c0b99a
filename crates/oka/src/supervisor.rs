//! Runs one session per alert.
//!
//! Each session gets a snapshot of the shared tool registry plus its own
//! session-scoped MCP servers, which are closed when the session ends no
//! matter how it ends. On cancellation the supervisor stops taking alerts
//! and waits for every running session to reach a terminal state.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::{Model, Session, SessionOutcome, SessionSettings};
use crate::config::McpServerConfig;
use crate::mcp::ToolRegistry;
use crate::Result;

pub struct Supervisor {
    shared: Arc<ToolRegistry>,
    session_servers: BTreeMap<String, McpServerConfig>,
    model: Arc<dyn Model>,
    settings: SessionSettings,
    limit: Option<Arc<Semaphore>>,
}

impl Supervisor {
    pub fn new(
        shared: Arc<ToolRegistry>,
        session_servers: BTreeMap<String, McpServerConfig>,
        model: Arc<dyn Model>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            shared,
            session_servers,
            model,
            settings,
            limit: None,
        }
    }

    /// Cap the number of sessions running at once. `None` means unbounded.
    pub fn with_concurrency_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit.map(|permits| Arc::new(Semaphore::new(permits)));
        self
    }

    /// Investigate a single alert and return once its session has ended.
    ///
    /// Errors are limited to setting the session up (registering
    /// session-scoped servers, opening the transcript).
    pub async fn process(&self, alert: Value, cancel: &CancellationToken) -> Result<SessionOutcome> {
        let mut registry = self.shared.snapshot();

        let outcome = match registry.register_servers(&self.session_servers).await {
            Ok(()) => match Session::new(alert, self.model.clone(), &registry, &self.settings).await {
                Ok(mut session) => Ok(session.run(cancel).await),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        if let Err(e) = registry.close().await {
            warn!("Failed to close session MCP servers: {}", e);
        }
        outcome
    }

    async fn admit_and_process(&self, alert: Value, cancel: &CancellationToken) -> Result<SessionOutcome> {
        let _permit = match &self.limit {
            Some(limit) => tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(alert = %alert, "Dropping alert: shutdown before a session slot was free");
                    return Ok(SessionOutcome::Cancelled);
                }
                permit = limit.clone().acquire_owned() => permit.ok(),
            },
            None => None,
        };
        self.process(alert, cancel).await
    }

    /// Consume alerts until `cancel` fires or the queue closes, then wait
    /// for the sessions still running.
    pub async fn run(self: Arc<Self>, mut alerts: mpsc::Receiver<Value>, cancel: CancellationToken) {
        let mut sessions = JoinSet::new();
        info!("Session supervisor started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                alert = alerts.recv() => {
                    let Some(alert) = alert else {
                        info!("Alert queue closed");
                        break;
                    };
                    let supervisor = self.clone();
                    let cancel = cancel.clone();
                    sessions.spawn(async move { supervisor.admit_and_process(alert, &cancel).await });
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => log_joined(joined),
            }
        }

        info!(sessions = sessions.len(), "Waiting for sessions to complete");
        while let Some(joined) = sessions.join_next().await {
            log_joined(joined);
        }
        info!("Session supervisor stopped");
    }
}

fn log_joined(joined: std::result::Result<Result<SessionOutcome>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(outcome)) => debug!(outcome = %outcome, "Session finished"),
        Ok(Err(e)) => error!("Failed to start session: {}", e),
        Err(e) => error!("Session task failed: {}", e),
    }
}
