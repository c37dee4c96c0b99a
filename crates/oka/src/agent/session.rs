//! The bounded model/tool loop for one alert.
//!
//! A session seeds the conversation with the alert and the system prompt,
//! then alternates model calls and tool calls until the model says it is
//! done, the call budget runs out, the session is cancelled or something
//! fatal happens. Cancellation is only checked between iterations; a model
//! or tool call that already started runs to completion or timeout.

use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::message::{Message, ToolCall, ToolResult};
use super::model::Model;
use super::prompt::{self, END_SESSION_PHRASE, FINAL_CALL_INSTRUCTION, MOTIVATION_TEXT};
use super::transcript::Transcript;
use crate::config::Config;
use crate::mcp::ToolRegistry;
use crate::metrics::{
    MODEL_CALLS_TOTAL, SESSIONS_ACTIVE, SESSIONS_FINISHED_TOTAL, SESSIONS_STARTED_TOTAL,
};
use crate::{Error, Result};

/// Terminal state of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The model used the end-of-session phrase.
    Complete,
    BudgetExhausted,
    Cancelled,
    Failed(String),
}

impl SessionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            SessionOutcome::Complete => "complete",
            SessionOutcome::BudgetExhausted => "budget_exhausted",
            SessionOutcome::Cancelled => "cancelled",
            SessionOutcome::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOutcome::Complete => write!(f, "complete"),
            SessionOutcome::BudgetExhausted => write!(f, "budget exhausted"),
            SessionOutcome::Cancelled => write!(f, "cancelled"),
            SessionOutcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub max_calls: usize,
    pub model_timeout: Duration,
    pub sessions_dir: PathBuf,
    pub system_prompt: String,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            max_calls: config.max_calls,
            model_timeout: config.model_timeout(),
            sessions_dir: config.sessions_log_dir.clone(),
            system_prompt: prompt::render_system_prompt(&config.slack_handle)?,
        })
    }
}

/// Sortable, unique session id.
pub fn new_session_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}",
        chrono::Utc::now().format("%Y%m%d-%H%M%S"),
        &suffix[..8]
    )
}

/// Case-insensitive check for the end-of-session phrase.
pub fn is_complete(content: &str) -> bool {
    content.to_lowercase().contains(END_SESSION_PHRASE)
}

/// Tool arguments must be a JSON object; an empty string means no arguments.
pub fn parse_arguments(raw: &str) -> Result<Value> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(other) => Err(Error::ArgumentParse(format!(
            "expected a JSON object, got {}",
            other
        ))),
        Err(e) => Err(Error::ArgumentParse(format!("{}: {}", e, raw))),
    }
}

pub struct Session<'a> {
    id: String,
    alert: Value,
    model: Arc<dyn Model>,
    tools: &'a ToolRegistry,
    settings: &'a SessionSettings,
    messages: Vec<Message>,
    transcript: Transcript,
}

impl<'a> Session<'a> {
    pub async fn new(
        alert: Value,
        model: Arc<dyn Model>,
        tools: &'a ToolRegistry,
        settings: &'a SessionSettings,
    ) -> Result<Self> {
        let id = new_session_id();
        let transcript = Transcript::create(&settings.sessions_dir, &id).await?;
        Ok(Self {
            id,
            alert,
            model,
            tools,
            settings,
            messages: Vec::new(),
            transcript,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Conversation so far, in order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Drive the session to a terminal state.
    pub async fn run(&mut self, cancel: &CancellationToken) -> SessionOutcome {
        info!(session.id = %self.id, log_file = %self.transcript.path().display(), "Starting session");
        SESSIONS_STARTED_TOTAL.inc();
        SESSIONS_ACTIVE.inc();

        let outcome = self.investigate(cancel).await;

        if let SessionOutcome::Failed(reason) = &outcome {
            self.transcript.error(reason).await;
        }
        self.transcript.end(&outcome.to_string()).await;

        SESSIONS_ACTIVE.dec();
        SESSIONS_FINISHED_TOTAL
            .with_label_values(&[outcome.label()])
            .inc();
        info!(session.id = %self.id, outcome = %outcome, "Stopping session");
        outcome
    }

    async fn investigate(&mut self, cancel: &CancellationToken) -> SessionOutcome {
        let alert = match serde_json::to_string(&self.alert) {
            Ok(alert) => alert,
            Err(e) => return SessionOutcome::Failed(format!("failed to serialize alert: {}", e)),
        };
        let tools = self.tools.tools();

        self.messages.push(Message::human(alert.clone()));
        self.messages
            .push(Message::system(self.settings.system_prompt.clone()));
        self.transcript
            .header(&self.id, &alert, &self.settings.system_prompt, &tools)
            .await;

        let max_calls = self.settings.max_calls;
        for call in 1..=max_calls {
            if cancel.is_cancelled() {
                info!(session.id = %self.id, "Session cancelled");
                return SessionOutcome::Cancelled;
            }

            let last_call = call == max_calls;
            if last_call {
                self.messages.push(Message::system(FINAL_CALL_INSTRUCTION));
            }

            info!(session.id = %self.id, call, max_calls, "Calling LLM");
            MODEL_CALLS_TOTAL.inc();
            let timeout = self.settings.model_timeout;
            let response =
                match tokio::time::timeout(timeout, self.model.generate(&self.messages, &tools))
                    .await
                {
                    Ok(Ok(response)) => response,
                    Ok(Err(e)) => {
                        error!(session.id = %self.id, "Failed to call LLM: {:#}", e);
                        return SessionOutcome::Failed(
                            Error::ModelInference(format!("{:#}", e)).to_string(),
                        );
                    }
                    Err(_) => {
                        error!(session.id = %self.id, "LLM call timed out");
                        return SessionOutcome::Failed(
                            Error::ModelInference(format!("timed out after {:?}", timeout))
                                .to_string(),
                        );
                    }
                };

            if let Some(reasoning) = response.reasoning.as_deref() {
                if !reasoning.trim().is_empty() {
                    self.transcript.reasoning(reasoning).await;
                }
            }

            let content = response.content.trim();
            if is_complete(content) {
                info!(session.id = %self.id, phrase = END_SESSION_PHRASE, "LLM indicated investigation is complete");
                self.transcript.response(content).await;
                return SessionOutcome::Complete;
            }

            if last_call {
                self.transcript.response(content).await;
                if !response.tool_calls.is_empty() {
                    info!(
                        session.id = %self.id,
                        discarded = response.tool_calls.len(),
                        "LLM call limit reached with tool calls pending, ending session"
                    );
                    let names: Vec<&str> = response
                        .tool_calls
                        .iter()
                        .map(|call| call.name.as_str())
                        .collect();
                    self.transcript.discarded_tool_calls(&names).await;
                }
                return SessionOutcome::BudgetExhausted;
            }

            if !content.is_empty() {
                self.messages.push(Message::assistant(content));
            }
            self.transcript.response(content).await;

            if response.tool_calls.is_empty() {
                self.messages.push(Message::human(MOTIVATION_TEXT));
                self.transcript.motivation(MOTIVATION_TEXT).await;
            }

            for tool_call in response.tool_calls {
                if let Err(e) = self.execute(tool_call).await {
                    error!(session.id = %self.id, "{}", e);
                    return SessionOutcome::Failed(e.to_string());
                }
            }
        }

        SessionOutcome::BudgetExhausted
    }

    /// Run one proposed tool call and record its result. Only malformed
    /// arguments are fatal; tool failures go back to the model as text.
    async fn execute(&mut self, call: ToolCall) -> Result<()> {
        self.messages.push(Message::tool_call(call.clone()));
        info!(session.id = %self.id, tool = %call.name, "Tool call");
        self.transcript.tool_call(&call.name, &call.arguments).await;

        let arguments = parse_arguments(&call.arguments)?;

        let (content, is_error) = match self.tools.call_tool(&call.name, arguments).await {
            Ok(output) if output.is_error => (format!("Error: {}", output.text), true),
            Ok(output) => (output.text, false),
            Err(e) => {
                warn!(session.id = %self.id, tool = %call.name, "Tool call failed: {}", e);
                (format!("Error: {}", e), true)
            }
        };

        info!(session.id = %self.id, tool = %call.name, response = content.len(), "Tool response");
        self.transcript.tool_response(&call.name, &content).await;
        self.messages.push(Message::tool_result(ToolResult {
            call_id: call.id,
            name: call.name,
            content: content.trim().to_string(),
            is_error,
        }));
        Ok(())
    }
}
