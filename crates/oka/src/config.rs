use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::{Error, Result};

/// Config file looked up when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "oka.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    /// Maximum number of model calls per session
    pub max_calls: usize,
    pub sessions_log_dir: PathBuf,
    pub slack_handle: String,
    pub model_timeout_seconds: u64,
    pub tool_timeout_seconds: u64,
    /// Upper bound on concurrently running sessions, unbounded when unset
    pub max_concurrent_sessions: Option<usize>,
    pub init_commands: Vec<CommandConfig>,
    pub llm: LlmConfig,
    pub mcp_servers: BTreeMap<String, McpServerConfig>,
    pub runbook: RunbookConfig,
    pub opsgenie: OpsGenieConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CommandConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LlmProviderKind {
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "openai")]
    OpenAI,
    #[serde(rename = "google")]
    Google,
    #[serde(rename = "mock")]
    Mock,
}

impl std::fmt::Display for LlmProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmProviderKind::Anthropic => write!(f, "anthropic"),
            LlmProviderKind::OpenAI => write!(f, "openai"),
            LlmProviderKind::Google => write!(f, "google"),
            LlmProviderKind::Mock => write!(f, "mock"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LlmConfig {
    pub provider: LlmProviderKind,
    pub model: String,
    /// Falls back to the provider's API key environment variable when unset
    pub token: Option<String>,
    pub endpoint: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProviderKind::Anthropic,
            model: "claude-3-5-sonnet-latest".to_string(),
            token: None,
            endpoint: None,
            temperature: None,
            max_tokens: Some(4096),
        }
    }
}

/// An MCP server entry. Exactly one of `command` (stdio) or `url` (streamable
/// HTTP) must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct McpServerConfig {
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub url: Option<String>,
    pub disabled: bool,
    pub initialize_timeout_seconds: Option<u64>,
    pub shared: Option<bool>,
    pub isolate_kubeconfig: Option<bool>,
}

impl McpServerConfig {
    /// Servers are shared across sessions unless explicitly marked otherwise.
    pub fn is_shared(&self) -> bool {
        self.shared.unwrap_or(true)
    }

    pub fn initialize_timeout(&self) -> Option<Duration> {
        self.initialize_timeout_seconds.map(Duration::from_secs)
    }

    /// Kubernetes servers get a private copy of the kubeconfig so they cannot
    /// switch the operator's current context.
    pub fn wants_isolated_kubeconfig(&self) -> bool {
        self.isolate_kubeconfig.unwrap_or_else(|| {
            self.command
                .as_deref()
                .is_some_and(|command| command.contains("kubernetes"))
        })
    }

    /// Environment with `${VAR}` references expanded from the process environment.
    pub fn resolved_env(&self) -> HashMap<String, String> {
        self.env
            .iter()
            .map(|(key, value)| (key.clone(), expand_env_vars(value)))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunbookConfig {
    pub enabled: bool,
    pub timeout_seconds: u64,
}

impl Default for RunbookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OpsGenieConfig {
    pub api_url: String,
    /// Environment variable holding the API key
    pub env_var: String,
    pub interval_seconds: u64,
    pub query_string: String,
    pub team: String,
}

impl Default for OpsGenieConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.opsgenie.com".to_string(),
            env_var: "OPSGENIE_TOKEN".to_string(),
            interval_seconds: 30,
            query_string: r#"responders: "{{ .Team }}" AND status: open"#.to_string(),
            team: String::new(),
        }
    }
}

impl OpsGenieConfig {
    pub fn is_enabled(&self) -> bool {
        !self.team.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub addr: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
            max_calls: 20,
            sessions_log_dir: PathBuf::from("sessions"),
            slack_handle: String::new(),
            model_timeout_seconds: 180,
            tool_timeout_seconds: 180,
            max_concurrent_sessions: None,
            init_commands: vec![],
            llm: LlmConfig::default(),
            mcp_servers: BTreeMap::new(),
            runbook: RunbookConfig::default(),
            opsgenie: OpsGenieConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Config {
    /// Load the configuration. An explicitly named file must exist; the
    /// default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // Load environment variables from .env file if it exists
        let _ = dotenvy::dotenv();

        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        if !path.exists() {
            if required {
                return Err(Error::Config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        let config = Self::from_yaml(&content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))?;
        info!(file = %path.display(), "Loaded config");
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_calls == 0 {
            return Err(Error::Config("max_calls must be at least 1".to_string()));
        }
        if self.max_concurrent_sessions == Some(0) {
            return Err(Error::Config(
                "max_concurrent_sessions must be at least 1 when set".to_string(),
            ));
        }
        for (name, server) in &self.mcp_servers {
            if name.is_empty() {
                return Err(Error::Config("MCP server names cannot be empty".to_string()));
            }
            match (&server.command, &server.url) {
                (Some(_), Some(_)) => {
                    return Err(Error::Config(format!(
                        "MCP server {} sets both command and url",
                        name
                    )))
                }
                (None, None) => {
                    return Err(Error::Config(format!(
                        "MCP server {} needs either command or url",
                        name
                    )))
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Servers filtered by sharing mode, in name order.
    pub fn mcp_servers(&self, shared: bool) -> BTreeMap<String, McpServerConfig> {
        self.mcp_servers
            .iter()
            .filter(|(_, server)| server.is_shared() == shared)
            .map(|(name, server)| (name.clone(), server.clone()))
            .collect()
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_seconds)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_seconds)
    }

    /// Log the effective configuration at debug level, without secrets.
    pub fn log_summary(&self) {
        debug!(
            log_level = %self.log_level,
            log_file = ?self.log_file,
            max_calls = self.max_calls,
            sessions_log_dir = %self.sessions_log_dir.display(),
            slack_handle = %self.slack_handle,
            max_concurrent_sessions = ?self.max_concurrent_sessions,
            init_commands = self.init_commands.len(),
            "Effective configuration"
        );
        debug!(provider = %self.llm.provider, model = %self.llm.model, "LLM");
        debug!(
            api_url = %self.opsgenie.api_url,
            query_string = %self.opsgenie.query_string,
            env_var = %self.opsgenie.env_var,
            interval_seconds = self.opsgenie.interval_seconds,
            team = %self.opsgenie.team,
            "OpsGenie"
        );
        for (name, server) in &self.mcp_servers {
            match (&server.command, &server.url) {
                (Some(command), _) => debug!(
                    server = %name,
                    shared = server.is_shared(),
                    "MCP server: {} {}",
                    command,
                    server.args.join(" ")
                ),
                (None, Some(url)) => {
                    debug!(server = %name, shared = server.is_shared(), "MCP server: {}", url)
                }
                (None, None) => {}
            }
        }
    }
}

/// Expand `${VAR}` references. Unset variables expand to an empty string.
pub fn expand_env_vars(value: &str) -> String {
    let mut result = value.to_string();
    let mut search_from = 0;

    while let Some(offset) = result[search_from..].find("${") {
        let start = search_from + offset;
        let Some(end_offset) = result[start..].find('}') else {
            break;
        };
        let end = start + end_offset;
        let var_name = &result[start + 2..end];
        let replacement = std::env::var(var_name).unwrap_or_default();
        result.replace_range(start..=end, &replacement);
        search_from = start + replacement.len();
    }

    result
}
