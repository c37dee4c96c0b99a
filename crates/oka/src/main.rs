use anyhow::{bail, Context};
use clap::Parser;
use serde_json::Value;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use oka::{
    agent::{create_model, SessionSettings},
    config::{CommandConfig, Config},
    logging,
    mcp::ToolRegistry,
    runbook::{RunbookServer, SERVER_NAME},
    server::Server,
    sources::OpsGenieSource,
    supervisor::Supervisor,
};

const ALERT_QUEUE_SIZE: usize = 64;

/// Investigates alerts with an LLM and MCP tool servers.
#[derive(Debug, Parser)]
#[command(name = "oka", version, about)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Investigate the alert in this JSON file and exit
    #[arg(long)]
    alert_file: Option<PathBuf>,

    #[arg(long)]
    log_level: Option<String>,

    #[arg(long)]
    log_file: Option<PathBuf>,

    #[arg(long)]
    sessions_log_dir: Option<PathBuf>,

    /// Maximum number of model calls per session
    #[arg(long)]
    max_calls: Option<usize>,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if let Some(file) = &self.log_file {
            config.log_file = Some(file.clone());
        }
        if let Some(dir) = &self.sessions_log_dir {
            config.sessions_log_dir = dir.clone();
        }
        if let Some(max_calls) = self.max_calls {
            config.max_calls = max_calls;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;

    logging::init(&config.log_level, config.log_file.as_deref())?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting oka");
    config.log_summary();

    std::fs::create_dir_all(&config.sessions_log_dir).with_context(|| {
        format!(
            "failed to create sessions directory {}",
            config.sessions_log_dir.display()
        )
    })?;

    let cancel = CancellationToken::new();
    tokio::spawn(wait_for_shutdown(cancel.clone()));

    run_init_commands(&config.init_commands).await?;

    // Shared tool servers live for the whole process
    let mut registry = ToolRegistry::new(config.tool_timeout());
    let registered = async {
        registry.register_servers(&config.mcp_servers(true)).await?;
        if config.runbook.enabled {
            let runbook = RunbookServer::new(std::time::Duration::from_secs(
                config.runbook.timeout_seconds,
            ))?;
            registry.register_server(SERVER_NAME, Arc::new(runbook)).await?;
        }
        Ok::<(), oka::Error>(())
    }
    .await;
    if let Err(e) = registered {
        if let Err(close_err) = registry.close().await {
            warn!("Failed to close MCP servers: {}", close_err);
        }
        return Err(e.into());
    }
    info!(tools = registry.len(), "Registered shared MCP tools");
    let registry = Arc::new(registry);

    let model = create_model(&config.llm)?;
    let settings = SessionSettings::from_config(&config)?;
    let supervisor = Arc::new(
        Supervisor::new(
            registry.clone(),
            config.mcp_servers(false),
            model,
            settings,
        )
        .with_concurrency_limit(config.max_concurrent_sessions),
    );

    let result = match &cli.alert_file {
        Some(path) => run_batch(&supervisor, path, &cancel).await,
        None => run_continuous(&config, supervisor.clone(), cancel.clone()).await,
    };

    // Release the supervisor's reference so the registry can be closed
    drop(supervisor);
    match Arc::try_unwrap(registry) {
        Ok(mut registry) => {
            if let Err(e) = registry.close().await {
                error!("Failed to close MCP servers: {}", e);
            }
        }
        Err(_) => warn!("Shared MCP servers still in use at shutdown"),
    }

    info!("Stopped oka");
    result
}

async fn run_batch(
    supervisor: &Supervisor,
    path: &std::path::Path,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read alert file {}", path.display()))?;
    let alert: Value = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse alert file {}", path.display()))?;

    let outcome = supervisor.process(alert, cancel).await?;
    info!(outcome = %outcome, "Investigation finished");
    Ok(())
}

async fn run_continuous(
    config: &Config,
    supervisor: Arc<Supervisor>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let (tx, rx) = mpsc::channel(ALERT_QUEUE_SIZE);
    let mut sources = Vec::new();

    if config.opsgenie.is_enabled() {
        let source = OpsGenieSource::new(&config.opsgenie)?;
        sources.push(tokio::spawn(source.run(tx.clone(), cancel.clone())));
    }

    if let Some(addr) = &config.server.addr {
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid server address {}", addr))?;
        let server = Server::new(tx.clone());
        let cancel = cancel.clone();
        sources.push(tokio::spawn(async move {
            if let Err(e) = server.serve(addr, cancel).await {
                error!("Server failed: {}", e);
            }
        }));
    }

    if sources.is_empty() {
        bail!("no alert source configured: set opsgenie.team or server.addr, or pass --alert-file");
    }
    // The queue closes once every source has stopped
    drop(tx);

    supervisor.run(rx, cancel).await;
    for source in sources {
        if let Err(e) = source.await {
            error!("Alert source task failed: {}", e);
        }
    }
    Ok(())
}

async fn run_init_commands(commands: &[CommandConfig]) -> anyhow::Result<()> {
    for command in commands {
        info!(command = %command.command, "Running init command");
        let output = tokio::process::Command::new(&command.command)
            .args(&command.args)
            .envs(&command.env)
            .output()
            .await
            .with_context(|| format!("failed to run init command {}", command.command))?;

        debug!(
            command = %command.command,
            "stdout: {}",
            String::from_utf8_lossy(&output.stdout).trim()
        );
        if !output.status.success() {
            bail!(
                "init command {} failed with {}: {}",
                command.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
    }
    Ok(())
}

async fn wait_for_shutdown(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = terminate.recv() => {},
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown signal received");
    cancel.cancel();
}
