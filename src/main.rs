//! Claude Sandbox - persistent terminal sessions bridged to the browser
//!
//! Serves the WebSocket terminal bridge and REST diagnostics for a sandbox
//! container running shells and an AI CLI.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use claude_sandbox::{
    config::SandboxConfig,
    container::{ContainerExec, ExecRequest},
    gateway::{build_transports, Gateway},
    session::screen,
};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "claude-sandbox")]
#[command(author = "Claude Sandbox Team")]
#[command(version)]
#[command(about = "Persistent sandbox terminal sessions over WebSockets")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CLAUDE_SANDBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides config)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Check the sandbox transport and multiplexer
    Doctor,

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("claude_sandbox={},tower_http=info", log_level).into());
    let registry = tracing_subscriber::registry().with(filter);
    if cli.log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    let config = match cli.config {
        Some(ref path) => SandboxConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => SandboxConfig::default(),
    };

    match cli.command {
        Commands::Serve { host, port } => run_serve(config, host, port).await?,
        Commands::Doctor => run_doctor(&config).await?,
        Commands::Config { default } => show_config(if default { None } else { Some(&config) })?,
    }

    Ok(())
}

async fn run_serve(
    mut config: SandboxConfig,
    host: Option<String>,
    port: Option<u16>,
) -> Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    let addr = format!("{}:{}", config.server.host, config.server.port);

    let gateway = Gateway::from_config(config).await?;
    gateway.start().await?;

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Claude Sandbox is running. Press Ctrl+C to stop.");

    gateway
        .serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
            }
            tracing::info!("Shutting down...");
        })
        .await?;

    gateway.stop().await;
    Ok(())
}

async fn run_doctor(config: &SandboxConfig) -> Result<()> {
    println!("Claude Sandbox Doctor");
    println!();

    let (exec, ssh) = build_transports(config);
    println!("Checking sandbox transport ({})...", exec.describe());
    let reachable = check(exec.as_ref(), ExecRequest::shell("echo ok"), "Sandbox reachable").await;

    if reachable {
        println!();
        println!("Checking terminal multiplexer...");
        check(exec.as_ref(), ExecRequest::new(screen::version()), "screen installed").await;
    }

    if let Some(ssh) = ssh {
        println!();
        println!("Checking SSH transport ({})...", ssh.describe());
        check(ssh.as_ref(), ExecRequest::shell("echo ok"), "SSH login").await;
    }

    println!();
    println!("Checking storage...");
    match config.storage.state_file.parent() {
        Some(dir) if dir.exists() => println!("  ✓ State directory: {}", dir.display()),
        Some(dir) => println!("  ℹ State directory will be created: {}", dir.display()),
        None => println!("  ✗ Invalid state file path"),
    }

    println!();
    println!("Doctor check complete!");
    Ok(())
}

async fn check(exec: &dyn ContainerExec, request: ExecRequest, label: &str) -> bool {
    match exec.exec(request).await {
        Ok(out) if out.success() => {
            println!("  ✓ {}", label);
            true
        }
        Ok(out) => {
            println!("  ✗ {} (exit {:?}: {})", label, out.status, out.stderr.trim());
            false
        }
        Err(e) => {
            println!("  ✗ {} ({})", label, e);
            false
        }
    }
}

fn show_config(config: Option<&SandboxConfig>) -> Result<()> {
    let config = config.cloned().unwrap_or_default();
    let toml = toml::to_string_pretty(&config)?;
    println!("{}", toml);
    Ok(())
}
