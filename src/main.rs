//! code-sandbox daemon
//!
//! MCP server that runs Python and shell snippets confined to a project
//! directory, each project with its own isolated Python environment.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use code_sandbox_daemon::{backend::LocalBackend, config::Config, mcp};

#[derive(Parser, Debug)]
#[command(name = "code-sandbox-daemon")]
#[command(about = "MCP server for project-confined sandboxed code execution")]
struct Args {
    /// Run in stdio mode (for MCP clients)
    #[arg(long)]
    stdio: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// JSON configuration file (overrides `CODE_SANDBOX_CONFIG`)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout is free for MCP protocol)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.config {
        Some(path) => Config::from_file(path),
        None => Config::from_env(),
    }
    .context("Failed to load configuration")?;

    info!(
        project = ?config.resolved_project_dir(),
        max_timeout = config.execution.max_timeout_seconds,
        "Loaded configuration"
    );

    let backend = LocalBackend::new();

    if args.stdio {
        mcp::serve_stdio(config, backend).await?;
    } else {
        anyhow::bail!("Only --stdio mode is currently supported");
    }

    Ok(())
}
