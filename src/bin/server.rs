//! HTTP server that converts YouTube videos to mp3/mp4 on the fly by piping
//! yt-dlp's output straight into the response.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tubepipe::{
    config::{self, DEFAULT_CONFIG_PATH, RuntimeConfig},
    process::ToolCommand,
    server,
};

#[derive(Debug, Parser)]
#[command(version, about = "Stream YouTube downloads converted by yt-dlp")]
struct Args {
    /// TOML config file; missing files fall back to built-in defaults.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[arg(long)]
    host: Option<String>,
    #[arg(long, env = "PORT")]
    port: Option<u16>,
    /// Path or name of the yt-dlp executable.
    #[arg(long, env = "TUBEPIPE_TOOL")]
    tool: Option<PathBuf>,
    /// Directory holding the front-end assets.
    #[arg(long)]
    public_dir: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> Result<RuntimeConfig> {
        let mut runtime = config::load_runtime_config_from(&self.config)?;
        if let Some(host) = self.host {
            runtime.host = host;
        }
        if let Some(port) = self.port {
            runtime.port = port;
        }
        if let Some(tool) = self.tool {
            runtime.tool.program = tool;
        }
        if let Some(dir) = self.public_dir {
            runtime.public_dir = dir;
        }
        config::validate(&runtime)?;
        Ok(runtime)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let runtime = Args::parse().into_config()?;

    let version = ToolCommand::new(runtime.tool.clone())
        .version()
        .await
        .context("checking yt-dlp")?;
    info!(tool = %runtime.tool.program.display(), %version, "found yt-dlp");

    let app = server::router(&runtime);

    let host: IpAddr = runtime
        .host
        .parse()
        .with_context(|| format!("parsing host {}", runtime.host))?;
    let addr = SocketAddr::new(host, runtime.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!(
        %addr,
        rate_limit = runtime.rate_limit.enabled,
        public_dir = %runtime.public_dir.display(),
        "server listening on http://{}",
        addr
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("running HTTP server")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!(error = %err, "failed to install Ctrl+C handler");
    }
    info!("shutting down");
}
