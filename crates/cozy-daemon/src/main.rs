// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use anyhow::{Context, Result};
use clap::Parser;
use cozy_config::{apply_env_overrides, load_config, validate_config};
use cozy_daemon::{build_app, AppState};
use cozy_protocol::HttpRemoteClient;
use cozy_sync::Core;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cozy-daemon", version, about = "Local sync core daemon")]
struct Args {
    /// Bind address for the control API.
    #[arg(long, default_value = "127.0.0.1:8089")]
    bind: String,

    /// Path to a TOML config file. Falls back to environment variables and
    /// defaults when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("cozy=debug,cozy_sync=debug,cozy_daemon=debug")
    } else {
        EnvFilter::new("cozy=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = load_config(args.config.as_deref()).context("load sync configuration")?;
    apply_env_overrides(&mut config);
    for warning in validate_config(&config).context("validate sync configuration")? {
        warn!(?warning, "configuration warning");
    }

    let token = config
        .token
        .as_ref()
        .map(|t| t.expose().to_string())
        .unwrap_or_default();
    let remote_client = Arc::new(HttpRemoteClient::new(config.remote_url.clone(), token));

    let core = Arc::new(Core::new(config, remote_client).context("open sync core")?);
    let state = Arc::new(AppState::new(core));
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    info!(bind = %args.bind, "cozy-daemon listening");

    axum::serve(listener, app).await.context("serve")
}
