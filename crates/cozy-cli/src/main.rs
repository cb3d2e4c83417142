// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
mod format;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use cozy_daemon::api::{DiskUsageResponse, StatusResponse};
use format::{Formatter, OutputFormat};
use futures::StreamExt;

#[derive(Parser, Debug)]
#[command(name = "cozy", version, about = "Talk to a running cozy-daemon")]
struct Cli {
    /// Base URL of the daemon's control API.
    #[arg(long, global = true, default_value = "http://127.0.0.1:8089")]
    daemon_url: String,

    /// Output format.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the sync core's background tasks.
    Start,
    /// Stop the sync core's background tasks.
    Stop,
    /// Report whether the core is running and how large the catalog is.
    Status,
    /// Report remote storage usage.
    DiskUsage,
    /// Force a full reconciliation pass against the local tree.
    FullSync,
    /// Stream progress events until interrupted.
    Events,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let formatter = Formatter::new(cli.format);
    let client = reqwest::Client::new();

    let result = match cli.command {
        Commands::Start => cmd_start(&client, &cli.daemon_url).await,
        Commands::Stop => cmd_stop(&client, &cli.daemon_url).await,
        Commands::Status => cmd_status(&client, &cli.daemon_url, &formatter).await,
        Commands::DiskUsage => cmd_disk_usage(&client, &cli.daemon_url, &formatter).await,
        Commands::FullSync => cmd_full_sync(&client, &cli.daemon_url).await,
        Commands::Events => cmd_events(&client, &cli.daemon_url, &formatter).await,
    };

    if let Err(err) = result {
        eprintln!("{}", formatter.format_error(&err.to_string()));
        std::process::exit(1);
    }
    Ok(())
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    bail!("daemon returned {status}: {body}")
}

async fn cmd_start(client: &reqwest::Client, base: &str) -> Result<()> {
    let resp = client.post(format!("{base}/start")).send().await.context("send /start")?;
    check_status(resp).await?;
    println!("started");
    Ok(())
}

async fn cmd_stop(client: &reqwest::Client, base: &str) -> Result<()> {
    let resp = client.post(format!("{base}/stop")).send().await.context("send /stop")?;
    check_status(resp).await?;
    println!("stopped");
    Ok(())
}

async fn cmd_status(client: &reqwest::Client, base: &str, formatter: &Formatter) -> Result<()> {
    let resp = client.get(format!("{base}/status")).send().await.context("send /status")?;
    let resp = check_status(resp).await?;
    let status: StatusResponse = resp.json().await.context("parse status response")?;
    println!("{}", formatter.format_status(&status));
    Ok(())
}

async fn cmd_disk_usage(client: &reqwest::Client, base: &str, formatter: &Formatter) -> Result<()> {
    let resp = client
        .get(format!("{base}/disk-usage"))
        .send()
        .await
        .context("send /disk-usage")?;
    let resp = check_status(resp).await?;
    let usage: DiskUsageResponse = resp.json().await.context("parse disk usage response")?;
    println!("{}", formatter.format_disk_usage(&usage));
    Ok(())
}

async fn cmd_full_sync(client: &reqwest::Client, base: &str) -> Result<()> {
    let resp = client
        .post(format!("{base}/full-sync"))
        .send()
        .await
        .context("send /full-sync")?;
    check_status(resp).await?;
    println!("full sync complete");
    Ok(())
}

async fn cmd_events(client: &reqwest::Client, base: &str, formatter: &Formatter) -> Result<()> {
    let resp = client.get(format!("{base}/events")).send().await.context("send /events")?;
    let resp = check_status(resp).await?;
    let mut stream = resp.bytes_stream();
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("read events stream")?;
        buf.extend_from_slice(&chunk);
        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line = buf.drain(..=pos).collect::<Vec<u8>>();
            let line = &line[..line.len() - 1];
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<serde_json::Value>(line) {
                Ok(event) => println!("{}", formatter.format_event(&event)),
                Err(err) => eprintln!("skipping malformed event line: {err}"),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_status_with_daemon_url_override() {
        let cli = Cli::parse_from(["cozy", "--daemon-url", "http://127.0.0.1:9000", "status"]);
        assert_eq!(cli.daemon_url, "http://127.0.0.1:9000");
        assert!(matches!(cli.command, Commands::Status));
    }

    #[test]
    fn cli_defaults_to_text_format() {
        let cli = Cli::parse_from(["cozy", "events"]);
        assert_eq!(cli.format, OutputFormat::Text);
    }
}
