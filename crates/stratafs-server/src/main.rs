#![warn(missing_docs)]

//! `sfs-server`: runs a StrataFS server reading JSON-encoded requests from
//! stdin, one per line, and writing JSON responses to stdout.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use stratafs_server::{ClientRequest, LogFormat, Server, ServerConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "sfs-server", about = "StrataFS metadata server", version)]
struct Cli {
    /// Config file (.toml or .json)
    #[arg(long, short, env = "SFS_CONFIG", default_value = "sfs-server.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, missing) = if cli.config.exists() {
        let config = ServerConfig::from_file(&cli.config)
            .with_context(|| format!("loading {}", cli.config.display()))?;
        (config, false)
    } else {
        (ServerConfig::default(), true)
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter.clone()));
    match config.log_format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init(),
    }

    if missing {
        tracing::warn!("Config file not found, using defaults: {}", cli.config.display());
    }
    tracing::info!(server = %config.server_name, "StrataFS server starting...");

    let server = Server::new(config)?;
    let (req_tx, req_rx) = mpsc::channel::<ClientRequest>(1024);
    let (resp_tx, mut resp_rx) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = watch::channel(false);

    let server_handle = tokio::spawn(server.run(req_rx, resp_tx, stop_rx));

    let reader_handle = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match serde_json::from_str::<ClientRequest>(&line) {
                    Ok(req) => {
                        if req_tx.send(req).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("Dropping malformed request: {}", e),
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("stdin read error: {}", e);
                    break;
                }
            }
        }
    });

    let writer_handle = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(resp) = resp_rx.recv().await {
            let mut line = match serde_json::to_vec(&resp) {
                Ok(line) => line,
                Err(e) => {
                    tracing::error!("Failed to encode response: {}", e);
                    continue;
                }
            };
            line.push(b'\n');
            if let Err(e) = stdout.write_all(&line).await {
                tracing::error!("stdout write error: {}", e);
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down...");
            let _ = stop_tx.send(true);
        }
    });

    let stats = server_handle.await??;
    reader_handle.abort();
    let _ = writer_handle.await;
    tracing::info!(
        started = stats.ops_started,
        completed = stats.ops_completed,
        failed = stats.ops_failed,
        unsupported = stats.ops_unsupported,
        "StrataFS server stopped"
    );
    Ok(())
}
