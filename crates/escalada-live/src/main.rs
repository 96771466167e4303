use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast;

use escalada_live::config::StorageBackend;
use escalada_live::http::{HttpState, spawn_http_server};
use escalada_live::{LiveConfig, LiveService, MergeRules, StaticTokens};

#[derive(Parser, Debug)]
#[command(name = "escalada-live", version, about = "Live box state sync daemon")]
struct Cli {
    /// HTTP/WebSocket bind address.
    #[arg(long, env = "HTTP_BIND")]
    bind: Option<SocketAddr>,

    /// `files` or `sqlite`.
    #[arg(long, env = "STORAGE_BACKEND")]
    storage_backend: Option<StorageBackend>,

    #[arg(long, env = "STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    #[arg(long, env = "BACKUP_DIR")]
    backup_dir: Option<PathBuf>,

    /// Keep persisted box states instead of resetting them on start.
    #[arg(long)]
    keep_boxes: bool,

    /// JSON table of bearer tokens to claims.
    #[arg(long, env = "AUTH_TOKENS_FILE")]
    tokens: Option<PathBuf>,

    /// Write one last backup file before exiting.
    #[arg(long)]
    backup_on_exit: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    setup_logging();

    let cli = Cli::parse();
    let mut config = LiveConfig::from_env().context("load configuration")?;
    if let Some(bind) = cli.bind {
        config.http_bind = bind;
    }
    if let Some(backend) = cli.storage_backend {
        config.storage.backend = backend;
    }
    if let Some(dir) = cli.storage_dir {
        config.storage.dir = dir;
    }
    if let Some(dir) = cli.backup_dir {
        config.backup.dir = dir;
    }
    if cli.keep_boxes {
        config.reset_boxes_on_start = false;
    }

    let tokens = match &cli.tokens {
        Some(path) => StaticTokens::from_file(path)?,
        None => {
            tracing::warn!("no token table configured; authenticated endpoints will reject");
            StaticTokens::new()
        }
    };
    tracing::info!(tokens = tokens.len(), "token table loaded");

    let bind = config.http_bind;
    let service = Arc::new(
        LiveService::open(config, Arc::new(MergeRules))
            .await
            .context("open live service")?,
    );
    let shutdown_tx = service.shutdown_sender();
    let mut shutdown_rx = shutdown_tx.subscribe();
    spawn_signal_handler(shutdown_tx.clone());

    let background = service.spawn_background();
    let state = HttpState::new(Arc::clone(&service), Arc::new(tokens));
    let mut http = spawn_http_server(bind, state, shutdown_tx.clone());

    tokio::select! {
        _ = shutdown_rx.recv() => {
            let _ = (&mut http).await;
        }
        res = &mut http => {
            if let Err(err) = res {
                tracing::error!("http task failed: {err}");
            }
            service.shutdown();
        }
    }
    for handle in background {
        let _ = handle.await;
    }

    if cli.backup_on_exit {
        match service.backups().backup_now().await {
            Ok(file) => tracing::info!(file = %file.file_name, "final backup written"),
            Err(err) => tracing::error!("final backup failed: {err}"),
        }
    }
    tracing::info!("shutdown complete");
    Ok(())
}

fn spawn_signal_handler(shutdown_tx: broadcast::Sender<()>) {
    tokio::spawn(async move {
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl-C received, shutting down...");
            }
            _ = async {
                if let Some(ref mut t) = term { t.recv().await; }
            } => {
                tracing::info!("SIGTERM received, shutting down...");
            }
        }
        let _ = shutdown_tx.send(());
    });
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .init();
}
