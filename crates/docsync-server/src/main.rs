//! docsync: sync server and terminal client for replicated documents.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use docsync_core::{Repo, RepoConfig};
use docsync_server::config::Config;
use docsync_server::{
    run_terminal, server, FsStorage, ServerOptions, TerminalOptions, WebSocketServer,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "docsync")]
#[command(about = "Replicated document sync over WebSocket")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Directory holding config.json (written with defaults if missing)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the sync server
    Serve {
        /// Address to listen on [default: 0.0.0.0:1323]
        #[arg(short, long)]
        listen: Option<String>,

        /// WebSocket path [default: /ws]
        #[arg(long)]
        path: Option<String>,

        /// Persist documents in this directory
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Serve the built page from this directory [default: public]
        #[arg(long)]
        static_dir: Option<PathBuf>,
    },

    /// Run the counter page in the terminal
    Client {
        /// Sync server URL [default: ws://localhost:1323/ws]
        #[arg(short, long)]
        server: Option<String>,

        /// Page URL; its fragment is the document id
        #[arg(long, default_value = "http://localhost:5173/")]
        url: String,

        /// Persist documents in this directory
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

fn build_repo(data_dir: Option<PathBuf>) -> Result<(Repo, docsync_core::Outgoing)> {
    let mut config = RepoConfig::new();
    if let Some(dir) = data_dir {
        let storage = FsStorage::new(&dir)
            .with_context(|| format!("Failed to open data directory: {:?}", dir))?;
        info!("Storing documents in {:?}", dir);
        config = config.with_storage(Arc::new(storage));
    }
    Ok(Repo::new(config))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,docsync_server=debug,docsync_core=debug"
    } else {
        "info,docsync_server=info,docsync_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load_or_default(args.config.as_deref())?;

    match args.command {
        Command::Serve {
            listen,
            path,
            data_dir,
            static_dir,
        } => {
            let listen = listen.unwrap_or(config.server.listen);
            let options = ServerOptions {
                ws_path: path.unwrap_or(config.server.path),
                static_dir: static_dir.or(config.server.static_dir),
                handshake_timeout: Duration::from_millis(config.server.handshake_timeout_ms),
            };
            let (repo, outgoing) = build_repo(data_dir.or(config.server.data_dir))?;

            info!("Starting docsync server {}", repo.id());
            let listener = WebSocketServer::bind(&listen).await?;
            info!("Server running. Press Ctrl+C to stop.");

            server::run(listener, repo, outgoing, options, async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;
        }
        Command::Client {
            server,
            url,
            data_dir,
        } => {
            let server_url = server.unwrap_or(config.client.server);
            let (repo, outgoing) = build_repo(data_dir.or(config.client.data_dir))?;

            info!("Starting docsync client {} against {}", repo.id(), server_url);
            run_terminal(
                repo,
                outgoing,
                TerminalOptions {
                    server_url,
                    page_url: url,
                    reconnect: (&config.reconnect).into(),
                },
            )
            .await?;
        }
    }

    info!("Shutting down");
    Ok(())
}
