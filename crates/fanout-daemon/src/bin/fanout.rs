//! Fanout CLI - publish a directory and mirror it elsewhere
//!
//! Usage:
//!   fanout serve <root>                          Watch and publish a directory
//!   fanout mirror --server <url> --root <dir>    Follow a relay into a directory
//!   fanout config [--write]                      Print (or write) a sample config

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fanout_core::Config;
use fanout_daemon::{Downloader, DownloaderConfig, HttpFetcher, MirrorClient, ReconnectPolicy};

#[derive(Parser)]
#[command(name = "fanout")]
#[command(about = "Mirror a directory tree to other machines as it changes", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: platform config directory)
    #[arg(short, long, global = true, env = "FANOUT_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch a directory and publish its changes
    Serve {
        /// Directory to publish
        root: PathBuf,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind address
        #[arg(short, long)]
        bind: Option<IpAddr>,
    },

    /// Follow a relay and mirror its directory locally
    Mirror {
        /// Relay URL, e.g. http://source:8888
        #[arg(short, long)]
        server: Option<String>,

        /// Local directory to mirror into
        #[arg(short, long)]
        root: Option<PathBuf>,

        /// Concurrent downloads
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Print a sample configuration
    Config {
        /// Write the defaults to the config path instead of printing them
        #[arg(long)]
        write: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Set up logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };

    match cli.command {
        Commands::Serve { root, port, bind } => {
            let port = port.unwrap_or(config.server.port);
            let bind = bind.unwrap_or(config.server.bind);
            run_serve(root, SocketAddr::new(bind, port)).await?;
        }
        Commands::Mirror { server, root, workers } => {
            run_mirror(config, server, root, workers).await?;
        }
        Commands::Config { write } => {
            if write {
                let path = match &cli.config {
                    Some(path) => {
                        Config::default().save_to(path)?;
                        path.clone()
                    }
                    None => Config::default().save()?,
                };
                println!("Wrote {}", path.display());
            } else {
                print!("{}", Config::sample());
            }
        }
    }

    Ok(())
}

#[cfg(target_os = "linux")]
async fn run_serve(root: PathBuf, addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    use fanout_daemon::{InotifyWatcher, RelayServer};

    if !root.is_dir() {
        error!("Root must be a directory: {:?}", root);
        return Err("Not a directory".into());
    }

    info!("Starting Fanout relay...");
    let watcher = InotifyWatcher::watch(&root)?;
    info!("  Publishing: {:?}", watcher.root());
    info!("  Listening on: {}", addr);

    let pump = watcher.spawn();
    let relay = RelayServer::new(watcher.clone());

    // Handle Ctrl+C
    tokio::select! {
        result = relay.serve(addr) => {
            if let Err(e) = result {
                error!("Relay error: {:?}", e);
            }
        }
        result = pump => {
            match result {
                Ok(Ok(())) => info!("Watcher stopped"),
                Ok(Err(e)) => error!("Watcher error: {}", e),
                Err(e) => error!("Watcher task failed: {}", e),
            }
        }
        _ = signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    watcher.close();
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn run_serve(_root: PathBuf, _addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    Err("serving requires inotify (Linux)".into())
}

async fn run_mirror(
    config: Config,
    server: Option<String>,
    root: Option<PathBuf>,
    workers: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let server = server
        .or(config.mirror.server_url.clone())
        .ok_or("no relay URL given (--server or [mirror] server_url)")?;
    let root = root
        .or(config.mirror.root.clone())
        .ok_or("no mirror root given (--root or [mirror] root)")?;

    std::fs::create_dir_all(&root)?;
    let root = root.canonicalize()?;

    let mut downloads = DownloaderConfig::from_mirror(&root, &config.mirror);
    if let Some(workers) = workers {
        downloads.workers = workers;
    }

    info!("Starting Fanout mirror...");
    info!("  Following: {}", server);
    info!("  Mirroring into: {:?}", root);
    info!("  Workers: {}", downloads.workers);

    let downloader = Arc::new(Downloader::new(downloads, Arc::new(HttpFetcher::new()?)));
    let client = MirrorClient::new(
        &server,
        downloader.clone(),
        ReconnectPolicy::from(&config.reconnect),
    )?;

    // Handle Ctrl+C
    tokio::select! {
        result = client.run() => {
            if let Err(e) = result {
                error!("Mirror error: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    downloader.close();
    Ok(())
}
