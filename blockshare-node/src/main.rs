// blockshare: chunk a file into blocks, or run a peer that serves and downloads them.

use std::path::PathBuf;

use anyhow::Context;
use blockshare_core::{create_file_metadata, DEFAULT_BLOCK_SIZE};
use blockshare_node::{config, logging, Neighbor, Node};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "blockshare",
    version,
    about = "Share a file between peers as fixed-size blocks"
)]
struct Cli {
    /// Config file (defaults to ~/.config/blockshare/config.toml, then /etc/blockshare/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Split FILE into blocks and write its metadata record.
    CreateMeta {
        file: PathBuf,
        #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
        block_size: u32,
        #[arg(long)]
        blocks_root: Option<PathBuf>,
        #[arg(long)]
        metadata_root: Option<PathBuf>,
    },
    /// Run a peer until Ctrl+C or SIGTERM.
    Run {
        /// Metadata file of a local file to serve; without it the node downloads from neighbors.
        #[arg(long)]
        meta: Option<PathBuf>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        download_root: Option<PathBuf>,
        /// Neighbors as host:port, added to those in the config file.
        neighbors: Vec<Neighbor>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut cfg = config::load(cli.config.as_deref()).context("loading config")?;
    logging::init_tracing(&cfg.log_level);

    match cli.command {
        Command::CreateMeta {
            file,
            block_size,
            blocks_root,
            metadata_root,
        } => {
            cfg.check_block_size(block_size)
                .context("block size exceeds max_payload_bytes")?;
            let blocks_root = blocks_root.unwrap_or(cfg.blocks_root);
            let metadata_root = metadata_root.unwrap_or(cfg.metadata_root);
            let created = create_file_metadata(&file, block_size, &blocks_root, &metadata_root)
                .with_context(|| format!("creating metadata for {}", file.display()))?;
            let info = &created.content.info;
            println!("file:       {}", info.file_name);
            println!("size:       {} bytes", info.file_size);
            println!("blocks:     {} x {} bytes", info.block_count, info.block_size);
            println!("sha256:     {}", info.checksum);
            println!("blocks dir: {}", created.content.blocks_directory);
            println!("metadata:   {}", created.metadata_path.display());
            Ok(())
        }
        Command::Run {
            meta,
            port,
            download_root,
            neighbors,
        } => {
            if let Some(meta) = meta {
                cfg.metadata_path = Some(meta);
            }
            if let Some(port) = port {
                cfg.listen_port = port;
            }
            if let Some(root) = download_root {
                cfg.download_root = root;
            }
            cfg.neighbors.extend(neighbors);

            let rt = tokio::runtime::Runtime::new().context("starting runtime")?;
            rt.block_on(async {
                let node = Node::new(cfg).context("initialising node")?;
                let bound = node.bind().context("binding listener")?;
                if let Ok(addr) = bound.local_addr() {
                    info!(%addr, "listening");
                }
                let (tx, rx) = watch::channel(false);
                tokio::spawn(async move {
                    if let Err(e) = shutdown_signal().await {
                        warn!(error = %e, "signal handler failed, shutting down");
                    }
                    let _ = tx.send(true);
                });
                bound.run(rx).await.context("running node")
            })
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    info!("shutdown requested");
    Ok(())
}
