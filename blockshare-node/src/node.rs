//! Node assembly: builds the shared core from config and runs the server and client loops together.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use blockshare_core::{load_metadata_file, MetadataError, PeerCore};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tracing::info;

use crate::client::{run_client, ClientContext};
use crate::config::{Config, ConfigError};
use crate::server::{self, run_server, ServerContext};

/// Peer state shared by the server handlers and the client loop.
pub type SharedCore = Arc<Mutex<PeerCore>>;

/// Resolves once shutdown is signalled. A dropped sender counts as shutdown.
pub(crate) async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// A configured node that has not bound its listener yet.
#[derive(Debug)]
pub struct Node {
    config: Config,
    core: SharedCore,
}

impl Node {
    /// Validate the config and build the core. With `metadata_path` set this node is the source
    /// of that file; without it the node starts idle and downloads whatever a neighbor offers.
    pub fn new(config: Config) -> Result<Self, NodeError> {
        config.validate()?;
        let core = match &config.metadata_path {
            Some(path) => {
                let local = load_metadata_file(path).map_err(|source| NodeError::LoadMetadata {
                    path: path.clone(),
                    source,
                })?;
                info!(
                    file = %local.info.file_name,
                    blocks = local.info.block_count,
                    checksum = %local.info.checksum,
                    "serving local file"
                );
                PeerCore::with_local_metadata(local, config.download_root.clone())
            }
            None => {
                info!("no local metadata, waiting for neighbors");
                PeerCore::new(config.download_root.clone())
            }
        };
        Ok(Self {
            config,
            core: Arc::new(Mutex::new(core)),
        })
    }

    pub fn core(&self) -> SharedCore {
        self.core.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bind the listen port. Port 0 picks a free port; see [`BoundNode::local_addr`].
    pub fn bind(self) -> Result<BoundNode, NodeError> {
        let port = self.config.listen_port;
        let listener = server::bind(port).map_err(|source| NodeError::Bind { port, source })?;
        Ok(BoundNode {
            node: self,
            listener,
        })
    }

    /// Bind and run until shutdown.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), NodeError> {
        self.bind()?.run(shutdown).await
    }
}

/// A node with its listener bound, ready to run.
#[derive(Debug)]
pub struct BoundNode {
    node: Node,
    listener: TcpListener,
}

impl BoundNode {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn core(&self) -> SharedCore {
        self.node.core()
    }

    /// Run the server and client loops until `shutdown` flips to true, then wait for both.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), NodeError> {
        let Self { node, listener } = self;
        let cfg = node.config;
        let server_ctx = ServerContext {
            core: node.core.clone(),
            max_payload: cfg.max_payload_bytes,
            io_timeout: cfg.io_timeout(),
        };
        let client_ctx = ClientContext {
            core: node.core,
            neighbors: cfg.neighbors.clone(),
            startup_delay: cfg.startup_delay(),
            poll_interval: cfg.poll_interval(),
            io_timeout: cfg.io_timeout(),
            max_payload: cfg.max_payload_bytes,
        };
        info!(neighbors = client_ctx.neighbors.len(), "node started");

        let server = tokio::spawn(run_server(
            listener,
            server_ctx,
            cfg.max_inbound_connections,
            shutdown.clone(),
        ));
        let client = tokio::spawn(run_client(client_ctx, shutdown));
        let (server, client) = tokio::join!(server, client);
        server?;
        client?;
        info!("node stopped");
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to load metadata {}: {source}", path.display())]
    LoadMetadata {
        path: PathBuf,
        source: MetadataError,
    },
    #[error("failed to bind port {port}: {source}")]
    Bind { port: u16, source: std::io::Error },
    #[error("node task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
