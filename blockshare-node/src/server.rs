//! Inbound side: accept loop and the one-request-per-connection handler.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use blockshare_core::{serialize_metadata, Frame, Message, MessageError, MessageType};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::node::{shutdown_requested, SharedCore};
use crate::storage::{self, StorageError};
use crate::transport;

const LISTEN_BACKLOG: u32 = 1024;

/// Bind 0.0.0.0:`port` with address reuse so a quick restart does not hit "address in use".
pub fn bind(port: u16) -> std::io::Result<TcpListener> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(SocketAddr::from(([0, 0, 0, 0], port)))?;
    socket.listen(LISTEN_BACKLOG)
}

/// Per-handler settings shared by every inbound connection.
#[derive(Debug, Clone)]
pub struct ServerContext {
    pub core: SharedCore,
    pub max_payload: u32,
    pub io_timeout: Duration,
}

/// Accept until shutdown. Each connection gets its own task; at most `max_connections`
/// handlers run at once and the loop waits for a free slot before accepting more.
pub async fn run_server(
    listener: TcpListener,
    ctx: ServerContext,
    max_connections: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let slots = Arc::new(Semaphore::new(max_connections));
    let port = listener.local_addr().map(|a| a.port()).unwrap_or_default();
    info!(port, "waiting for connections");
    loop {
        let permit = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            permit = slots.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };
        let accepted = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    handle_connection(stream, peer, &ctx).await;
                    drop(permit);
                });
            }
            Err(e) => {
                warn!(port, error = %e, "accept failed");
            }
        }
    }
    info!(port, "server loop stopped");
}

/// Receive one message, answer it, close.
pub async fn handle_connection(mut stream: TcpStream, peer: SocketAddr, ctx: &ServerContext) {
    let frame = match timeout(
        ctx.io_timeout,
        transport::recv_frame(&mut stream, ctx.max_payload),
    )
    .await
    {
        Ok(Ok(frame)) => frame,
        Ok(Err(e)) => {
            warn!(%peer, error = %e, "failed to read request");
            return;
        }
        Err(_) => {
            warn!(%peer, "timed out waiting for request");
            return;
        }
    };

    if let Some(response) = respond(frame, peer, ctx).await {
        let kind = response.message_type();
        match timeout(ctx.io_timeout, transport::send_message(&mut stream, response)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(%peer, ?kind, error = %e, "failed to send response"),
            Err(_) => warn!(%peer, ?kind, "timed out sending response"),
        }
    }
    let _ = stream.shutdown().await;
}

/// Decide the response to one request frame. `None` means nothing is sent back.
pub async fn respond(frame: Frame, peer: SocketAddr, ctx: &ServerContext) -> Option<Message> {
    match Message::from_frame(frame) {
        Ok(Message::GetMetadata) => Some(metadata_response(peer, ctx).await),
        Ok(Message::RequestBlock { index }) => Some(block_response(index, peer, ctx).await),
        Err(MessageError::Truncated {
            kind: MessageType::RequestBlock,
            len,
        }) => {
            debug!(%peer, len, "short REQUEST_BLOCK payload");
            Some(Message::Error("invalid REQUEST_BLOCK payload".into()))
        }
        Ok(other) => {
            info!(%peer, kind = ?other.message_type(), "unsupported request type, ignoring");
            None
        }
        Err(e) => {
            info!(%peer, error = %e, "unsupported request, ignoring");
            None
        }
    }
}

async fn metadata_response(peer: SocketAddr, ctx: &ServerContext) -> Message {
    let metadata = ctx.core.lock().await.advertised_metadata().cloned();
    let Some(metadata) = metadata else {
        debug!(%peer, "metadata requested before any is known");
        return Message::Error("peer has no metadata available".into());
    };
    match serialize_metadata(&metadata) {
        Ok(text) => {
            info!(%peer, file = %metadata.info.file_name, "sending metadata");
            Message::MetadataResponse(text)
        }
        Err(e) => {
            warn!(%peer, error = %e, "failed to serialize metadata");
            Message::Error("metadata unavailable".into())
        }
    }
}

async fn block_response(index: u32, peer: SocketAddr, ctx: &ServerContext) -> Message {
    // Lock only to resolve the path; the file read happens unlocked.
    let resolved = ctx.core.lock().await.resolve_block_request(index);
    let path = match resolved {
        Ok(path) => path,
        Err(e) => {
            debug!(%peer, block = index, reason = %e, "rejecting block request");
            return Message::Error(e.to_string());
        }
    };
    match storage::read_block(&path).await {
        Ok(data) => {
            info!(%peer, block = index, "serving block");
            Message::BlockData { index, data }
        }
        Err(StorageError::MissingBlock(p)) => {
            warn!(%peer, block = index, path = %p.display(), "block file missing");
            Message::Error(format!("block {index} not found"))
        }
        Err(e) => {
            warn!(%peer, block = index, error = %e, "failed to read block");
            Message::Error(format!("block {index} not found"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockshare_core::PeerCore;
    use tokio::sync::Mutex;

    fn ctx(core: PeerCore) -> ServerContext {
        ServerContext {
            core: Arc::new(Mutex::new(core)),
            max_payload: 1 << 20,
            io_timeout: Duration::from_secs(1),
        }
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40000))
    }

    #[tokio::test]
    async fn short_block_request_gets_error() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ctx(PeerCore::new(tmp.path()));
        let frame = Frame::new(MessageType::RequestBlock.code(), vec![0, 1]);
        assert!(matches!(
            respond(frame, peer(), &ctx).await,
            Some(Message::Error(_))
        ));
    }

    #[tokio::test]
    async fn non_request_types_get_no_response() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ctx(PeerCore::new(tmp.path()));
        let block = Message::BlockData {
            index: 0,
            data: vec![1, 2, 3],
        };
        assert_eq!(respond(block.into_frame(), peer(), &ctx).await, None);
        assert_eq!(respond(Frame::new(42, Vec::new()), peer(), &ctx).await, None);
    }

    #[tokio::test]
    async fn missing_block_file_answers_error() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("notes.txt");
        std::fs::write(&src, b"0123456789").unwrap();
        let created = blockshare_core::create_file_metadata(
            &src,
            4,
            &tmp.path().join("blocks"),
            &tmp.path().join("metadata"),
        )
        .unwrap();
        std::fs::remove_file(created.content.blocks_dir().join("block_1.bin")).unwrap();
        let ctx = ctx(PeerCore::with_local_metadata(
            created.content,
            tmp.path().join("downloads"),
        ));

        let missing = respond(Message::RequestBlock { index: 1 }.into_frame(), peer(), &ctx).await;
        assert!(matches!(missing, Some(Message::Error(_))));
        let present = respond(Message::RequestBlock { index: 0 }.into_frame(), peer(), &ctx).await;
        assert_eq!(
            present,
            Some(Message::BlockData {
                index: 0,
                data: b"0123".to_vec()
            })
        );
    }

    #[tokio::test]
    async fn idle_node_refuses_block_requests() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ctx(PeerCore::new(tmp.path()));
        let resp = respond(Message::RequestBlock { index: 0 }.into_frame(), peer(), &ctx).await;
        assert_eq!(
            resp,
            Some(Message::Error("peer has no block information available".into()))
        );
    }
}
