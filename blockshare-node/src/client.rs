//! Outbound side: poll neighbors for metadata, pull missing blocks in order, assemble and verify.

use std::time::Duration;

use blockshare_core::{parse_metadata_string, Message, MetadataUpdate};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::Neighbor;
use crate::node::{shutdown_requested, SharedCore};
use crate::storage;
use crate::transport;

/// Client loop settings.
#[derive(Debug, Clone)]
pub struct ClientContext {
    pub core: SharedCore,
    pub neighbors: Vec<Neighbor>,
    pub startup_delay: Duration,
    pub poll_interval: Duration,
    pub io_timeout: Duration,
    pub max_payload: u32,
}

/// How a block request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Block stored and marked owned.
    Stored,
    /// Neighbor answered ERROR, sent something malformed, or the exchange failed.
    Failed,
}

/// Wait for neighbors to come up, then visit every neighbor in order, pause, and repeat until shutdown.
pub async fn run_client(ctx: ClientContext, mut shutdown: watch::Receiver<bool>) {
    if sleep_or_shutdown(ctx.startup_delay, &mut shutdown).await {
        return;
    }
    loop {
        for neighbor in &ctx.neighbors {
            if *shutdown.borrow() {
                return;
            }
            poll_neighbor(&ctx, neighbor, &mut shutdown).await;
        }
        if sleep_or_shutdown(ctx.poll_interval, &mut shutdown).await {
            info!("client loop stopped");
            return;
        }
    }
}

/// True if shutdown was requested before the delay ran out.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = shutdown_requested(shutdown) => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

/// One GET_METADATA exchange with `neighbor`, followed by block pulls if this node is downloading.
pub async fn poll_neighbor(
    ctx: &ClientContext,
    neighbor: &Neighbor,
    shutdown: &mut watch::Receiver<bool>,
) {
    let response = transport::request(
        neighbor,
        Message::GetMetadata,
        ctx.io_timeout,
        ctx.max_payload,
    )
    .await;
    match response {
        Ok(Message::MetadataResponse(text)) => {
            let remote = match parse_metadata_string(&text) {
                Ok(m) => m,
                Err(e) => {
                    warn!(%neighbor, error = %e, "failed to parse metadata");
                    return;
                }
            };
            info!(
                %neighbor,
                file = %remote.info.file_name,
                blocks = remote.info.block_count,
                checksum = %remote.info.checksum,
                "metadata received"
            );
            let frame_len = remote.info.block_frame_len();
            let (update, downloading) = {
                let mut core = ctx.core.lock().await;
                let update = core.on_metadata_received(remote);
                (update, core.is_downloader())
            };
            match update {
                MetadataUpdate::Initialized => debug!(%neighbor, "ownership bitmap initialised"),
                MetadataUpdate::Unchanged => {}
                MetadataUpdate::Conflicting => {
                    warn!(%neighbor, "neighbor advertises a different file, ignoring");
                    return;
                }
            }
            if !downloading {
                return;
            }
            if frame_len > u64::from(ctx.max_payload) {
                // Every BLOCK_DATA would be rejected; say so once instead of every pass.
                if update == MetadataUpdate::Initialized {
                    error!(
                        %neighbor,
                        frame_len,
                        max_payload = ctx.max_payload,
                        "blocks do not fit max_payload_bytes, not downloading"
                    );
                }
                return;
            }
            fetch_missing_blocks(ctx, neighbor, shutdown).await;
        }
        Ok(Message::Error(reason)) => {
            warn!(%neighbor, %reason, "remote error");
        }
        Ok(other) => {
            warn!(%neighbor, kind = ?other.message_type(), "unexpected response type");
        }
        Err(e) => {
            warn!(%neighbor, error = %e, "metadata exchange failed");
        }
    }
}

/// Request the lowest missing block from `neighbor` until none is missing or a request fails.
/// Attempts assembly once nothing is missing.
pub async fn fetch_missing_blocks(
    ctx: &ClientContext,
    neighbor: &Neighbor,
    shutdown: &mut watch::Receiver<bool>,
) {
    loop {
        let next = ctx.core.lock().await.next_missing_block();
        let Some(index) = next else {
            try_assemble(ctx).await;
            return;
        };
        if *shutdown.borrow() {
            return;
        }
        if request_block(ctx, neighbor, index).await == FetchOutcome::Failed {
            return;
        }
    }
}

/// Fetch one block and persist it under this node's staging directory.
pub async fn request_block(ctx: &ClientContext, neighbor: &Neighbor, index: u32) -> FetchOutcome {
    let Some(staging) = ctx.core.lock().await.staging_dir() else {
        return FetchOutcome::Failed;
    };
    let response = transport::request(
        neighbor,
        Message::RequestBlock { index },
        ctx.io_timeout,
        ctx.max_payload,
    )
    .await;
    let (received, data) = match response {
        Ok(Message::BlockData { index: received, data }) => (received, data),
        Ok(Message::Error(reason)) => {
            warn!(%neighbor, block = index, %reason, "block request refused");
            return FetchOutcome::Failed;
        }
        Ok(other) => {
            warn!(%neighbor, block = index, kind = ?other.message_type(), "unexpected response to block request");
            return FetchOutcome::Failed;
        }
        Err(e) => {
            warn!(%neighbor, block = index, error = %e, "block request failed");
            return FetchOutcome::Failed;
        }
    };
    if received != index {
        warn!(%neighbor, requested = index, received, "BLOCK_DATA for the wrong index");
        return FetchOutcome::Failed;
    }
    match storage::save_block(&staging, received, &data).await {
        Ok(path) => {
            ctx.core.lock().await.mark_owned(received);
            info!(%neighbor, block = received, path = %path.display(), "block stored");
            FetchOutcome::Stored
        }
        Err(e) => {
            warn!(block = received, error = %e, "failed to store block");
            FetchOutcome::Failed
        }
    }
}

/// Assemble and verify the download if every block is owned and it has not been done yet.
/// A checksum mismatch is terminal; write or checksum failures leave it retryable.
pub async fn try_assemble(ctx: &ClientContext) {
    let Some(job) = ctx.core.lock().await.begin_assembly() else {
        return;
    };
    let bytes = match storage::assemble(&job).await {
        Ok(n) => n,
        Err(e) => {
            warn!(file = %job.file_name, error = %e, "assembly failed, will retry");
            ctx.core.lock().await.abort_assembly();
            return;
        }
    };
    let output = job.output_path.clone();
    let checksum = tokio::task::spawn_blocking(move || {
        blockshare_core::compute_file_checksum(&output)
    })
    .await;
    let checksum = match checksum {
        Ok(Ok(sum)) => sum,
        Ok(Err(e)) => {
            warn!(file = %job.file_name, error = %e, "failed to checksum assembled file");
            ctx.core.lock().await.abort_assembly();
            return;
        }
        Err(e) => {
            warn!(file = %job.file_name, error = %e, "checksum task failed");
            ctx.core.lock().await.abort_assembly();
            return;
        }
    };
    let verified = checksum.eq_ignore_ascii_case(&job.expected_checksum);
    if verified {
        info!(
            file = %job.file_name,
            bytes,
            path = %job.output_path.display(),
            "download complete, checksum OK"
        );
    } else {
        error!(
            file = %job.file_name,
            expected = %job.expected_checksum,
            actual = %checksum,
            "checksum mismatch"
        );
    }
    ctx.core.lock().await.finish_assembly(verified);
}
