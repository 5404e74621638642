//! Host-driven API: PeerCore holds all peer state shared between the server and client loops.
//! The host passes events in and performs the file/network work the returned decisions call for.

use std::path::{Path, PathBuf};

use crate::chunk::block_path;
use crate::metadata::MetadataContent;

/// Prefix of the reassembled output file inside the staging directory.
pub const ASSEMBLED_PREFIX: &str = "complete_";

/// Which metadata this node holds. The two roles are mutually exclusive for the life of the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Nothing known yet.
    Idle,
    /// Original source: every block is on disk under the chunking output directory.
    Source(MetadataContent),
    /// Downloader: metadata learned from a neighbor, blocks staged under the download root.
    Downloader(MetadataContent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AssemblyState {
    Pending,
    Assembling,
    Done { verified: bool },
}

/// Result of feeding remote metadata to the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataUpdate {
    /// First metadata or a changed block count: ownership bitmap was (re)initialised.
    Initialized,
    /// Same block count as already known; nothing changed.
    Unchanged,
    /// Downloader is already tracking a different file; the response was ignored.
    Conflicting,
}

/// Work order for reassembling a download. Returned by [`PeerCore::begin_assembly`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyJob {
    pub file_name: String,
    pub block_count: u32,
    pub staging_dir: PathBuf,
    pub output_path: PathBuf,
    pub expected_checksum: String,
}

/// Main coordinator. One instance per node, behind a single lock.
#[derive(Debug)]
pub struct PeerCore {
    role: Role,
    /// Index i true means block i is on local storage. Entries never go back to false.
    owned: Vec<bool>,
    assembly: AssemblyState,
    download_root: PathBuf,
}

impl PeerCore {
    /// Node without metadata; it becomes a downloader when a neighbor answers GET_METADATA.
    pub fn new(download_root: impl Into<PathBuf>) -> Self {
        Self {
            role: Role::Idle,
            owned: Vec::new(),
            assembly: AssemblyState::Pending,
            download_root: download_root.into(),
        }
    }

    /// Source node: owns every block of `local`.
    pub fn with_local_metadata(local: MetadataContent, download_root: impl Into<PathBuf>) -> Self {
        let owned = vec![true; local.info.block_count as usize];
        Self {
            role: Role::Source(local),
            owned,
            assembly: AssemblyState::Pending,
            download_root: download_root.into(),
        }
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn is_source(&self) -> bool {
        matches!(self.role, Role::Source(_))
    }

    pub fn is_downloader(&self) -> bool {
        matches!(self.role, Role::Downloader(_))
    }

    pub fn owned_blocks(&self) -> &[bool] {
        &self.owned
    }

    /// Block count used to validate incoming requests.
    pub fn known_block_count(&self) -> usize {
        self.owned.len()
    }

    /// Metadata to answer GET_METADATA with: local if this is the source, else the learned one.
    pub fn advertised_metadata(&self) -> Option<&MetadataContent> {
        match &self.role {
            Role::Idle => None,
            Role::Source(m) | Role::Downloader(m) => Some(m),
        }
    }

    /// Staging directory for a downloader: `<download_root>/<file name>`.
    pub fn staging_dir(&self) -> Option<PathBuf> {
        match &self.role {
            Role::Downloader(m) => Some(staging_dir_for(&self.download_root, &m.info.file_name)),
            _ => None,
        }
    }

    /// Neighbor answered GET_METADATA. `remote.blocks_directory` is the sender's path and is
    /// replaced by this node's staging directory before it is stored.
    pub fn on_metadata_received(&mut self, mut remote: MetadataContent) -> MetadataUpdate {
        let count = remote.info.block_count as usize;
        match &self.role {
            Role::Source(_) => {
                // Local metadata stays authoritative; the bitmap only tracks the new length.
                if self.owned.len() == count {
                    return MetadataUpdate::Unchanged;
                }
                self.owned = vec![true; count];
                MetadataUpdate::Initialized
            }
            Role::Downloader(current) => {
                if !current.info.same_file(&remote.info) {
                    return MetadataUpdate::Conflicting;
                }
                if self.owned.len() >= count {
                    return MetadataUpdate::Unchanged;
                }
                self.owned.resize(count, false);
                MetadataUpdate::Initialized
            }
            Role::Idle => {
                let dir = staging_dir_for(&self.download_root, &remote.info.file_name);
                remote.blocks_directory = dir.to_string_lossy().into_owned();
                self.owned = vec![false; count];
                self.role = Role::Downloader(remote);
                MetadataUpdate::Initialized
            }
        }
    }

    /// Lowest-indexed block not yet owned.
    pub fn next_missing_block(&self) -> Option<u32> {
        self.owned
            .iter()
            .position(|owned| !owned)
            .and_then(|i| u32::try_from(i).ok())
    }

    pub fn has_block(&self, index: u32) -> bool {
        self.owned.get(index as usize).copied().unwrap_or(false)
    }

    pub fn has_all_blocks(&self) -> bool {
        self.owned.iter().all(|owned| *owned)
    }

    /// Record that block `index` has been persisted. Grows the bitmap (new slots false) if the
    /// index is past its end. Returns true when no block is missing afterwards.
    pub fn mark_owned(&mut self, index: u32) -> bool {
        let i = index as usize;
        if i >= self.owned.len() {
            self.owned.resize(i + 1, false);
        }
        self.owned[i] = true;
        self.has_all_blocks()
    }

    /// Validate a REQUEST_BLOCK and resolve where the block should be read from.
    pub fn resolve_block_request(&self, index: u32) -> Result<PathBuf, BlockRequestError> {
        let count = self.known_block_count();
        if count == 0 {
            return Err(BlockRequestError::NoBlockInfo);
        }
        if index as usize >= count {
            return Err(BlockRequestError::OutOfRange { index, count });
        }
        match &self.role {
            Role::Source(local) => Ok(block_path(local.blocks_dir(), index)),
            Role::Downloader(remote) if self.has_block(index) => {
                Ok(block_path(remote.blocks_dir(), index))
            }
            _ => Err(BlockRequestError::NotAvailable(index)),
        }
    }

    /// Claim the assembly step. Succeeds once: only for a downloader with every block owned
    /// and no assembly running or finished.
    pub fn begin_assembly(&mut self) -> Option<AssemblyJob> {
        let Role::Downloader(remote) = &self.role else {
            return None;
        };
        if self.assembly != AssemblyState::Pending || self.next_missing_block().is_some() {
            return None;
        }
        let info = &remote.info;
        let staging_dir = staging_dir_for(&self.download_root, &info.file_name);
        let job = AssemblyJob {
            file_name: info.file_name.clone(),
            block_count: info.block_count,
            output_path: staging_dir.join(format!("{ASSEMBLED_PREFIX}{}", info.file_name)),
            staging_dir,
            expected_checksum: info.checksum.clone(),
        };
        self.assembly = AssemblyState::Assembling;
        Some(job)
    }

    /// Output written and checksummed. Terminal whether or not the checksum matched.
    pub fn finish_assembly(&mut self, verified: bool) {
        self.assembly = AssemblyState::Done { verified };
    }

    /// Output could not be written or checksummed; allow a later retry.
    pub fn abort_assembly(&mut self) {
        if self.assembly == AssemblyState::Assembling {
            self.assembly = AssemblyState::Pending;
        }
    }

    pub fn is_assembled(&self) -> bool {
        matches!(self.assembly, AssemblyState::Done { .. })
    }

    /// `Some(checksum matched)` once assembly finished.
    pub fn assembly_outcome(&self) -> Option<bool> {
        match self.assembly {
            AssemblyState::Done { verified } => Some(verified),
            _ => None,
        }
    }
}

pub fn staging_dir_for(download_root: &Path, file_name: &str) -> PathBuf {
    download_root.join(file_name)
}

/// Why a REQUEST_BLOCK cannot be served. Display text goes back to the peer in an ERROR message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockRequestError {
    #[error("peer has no block information available")]
    NoBlockInfo,
    #[error("invalid block index {index} (block count {count})")]
    OutOfRange { index: u32, count: usize },
    #[error("block {0} not available yet")]
    NotAvailable(u32),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::hash_bytes;
    use crate::metadata::FileInfo;

    fn meta(name: &str, size: u64, block_size: u32, dir: &str) -> MetadataContent {
        MetadataContent {
            info: FileInfo {
                file_name: name.into(),
                file_size: size,
                block_size,
                block_count: crate::chunk::block_count_for(size, block_size).unwrap(),
                checksum: hash_bytes(name.as_bytes()),
            },
            blocks_directory: dir.into(),
        }
    }

    fn three_blocks() -> MetadataContent {
        meta("movie.bin", 2500, 1000, "/srv/source/blocks/movie.bin")
    }

    #[test]
    fn source_owns_everything() {
        let core = PeerCore::with_local_metadata(three_blocks(), "downloads");
        assert!(core.is_source());
        assert_eq!(core.owned_blocks(), &[true, true, true]);
        assert_eq!(core.next_missing_block(), None);
        assert_eq!(core.advertised_metadata().unwrap().info.block_count, 3);
    }

    #[test]
    fn idle_node_has_nothing_to_advertise() {
        let core = PeerCore::new("downloads");
        assert!(core.advertised_metadata().is_none());
        assert_eq!(
            core.resolve_block_request(0),
            Err(BlockRequestError::NoBlockInfo)
        );
    }

    #[test]
    fn downloader_starts_all_missing_and_requests_block_zero() {
        let mut core = PeerCore::new("downloads");
        assert_eq!(
            core.on_metadata_received(three_blocks()),
            MetadataUpdate::Initialized
        );
        assert!(core.is_downloader());
        assert_eq!(core.owned_blocks(), &[false, false, false]);
        assert_eq!(core.next_missing_block(), Some(0));
    }

    #[test]
    fn received_metadata_is_rebased_on_staging_dir() {
        let mut core = PeerCore::new("/var/dl");
        core.on_metadata_received(three_blocks());
        let stored = core.advertised_metadata().unwrap();
        assert_eq!(stored.blocks_dir(), Path::new("/var/dl/movie.bin"));
        assert_eq!(core.staging_dir(), Some(PathBuf::from("/var/dl/movie.bin")));
    }

    #[test]
    fn identical_metadata_is_a_noop() {
        let mut core = PeerCore::new("downloads");
        core.on_metadata_received(three_blocks());
        core.mark_owned(1);
        assert_eq!(
            core.on_metadata_received(three_blocks()),
            MetadataUpdate::Unchanged
        );
        assert_eq!(core.owned_blocks(), &[false, true, false]);
    }

    #[test]
    fn downloader_ignores_a_different_file() {
        let mut core = PeerCore::new("downloads");
        core.on_metadata_received(three_blocks());
        core.mark_owned(0);
        let other = meta("other.bin", 100, 10, "x");
        assert_eq!(
            core.on_metadata_received(other),
            MetadataUpdate::Conflicting
        );
        assert_eq!(core.owned_blocks(), &[true, false, false]);
        assert_eq!(
            core.advertised_metadata().unwrap().info.file_name,
            "movie.bin"
        );
    }

    #[test]
    fn source_resizes_bitmap_but_keeps_local_metadata() {
        let mut core = PeerCore::with_local_metadata(three_blocks(), "downloads");
        let remote = meta("bigger.bin", 5000, 1000, "elsewhere");
        assert_eq!(
            core.on_metadata_received(remote),
            MetadataUpdate::Initialized
        );
        assert_eq!(core.owned_blocks(), &[true; 5]);
        assert!(core.is_source());
        assert_eq!(
            core.advertised_metadata().unwrap().info.file_name,
            "movie.bin"
        );
        assert_eq!(
            core.on_metadata_received(meta("bigger.bin", 5000, 1000, "elsewhere")),
            MetadataUpdate::Unchanged
        );
    }

    #[test]
    fn out_of_order_block_only_sets_that_index() {
        let mut core = PeerCore::new("downloads");
        core.on_metadata_received(three_blocks());
        assert!(!core.mark_owned(2));
        assert_eq!(core.owned_blocks(), &[false, false, true]);
        assert_eq!(core.next_missing_block(), Some(0));
        assert!(core.begin_assembly().is_none());
    }

    #[test]
    fn mark_owned_grows_bitmap() {
        let mut core = PeerCore::new("downloads");
        core.on_metadata_received(meta("a", 10, 10, "d"));
        core.mark_owned(3);
        assert_eq!(core.owned_blocks(), &[false, false, false, true]);
    }

    #[test]
    fn ownership_never_regresses() {
        let mut core = PeerCore::new("downloads");
        core.on_metadata_received(three_blocks());
        for i in [1, 0, 1, 2, 0] {
            core.mark_owned(i);
            assert!(core.has_block(i));
        }
        core.on_metadata_received(three_blocks());
        core.on_metadata_received(meta("other.bin", 1, 1, "x"));
        assert!(core.has_all_blocks());
    }

    #[test]
    fn request_one_past_the_end_is_rejected() {
        let core = PeerCore::with_local_metadata(three_blocks(), "downloads");
        assert_eq!(
            core.resolve_block_request(3),
            Err(BlockRequestError::OutOfRange { index: 3, count: 3 })
        );
        assert_eq!(
            core.resolve_block_request(2).unwrap(),
            PathBuf::from("/srv/source/blocks/movie.bin/block_2.bin")
        );
    }

    #[test]
    fn downloader_serves_only_owned_blocks() {
        let mut core = PeerCore::new("/dl");
        core.on_metadata_received(three_blocks());
        assert_eq!(
            core.resolve_block_request(1),
            Err(BlockRequestError::NotAvailable(1))
        );
        core.mark_owned(1);
        assert_eq!(
            core.resolve_block_request(1).unwrap(),
            PathBuf::from("/dl/movie.bin/block_1.bin")
        );
    }

    #[test]
    fn assembly_runs_once() {
        let mut core = PeerCore::new("/dl");
        core.on_metadata_received(three_blocks());
        for i in 0..3 {
            core.mark_owned(i);
        }
        let job = core.begin_assembly().expect("all blocks owned");
        assert_eq!(job.block_count, 3);
        assert_eq!(
            job.output_path,
            PathBuf::from("/dl/movie.bin/complete_movie.bin")
        );
        // Claimed: a concurrent attempt gets nothing.
        assert!(core.begin_assembly().is_none());
        core.finish_assembly(true);
        assert!(core.is_assembled());
        assert!(core.begin_assembly().is_none());
    }

    #[test]
    fn checksum_mismatch_is_terminal() {
        let mut core = PeerCore::new("/dl");
        core.on_metadata_received(three_blocks());
        for i in 0..3 {
            core.mark_owned(i);
        }
        core.begin_assembly().unwrap();
        core.finish_assembly(false);
        assert_eq!(core.assembly_outcome(), Some(false));
        assert!(core.begin_assembly().is_none());
    }

    #[test]
    fn aborted_assembly_can_retry() {
        let mut core = PeerCore::new("/dl");
        core.on_metadata_received(three_blocks());
        for i in 0..3 {
            core.mark_owned(i);
        }
        core.begin_assembly().unwrap();
        core.abort_assembly();
        assert!(!core.is_assembled());
        assert!(core.begin_assembly().is_some());
    }

    #[test]
    fn source_never_assembles() {
        let mut core = PeerCore::with_local_metadata(three_blocks(), "/dl");
        assert!(core.begin_assembly().is_none());
    }
}
