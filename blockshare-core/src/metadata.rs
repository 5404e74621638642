//! File metadata record: what a node advertises and what a downloader needs to rebuild the file.
//!
//! The same JSON text is written to the `.meta` file and sent as the METADATA_RESPONSE payload.
//! Field order is fixed by [`MetadataRecord`], so serializing the same content always yields
//! the same bytes.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::chunk::block_count_for;
use crate::integrity::is_valid_checksum;
use crate::protocol::BLOCK_INDEX_LEN;

/// Descriptive part of the metadata. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub file_name: String,
    pub file_size: u64,
    pub block_size: u32,
    pub block_count: u32,
    /// SHA-256 of the whole file (lowercase hex), never of a single block.
    pub checksum: String,
}

impl FileInfo {
    /// Length of block `index`; the last block may be shorter. `None` if out of range.
    pub fn block_len(&self, index: u32) -> Option<u64> {
        if index >= self.block_count {
            return None;
        }
        let start = u64::from(index) * u64::from(self.block_size);
        Some((self.file_size - start).min(u64::from(self.block_size)))
    }

    /// Payload length of a BLOCK_DATA message carrying a full block.
    pub fn block_frame_len(&self) -> u64 {
        u64::from(self.block_size) + BLOCK_INDEX_LEN as u64
    }

    /// Same logical file: name, size, block layout and checksum all agree.
    pub fn same_file(&self, other: &FileInfo) -> bool {
        self.file_name == other.file_name
            && self.file_size == other.file_size
            && self.block_size == other.block_size
            && self.checksum.eq_ignore_ascii_case(&other.checksum)
    }

    fn validate(&self) -> Result<(), MetadataError> {
        validate_file_name(&self.file_name)?;
        if self.block_size == 0 {
            return Err(MetadataError::ZeroBlockSize);
        }
        let expected = block_count_for(self.file_size, self.block_size)
            .ok_or(MetadataError::TooManyBlocks(self.file_size))?;
        if expected != self.block_count {
            return Err(MetadataError::BlockCountMismatch {
                expected,
                found: self.block_count,
            });
        }
        if !is_valid_checksum(&self.checksum) {
            return Err(MetadataError::BadChecksum(self.checksum.clone()));
        }
        Ok(())
    }
}

/// Metadata plus where its blocks live. For metadata received from a neighbor the
/// directory is the sender's path and must be replaced by the local staging directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataContent {
    pub info: FileInfo,
    pub blocks_directory: String,
}

impl MetadataContent {
    pub fn blocks_dir(&self) -> &Path {
        Path::new(&self.blocks_directory)
    }
}

/// Flat on-disk / on-wire layout.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct MetadataRecord {
    file_name: String,
    file_size: u64,
    block_size: u32,
    block_count: u32,
    checksum: String,
    blocks_directory: String,
}

impl From<&MetadataContent> for MetadataRecord {
    fn from(m: &MetadataContent) -> Self {
        Self {
            file_name: m.info.file_name.clone(),
            file_size: m.info.file_size,
            block_size: m.info.block_size,
            block_count: m.info.block_count,
            checksum: m.info.checksum.clone(),
            blocks_directory: m.blocks_directory.clone(),
        }
    }
}

impl From<MetadataRecord> for MetadataContent {
    fn from(r: MetadataRecord) -> Self {
        Self {
            info: FileInfo {
                file_name: r.file_name,
                file_size: r.file_size,
                block_size: r.block_size,
                block_count: r.block_count,
                checksum: r.checksum,
            },
            blocks_directory: r.blocks_directory,
        }
    }
}

/// Canonical text encoding. JSON string escaping covers any delimiter inside field values.
pub fn serialize_metadata(content: &MetadataContent) -> Result<String, MetadataError> {
    Ok(serde_json::to_string_pretty(&MetadataRecord::from(content))?)
}

/// Parse and validate the text produced by [`serialize_metadata`].
pub fn parse_metadata_string(text: &str) -> Result<MetadataContent, MetadataError> {
    let record: MetadataRecord = serde_json::from_str(text)?;
    let content = MetadataContent::from(record);
    content.info.validate()?;
    Ok(content)
}

/// Load a metadata file written by [`write_metadata_file`].
pub fn load_metadata_file(path: &Path) -> Result<MetadataContent, MetadataError> {
    let text = std::fs::read_to_string(path).map_err(|source| MetadataError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_metadata_string(&text)
}

pub fn write_metadata_file(path: &Path, content: &MetadataContent) -> Result<(), MetadataError> {
    let text = serialize_metadata(content)?;
    std::fs::write(path, text).map_err(|source| MetadataError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// File names arrive from the network and become local path components.
fn validate_file_name(name: &str) -> Result<(), MetadataError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
        || Path::new(name).file_name().map(|n| n != name).unwrap_or(true);
    if bad {
        return Err(MetadataError::BadFileName(name.to_string()));
    }
    Ok(())
}

/// Error reading, writing or validating metadata.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("failed to read metadata file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write metadata file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed metadata: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("block size must be positive")]
    ZeroBlockSize,
    #[error("file of {0} bytes needs more blocks than a peer will track")]
    TooManyBlocks(u64),
    #[error("block count {found} does not match file size (expected {expected})")]
    BlockCountMismatch { expected: u32, found: u32 },
    #[error("checksum {0:?} is not a hex SHA-256 digest")]
    BadChecksum(String),
    #[error("file name {0:?} is not a plain file name")]
    BadFileName(String),
}
