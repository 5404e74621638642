//! Chunking: split a source file into fixed-size block files and write its metadata record.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use crate::integrity::StreamingChecksum;
use crate::metadata::{self, FileInfo, MetadataContent, MetadataError};

/// Default block size in bytes.
pub const DEFAULT_BLOCK_SIZE: u32 = 1024;

/// Extension of metadata files written next to each other under the metadata root.
pub const METADATA_EXTENSION: &str = "meta";

/// Deterministic file name of block `index` inside a blocks directory.
pub fn block_file_name(index: u32) -> String {
    format!("block_{index}.bin")
}

pub fn block_path(dir: &Path, index: u32) -> PathBuf {
    dir.join(block_file_name(index))
}

/// Upper bound on blocks per file. Keeps the ownership bitmap a remote peer can make us
/// allocate at 16 MiB.
pub const MAX_BLOCK_COUNT: u32 = 1 << 24;

/// `ceil(file_size / block_size)`. `None` for a zero block size or more than
/// [`MAX_BLOCK_COUNT`] blocks.
pub fn block_count_for(file_size: u64, block_size: u32) -> Option<u32> {
    if block_size == 0 {
        return None;
    }
    let count = file_size.div_ceil(u64::from(block_size));
    if count > u64::from(MAX_BLOCK_COUNT) {
        return None;
    }
    u32::try_from(count).ok()
}

/// Result of chunking a file: the metadata and where its record was written.
#[derive(Debug, Clone)]
pub struct MetadataCreation {
    pub content: MetadataContent,
    pub metadata_path: PathBuf,
}

/// Split `source` into `block_<i>.bin` files under `blocks_root/<file name>/`, checksum the
/// whole file on the way, and write `metadata_root/<file name>.meta`.
pub fn create_file_metadata(
    source: &Path,
    block_size: u32,
    blocks_root: &Path,
    metadata_root: &Path,
) -> Result<MetadataCreation, ChunkError> {
    if block_size == 0 {
        return Err(ChunkError::ZeroBlockSize);
    }
    let file_name = source
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ChunkError::BadSourceName(source.to_path_buf()))?
        .to_string();

    let input = File::open(source).map_err(|e| ChunkError::io(source, e))?;
    let file_size = input
        .metadata()
        .map_err(|e| ChunkError::io(source, e))?
        .len();
    let expected_blocks =
        block_count_for(file_size, block_size).ok_or(ChunkError::TooManyBlocks(file_size))?;

    let blocks_dir = blocks_root.join(&file_name);
    fs::create_dir_all(&blocks_dir).map_err(|e| ChunkError::io(&blocks_dir, e))?;
    fs::create_dir_all(metadata_root).map_err(|e| ChunkError::io(metadata_root, e))?;

    let mut reader = BufReader::new(input);
    let mut checksum = StreamingChecksum::new();
    let mut buf = vec![0u8; block_size as usize];
    let mut block_count = 0u32;
    let mut total = 0u64;
    loop {
        let n = read_full(&mut reader, &mut buf).map_err(|e| ChunkError::io(source, e))?;
        if n == 0 {
            break;
        }
        let block = &buf[..n];
        checksum.update(block);
        let path = block_path(&blocks_dir, block_count);
        fs::write(&path, block).map_err(|e| ChunkError::io(&path, e))?;
        block_count += 1;
        total += n as u64;
        if n < buf.len() {
            break;
        }
    }
    // The file changed size while we were reading it.
    if total != file_size || block_count != expected_blocks {
        return Err(ChunkError::SourceChanged {
            expected: file_size,
            read: total,
        });
    }

    let content = MetadataContent {
        info: FileInfo {
            file_name: file_name.clone(),
            file_size,
            block_size,
            block_count,
            checksum: checksum.finish(),
        },
        blocks_directory: blocks_dir.to_string_lossy().into_owned(),
    };
    let metadata_path = metadata_root.join(format!("{file_name}.{METADATA_EXTENSION}"));
    metadata::write_metadata_file(&metadata_path, &content)?;
    Ok(MetadataCreation {
        content,
        metadata_path,
    })
}

/// Fill `buf` until it is full or the reader hits EOF. Returns bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Error chunking a source file.
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("block size must be positive")]
    ZeroBlockSize,
    #[error("source path {} has no usable file name", .0.display())]
    BadSourceName(PathBuf),
    #[error("file of {0} bytes needs more blocks than a peer will track")]
    TooManyBlocks(u64),
    #[error("source changed while chunking: expected {expected} bytes, read {read}")]
    SourceChanged { expected: u64, read: u64 },
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: io::Error,
    },
    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

impl ChunkError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
