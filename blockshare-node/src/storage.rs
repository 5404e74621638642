//! Block files on local disk: staging downloaded blocks, reading blocks to serve, assembling output.

use std::io;
use std::path::{Path, PathBuf};

use blockshare_core::chunk::block_path;
use blockshare_core::AssemblyJob;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};

/// Persist a received block as `block_<index>.bin` under `dir`, creating the directory if needed.
/// Written to a temporary name first so concurrent readers never see a partial block.
pub async fn save_block(dir: &Path, index: u32, data: &[u8]) -> Result<PathBuf, StorageError> {
    fs::create_dir_all(dir)
        .await
        .map_err(|e| StorageError::io(dir, e))?;
    let path = block_path(dir, index);
    let tmp = path.with_extension("bin.part");
    fs::write(&tmp, data)
        .await
        .map_err(|e| StorageError::io(&tmp, e))?;
    fs::rename(&tmp, &path)
        .await
        .map_err(|e| StorageError::io(&path, e))?;
    Ok(path)
}

/// Read a whole block file. A missing file is reported separately from other I/O errors.
pub async fn read_block(path: &Path) -> Result<Vec<u8>, StorageError> {
    fs::read(path).await.map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            StorageError::MissingBlock(path.to_path_buf())
        } else {
            StorageError::io(path, e)
        }
    })
}

/// Concatenate blocks `0..block_count` in index order into the job's output file.
/// Returns the number of bytes written. Stops at the first missing block.
pub async fn assemble(job: &AssemblyJob) -> Result<u64, StorageError> {
    fs::create_dir_all(&job.staging_dir)
        .await
        .map_err(|e| StorageError::io(&job.staging_dir, e))?;
    let out = File::create(&job.output_path)
        .await
        .map_err(|e| StorageError::io(&job.output_path, e))?;
    let mut out = BufWriter::new(out);
    let mut written = 0u64;
    for index in 0..job.block_count {
        let path = block_path(&job.staging_dir, index);
        let mut block = match File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::MissingBlock(path));
            }
            Err(e) => return Err(StorageError::io(&path, e)),
        };
        written += tokio::io::copy(&mut block, &mut out)
            .await
            .map_err(|e| StorageError::io(&job.output_path, e))?;
    }
    out.flush()
        .await
        .map_err(|e| StorageError::io(&job.output_path, e))?;
    out.into_inner()
        .sync_all()
        .await
        .map_err(|e| StorageError::io(&job.output_path, e))?;
    Ok(written)
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("block file {} not found", .0.display())]
    MissingBlock(PathBuf),
    #[error("i/o error on {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
}

impl StorageError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(dir: &Path, block_count: u32) -> AssemblyJob {
        AssemblyJob {
            file_name: "f.bin".into(),
            block_count,
            staging_dir: dir.to_path_buf(),
            output_path: dir.join("complete_f.bin"),
            expected_checksum: String::new(),
        }
    }

    #[tokio::test]
    async fn save_creates_directory_and_reads_back() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("downloads").join("f.bin");
        let path = save_block(&dir, 4, b"hello").await.unwrap();
        assert_eq!(path, dir.join("block_4.bin"));
        assert_eq!(read_block(&path).await.unwrap(), b"hello");
        assert!(!dir.join("block_4.bin.part").exists());
    }

    #[tokio::test]
    async fn duplicate_save_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        save_block(tmp.path(), 0, b"first").await.unwrap();
        let path = save_block(tmp.path(), 0, b"second").await.unwrap();
        assert_eq!(read_block(&path).await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn missing_block_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let r = read_block(&tmp.path().join("block_0.bin")).await;
        assert!(matches!(r, Err(StorageError::MissingBlock(_))));
    }

    #[tokio::test]
    async fn assemble_in_index_order() {
        let tmp = tempfile::tempdir().unwrap();
        // Saved out of order on purpose.
        save_block(tmp.path(), 2, b"cc").await.unwrap();
        save_block(tmp.path(), 0, b"aaaa").await.unwrap();
        save_block(tmp.path(), 1, b"bbbb").await.unwrap();
        let j = job(tmp.path(), 3);
        assert_eq!(assemble(&j).await.unwrap(), 10);
        assert_eq!(std::fs::read(&j.output_path).unwrap(), b"aaaabbbbcc");
    }

    #[tokio::test]
    async fn assemble_aborts_on_missing_block() {
        let tmp = tempfile::tempdir().unwrap();
        save_block(tmp.path(), 0, b"aaaa").await.unwrap();
        let r = assemble(&job(tmp.path(), 2)).await;
        assert!(matches!(r, Err(StorageError::MissingBlock(p)) if p.ends_with("block_1.bin")));
    }

    #[tokio::test]
    async fn assemble_zero_blocks_writes_empty_file() {
        let tmp = tempfile::tempdir().unwrap();
        let j = job(tmp.path(), 0);
        assert_eq!(assemble(&j).await.unwrap(), 0);
        assert_eq!(std::fs::metadata(&j.output_path).unwrap().len(), 0);
    }
}
