//! Integrity: whole-file SHA-256, hex-encoded, used to verify a reassembled download.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

/// Length of a hex-encoded SHA-256 digest.
pub const CHECKSUM_HEX_LEN: usize = 64;

const READ_BUF_SIZE: usize = 64 * 1024;

/// Incremental checksum for callers that already stream the bytes (e.g. while chunking).
#[derive(Default)]
pub struct StreamingChecksum {
    hasher: Sha256,
}

impl StreamingChecksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Lowercase hex digest of everything fed so far.
    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Hash an in-memory buffer.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut sum = StreamingChecksum::new();
    sum.update(bytes);
    sum.finish()
}

/// Stream a file through SHA-256. Fails if the path cannot be opened or read.
pub fn compute_file_checksum(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut sum = StreamingChecksum::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        sum.update(&buf[..n]);
    }
    Ok(sum.finish())
}

/// Recompute a file's checksum and compare against the expected hex digest.
pub fn verify_file_checksum(path: &Path, expected: &str) -> io::Result<bool> {
    Ok(compute_file_checksum(path)?.eq_ignore_ascii_case(expected))
}

/// Whether `s` has the shape of a lowercase hex SHA-256 digest.
pub fn is_valid_checksum(s: &str) -> bool {
    s.len() == CHECKSUM_HEX_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
