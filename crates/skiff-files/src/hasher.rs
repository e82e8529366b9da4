//! BLAKE3 hashing of files for end-to-end verification.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Hash the full contents of a file
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub fn hash_file<P: AsRef<Path>>(path: P) -> io::Result<[u8; 32]> {
    hash_file_prefix(path, u64::MAX)
}

/// Hash the first `len` bytes of a file (or all of it, if shorter)
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub fn hash_file_prefix<P: AsRef<Path>>(path: P, len: u64) -> io::Result<[u8; 32]> {
    let file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut limited = file.take(len);
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let bytes_read = limited.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(*hasher.finalize().as_bytes())
}
