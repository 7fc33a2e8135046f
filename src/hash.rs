use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use md5::{Md5, Digest};

/// Chunk size used while streaming a file through the hasher, so hashing a
/// multi-gigabyte patched binary doesn't require reading it whole into
/// memory.
const CHUNK_SIZE: usize = 64 * 1024;

/// Lower-case hex digest of a file's content.
pub fn md5_file(path: impl AsRef<Path>) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let read = file.read(&mut buffer)?;

        if read == 0 {
            break;
        }

        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Lower-case hex digest of an in-memory byte slice.
pub fn md5_bytes(bytes: impl AsRef<[u8]>) -> String {
    format!("{:x}", Md5::digest(bytes.as_ref()))
}
