use std::fs::File;
use std::io::Read;
use std::path::Path;

use md5::Md5;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Compute the hex SHA-256 digest of a file, streaming in 4 KiB blocks.
pub fn sha256sum(path: &Path) -> Result<String> {
    file_digest::<Sha256>(path)
}

/// Compute the hex MD5 digest of a file, streaming in 4 KiB blocks.
pub fn md5sum(path: &Path) -> Result<String> {
    file_digest::<Md5>(path)
}

fn file_digest<D: Digest>(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = D::new();
    let mut block = [0u8; 4096];
    loop {
        let n = file.read(&mut block)?;
        if n == 0 {
            break;
        }
        hasher.update(&block[..n]);
    }
    Ok(hex(&hasher.finalize()))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
