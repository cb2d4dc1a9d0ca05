use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

const READ_BUFFER_SIZE: usize = 1024 * 1024;

pub fn sha256_hex(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

pub fn sha256_reader<R: Read>(mut reader: R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0_u8; READ_BUFFER_SIZE];
    loop {
        let read = reader
            .read(&mut buffer)
            .context("failed reading payload for sha256")?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Streams the file through SHA-256; images are several GiB so the file is
/// never loaded whole.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path)
        .with_context(|| format!("failed to open file for sha256: {}", path.display()))?;
    sha256_reader(BufReader::with_capacity(READ_BUFFER_SIZE, file))
        .with_context(|| format!("failed to hash file: {}", path.display()))
}

pub fn verify_sha256(payload: &[u8], expected_hex: &str) -> bool {
    sha256_hex(payload).eq_ignore_ascii_case(expected_hex.trim())
}

pub fn verify_sha256_file(path: &Path, expected_hex: &str) -> Result<bool> {
    Ok(sha256_file(path)?.eq_ignore_ascii_case(expected_hex.trim()))
}

pub fn is_sha256_hex(value: &str) -> bool {
    let value = value.trim();
    value.len() == 64 && value.chars().all(|ch| ch.is_ascii_hexdigit())
}
