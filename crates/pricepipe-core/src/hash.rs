use anyhow::Result;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path)?;
    Ok(sha256_bytes(&bytes))
}

/// Digest of a JSON value independent of the formatting it arrived in.
/// serde_json's default map keeps keys sorted, so compact serialization is
/// already canonical.
pub fn canonical_json_digest(value: &serde_json::Value) -> Result<String> {
    Ok(sha256_bytes(&serde_json::to_vec(value)?))
}
