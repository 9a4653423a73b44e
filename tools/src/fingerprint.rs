use sha2::{Digest, Sha256};
use std::fs;

use sandpatch_types::Fingerprint;

use crate::ToolError;
use crate::sandbox::ResolvedPath;

/// SHA-256 of exact byte content.
#[must_use]
pub fn fingerprint_bytes(bytes: &[u8]) -> Fingerprint {
    Fingerprint::from_digest(&Sha256::digest(bytes))
}

/// Fingerprint the current content of a sandboxed file.
pub fn fingerprint_file(path: &ResolvedPath) -> Result<Fingerprint, ToolError> {
    let bytes = fs::read(path).map_err(|e| ToolError::io(path.as_path(), e))?;
    Ok(fingerprint_bytes(&bytes))
}

/// Number of lines, counting a final unterminated line.
#[must_use]
pub fn line_count(bytes: &[u8]) -> usize {
    bytes.split_inclusive(|&b| b == b'\n').count()
}
