//! Core domain types for sandpatch.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Hashing and filesystem access live in `sandpatch-tools`; everything here can be
//! constructed and tested in memory.

mod call;
mod edit;
pub mod text;

pub use call::{Args, CanonicalCall, Invocation};
pub use edit::{EDIT_EXAMPLE, Edit, EditLimits, EditProblem, EditSet, EditSetError, json_type_name};
pub use text::{canonical_key, is_invisible_char, truncate_with_ellipsis};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// Content fingerprints
// ============================================================================

/// Lowercase hex digest of a file's exact byte content.
///
/// Compared for equality only; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("fingerprint must be a non-empty hex string, got {0:?}")]
pub struct FingerprintParseError(pub String);

impl Fingerprint {
    /// Parse a caller-supplied hex digest. Surrounding whitespace and case are ignored.
    pub fn from_hex(raw: &str) -> Result<Self, FingerprintParseError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(FingerprintParseError(raw.to_string()));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    /// Hex-encode raw digest bytes.
    #[must_use]
    pub fn from_digest(bytes: &[u8]) -> Self {
        Self(bytes.iter().map(|b| format!("{b:02x}")).collect())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = FingerprintParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<Fingerprint> for String {
    fn from(value: Fingerprint) -> Self {
        value.0
    }
}

// ============================================================================
// Action classes
// ============================================================================

/// How the repetition guard treats an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionClass {
    /// Inspects files without changing them (`read_file`).
    Read,
    /// Checks content without changing it; repeats are allowed after a mutation.
    Verification,
    /// Changes file content (`apply_patch`, `create_file`).
    Mutation,
    /// Never admitted.
    Denied,
    Default,
}

impl ActionClass {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Verification => "verification",
            Self::Mutation => "mutation",
            Self::Denied => "denied",
            Self::Default => "default",
        }
    }
}

impl fmt::Display for ActionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
