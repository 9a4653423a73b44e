//! Path sandbox: resolves loosely-shaped, caller-supplied paths to locations
//! confined to a single root directory.
//!
//! Resolution is permissive about *shape* (absolute or relative, with or
//! without the sandbox directory prefix, wrong letter case) and strict about
//! *containment*: every result is checked against the canonical root after
//! symlinks are resolved.

use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

use sandpatch_types::is_invisible_char;
use tracing::{debug, warn};

use super::{DenialReason, ToolError};

/// Conventional sandbox directory name, created under the base directory.
pub const DEFAULT_SANDBOX_DIR: &str = "playground";

/// Default deny patterns for sensitive files inside the sandbox.
pub const DEFAULT_SANDBOX_DENY_PATTERNS: &[&str] = &[
    "**/.ssh/**",
    "**/.gnupg/**",
    "**/.aws/**",
    "**/.git/**",
    "**/.git-credentials",
    "**/.npmrc",
    "**/.netrc",
    "**/.env",
    "**/.env.*",
    "**/id_rsa*",
    "**/id_ed25519*",
    "**/*.pem",
    "**/*.key",
    "**/*.p12",
];

/// Files that may be read but never patched or created.
pub const DEFAULT_PROTECTED_PATTERNS: &[&str] =
    &["**/Gemfile.lock", "**/package-lock.json", "**/yarn.lock"];

#[must_use]
pub fn default_sandbox_deny_patterns() -> Vec<String> {
    DEFAULT_SANDBOX_DENY_PATTERNS
        .iter()
        .map(std::string::ToString::to_string)
        .collect()
}

#[must_use]
pub fn default_protected_patterns() -> Vec<String> {
    DEFAULT_PROTECTED_PATTERNS
        .iter()
        .map(std::string::ToString::to_string)
        .collect()
}

/// Construction parameters for [`PathSandbox`].
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Directory the sandbox directory lives in; relative paths are made absolute from here.
    pub base_dir: PathBuf,
    /// Single path component naming the sandbox directory under `base_dir`.
    pub dir_name: String,
    /// Create the sandbox directory if it does not exist yet.
    pub create_root: bool,
    pub denied_patterns: Vec<String>,
    pub protected_patterns: Vec<String>,
}

impl SandboxConfig {
    /// Sandbox at `base_dir/playground` with the default deny and protected lists.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            dir_name: DEFAULT_SANDBOX_DIR.to_string(),
            create_root: true,
            denied_patterns: default_sandbox_deny_patterns(),
            protected_patterns: default_protected_patterns(),
        }
    }
}

#[derive(Debug, Clone)]
struct PathPattern {
    pattern: String,
    matcher: globset::GlobMatcher,
}

fn compile_patterns(patterns: &[String], label: &str) -> Result<Vec<PathPattern>, ToolError> {
    patterns
        .iter()
        .map(|pat| {
            let mut builder = globset::GlobBuilder::new(pat);
            // Case-insensitive so "Secret.PEM" cannot slip past "*.pem".
            builder.case_insensitive(true);
            let glob = builder.build().map_err(|e| ToolError::BadArgs {
                message: format!("Invalid {label} pattern '{pat}': {e}"),
            })?;
            Ok(PathPattern {
                pattern: pat.clone(),
                matcher: glob.compile_matcher(),
            })
        })
        .collect()
}

/// An absolute path proven to lie within the sandbox root.
///
/// Only [`PathSandbox`] constructs these, and only per call: the filesystem
/// may change between calls, so they are never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath(PathBuf);

impl ResolvedPath {
    #[must_use]
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    #[must_use]
    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }
}

impl AsRef<Path> for ResolvedPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for ResolvedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// How a resolution treats missing files and protected paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Purpose {
    Read,
    Write,
    Create,
    Directory,
}

/// Filesystem sandbox rooted at one directory.
#[derive(Debug, Clone)]
pub struct PathSandbox {
    /// Canonical sandbox root.
    root: PathBuf,
    /// `base.join(dir_name)` before canonicalization.
    scoped_root: PathBuf,
    /// Canonical base directory.
    base: PathBuf,
    dir_name: String,
    deny_patterns: Vec<PathPattern>,
    protected_patterns: Vec<PathPattern>,
}

impl PathSandbox {
    pub fn new(config: SandboxConfig) -> Result<Self, ToolError> {
        let mut components = Path::new(&config.dir_name).components();
        if !matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        ) {
            return Err(ToolError::BadArgs {
                message: format!(
                    "sandbox dir_name must be a single directory name, got {:?}",
                    config.dir_name
                ),
            });
        }

        let base = fs::canonicalize(&config.base_dir)
            .map_err(|e| ToolError::io(&config.base_dir, e))?;
        let scoped_root = base.join(&config.dir_name);
        if config.create_root && !scoped_root.exists() {
            fs::create_dir_all(&scoped_root).map_err(|e| ToolError::io(&scoped_root, e))?;
            debug!(root = %scoped_root.display(), "Created sandbox root");
        }
        let root = fs::canonicalize(&scoped_root).map_err(|e| ToolError::io(&scoped_root, e))?;
        if !root.is_dir() {
            return Err(ToolError::NotAFile { path: root });
        }

        Ok(Self {
            root,
            scoped_root,
            base,
            dir_name: config.dir_name,
            deny_patterns: compile_patterns(&config.denied_patterns, "denied")?,
            protected_patterns: compile_patterns(&config.protected_patterns, "protected")?,
        })
    }

    /// Canonical sandbox root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a path for reading. The target may not exist; callers report `NotFound`.
    pub fn resolve(&self, raw: &str) -> Result<ResolvedPath, ToolError> {
        self.resolve_with(raw, Purpose::Read)
    }

    /// Resolve an existing file for modification; protected paths are refused.
    pub fn resolve_for_write(&self, raw: &str) -> Result<ResolvedPath, ToolError> {
        self.resolve_with(raw, Purpose::Write)
    }

    /// Resolve a path for file creation.
    ///
    /// No case-insensitive fallback (the caller names the file it wants), and
    /// missing parent directories are allowed as long as they would be inside the root.
    pub fn resolve_for_create(&self, raw: &str) -> Result<ResolvedPath, ToolError> {
        self.resolve_with(raw, Purpose::Create)
    }

    /// Resolve a directory for listing or searching. `None`, `""` and `"."` mean the root.
    pub fn resolve_directory(&self, raw: Option<&str>) -> Result<ResolvedPath, ToolError> {
        match raw.map(str::trim) {
            None | Some("" | "." | "./") => Ok(ResolvedPath(self.root.clone())),
            Some(raw) => self.resolve_with(raw, Purpose::Directory),
        }
    }

    /// Display form of a resolved path: relative to the base directory, so it
    /// starts with the sandbox directory name and resolves back to the same file.
    #[must_use]
    pub fn display_path(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(rel) if rel.as_os_str().is_empty() => self.dir_name.clone(),
            Ok(rel) => format!(
                "{}/{}",
                self.dir_name,
                rel.to_string_lossy().replace('\\', "/")
            ),
            Err(_) => path.display().to_string(),
        }
    }

    /// Check if a path matches any deny pattern (no canonicalization).
    ///
    /// Suitable for filtering directory walks.
    #[must_use]
    pub fn is_path_denied(&self, path: &Path) -> bool {
        matching(&self.deny_patterns, path).is_some()
    }

    fn resolve_with(&self, raw: &str, purpose: Purpose) -> Result<ResolvedPath, ToolError> {
        if raw.trim().is_empty() {
            return Err(DenialReason::InvalidPath {
                attempted: raw.to_string(),
                reason: "path is empty",
            }
            .into());
        }
        if raw.chars().any(is_unsafe_path_char) {
            return Err(DenialReason::InvalidPath {
                attempted: raw.to_string(),
                reason: "path contains control or invisible characters",
            }
            .into());
        }

        let mut candidate = self.shape(raw);
        if purpose != Purpose::Create
            && !candidate.exists()
            && let Some(found) = find_case_insensitive(&candidate)
        {
            debug!(
                requested = %candidate.display(),
                found = %found.display(),
                "Resolved path by case-insensitive match"
            );
            candidate = found;
        }

        let canonical = canonicalize_nearest(&candidate).ok_or_else(|| {
            ToolError::from(DenialReason::PathEscape {
                attempted: raw.to_string(),
                resolved: candidate.clone(),
            })
        })?;

        let inside = canonical.starts_with(&self.root)
            && (canonical != self.root || purpose == Purpose::Directory);
        if !inside {
            warn!(attempted = raw, resolved = %canonical.display(), "Path escapes sandbox");
            return Err(DenialReason::PathEscape {
                attempted: raw.to_string(),
                resolved: canonical,
            }
            .into());
        }

        if let Some(pattern) = matching(&self.deny_patterns, &canonical) {
            return Err(DenialReason::DeniedPatternMatched {
                attempted: canonical,
                pattern,
            }
            .into());
        }
        if matches!(purpose, Purpose::Write | Purpose::Create)
            && let Some(pattern) = matching(&self.protected_patterns, &canonical)
        {
            return Err(DenialReason::ProtectedFile {
                path: canonical,
                pattern,
            }
            .into());
        }

        Ok(ResolvedPath(canonical))
    }

    /// Turn a raw path into an absolute, lexically normalized candidate.
    fn shape(&self, raw: &str) -> PathBuf {
        let direct = lexical_normalize(&self.base.join(raw));
        if direct.starts_with(&self.scoped_root) || direct.starts_with(&self.root) {
            return direct;
        }

        let relative = raw
            .strip_prefix('/')
            .or_else(|| raw.strip_prefix('\\'))
            .unwrap_or(raw);
        let prefixed = Path::new(relative)
            .components()
            .next()
            .is_some_and(|first| first.as_os_str() == self.dir_name.as_str());
        let scoped = if prefixed {
            self.base.join(relative)
        } else {
            self.scoped_root.join(relative)
        };
        lexical_normalize(&scoped)
    }
}

/// Resolve `.` and `..` without touching the filesystem. `..` never climbs past the filesystem root.
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Find exactly one regular file in the candidate's directory whose name
/// matches the candidate's name ignoring case.
fn find_case_insensitive(candidate: &Path) -> Option<PathBuf> {
    let dir = candidate.parent()?;
    let wanted = candidate.file_name()?.to_string_lossy().to_lowercase();
    let entries = fs::read_dir(dir).ok()?;

    let mut matches = entries.filter_map(Result::ok).filter(|entry| {
        entry.file_name().to_string_lossy().to_lowercase() == wanted
            && entry.file_type().is_ok_and(|ft| ft.is_file())
    });
    let first = matches.next()?;
    if matches.next().is_some() {
        debug!(path = %candidate.display(), "Ambiguous case-insensitive match; not substituting");
        return None;
    }
    Some(first.path())
}

/// Canonicalize the nearest existing ancestor and re-join the missing tail.
fn canonicalize_nearest(path: &Path) -> Option<PathBuf> {
    if let Ok(canonical) = fs::canonicalize(path) {
        return Some(canonical);
    }

    let mut missing: Vec<OsString> = Vec::new();
    let mut existing = path;
    loop {
        missing.push(existing.file_name()?.to_os_string());
        existing = existing.parent()?;
        if existing.exists() {
            break;
        }
    }

    let mut result = fs::canonicalize(existing).ok()?;
    for part in missing.into_iter().rev() {
        result.push(part);
    }
    Some(result)
}

fn matching(patterns: &[PathPattern], path: &Path) -> Option<String> {
    let normalized = path.to_string_lossy().replace('\\', "/");
    patterns
        .iter()
        .find(|pat| pat.matcher.is_match(&normalized))
        .map(|pat| pat.pattern.clone())
}

/// C0/C1 controls, DEL, and invisible formatting characters.
fn is_unsafe_path_char(c: char) -> bool {
    matches!(c, '\u{0000}'..='\u{001f}' | '\u{007f}' | '\u{0080}'..='\u{009f}')
        || is_invisible_char(c)
}
