//! Sandboxed patch execution: core types, the tool executor framework, and built-in tools.
//!
//! An untrusted invocation flows one way through this crate:
//! [`normalize::CallNormalizer`] → [`loop_guard::LoopGuard`] → [`sandbox::PathSandbox`]
//! → [`patch::PatchEngine`] (or a sibling tool). [`run::AgentRun`] wires the stages together.

pub mod builtins;
pub mod fingerprint;
pub mod loop_guard;
pub mod normalize;
pub mod patch;
pub mod run;
pub mod sandbox;

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use sandpatch_types::{ActionClass, EDIT_EXAMPLE, EditLimits, EditSetError, Fingerprint};
use serde::Serialize;
use serde_json::{Value, json};

pub use builtins::register_builtins;
pub use loop_guard::{CallHistory, LoopGuard, LoopPolicy, RejectReason, Rejection, Verdict};
pub use normalize::CallNormalizer;
pub use patch::{PatchEngine, PatchOutcome, PatchRequest};
pub use run::{AgentRun, Decision};
pub use sandbox::{PathSandbox, ResolvedPath, SandboxConfig};

/// Tool execution future type alias.
pub type ToolFut<'a> = Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send + 'a>>;

/// Error types for tool execution.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Bad tool args: {message}")]
    BadArgs { message: String },
    #[error("Sandbox violation: {0}")]
    SandboxViolation(DenialReason),
    #[error("File not found: {path}")]
    NotFound { path: String },
    #[error("Not a regular file: {}", path.display())]
    NotAFile { path: PathBuf },
    #[error("File already exists: {}. Use apply_patch to modify existing files.", path.display())]
    AlreadyExists { path: PathBuf },
    #[error(
        "File changed since it was read: {} (expected sha256 {expected}, actual {actual}). Re-read the file and retry.",
        path.display()
    )]
    ConcurrentModification {
        path: PathBuf,
        expected: Fingerprint,
        actual: Fingerprint,
    },
    #[error("Invalid edits: {0}")]
    InvalidEditSet(EditSetError),
    #[error(
        "edits[{index}]: lines {start_line}-{end_line} are outside {} ({line_count} lines). Re-read the file for current line numbers.",
        path.display()
    )]
    LineRangeOutOfBounds {
        path: PathBuf,
        index: usize,
        start_line: u32,
        end_line: u32,
        line_count: usize,
    },
    #[error("{0}")]
    LoopRejected(Rejection),
    #[error("Unknown tool: {name}")]
    UnknownTool { name: String },
    #[error("Duplicate tool registered: {name}")]
    DuplicateTool { name: String },
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Denial reason for sandbox policy.
#[derive(Debug, Clone)]
pub enum DenialReason {
    /// The path resolves (or would resolve) outside the sandbox root.
    PathEscape {
        attempted: String,
        resolved: PathBuf,
    },
    DeniedPatternMatched {
        attempted: PathBuf,
        pattern: String,
    },
    /// Readable, but never written or created.
    ProtectedFile {
        path: PathBuf,
        pattern: String,
    },
    InvalidPath {
        attempted: String,
        reason: &'static str,
    },
}

impl DenialReason {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PathEscape { .. } => "path_escape",
            Self::DeniedPatternMatched { .. } => "denied_pattern",
            Self::ProtectedFile { .. } => "protected_file",
            Self::InvalidPath { .. } => "invalid_path",
        }
    }
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenialReason::PathEscape {
                attempted,
                resolved,
            } => write!(
                f,
                "Path escapes the sandbox (attempted: {attempted}, resolved: {})",
                resolved.display()
            ),
            DenialReason::DeniedPatternMatched { attempted, pattern } => write!(
                f,
                "Path '{}' matched denied pattern '{pattern}'",
                attempted.display()
            ),
            DenialReason::ProtectedFile { path, pattern } => write!(
                f,
                "Path '{}' is protected (pattern '{pattern}') and cannot be modified",
                path.display()
            ),
            DenialReason::InvalidPath { attempted, reason } => {
                write!(f, "Invalid path {attempted:?}: {reason}")
            }
        }
    }
}

/// Machine-readable form of a [`ToolError`], suitable for feeding back to a planner.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub error: &'static str,
    pub message: String,
    pub details: Value,
}

impl ToolError {
    /// Stable snake_case code for this error.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadArgs { .. } => "bad_args",
            Self::SandboxViolation(reason) => reason.kind(),
            Self::NotFound { .. } => "not_found",
            Self::NotAFile { .. } => "not_a_file",
            Self::AlreadyExists { .. } => "already_exists",
            Self::ConcurrentModification { .. } => "concurrent_modification",
            Self::InvalidEditSet(_) => "invalid_edit_set",
            Self::LineRangeOutOfBounds { .. } => "line_range_out_of_bounds",
            Self::LoopRejected(_) => "loop_rejected",
            Self::UnknownTool { .. } => "unknown_tool",
            Self::DuplicateTool { .. } => "duplicate_tool",
            Self::Io { .. } => "io",
        }
    }

    #[must_use]
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            error: self.kind(),
            message: self.to_string(),
            details: self.details(),
        }
    }

    fn details(&self) -> Value {
        match self {
            Self::SandboxViolation(DenialReason::PathEscape {
                attempted,
                resolved,
            }) => json!({ "attempted": attempted, "resolved": resolved }),
            Self::SandboxViolation(DenialReason::DeniedPatternMatched { attempted, pattern }) => {
                json!({ "path": attempted, "pattern": pattern })
            }
            Self::SandboxViolation(DenialReason::ProtectedFile { path, pattern }) => {
                json!({ "path": path, "pattern": pattern })
            }
            Self::SandboxViolation(DenialReason::InvalidPath { attempted, reason }) => {
                json!({ "attempted": attempted, "reason": reason })
            }
            Self::NotFound { path } => json!({ "path": path }),
            Self::NotAFile { path } | Self::AlreadyExists { path } => json!({ "path": path }),
            Self::ConcurrentModification {
                path,
                expected,
                actual,
            } => json!({ "path": path, "expected": expected, "actual": actual }),
            Self::InvalidEditSet(err) => json!({
                "index": err.index,
                "problem": err.problem.to_string(),
                "example": err.example(),
            }),
            Self::LineRangeOutOfBounds {
                path,
                index,
                start_line,
                end_line,
                line_count,
            } => json!({
                "path": path,
                "index": index,
                "start_line": start_line,
                "end_line": end_line,
                "line_count": line_count,
                "example": EDIT_EXAMPLE,
            }),
            Self::LoopRejected(rejection) => json!({
                "action": rejection.action,
                "reason": rejection.reason.code(),
                "class": rejection.class,
                "occurrences": rejection.occurrences,
                "threshold": rejection.threshold,
            }),
            Self::UnknownTool { name } | Self::DuplicateTool { name } => json!({ "name": name }),
            Self::Io { path, source } => json!({ "path": path, "source": source.to_string() }),
            Self::BadArgs { .. } => Value::Null,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<EditSetError> for ToolError {
    fn from(err: EditSetError) -> Self {
        Self::InvalidEditSet(err)
    }
}

impl From<DenialReason> for ToolError {
    fn from(reason: DenialReason) -> Self {
        Self::SandboxViolation(reason)
    }
}

/// A tool the dispatch pipeline can call.
pub trait ToolExecutor: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn schema(&self) -> Value;
    /// Class the repetition guard uses unless the policy names this tool explicitly.
    fn action_class(&self) -> ActionClass {
        ActionClass::Default
    }
    fn execute<'a>(&'a self, args: Value, ctx: &'a ToolCtx) -> ToolFut<'a>;
}

pub(crate) fn parse_args<T: serde::de::DeserializeOwned>(args: &Value) -> Result<T, ToolError> {
    serde_json::from_value(args.clone()).map_err(|e| ToolError::BadArgs {
        message: e.to_string(),
    })
}

/// Definition of a registered tool, as advertised to a planner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub class: ActionClass,
}

/// Tool registry for executors.
#[derive(Default)]
pub struct ToolRegistry {
    executors: HashMap<String, Box<dyn ToolExecutor>>,
}

impl ToolRegistry {
    pub fn register(&mut self, executor: Box<dyn ToolExecutor>) -> Result<(), ToolError> {
        let name = executor.name().to_string();
        if self.executors.contains_key(&name) {
            return Err(ToolError::DuplicateTool { name });
        }
        self.executors.insert(name, executor);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<&dyn ToolExecutor, ToolError> {
        self.executors
            .get(name)
            .map(std::convert::AsRef::as_ref)
            .ok_or_else(|| ToolError::UnknownTool {
                name: name.to_string(),
            })
    }

    /// Declared classes of every registered tool.
    pub fn action_classes(&self) -> impl Iterator<Item = (&str, ActionClass)> {
        self.executors
            .iter()
            .map(|(name, exec)| (name.as_str(), exec.action_class()))
    }

    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .executors
            .values()
            .map(|exec| ToolDefinition {
                name: exec.name().to_string(),
                description: exec.description().to_string(),
                parameters: exec.schema(),
                class: exec.action_class(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("ToolRegistry").field("tools", &names).finish()
    }
}

/// Tool-specific limits for `read_file` and `search`.
#[derive(Debug, Clone, Copy)]
pub struct ReadFileLimits {
    pub max_file_read_bytes: usize,
}

impl Default for ReadFileLimits {
    fn default() -> Self {
        Self {
            max_file_read_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SearchLimits {
    pub max_results: usize,
}

impl Default for SearchLimits {
    fn default() -> Self {
        Self { max_results: 500 }
    }
}

/// Aggregated per-tool limits.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolLimits {
    pub edits: EditLimits,
    pub read: ReadFileLimits,
    pub search: SearchLimits,
}

/// Aggregated tool settings derived from config.
#[derive(Debug, Clone)]
pub struct ToolSettings {
    pub sandbox: SandboxConfig,
    pub limits: ToolLimits,
    pub loop_policy: LoopPolicy,
}

/// Context shared by every call in one agent run.
#[derive(Debug, Clone)]
pub struct ToolCtx {
    pub sandbox: Arc<PathSandbox>,
    pub limits: ToolLimits,
}

impl ToolCtx {
    #[must_use]
    pub fn new(sandbox: PathSandbox, limits: ToolLimits) -> Self {
        Self {
            sandbox: Arc::new(sandbox),
            limits,
        }
    }
}
