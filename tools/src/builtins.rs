//! Built-in tool executors.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use globset::GlobBuilder;
use ignore::WalkBuilder;
use sandpatch_types::{ActionClass, Fingerprint, truncate_with_ellipsis};
use sandpatch_utils::{AtomicWriteOptions, PersistMode, atomic_write_new};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::{DenialReason, ToolCtx, ToolError, ToolExecutor, ToolFut, ToolRegistry, parse_args};
use crate::fingerprint::{fingerprint_bytes, line_count};
use crate::patch::{PatchEngine, PatchOutcome, PatchRequest};
use crate::sandbox::{PathSandbox, ResolvedPath};

/// Directory names never descended into by listing or searching.
pub const EXCLUDED_DIRS: &[&str] = &[".git", "node_modules", "vendor", "bundle", ".bundle", "tmp", "log"];

const MAX_LIST_ENTRIES: usize = 10_000;
const MAX_MATCH_LINE_CHARS: usize = 500;
const BINARY_SNIFF_BYTES: usize = 8192;
/// Staged temp files are owner-only; created files get ordinary permissions.
const NEW_FILE_MODE: u32 = 0o644;

#[derive(Debug, Default)]
pub struct ReadFileTool;

#[derive(Debug, Default)]
pub struct CreateFileTool;

#[derive(Debug, Default)]
pub struct ApplyPatchTool;

#[derive(Debug, Default)]
pub struct ListFilesTool;

#[derive(Debug, Default)]
pub struct SearchTool;

#[derive(Debug, Deserialize)]
struct ReadFileArgs {
    path: String,
}

#[derive(Debug, Deserialize)]
struct CreateFileArgs {
    path: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApplyPatchArgs {
    path: String,
    #[serde(default)]
    edits: Value,
    #[serde(default, alias = "expected_fingerprint")]
    sha256: Option<Fingerprint>,
}

#[derive(Debug, Deserialize)]
struct ListFilesArgs {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    glob: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchArgs {
    query: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    case_sensitive: bool,
}

/// Metadata for an existing regular file, mapping absence to `NotFound`.
fn existing_file(path: &ResolvedPath, raw: &str) -> Result<fs::Metadata, ToolError> {
    let meta = fs::metadata(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ToolError::NotFound {
            path: raw.to_string(),
        },
        _ => ToolError::io(path.as_path(), e),
    })?;
    if !meta.is_file() {
        return Err(ToolError::NotAFile {
            path: path.as_path().to_path_buf(),
        });
    }
    Ok(meta)
}

impl ToolExecutor for ReadFileTool {
    fn name(&self) -> &'static str {
        "read_file"
    }

    fn description(&self) -> &'static str {
        "Read a file's full content. Returns the sha256 fingerprint that apply_patch expects."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path inside the sandbox" }
            },
            "required": ["path"]
        })
    }

    fn action_class(&self) -> ActionClass {
        ActionClass::Read
    }

    fn execute<'a>(&'a self, args: Value, ctx: &'a ToolCtx) -> ToolFut<'a> {
        Box::pin(async move {
            let typed: ReadFileArgs = parse_args(&args)?;
            let resolved = ctx.sandbox.resolve(&typed.path)?;
            let meta = existing_file(&resolved, &typed.path)?;

            let limit = ctx.limits.read.max_file_read_bytes;
            if meta.len() > limit as u64 {
                return Err(ToolError::BadArgs {
                    message: format!(
                        "{} is {} bytes, over the read limit of {limit} bytes",
                        ctx.sandbox.display_path(resolved.as_path()),
                        meta.len()
                    ),
                });
            }

            let bytes = fs::read(&resolved).map_err(|e| ToolError::io(resolved.as_path(), e))?;
            Ok(json!({
                "path": ctx.sandbox.display_path(resolved.as_path()),
                "content": String::from_utf8_lossy(&bytes),
                "sha256": fingerprint_bytes(&bytes),
                "lines": line_count(&bytes),
            }))
        })
    }
}

impl ToolExecutor for CreateFileTool {
    fn name(&self) -> &'static str {
        "create_file"
    }

    fn description(&self) -> &'static str {
        "Create a new file, creating parent directories as needed. Fails if the file exists."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path to create inside the sandbox" },
                "content": { "type": "string", "description": "Full file content" }
            },
            "required": ["path", "content"]
        })
    }

    fn action_class(&self) -> ActionClass {
        ActionClass::Mutation
    }

    fn execute<'a>(&'a self, args: Value, ctx: &'a ToolCtx) -> ToolFut<'a> {
        Box::pin(async move {
            let typed: CreateFileArgs = parse_args(&args)?;
            let resolved = ctx.sandbox.resolve_for_create(&typed.path)?;
            if fs::symlink_metadata(&resolved).is_ok() {
                return Err(ToolError::AlreadyExists {
                    path: resolved.into_path_buf(),
                });
            }

            if let Some(parent) = resolved.as_path().parent()
                && !parent.exists()
            {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ToolError::io(parent, e))?;
                // A directory could have been swapped for a symlink while we created it.
                let recheck = ctx.sandbox.resolve_for_create(&typed.path)?;
                if recheck != resolved {
                    return Err(ToolError::from(DenialReason::PathEscape {
                        attempted: typed.path.clone(),
                        resolved: recheck.into_path_buf(),
                    }));
                }
            }

            let bytes = typed.content.into_bytes();
            let fingerprint = fingerprint_bytes(&bytes);
            let lines = line_count(&bytes);
            let write_path: PathBuf = resolved.as_path().to_path_buf();
            let write_result = tokio::task::spawn_blocking(move || {
                let options = AtomicWriteOptions {
                    mode: PersistMode::Preserve(NEW_FILE_MODE),
                    ..AtomicWriteOptions::default()
                };
                atomic_write_new(&write_path, &bytes, options)
            })
            .await
            .map_err(|e| ToolError::io(resolved.as_path(), io::Error::other(e)))?;

            match write_result {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    return Err(ToolError::AlreadyExists {
                        path: resolved.into_path_buf(),
                    });
                }
                Err(err) => return Err(ToolError::io(resolved.as_path(), err)),
            }

            debug!(path = %resolved, lines, "Created file");
            Ok(json!({
                "status": "created",
                "path": ctx.sandbox.display_path(resolved.as_path()),
                "sha256": fingerprint,
                "lines": lines,
            }))
        })
    }
}

impl ToolExecutor for ApplyPatchTool {
    fn name(&self) -> &'static str {
        "apply_patch"
    }

    fn description(&self) -> &'static str {
        "Replace inclusive 1-indexed line ranges of an existing file. Line numbers refer to the \
         file as last read; pass its sha256 to guard against concurrent changes."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File to patch" },
                "sha256": { "type": "string", "description": "Fingerprint returned by read_file. Omit to skip the check." },
                "edits": {
                    "type": "array",
                    "minItems": 1,
                    "items": {
                        "type": "object",
                        "properties": {
                            "start_line": { "type": "integer", "minimum": 1 },
                            "end_line": { "type": "integer", "minimum": 1 },
                            "replacement": { "type": "string", "description": "New text for the range; empty deletes it" }
                        },
                        "required": ["start_line", "end_line", "replacement"]
                    }
                }
            },
            "required": ["path", "edits"]
        })
    }

    fn action_class(&self) -> ActionClass {
        ActionClass::Mutation
    }

    fn execute<'a>(&'a self, args: Value, ctx: &'a ToolCtx) -> ToolFut<'a> {
        Box::pin(async move {
            let typed: ApplyPatchArgs = parse_args(&args)?;
            if typed.path.trim().is_empty() {
                return Err(ToolError::BadArgs {
                    message: "path must not be empty".to_string(),
                });
            }
            let mut request = PatchRequest::new(typed.path, typed.edits);
            request.expected_fingerprint = typed.sha256;

            let outcome = PatchEngine::new(&ctx.sandbox, ctx.limits.edits).apply_patch(&request)?;
            Ok(json!({
                "status": PatchOutcome::STATUS,
                "path": ctx.sandbox.display_path(outcome.path.as_path()),
                "sha256": outcome.fingerprint,
                "edits": outcome.edits_applied,
                "additions": outcome.stats.additions,
                "deletions": outcome.stats.deletions,
                "changed": outcome.written,
            }))
        })
    }
}

/// Regular files below `dir`, skipping excluded directories and denied paths.
fn walk_files<'s>(sandbox: &'s PathSandbox, dir: &Path) -> impl Iterator<Item = PathBuf> + 's {
    WalkBuilder::new(dir)
        .hidden(false)
        .git_ignore(true)
        .parents(false)
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !EXCLUDED_DIRS.contains(&name.as_ref())
        })
        .build()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_some_and(|ft| ft.is_file()))
        .map(ignore::DirEntry::into_path)
        .filter(move |path| !sandbox.is_path_denied(path))
}

fn existing_dir(sandbox: &PathSandbox, raw: Option<&str>) -> Result<ResolvedPath, ToolError> {
    let dir = sandbox.resolve_directory(raw)?;
    if !dir.as_path().exists() {
        return Err(ToolError::NotFound {
            path: raw.unwrap_or(".").to_string(),
        });
    }
    if !dir.as_path().is_dir() {
        return Err(ToolError::BadArgs {
            message: format!("{} is not a directory", sandbox.display_path(dir.as_path())),
        });
    }
    Ok(dir)
}

impl ToolExecutor for ListFilesTool {
    fn name(&self) -> &'static str {
        "list_files"
    }

    fn description(&self) -> &'static str {
        "List files in the sandbox, optionally filtered by a glob relative to the listed directory"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory to list. Defaults to the sandbox root." },
                "glob": { "type": "string", "description": "Glob such as '**/*.rb'. Defaults to every file." }
            }
        })
    }

    fn execute<'a>(&'a self, args: Value, ctx: &'a ToolCtx) -> ToolFut<'a> {
        Box::pin(async move {
            let typed: ListFilesArgs = parse_args(&args)?;
            let dir = existing_dir(&ctx.sandbox, typed.path.as_deref())?;

            let matcher = match typed.glob.as_deref().map(str::trim) {
                None | Some("") => None,
                Some(pattern) => match GlobBuilder::new(pattern).literal_separator(true).build() {
                    Ok(glob) => Some(glob.compile_matcher()),
                    Err(e) => {
                        return Err(ToolError::BadArgs {
                            message: format!("invalid glob pattern '{pattern}': {e}"),
                        });
                    }
                },
            };

            let mut files = Vec::new();
            let mut truncated = false;
            for path in walk_files(&ctx.sandbox, dir.as_path()) {
                let rel = path.strip_prefix(dir.as_path()).unwrap_or(&path);
                if matcher.as_ref().is_some_and(|m| !m.is_match(rel)) {
                    continue;
                }
                if files.len() == MAX_LIST_ENTRIES {
                    truncated = true;
                    break;
                }
                files.push(ctx.sandbox.display_path(&path));
            }
            files.sort();

            Ok(json!({ "files": files, "count": files.len(), "truncated": truncated }))
        })
    }
}

impl ToolExecutor for SearchTool {
    fn name(&self) -> &'static str {
        "search"
    }

    fn description(&self) -> &'static str {
        "Find lines containing a literal query in sandbox files"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Literal text to find" },
                "path": { "type": "string", "description": "Directory to search. Defaults to the sandbox root." },
                "case_sensitive": { "type": "boolean", "default": false }
            },
            "required": ["query"]
        })
    }

    fn execute<'a>(&'a self, args: Value, ctx: &'a ToolCtx) -> ToolFut<'a> {
        Box::pin(async move {
            let typed: SearchArgs = parse_args(&args)?;
            if typed.query.is_empty() {
                return Err(ToolError::BadArgs {
                    message: "query must not be empty".to_string(),
                });
            }
            let dir = existing_dir(&ctx.sandbox, typed.path.as_deref())?;
            let needle = if typed.case_sensitive {
                typed.query.clone()
            } else {
                typed.query.to_lowercase()
            };
            let max_results = ctx.limits.search.max_results;
            let max_bytes = ctx.limits.read.max_file_read_bytes as u64;

            let mut files: Vec<PathBuf> = walk_files(&ctx.sandbox, dir.as_path()).collect();
            files.sort();

            let mut results = Vec::new();
            let mut truncated = false;
            'files: for path in files {
                if fs::metadata(&path).is_ok_and(|m| m.len() > max_bytes) {
                    continue;
                }
                let Ok(bytes) = fs::read(&path) else {
                    continue;
                };
                if bytes[..bytes.len().min(BINARY_SNIFF_BYTES)].contains(&0) {
                    continue;
                }
                let text = String::from_utf8_lossy(&bytes);
                let display = ctx.sandbox.display_path(&path);
                for (idx, line) in text.lines().enumerate() {
                    let hit = if typed.case_sensitive {
                        line.contains(&needle)
                    } else {
                        line.to_lowercase().contains(&needle)
                    };
                    if !hit {
                        continue;
                    }
                    if results.len() == max_results {
                        truncated = true;
                        break 'files;
                    }
                    results.push(json!({
                        "file": display,
                        "line": idx + 1,
                        "content": truncate_with_ellipsis(line, MAX_MATCH_LINE_CHARS),
                    }));
                }
            }

            Ok(json!({ "results": results, "count": results.len(), "truncated": truncated }))
        })
    }
}

pub fn register_builtins(registry: &mut ToolRegistry) -> Result<(), ToolError> {
    registry.register(Box::new(ReadFileTool))?;
    registry.register(Box::new(CreateFileTool))?;
    registry.register(Box::new(ApplyPatchTool))?;
    registry.register(Box::new(ListFilesTool))?;
    registry.register(Box::new(SearchTool))?;
    Ok(())
}
