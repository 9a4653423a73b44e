//! Line-range patching with optimistic concurrency.
//!
//! Edits address the file's *original* 1-indexed line numbers. They are
//! applied from the highest `start_line` down, so no replacement shifts a
//! range that is still waiting to be applied. The whole result is written
//! back with a single atomic rename.

use std::borrow::Cow;
use std::fs;

use sandpatch_types::{EditLimits, EditSet, Fingerprint};
use sandpatch_utils::{AtomicWriteOptions, DiffStats, atomic_write_with_options, compute_diff_stats};
use serde_json::Value;
use tracing::{debug, warn};

use crate::ToolError;
use crate::fingerprint::fingerprint_bytes;
use crate::sandbox::{PathSandbox, ResolvedPath};

/// One patch call: a target path, untrusted edits, and an optional precondition.
#[derive(Debug, Clone)]
pub struct PatchRequest {
    pub path: String,
    /// Raw edit list, validated by the engine.
    pub edits: Value,
    /// `None` skips the concurrency check.
    pub expected_fingerprint: Option<Fingerprint>,
}

impl PatchRequest {
    pub fn new(path: impl Into<String>, edits: Value) -> Self {
        Self {
            path: path.into(),
            edits,
            expected_fingerprint: None,
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: Fingerprint) -> Self {
        self.expected_fingerprint = Some(fingerprint);
        self
    }
}

/// Result of a successful patch.
#[derive(Debug, Clone)]
pub struct PatchOutcome {
    pub path: ResolvedPath,
    /// Fingerprint of the content now on disk.
    pub fingerprint: Fingerprint,
    pub edits_applied: usize,
    pub stats: DiffStats,
    /// `false` when the edits reproduced the original bytes and nothing was written.
    pub written: bool,
}

impl PatchOutcome {
    pub const STATUS: &'static str = "patched";
}

#[derive(Debug, Clone, Copy)]
pub struct PatchEngine<'a> {
    sandbox: &'a PathSandbox,
    limits: EditLimits,
}

impl<'a> PatchEngine<'a> {
    #[must_use]
    pub fn new(sandbox: &'a PathSandbox, limits: EditLimits) -> Self {
        Self { sandbox, limits }
    }

    pub fn apply_patch(&self, request: &PatchRequest) -> Result<PatchOutcome, ToolError> {
        let path = self.sandbox.resolve_for_write(&request.path)?;
        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ToolError::NotFound {
                    path: request.path.clone(),
                });
            }
            Err(e) => return Err(ToolError::io(path.as_path(), e)),
        };
        if !meta.is_file() {
            return Err(ToolError::NotAFile {
                path: path.into_path_buf(),
            });
        }

        let original = fs::read(&path).map_err(|e| ToolError::io(path.as_path(), e))?;
        let current = fingerprint_bytes(&original);

        if let Some(expected) = &request.expected_fingerprint
            && *expected != current
        {
            warn!(
                path = %path,
                expected = %expected,
                actual = %current,
                "Fingerprint mismatch; refusing to patch"
            );
            return Err(ToolError::ConcurrentModification {
                path: path.into_path_buf(),
                expected: expected.clone(),
                actual: current,
            });
        }

        let edits = EditSet::parse(&request.edits, self.limits)?;
        let patched = splice_lines(&path, &original, &edits)?;

        if patched == original {
            debug!(path = %path, edits = edits.len(), "Patch reproduces original content; skipping write");
            return Ok(PatchOutcome {
                path,
                fingerprint: current,
                edits_applied: edits.len(),
                stats: DiffStats::default(),
                written: false,
            });
        }

        atomic_write_with_options(&path, &patched, AtomicWriteOptions::preserving(&meta))
            .map_err(|e| ToolError::io(path.as_path(), e))?;

        let stats = compute_diff_stats(&original, &patched);
        debug!(
            path = %path,
            edits = edits.len(),
            additions = stats.additions,
            deletions = stats.deletions,
            "Patched file"
        );
        Ok(PatchOutcome {
            path,
            fingerprint: fingerprint_bytes(&patched),
            edits_applied: edits.len(),
            stats,
            written: true,
        })
    }
}

/// Apply a validated edit set to `original`, returning the new bytes.
///
/// Every range is checked against the original line count before anything is spliced.
fn splice_lines(path: &ResolvedPath, original: &[u8], edits: &EditSet) -> Result<Vec<u8>, ToolError> {
    let mut lines: Vec<Cow<'_, [u8]>> = original
        .split_inclusive(|&b| b == b'\n')
        .map(Cow::Borrowed)
        .collect();
    let line_count = lines.len();

    for (index, edit) in edits.iter_descending() {
        if edit.end_line() as usize > line_count {
            return Err(ToolError::LineRangeOutOfBounds {
                path: path.as_path().to_path_buf(),
                index,
                start_line: edit.start_line(),
                end_line: edit.end_line(),
                line_count,
            });
        }
    }

    for (_, edit) in edits.iter_descending() {
        let start = edit.start_line() as usize - 1;
        let end = edit.end_line() as usize;
        let replacement = terminated(edit.replacement(), &lines[end - 1]);
        lines.drain(start..end);
        if !replacement.is_empty() {
            lines.insert(start, Cow::Owned(replacement));
        }
    }

    Ok(lines.concat())
}

/// Give a non-empty replacement the terminator of the last line it replaces,
/// unless it already ends with one.
fn terminated(replacement: &str, last_replaced: &[u8]) -> Vec<u8> {
    let mut bytes = replacement.as_bytes().to_vec();
    if bytes.is_empty() || bytes.ends_with(b"\n") {
        return bytes;
    }
    if last_replaced.ends_with(b"\r\n") {
        bytes.extend_from_slice(b"\r\n");
    } else if last_replaced.ends_with(b"\n") {
        bytes.push(b'\n');
    }
    bytes
}

#[cfg(test)]
mod tests {
    use std::fs;

    use sandpatch_types::{EditLimits, Fingerprint};
    use serde_json::json;
    use tempfile::tempdir;

    use super::{PatchEngine, PatchRequest, terminated};
    use crate::ToolError;
    use crate::fingerprint::fingerprint_bytes;
    use crate::sandbox::{PathSandbox, SandboxConfig};

    fn setup(content: &str) -> (tempfile::TempDir, PathSandbox) {
        let temp = tempdir().unwrap();
        let sandbox = PathSandbox::new(SandboxConfig::new(temp.path())).unwrap();
        fs::write(sandbox.root().join("file.txt"), content).unwrap();
        (temp, sandbox)
    }

    fn read(sandbox: &PathSandbox) -> String {
        fs::read_to_string(sandbox.root().join("file.txt")).unwrap()
    }

    #[test]
    fn replaces_a_single_line() {
        let (_temp, sandbox) = setup("a\nb\nc\n");
        let engine = PatchEngine::new(&sandbox, EditLimits::default());
        let outcome = engine
            .apply_patch(&PatchRequest::new(
                "file.txt",
                json!([{"start_line": 2, "end_line": 2, "replacement": "B\n"}]),
            ))
            .unwrap();
        assert_eq!(read(&sandbox), "a\nB\nc\n");
        assert!(outcome.written);
        assert_eq!(outcome.stats.additions, 1);
        assert_eq!(outcome.stats.deletions, 1);
        assert_eq!(outcome.fingerprint, fingerprint_bytes(b"a\nB\nc\n"));
    }

    #[test]
    fn empty_replacement_deletes_range() {
        let (_temp, sandbox) = setup("a\nb\nc\nd\n");
        let engine = PatchEngine::new(&sandbox, EditLimits::default());
        engine
            .apply_patch(&PatchRequest::new(
                "file.txt",
                json!([{"start_line": 2, "end_line": 3, "replacement": ""}]),
            ))
            .unwrap();
        assert_eq!(read(&sandbox), "a\nd\n");
    }

    #[test]
    fn multi_line_replacement_grows_file() {
        let (_temp, sandbox) = setup("a\nb\nc\n");
        let engine = PatchEngine::new(&sandbox, EditLimits::default());
        engine
            .apply_patch(&PatchRequest::new(
                "file.txt",
                json!([{"start_line": 2, "end_line": 2, "replacement": "x\ny\nz\n"}]),
            ))
            .unwrap();
        assert_eq!(read(&sandbox), "a\nx\ny\nz\nc\n");
    }

    #[test]
    fn missing_terminator_is_inherited() {
        assert_eq!(terminated("x", b"old\n"), b"x\n");
        assert_eq!(terminated("x", b"old\r\n"), b"x\r\n");
        assert_eq!(terminated("x", b"old"), b"x");
        assert_eq!(terminated("x\n", b"old\r\n"), b"x\n");
        assert_eq!(terminated("", b"old\n"), b"");
    }

    #[test]
    fn replacement_without_newline_does_not_fuse_lines() {
        let (_temp, sandbox) = setup("a\nb\nc\n");
        let engine = PatchEngine::new(&sandbox, EditLimits::default());
        engine
            .apply_patch(&PatchRequest::new(
                "file.txt",
                json!([{"start_line": 1, "end_line": 1, "replacement": "A"}]),
            ))
            .unwrap();
        assert_eq!(read(&sandbox), "A\nb\nc\n");
    }

    #[test]
    fn replacing_with_original_content_skips_write() {
        let (_temp, sandbox) = setup("a\nb\nc\n");
        let engine = PatchEngine::new(&sandbox, EditLimits::default());
        let outcome = engine
            .apply_patch(&PatchRequest::new(
                "file.txt",
                json!([{"start_line": 2, "end_line": 3, "replacement": "b\nc\n"}]),
            ))
            .unwrap();
        assert!(!outcome.written);
        assert_eq!(read(&sandbox), "a\nb\nc\n");
    }

    #[test]
    fn last_line_without_newline_can_be_replaced() {
        let (_temp, sandbox) = setup("a\nb");
        let engine = PatchEngine::new(&sandbox, EditLimits::default());
        engine
            .apply_patch(&PatchRequest::new(
                "file.txt",
                json!([{"start_line": 2, "end_line": 2, "replacement": "B"}]),
            ))
            .unwrap();
        assert_eq!(read(&sandbox), "a\nB");
    }

    #[test]
    fn out_of_bounds_reports_index_and_line_count() {
        let (_temp, sandbox) = setup("a\nb\n");
        let engine = PatchEngine::new(&sandbox, EditLimits::default());
        let err = engine
            .apply_patch(&PatchRequest::new(
                "file.txt",
                json!([
                    {"start_line": 1, "end_line": 1, "replacement": "A\n"},
                    {"start_line": 2, "end_line": 3, "replacement": ""}
                ]),
            ))
            .unwrap_err();
        match err {
            ToolError::LineRangeOutOfBounds {
                index, line_count, ..
            } => {
                assert_eq!(index, 1);
                assert_eq!(line_count, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(read(&sandbox), "a\nb\n");
    }

    #[test]
    fn stale_fingerprint_leaves_file_untouched() {
        let (_temp, sandbox) = setup("a\n");
        let engine = PatchEngine::new(&sandbox, EditLimits::default());
        let stale = Fingerprint::from_hex("00").unwrap();
        let err = engine
            .apply_patch(
                &PatchRequest::new(
                    "file.txt",
                    json!([{"start_line": 1, "end_line": 1, "replacement": "b\n"}]),
                )
                .with_fingerprint(stale),
            )
            .unwrap_err();
        assert!(matches!(err, ToolError::ConcurrentModification { .. }));
        assert_eq!(read(&sandbox), "a\n");
    }

    #[test]
    fn missing_file_is_not_found() {
        let (_temp, sandbox) = setup("a\n");
        let engine = PatchEngine::new(&sandbox, EditLimits::default());
        let err = engine
            .apply_patch(&PatchRequest::new(
                "nope.txt",
                json!([{"start_line": 1, "end_line": 1, "replacement": ""}]),
            ))
            .unwrap_err();
        assert!(matches!(err, ToolError::NotFound { path } if path == "nope.txt"));
    }

    #[test]
    fn directory_is_not_a_file() {
        let (_temp, sandbox) = setup("a\n");
        fs::create_dir(sandbox.root().join("dir")).unwrap();
        let engine = PatchEngine::new(&sandbox, EditLimits::default());
        let err = engine
            .apply_patch(&PatchRequest::new(
                "dir",
                json!([{"start_line": 1, "end_line": 1, "replacement": ""}]),
            ))
            .unwrap_err();
        assert!(matches!(err, ToolError::NotAFile { .. }));
    }

    #[test]
    fn crlf_content_is_preserved_outside_edits() {
        let (_temp, sandbox) = setup("a\r\nb\r\nc\r\n");
        let engine = PatchEngine::new(&sandbox, EditLimits::default());
        engine
            .apply_patch(&PatchRequest::new(
                "file.txt",
                json!([{"start_line": 2, "end_line": 2, "replacement": "B"}]),
            ))
            .unwrap();
        assert_eq!(read(&sandbox), "a\r\nB\r\nc\r\n");
    }
}
