//! Line-level change statistics.

use similar::{ChangeTag, TextDiff};

/// Lines added and removed between two versions of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiffStats {
    pub additions: u32,
    pub deletions: u32,
}

/// Count inserted and deleted lines between old and new content.
///
/// Non-UTF-8 input is compared lossily; the counts are informational.
#[must_use]
pub fn compute_diff_stats(old_bytes: &[u8], new_bytes: &[u8]) -> DiffStats {
    let old_text = String::from_utf8_lossy(old_bytes);
    let new_text = String::from_utf8_lossy(new_bytes);

    let diff = TextDiff::from_lines(old_text.as_ref(), new_text.as_ref());

    let mut stats = DiffStats::default();
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => stats.additions += 1,
            ChangeTag::Delete => stats.deletions += 1,
            ChangeTag::Equal => {}
        }
    }
    stats
}
