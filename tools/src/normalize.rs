//! Argument normalization for planner-produced tool invocations.
//!
//! Planners send the same call in many shapes. Everything is folded into one
//! [`CanonicalCall`]: a canonical action name plus a flat map of canonical keys.
//! Normalization never fails; tools validate the fields they own.

use sandpatch_types::{Args, CanonicalCall, Invocation, canonical_key};
use serde_json::Value;
use tracing::debug;

/// Fields promoted to `path` when it is absent, in priority order.
pub const PATH_ALIASES: &[&str] = &["file_path", "files", "file"];

#[derive(Debug, Clone, Copy, Default)]
pub struct CallNormalizer;

impl CallNormalizer {
    /// Normalize an untyped invocation value.
    #[must_use]
    pub fn normalize(&self, action: &str, raw: Value) -> CanonicalCall {
        self.normalize_invocation(action, Invocation::classify(raw))
    }

    /// Normalize an already-classified invocation.
    ///
    /// Precedence, highest first:
    /// - `Nested`: `params` over sibling keys
    /// - `Call`: keyword arguments over the first positional object
    #[must_use]
    pub fn normalize_invocation(&self, action: &str, invocation: Invocation) -> CanonicalCall {
        let action = canonical_key(action);
        let shape = invocation.shape_name();

        let layers: Vec<Args> = match invocation {
            Invocation::Flat(args) => {
                let mut args = fold_keys(args);
                drop_action_echo(&mut args, &action, false);
                vec![args]
            }
            Invocation::Nested { params, siblings } => {
                let mut siblings = fold_keys(siblings);
                drop_action_echo(&mut siblings, &action, true);
                vec![siblings, fold_keys(params)]
            }
            Invocation::Call {
                positional,
                keyword,
            } => {
                let mut keyword = fold_keys(keyword);
                drop_action_echo(&mut keyword, &action, true);
                vec![positional_base(&action, positional), keyword]
            }
        };

        let mut args = Args::new();
        for layer in layers {
            args.extend(layer);
        }
        promote_path_alias(&mut args);

        debug!(action = %action, shape, keys = args.len(), "Normalized invocation");
        CanonicalCall::from_normalized(action, args)
    }
}

/// Rewrite top-level keys into canonical form.
///
/// When two keys fold to the same name, the one that was already canonical wins;
/// otherwise the first in key order is kept.
fn fold_keys(args: Args) -> Args {
    let mut folded = Args::new();
    let mut already_canonical: Vec<String> = Vec::new();
    for (key, value) in args {
        let canonical = canonical_key(&key);
        if canonical.is_empty() {
            debug!(key = %key, "Dropping argument with empty name");
            continue;
        }
        let is_canonical = canonical == key;
        if folded.contains_key(&canonical) {
            if is_canonical && !already_canonical.contains(&canonical) {
                debug!(key = %canonical, "Canonical key overrides folded alias");
                folded.insert(canonical.clone(), value);
                already_canonical.push(canonical);
            } else {
                debug!(key = %key, folded = %canonical, "Dropping duplicate argument after folding");
            }
            continue;
        }
        if is_canonical {
            already_canonical.push(canonical.clone());
        }
        folded.insert(canonical, value);
    }
    folded
}

/// Remove an `action` key that merely restates the action being called.
///
/// Wrapper layers (siblings, keywords) always drop it; a flat map keeps it
/// unless it names the same action.
fn drop_action_echo(args: &mut Args, action: &str, wrapper: bool) {
    let echoes = args
        .get("action")
        .and_then(Value::as_str)
        .is_some_and(|named| canonical_key(named) == action);
    if wrapper || echoes {
        args.remove("action");
    }
}

/// First positional object becomes the base layer; a leading positional
/// string equal to the action name is skipped.
fn positional_base(action: &str, positional: Vec<Value>) -> Args {
    let mut values = positional.into_iter().peekable();
    if values
        .peek()
        .and_then(Value::as_str)
        .is_some_and(|first| canonical_key(first) == action)
    {
        values.next();
    }

    let mut base = None;
    let mut ignored = 0usize;
    for value in values {
        match value {
            Value::Object(map) if base.is_none() => base = Some(fold_keys(map)),
            _ => ignored += 1,
        }
    }
    if ignored > 0 {
        debug!(action, ignored, "Ignoring positional arguments that are not the first object");
    }
    base.unwrap_or_default()
}

/// If `path` is absent, promote `file_path`, then `files[0]`, then `file`.
fn promote_path_alias(args: &mut Args) {
    if args.contains_key("path") {
        return;
    }
    let promoted = if let Some(value) = args.remove("file_path") {
        Some(("file_path", value))
    } else if let Some(first) = args
        .get("files")
        .and_then(Value::as_array)
        .and_then(|files| files.first())
        .cloned()
    {
        Some(("files", first))
    } else {
        args.remove("file").map(|value| ("file", value))
    };
    if let Some((alias, value)) = promoted {
        debug!(alias, "Promoted path alias");
        args.insert("path".to_string(), value);
    }
}
