//! Tool invocations: the raw shapes a planner sends and the canonical form tools consume.

use serde::Serialize;
use serde_json::Value;

use crate::text::canonical_key;

/// Argument map with unique string keys.
///
/// `serde_json::Map` is ordered by key (no `preserve_order`), which keeps
/// serialized signatures deterministic.
pub type Args = serde_json::Map<String, Value>;

/// Every invocation shape the normalizer understands.
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    /// `{"path": "...", "edits": [...]}`
    Flat(Args),
    /// `{"params": {...}, ...siblings}`. `params` wins over siblings.
    Nested { params: Args, siblings: Args },
    /// Positional values (the first may repeat the action name) plus keywords.
    Call {
        positional: Vec<Value>,
        keyword: Args,
    },
}

impl Invocation {
    /// Classify an untyped JSON value into one of the known shapes.
    ///
    /// - object with an object under a `params`-like key: [`Invocation::Nested`]
    /// - object with an array under a `params`-like key: [`Invocation::Call`],
    ///   the remaining keys becoming keyword arguments
    /// - any other object: [`Invocation::Flat`]
    /// - array: [`Invocation::Call`] with no keywords
    /// - null: empty [`Invocation::Flat`]
    /// - scalar: [`Invocation::Call`] with a single positional value
    #[must_use]
    pub fn classify(value: Value) -> Self {
        match value {
            Value::Object(mut map) => {
                let params_key = map
                    .keys()
                    .find(|key| canonical_key(key) == "params")
                    .cloned();
                let Some(params_key) = params_key else {
                    return Self::Flat(map);
                };
                match map.remove(&params_key) {
                    Some(Value::Object(params)) => Self::Nested {
                        params,
                        siblings: map,
                    },
                    Some(Value::Array(positional)) => Self::Call {
                        positional,
                        keyword: map,
                    },
                    Some(other) => {
                        // Not a wrapper after all; keep it as an ordinary field.
                        map.insert(params_key, other);
                        Self::Flat(map)
                    }
                    None => Self::Flat(map),
                }
            }
            Value::Array(positional) => Self::Call {
                positional,
                keyword: Args::new(),
            },
            Value::Null => Self::Flat(Args::new()),
            scalar => Self::Call {
                positional: vec![scalar],
                keyword: Args::new(),
            },
        }
    }

    #[must_use]
    pub fn shape_name(&self) -> &'static str {
        match self {
            Self::Flat(_) => "flat",
            Self::Nested { .. } => "nested",
            Self::Call { .. } => "call",
        }
    }
}

/// The de-aliased, flattened form of a tool invocation.
///
/// Keys are in canonical form; the repetition guard compares calls by
/// [`CanonicalCall::signature`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalCall {
    action: String,
    args: Args,
}

impl CanonicalCall {
    /// Wrap already-normalized parts. Callers are expected to have folded
    /// the action name and keys; use the normalizer for raw input.
    #[must_use]
    pub fn from_normalized(action: String, args: Args) -> Self {
        Self { action, args }
    }

    #[must_use]
    pub fn action(&self) -> &str {
        &self.action
    }

    #[must_use]
    pub fn args(&self) -> &Args {
        &self.args
    }

    #[must_use]
    pub fn into_parts(self) -> (String, Args) {
        (self.action, self.args)
    }

    /// `action:` followed by compact JSON of the arguments.
    #[must_use]
    pub fn signature(&self) -> String {
        format!("{}:{}", self.action, Value::Object(self.args.clone()))
    }
}
