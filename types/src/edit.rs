//! Line-range edits and structural validation of caller-supplied edit sets.
//!
//! An [`Edit`] replaces the inclusive, 1-indexed line range
//! `[start_line, end_line]` with `replacement`. An [`EditSet`] is the
//! validated, non-empty, non-overlapping collection for one patch request.
//! Nothing here knows about files: range-versus-line-count checks happen
//! where the file content is available.

use std::fmt;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::text::canonical_key;

/// Shape a caller should send for a single edit; quoted in every validation error.
pub const EDIT_EXAMPLE: &str =
    r#"{"start_line": 3, "end_line": 4, "replacement": "first new line\nsecond new line\n"}"#;

/// A single validated line-range replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Edit {
    start_line: u32,
    end_line: u32,
    replacement: String,
}

impl Edit {
    pub fn new(
        start_line: u32,
        end_line: u32,
        replacement: impl Into<String>,
    ) -> Result<Self, EditProblem> {
        if start_line < 1 {
            return Err(EditProblem::StartBelowOne {
                start_line: i64::from(start_line),
            });
        }
        if end_line < start_line {
            return Err(EditProblem::EndBeforeStart {
                start_line: i64::from(start_line),
                end_line: i64::from(end_line),
            });
        }
        Ok(Self {
            start_line,
            end_line,
            replacement: replacement.into(),
        })
    }

    #[must_use]
    pub fn start_line(&self) -> u32 {
        self.start_line
    }

    #[must_use]
    pub fn end_line(&self) -> u32 {
        self.end_line
    }

    #[must_use]
    pub fn replacement(&self) -> &str {
        &self.replacement
    }

    fn overlaps(&self, other: &Edit) -> bool {
        self.start_line <= other.end_line && other.start_line <= self.end_line
    }
}

/// Limits applied while parsing an edit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditLimits {
    pub max_edits: usize,
    pub max_replacement_bytes: usize,
}

impl Default for EditLimits {
    fn default() -> Self {
        Self {
            max_edits: 200,
            max_replacement_bytes: 1024 * 1024,
        }
    }
}

/// What is wrong with an edit set (or with one edit in it).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EditProblem {
    #[error("edits must contain at least one edit")]
    Empty,
    #[error("edits must be an array of edit objects, got {found}")]
    NotASequence { found: &'static str },
    #[error("edit must be an object, got {found}")]
    NotAnObject { found: &'static str },
    #[error("missing field `{field}`")]
    MissingField { field: &'static str },
    #[error("field `{field}` must be {expected}, got {found}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
        found: &'static str,
    },
    #[error("start_line must be >= 1 (got {start_line})")]
    StartBelowOne { start_line: i64 },
    #[error("end_line ({end_line}) must be >= start_line ({start_line})")]
    EndBeforeStart { start_line: i64, end_line: i64 },
    #[error("lines {start_line}-{end_line} overlap edits[{other}]")]
    Overlap {
        other: usize,
        start_line: u32,
        end_line: u32,
    },
    #[error("{count} edits exceed the limit of {limit}")]
    TooManyEdits { count: usize, limit: usize },
    #[error("replacement text totals {bytes} bytes, over the limit of {limit}")]
    ReplacementTooLarge { bytes: usize, limit: usize },
}

/// A rejected edit set: the problem plus the offending edit's position, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditSetError {
    pub index: Option<usize>,
    pub problem: EditProblem,
}

impl EditSetError {
    fn whole(problem: EditProblem) -> Self {
        Self {
            index: None,
            problem,
        }
    }

    fn at(index: usize, problem: EditProblem) -> Self {
        Self {
            index: Some(index),
            problem,
        }
    }

    /// Corrective example to show the caller.
    #[must_use]
    pub fn example(&self) -> &'static str {
        EDIT_EXAMPLE
    }
}

impl fmt::Display for EditSetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "edits[{index}]: {}", self.problem)?,
            None => write!(f, "{}", self.problem)?,
        }
        write!(f, ". Each edit looks like {EDIT_EXAMPLE}")
    }
}

impl std::error::Error for EditSetError {}

/// A validated, non-empty set of non-overlapping edits.
///
/// Edits keep their input position (for error reporting) and are stored in
/// descending `start_line` order, the order they must be applied in so every
/// range stays valid against the original line numbering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditSet {
    edits: Vec<(usize, Edit)>,
}

impl EditSet {
    /// Build from already-typed edits. Checks emptiness and overlap.
    pub fn new(edits: Vec<Edit>) -> Result<Self, EditSetError> {
        if edits.is_empty() {
            return Err(EditSetError::whole(EditProblem::Empty));
        }
        Self::from_indexed(edits.into_iter().enumerate().collect())
    }

    /// Parse and validate an untrusted JSON value.
    ///
    /// Every edit is checked structurally before any cross-edit rule, and the
    /// first problem found is returned.
    pub fn parse(value: &Value, limits: EditLimits) -> Result<Self, EditSetError> {
        let items = match value {
            Value::Array(items) => items,
            other => {
                return Err(EditSetError::whole(EditProblem::NotASequence {
                    found: json_type_name(other),
                }));
            }
        };
        if items.is_empty() {
            return Err(EditSetError::whole(EditProblem::Empty));
        }
        if items.len() > limits.max_edits {
            return Err(EditSetError::whole(EditProblem::TooManyEdits {
                count: items.len(),
                limit: limits.max_edits,
            }));
        }

        let mut edits = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let edit = parse_edit(item).map_err(|problem| EditSetError::at(index, problem))?;
            edits.push((index, edit));
        }

        let total_bytes: usize = edits.iter().map(|(_, e)| e.replacement.len()).sum();
        if total_bytes > limits.max_replacement_bytes {
            return Err(EditSetError::whole(EditProblem::ReplacementTooLarge {
                bytes: total_bytes,
                limit: limits.max_replacement_bytes,
            }));
        }

        Self::from_indexed(edits)
    }

    fn from_indexed(mut edits: Vec<(usize, Edit)>) -> Result<Self, EditSetError> {
        edits.sort_by_key(|(index, edit)| (edit.start_line, edit.end_line, *index));
        for pair in edits.windows(2) {
            let (earlier_index, earlier) = &pair[0];
            let (later_index, later) = &pair[1];
            if earlier.overlaps(later) {
                // Blame whichever of the two came later in the input.
                let ((index, edit), other) = if later_index > earlier_index {
                    ((*later_index, later), *earlier_index)
                } else {
                    ((*earlier_index, earlier), *later_index)
                };
                return Err(EditSetError::at(
                    index,
                    EditProblem::Overlap {
                        other,
                        start_line: edit.start_line,
                        end_line: edit.end_line,
                    },
                ));
            }
        }
        edits.reverse();
        Ok(Self { edits })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.edits.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    /// Edits in application order (highest `start_line` first), with input positions.
    pub fn iter_descending(&self) -> impl Iterator<Item = (usize, &Edit)> {
        self.edits.iter().map(|(index, edit)| (*index, edit))
    }
}

fn parse_edit(item: &Value) -> Result<Edit, EditProblem> {
    let Value::Object(map) = item else {
        return Err(EditProblem::NotAnObject {
            found: json_type_name(item),
        });
    };

    let mut start = None;
    let mut end = None;
    let mut replacement = None;
    for (key, value) in map {
        match canonical_key(key).as_str() {
            "start_line" => start = Some(value),
            "end_line" => end = Some(value),
            "replacement" => replacement = Some(value),
            _ => {}
        }
    }

    let start_line = line_number("start_line", start)?;
    let end_line = line_number("end_line", end)?;
    let replacement = match replacement {
        None => return Err(EditProblem::MissingField { field: "replacement" }),
        Some(Value::String(text)) => text.clone(),
        Some(other) => {
            return Err(EditProblem::WrongType {
                field: "replacement",
                expected: "a string",
                found: json_type_name(other),
            });
        }
    };

    if start_line < 1 {
        return Err(EditProblem::StartBelowOne { start_line });
    }
    if end_line < start_line {
        return Err(EditProblem::EndBeforeStart {
            start_line,
            end_line,
        });
    }

    let start_line = to_u32("start_line", start_line)?;
    let end_line = to_u32("end_line", end_line)?;
    Edit::new(start_line, end_line, replacement)
}

fn line_number(field: &'static str, value: Option<&Value>) -> Result<i64, EditProblem> {
    let Some(value) = value else {
        return Err(EditProblem::MissingField { field });
    };
    value.as_i64().ok_or(EditProblem::WrongType {
        field,
        expected: "an integer",
        found: json_type_name(value),
    })
}

fn to_u32(field: &'static str, value: i64) -> Result<u32, EditProblem> {
    u32::try_from(value).map_err(|_| EditProblem::WrongType {
        field,
        expected: "an integer no larger than 4294967295",
        found: "a larger integer",
    })
}

/// Human name of a JSON value's type, for error messages.
#[must_use]
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(n) if n.is_f64() => "a float",
        Value::Number(_) => "an integer",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Edit, EditLimits, EditProblem, EditSet, EditSetError};

    fn parse(value: &serde_json::Value) -> Result<EditSet, EditSetError> {
        EditSet::parse(value, EditLimits::default())
    }

    #[test]
    fn parses_well_formed_edits() {
        let set = parse(&json!([
            {"start_line": 1, "end_line": 2, "replacement": "A\n"},
            {"start_line": 5, "end_line": 6, "replacement": "B\n"}
        ]))
        .unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn applies_in_descending_start_order_regardless_of_input_order() {
        let set = parse(&json!([
            {"start_line": 1, "end_line": 2, "replacement": "A\n"},
            {"start_line": 9, "end_line": 9, "replacement": ""},
            {"start_line": 5, "end_line": 6, "replacement": "B\n"}
        ]))
        .unwrap();
        let order: Vec<(usize, u32)> = set
            .iter_descending()
            .map(|(index, edit)| (index, edit.start_line()))
            .collect();
        assert_eq!(order, vec![(1, 9), (2, 5), (0, 1)]);
    }

    #[test]
    fn accepts_camel_case_field_names() {
        let set = parse(&json!([{"startLine": 2, "EndLine": 3, "Replacement": "x\n"}])).unwrap();
        let (_, edit) = set.iter_descending().next().unwrap();
        assert_eq!((edit.start_line(), edit.end_line()), (2, 3));
    }

    #[test]
    fn rejects_empty_array() {
        let err = parse(&json!([])).unwrap_err();
        assert_eq!(err.problem, EditProblem::Empty);
        assert_eq!(err.index, None);
    }

    #[test]
    fn rejects_non_array() {
        let err = parse(&json!({"start_line": 1, "end_line": 1, "replacement": ""})).unwrap_err();
        assert_eq!(
            err.problem,
            EditProblem::NotASequence {
                found: "an object"
            }
        );
    }

    #[test]
    fn rejects_missing_field_with_index() {
        let err = parse(&json!([
            {"start_line": 1, "end_line": 1, "replacement": ""},
            {"start_line": 3, "replacement": ""}
        ]))
        .unwrap_err();
        assert_eq!(err.index, Some(1));
        assert_eq!(err.problem, EditProblem::MissingField { field: "end_line" });
    }

    #[test]
    fn rejects_string_line_numbers() {
        let err = parse(&json!([{"start_line": "3", "end_line": 4, "replacement": ""}])).unwrap_err();
        assert!(matches!(
            err.problem,
            EditProblem::WrongType {
                field: "start_line",
                ..
            }
        ));
    }

    #[test]
    fn rejects_non_string_replacement() {
        let err = parse(&json!([{"start_line": 1, "end_line": 1, "replacement": 7}])).unwrap_err();
        assert!(matches!(
            err.problem,
            EditProblem::WrongType {
                field: "replacement",
                ..
            }
        ));
    }

    #[test]
    fn rejects_zero_and_negative_start() {
        let err = parse(&json!([{"start_line": 0, "end_line": 1, "replacement": ""}])).unwrap_err();
        assert_eq!(err.problem, EditProblem::StartBelowOne { start_line: 0 });

        let err = parse(&json!([{"start_line": -2, "end_line": 1, "replacement": ""}])).unwrap_err();
        assert_eq!(err.problem, EditProblem::StartBelowOne { start_line: -2 });
    }

    #[test]
    fn rejects_end_before_start() {
        let err = parse(&json!([{"start_line": 4, "end_line": 3, "replacement": ""}])).unwrap_err();
        assert_eq!(
            err.problem,
            EditProblem::EndBeforeStart {
                start_line: 4,
                end_line: 3
            }
        );
    }

    #[test]
    fn rejects_overlapping_ranges_naming_both_edits() {
        let err = parse(&json!([
            {"start_line": 5, "end_line": 8, "replacement": ""},
            {"start_line": 1, "end_line": 5, "replacement": ""}
        ]))
        .unwrap_err();
        assert_eq!(err.index, Some(1));
        assert!(matches!(err.problem, EditProblem::Overlap { other: 0, .. }));
    }

    #[test]
    fn adjacent_ranges_do_not_overlap() {
        assert!(
            parse(&json!([
                {"start_line": 1, "end_line": 2, "replacement": ""},
                {"start_line": 3, "end_line": 4, "replacement": ""}
            ]))
            .is_ok()
        );
    }

    #[test]
    fn enforces_edit_count_limit() {
        let limits = EditLimits {
            max_edits: 1,
            ..EditLimits::default()
        };
        let err = EditSet::parse(
            &json!([
                {"start_line": 1, "end_line": 1, "replacement": ""},
                {"start_line": 2, "end_line": 2, "replacement": ""}
            ]),
            limits,
        )
        .unwrap_err();
        assert_eq!(
            err.problem,
            EditProblem::TooManyEdits { count: 2, limit: 1 }
        );
    }

    #[test]
    fn error_display_includes_index_and_example() {
        let err = parse(&json!([{"end_line": 1, "replacement": ""}])).unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("edits[0]: missing field `start_line`"));
        assert!(message.contains(r#""start_line": 3"#));
    }

    #[test]
    fn typed_constructor_validates_range() {
        assert!(Edit::new(0, 1, "").is_err());
        assert!(Edit::new(3, 2, "").is_err());
        assert!(EditSet::new(vec![]).is_err());
        assert!(EditSet::new(vec![Edit::new(1, 1, "x\n").unwrap()]).is_ok());
    }
}
