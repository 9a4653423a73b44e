//! Repetition guard for agent runs.
//!
//! [`LoopGuard::admit`] is a pure function of the incoming call and the run's
//! [`CallHistory`]; committing an admitted call is a separate
//! [`LoopGuard::record`] step. Rejections are advisory: they carry a reason an
//! upstream planner can act on.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use sandpatch_types::{ActionClass, CanonicalCall, truncate_with_ellipsis};
use serde::Serialize;
use tracing::{debug, warn};

pub const DEFAULT_HISTORY_CAPACITY: usize = 5;
pub const DEFAULT_THRESHOLD: usize = 2;
pub const READ_THRESHOLD: usize = 3;
pub const VERIFICATION_THRESHOLD: usize = 3;

pub const DEFAULT_READ_ACTIONS: &[&str] = &["read_file"];
pub const DEFAULT_VERIFICATION_ACTIONS: &[&str] = &[
    "ruby_syntax_check",
    "python_syntax_check",
    "eslint_check",
    "rubocop_check",
];
pub const DEFAULT_MUTATION_ACTIONS: &[&str] = &["apply_patch", "create_file", "revert_last_change"];
pub const DEFAULT_DENIED_ACTIONS: &[&str] = &["delete_file", "rm", "remove"];

const SIGNATURE_DISPLAY_CHARS: usize = 120;

/// Per-class repetition thresholds and the action → class table.
///
/// A threshold of `n` rejects the call that would make `n` identical
/// signatures: the incoming call plus its matches in the retained history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopPolicy {
    pub history_capacity: usize,
    pub default_threshold: usize,
    pub read_threshold: usize,
    pub verification_threshold: usize,
    classes: HashMap<String, ActionClass>,
}

impl Default for LoopPolicy {
    fn default() -> Self {
        let mut policy = Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            default_threshold: DEFAULT_THRESHOLD,
            read_threshold: READ_THRESHOLD,
            verification_threshold: VERIFICATION_THRESHOLD,
            classes: HashMap::new(),
        };
        policy.set_classes(ActionClass::Read, DEFAULT_READ_ACTIONS);
        policy.set_classes(ActionClass::Verification, DEFAULT_VERIFICATION_ACTIONS);
        policy.set_classes(ActionClass::Mutation, DEFAULT_MUTATION_ACTIONS);
        policy.set_classes(ActionClass::Denied, DEFAULT_DENIED_ACTIONS);
        policy
    }
}

impl LoopPolicy {
    /// Policy with thresholds and capacity but no classified actions.
    #[must_use]
    pub fn unclassified() -> Self {
        Self {
            classes: HashMap::new(),
            ..Self::default()
        }
    }

    /// Assign `class` to each action, replacing any earlier assignment.
    pub fn set_classes<S: AsRef<str>>(&mut self, class: ActionClass, actions: &[S]) {
        for action in actions {
            self.classes
                .insert(sandpatch_types::canonical_key(action.as_ref()), class);
        }
    }

    /// Assign `class` only if the action has no class yet.
    pub fn default_class(&mut self, action: &str, class: ActionClass) {
        self.classes
            .entry(sandpatch_types::canonical_key(action))
            .or_insert(class);
    }

    #[must_use]
    pub fn classify(&self, action: &str) -> ActionClass {
        self.classes
            .get(action)
            .copied()
            .unwrap_or(ActionClass::Default)
    }

    /// Identical-signature count at which a call of this class is rejected.
    /// `None` for denied actions, which are always rejected.
    #[must_use]
    pub fn threshold(&self, class: ActionClass) -> Option<usize> {
        match class {
            ActionClass::Denied => None,
            ActionClass::Read => Some(self.read_threshold),
            ActionClass::Verification => Some(self.verification_threshold),
            ActionClass::Mutation | ActionClass::Default => Some(self.default_threshold),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HistoryEntry {
    signature: String,
    class: ActionClass,
}

/// Bounded FIFO of admitted call signatures for one agent run.
#[derive(Debug, Clone)]
pub struct CallHistory {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl Default for CallHistory {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }
}

impl CallHistory {
    /// A capacity of zero is treated as one.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn count(&self, signature: &str) -> usize {
        self.entries
            .iter()
            .filter(|e| e.signature == signature)
            .count()
    }

    #[must_use]
    pub fn contains_mutation(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.class == ActionClass::Mutation)
    }

    fn push(&mut self, signature: String, class: ActionClass) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(HistoryEntry { signature, class });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The same call was repeated too many times.
    IdenticalRepeat,
    /// A verification was repeated with no mutation in between.
    NoProgressSinceCheck,
    /// The action is never allowed.
    DeniedAction,
}

impl RejectReason {
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::IdenticalRepeat => "identical_repeat",
            Self::NoProgressSinceCheck => "no_progress_since_check",
            Self::DeniedAction => "denied_action",
        }
    }
}

/// Why a call was not admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub action: String,
    pub signature: String,
    pub class: ActionClass,
    pub reason: RejectReason,
    /// Identical signatures counting the rejected call.
    pub occurrences: usize,
    pub threshold: Option<usize>,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason {
            RejectReason::DeniedAction => write!(
                f,
                "Action '{}' is not allowed. Choose a different action.",
                self.action
            ),
            RejectReason::NoProgressSinceCheck => write!(
                f,
                "Repeated '{}' without any edit in between ({} identical calls). \
                 If the check passed, the task is complete: stop. If it failed, fix the file first.",
                self.action, self.occurrences
            ),
            RejectReason::IdenticalRepeat => write!(
                f,
                "Repeated identical call detected ({} times): {}. Try a different approach.",
                self.occurrences,
                truncate_with_ellipsis(&self.signature, SIGNATURE_DISPLAY_CHARS)
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Admit,
    Reject(Rejection),
}

impl Verdict {
    #[must_use]
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admit)
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoopGuard {
    policy: LoopPolicy,
}

impl LoopGuard {
    #[must_use]
    pub fn new(policy: LoopPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub fn policy(&self) -> &LoopPolicy {
        &self.policy
    }

    /// A history sized for this guard's policy.
    #[must_use]
    pub fn new_history(&self) -> CallHistory {
        CallHistory::with_capacity(self.policy.history_capacity)
    }

    /// Decide whether `call` may run. Does not touch `history`.
    #[must_use]
    pub fn admit(&self, call: &CanonicalCall, history: &CallHistory) -> Verdict {
        let class = self.policy.classify(call.action());
        let signature = call.signature();
        let occurrences = history.count(&signature) + 1;
        let threshold = self.policy.threshold(class);

        let reason = match (class, threshold) {
            (_, None) => Some(RejectReason::DeniedAction),
            (ActionClass::Verification, Some(limit)) => (occurrences >= limit
                && !history.contains_mutation())
            .then_some(RejectReason::NoProgressSinceCheck),
            (_, Some(limit)) => (occurrences >= limit).then_some(RejectReason::IdenticalRepeat),
        };

        match reason {
            None => {
                debug!(action = call.action(), %class, occurrences, "Call admitted");
                Verdict::Admit
            }
            Some(reason) => {
                warn!(
                    action = call.action(),
                    %class,
                    reason = reason.code(),
                    occurrences,
                    "Call rejected by loop guard"
                );
                Verdict::Reject(Rejection {
                    action: call.action().to_string(),
                    signature,
                    class,
                    reason,
                    occurrences,
                    threshold,
                })
            }
        }
    }

    /// Commit an admitted call to the history.
    pub fn record(&self, call: &CanonicalCall, history: &mut CallHistory) {
        let class = self.policy.classify(call.action());
        history.push(call.signature(), class);
    }

    /// [`admit`](Self::admit), then [`record`](Self::record) on admission.
    pub fn admit_and_record(
        &self,
        call: &CanonicalCall,
        history: &mut CallHistory,
    ) -> Result<(), Rejection> {
        match self.admit(call, history) {
            Verdict::Admit => {
                self.record(call, history);
                Ok(())
            }
            Verdict::Reject(rejection) => Err(rejection),
        }
    }
}
