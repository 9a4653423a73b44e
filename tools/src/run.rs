//! Per-run dispatch: normalize, admit, record, execute.

use sandpatch_types::{CanonicalCall, Invocation};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::loop_guard::{CallHistory, LoopGuard, LoopPolicy};
use crate::normalize::CallNormalizer;
use crate::sandbox::PathSandbox;
use crate::{ToolCtx, ToolError, ToolRegistry, ToolSettings, register_builtins};

/// A planner's choice of what to do next.
#[derive(Debug, Clone, Deserialize)]
pub struct Decision {
    pub action: String,
    #[serde(default, alias = "args")]
    pub params: Value,
    #[serde(default)]
    pub confidence: Option<f64>,
}

impl Decision {
    pub fn new(action: impl Into<String>, params: Value) -> Self {
        Self {
            action: action.into(),
            params,
            confidence: None,
        }
    }

    /// Parse a decision from planner output.
    pub fn from_json(raw: &str) -> Result<Self, ToolError> {
        serde_json::from_str(raw).map_err(|e| ToolError::BadArgs {
            message: format!("invalid decision: {e}"),
        })
    }

    #[must_use]
    pub fn invocation(&self) -> Invocation {
        Invocation::classify(self.params.clone())
    }
}

/// One agent run: a tool registry, a sandboxed context, and the run's own call history.
#[derive(Debug)]
pub struct AgentRun {
    registry: ToolRegistry,
    guard: LoopGuard,
    history: CallHistory,
    ctx: ToolCtx,
    normalizer: CallNormalizer,
}

impl AgentRun {
    /// Tools' declared classes fill in any action the policy does not name.
    #[must_use]
    pub fn new(registry: ToolRegistry, mut policy: LoopPolicy, ctx: ToolCtx) -> Self {
        for (name, class) in registry.action_classes() {
            policy.default_class(name, class);
        }
        let guard = LoopGuard::new(policy);
        let history = guard.new_history();
        Self {
            registry,
            guard,
            history,
            ctx,
            normalizer: CallNormalizer,
        }
    }

    /// A run over the built-in file tools.
    pub fn with_builtins(settings: ToolSettings) -> Result<Self, ToolError> {
        let sandbox = PathSandbox::new(settings.sandbox)?;
        let mut registry = ToolRegistry::default();
        register_builtins(&mut registry)?;
        Ok(Self::new(
            registry,
            settings.loop_policy,
            ToolCtx::new(sandbox, settings.limits),
        ))
    }

    #[must_use]
    pub fn history(&self) -> &CallHistory {
        &self.history
    }

    #[must_use]
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    #[must_use]
    pub fn guard(&self) -> &LoopGuard {
        &self.guard
    }

    #[must_use]
    pub fn ctx(&self) -> &ToolCtx {
        &self.ctx
    }

    /// Normalize a decision without admitting or running it.
    #[must_use]
    pub fn canonicalize(&self, decision: &Decision) -> CanonicalCall {
        self.normalizer
            .normalize_invocation(&decision.action, decision.invocation())
    }

    /// Run one decision through the pipeline.
    ///
    /// An admitted call is recorded before it executes, so a call that fails
    /// still counts toward repetition.
    pub async fn dispatch(&mut self, decision: &Decision) -> Result<Value, ToolError> {
        let call = self.canonicalize(decision);
        self.guard
            .admit_and_record(&call, &mut self.history)
            .map_err(ToolError::LoopRejected)?;

        let tool = self.registry.lookup(call.action())?;
        info!(
            action = call.action(),
            confidence = decision.confidence,
            "Dispatching tool call"
        );
        let (action, args) = call.into_parts();
        let result = tool.execute(Value::Object(args), &self.ctx).await;
        match &result {
            Ok(_) => debug!(action = %action, "Tool call succeeded"),
            Err(err) => debug!(action = %action, error = err.kind(), "Tool call failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use sandpatch_types::ActionClass;
    use serde_json::json;
    use tempfile::tempdir;

    use super::{AgentRun, Decision};
    use crate::loop_guard::RejectReason;
    use crate::sandbox::SandboxConfig;
    use crate::{LoopPolicy, ToolError, ToolLimits, ToolSettings};

    fn run_in(base: &std::path::Path) -> AgentRun {
        AgentRun::with_builtins(ToolSettings {
            sandbox: SandboxConfig::new(base),
            limits: ToolLimits::default(),
            loop_policy: LoopPolicy::default(),
        })
        .unwrap()
    }

    #[test]
    fn decision_accepts_args_alias_and_confidence() {
        let d = Decision::from_json(r#"{"action":"read_file","args":{"path":"a"},"confidence":0.9}"#)
            .unwrap();
        assert_eq!(d.action, "read_file");
        assert_eq!(d.params, json!({"path": "a"}));
        assert_eq!(d.confidence, Some(0.9));
    }

    #[test]
    fn decision_without_params_is_empty() {
        let d = Decision::from_json(r#"{"action":"list_files"}"#).unwrap();
        assert!(d.params.is_null());
    }

    #[test]
    fn malformed_decision_is_bad_args() {
        let err = Decision::from_json(r#"{"params":{}}"#).unwrap_err();
        assert!(matches!(err, ToolError::BadArgs { .. }));
    }

    #[tokio::test]
    async fn dispatch_runs_tool_and_records_history() {
        let temp = tempdir().unwrap();
        let mut run = run_in(temp.path());
        fs::write(run.ctx().sandbox.root().join("a.rb"), "x\n").unwrap();

        let out = run
            .dispatch(&Decision::new("ReadFile", json!({"filePath": "a.rb"})))
            .await
            .unwrap();
        assert_eq!(out["content"], "x\n");
        assert_eq!(run.history().len(), 1);
    }

    #[tokio::test]
    async fn rejected_call_does_not_touch_history() {
        let temp = tempdir().unwrap();
        let mut run = run_in(temp.path());

        let list = Decision::new("list_files", json!({}));
        run.dispatch(&list).await.unwrap();
        let err = run.dispatch(&list).await.unwrap_err();
        let ToolError::LoopRejected(rejection) = err else {
            panic!("expected loop rejection, got {err:?}");
        };
        assert_eq!(rejection.reason, RejectReason::IdenticalRepeat);
        assert_eq!(rejection.occurrences, 2);
        assert_eq!(run.history().len(), 1);
    }

    #[tokio::test]
    async fn listing_keeps_default_threshold_with_custom_read_actions() {
        let temp = tempdir().unwrap();
        let mut policy = LoopPolicy::unclassified();
        policy.set_classes(ActionClass::Read, &["read_file"]);
        let mut run = AgentRun::with_builtins(ToolSettings {
            sandbox: SandboxConfig::new(temp.path()),
            limits: ToolLimits::default(),
            loop_policy: policy,
        })
        .unwrap();
        assert_eq!(run.guard().policy().classify("list_files"), ActionClass::Default);
        assert_eq!(run.guard().policy().classify("search"), ActionClass::Default);

        let list = Decision::new("list_files", json!({}));
        run.dispatch(&list).await.unwrap();
        let err = run.dispatch(&list).await.unwrap_err();
        assert!(matches!(
            err,
            ToolError::LoopRejected(ref r) if r.reason == RejectReason::IdenticalRepeat
        ));
    }

    #[tokio::test]
    async fn unknown_action_is_admitted_then_unknown() {
        let temp = tempdir().unwrap();
        let mut run = run_in(temp.path());
        let err = run
            .dispatch(&Decision::new("teleport", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool { name } if name == "teleport"));
    }

    #[tokio::test]
    async fn denied_action_never_reaches_registry() {
        let temp = tempdir().unwrap();
        let mut run = run_in(temp.path());
        let err = run
            .dispatch(&Decision::new("delete_file", json!({"path": "a.rb"})))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ToolError::LoopRejected(ref r) if r.reason == RejectReason::DeniedAction
        ));
        assert!(run.history().is_empty());
    }

    #[test]
    fn builtin_classes_fill_unnamed_actions() {
        let temp = tempdir().unwrap();
        let run = AgentRun::with_builtins(ToolSettings {
            sandbox: SandboxConfig::new(temp.path()),
            limits: ToolLimits::default(),
            loop_policy: LoopPolicy::unclassified(),
        })
        .unwrap();
        let policy = run.guard().policy();
        assert_eq!(policy.classify("read_file"), ActionClass::Read);
        assert_eq!(policy.classify("apply_patch"), ActionClass::Mutation);
        assert_eq!(policy.classify("create_file"), ActionClass::Mutation);
        assert_eq!(policy.classify("search"), ActionClass::Default);
    }
}
