//! End-to-end tests for the dispatch pipeline.
//!
//! Decisions go in the way a planner emits them: normalized, admitted by the
//! loop guard, then executed against a temporary sandbox.

use std::fs;
use std::path::Path;

use sandpatch_tools::{
    AgentRun, Decision, LoopPolicy, RejectReason, SandboxConfig, ToolError, ToolLimits,
    ToolSettings,
};
use sandpatch_types::ActionClass;
use serde_json::{Value, json};
use tempfile::tempdir;

fn run_with(base: &Path, loop_policy: LoopPolicy) -> AgentRun {
    AgentRun::with_builtins(ToolSettings {
        sandbox: SandboxConfig::new(base),
        limits: ToolLimits::default(),
        loop_policy,
    })
    .unwrap()
}

fn write(run: &AgentRun, name: &str, content: &str) {
    fs::write(run.ctx().sandbox.root().join(name), content).unwrap();
}

fn read(run: &AgentRun, name: &str) -> String {
    fs::read_to_string(run.ctx().sandbox.root().join(name)).unwrap()
}

async fn read_file(run: &mut AgentRun, path: &str) -> Value {
    run.dispatch(&Decision::new("read_file", json!({"path": path})))
        .await
        .unwrap()
}

fn rejection(err: ToolError) -> RejectReason {
    match err {
        ToolError::LoopRejected(rejection) => rejection.reason,
        other => panic!("expected loop rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn read_then_patch_with_fingerprint() {
    let temp = tempdir().unwrap();
    let mut run = run_with(temp.path(), LoopPolicy::default());
    write(&run, "calc.rb", "def add(a, b)\n  a - b\nend\n");

    let before = read_file(&mut run, "calc.rb").await;
    let out = run
        .dispatch(&Decision::new(
            "apply_patch",
            json!({
                "params": {
                    "filePath": "playground/calc.rb",
                    "sha256": before["sha256"],
                    "edits": [{"start_line": 2, "end_line": 2, "replacement": "  a + b\n"}]
                }
            }),
        ))
        .await
        .unwrap();

    assert_eq!(out["status"], "patched");
    assert_eq!(out["path"], "playground/calc.rb");
    assert_eq!(read(&run, "calc.rb"), "def add(a, b)\n  a + b\nend\n");

    let after = read_file(&mut run, "calc.rb").await;
    assert_eq!(out["sha256"], after["sha256"]);
}

#[tokio::test]
async fn external_edit_between_read_and_patch_is_detected() {
    let temp = tempdir().unwrap();
    let mut run = run_with(temp.path(), LoopPolicy::default());
    write(&run, "a.rb", "one\ntwo\n");

    let seen = read_file(&mut run, "a.rb").await;
    write(&run, "a.rb", "one\ntwo\nthree\n");

    let err = run
        .dispatch(&Decision::new(
            "apply_patch",
            json!({
                "path": "a.rb",
                "sha256": seen["sha256"],
                "edits": [{"start_line": 1, "end_line": 1, "replacement": "ONE\n"}]
            }),
        ))
        .await
        .unwrap_err();

    let report = err.report();
    assert_eq!(report.error, "concurrent_modification");
    assert_eq!(report.details["expected"], seen["sha256"]);
    assert_ne!(report.details["actual"], seen["sha256"]);
    assert_eq!(read(&run, "a.rb"), "one\ntwo\nthree\n");
}

#[tokio::test]
async fn edits_in_any_order_address_original_lines() {
    let temp = tempdir().unwrap();
    let mut run = run_with(temp.path(), LoopPolicy::default());
    write(&run, "f.txt", "1\n2\n3\n4\n5\n");

    run.dispatch(&Decision::new(
        "apply_patch",
        json!({
            "path": "f.txt",
            "edits": [
                {"start_line": 1, "end_line": 1, "replacement": "one\nuno\n"},
                {"start_line": 4, "end_line": 5, "replacement": ""},
                {"start_line": 3, "end_line": 3, "replacement": "three\n"}
            ]
        }),
    ))
    .await
    .unwrap();

    assert_eq!(read(&run, "f.txt"), "one\nuno\n2\nthree\n");
}

#[tokio::test]
async fn listing_order_does_not_change_the_result() {
    let temp = tempdir().unwrap();
    let mut run = run_with(temp.path(), LoopPolicy::default());
    let ten_lines: String = (1..=10).map(|n| format!("{n}\n")).collect();
    write(&run, "ascending.txt", &ten_lines);
    write(&run, "descending.txt", &ten_lines);

    let first = json!({"start_line": 1, "end_line": 2, "replacement": "A\n"});
    let second = json!({"start_line": 5, "end_line": 6, "replacement": "B\n"});
    for (path, edits) in [
        ("ascending.txt", json!([first, second])),
        ("descending.txt", json!([second, first])),
    ] {
        run.dispatch(&Decision::new(
            "apply_patch",
            json!({"path": path, "edits": edits}),
        ))
        .await
        .unwrap();
    }

    let ascending = fs::read(run.ctx().sandbox.root().join("ascending.txt")).unwrap();
    let descending = fs::read(run.ctx().sandbox.root().join("descending.txt")).unwrap();
    assert_eq!(ascending, descending);
    assert_eq!(ascending, b"A\n3\n4\nB\n7\n8\n9\n10\n");
}

#[tokio::test]
async fn overlapping_edits_name_both_indices() {
    let temp = tempdir().unwrap();
    let mut run = run_with(temp.path(), LoopPolicy::default());
    write(&run, "f.txt", "1\n2\n3\n");

    let err = run
        .dispatch(&Decision::new(
            "apply_patch",
            json!({
                "path": "f.txt",
                "edits": [
                    {"start_line": 1, "end_line": 2, "replacement": "x\n"},
                    {"start_line": 2, "end_line": 3, "replacement": "y\n"}
                ]
            }),
        ))
        .await
        .unwrap_err();

    let report = err.report();
    assert_eq!(report.error, "invalid_edit_set");
    assert_eq!(report.details["index"], 1);
    assert!(report.message.contains("edits[0]"), "{}", report.message);
    assert_eq!(read(&run, "f.txt"), "1\n2\n3\n");
}

#[tokio::test]
async fn out_of_range_edit_leaves_file_unchanged() {
    let temp = tempdir().unwrap();
    let mut run = run_with(temp.path(), LoopPolicy::default());
    write(&run, "f.txt", "1\n2\n");

    let err = run
        .dispatch(&Decision::new(
            "apply_patch",
            json!({
                "path": "f.txt",
                "edits": [
                    {"start_line": 1, "end_line": 1, "replacement": "x\n"},
                    {"start_line": 2, "end_line": 9, "replacement": "y\n"}
                ]
            }),
        ))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "line_range_out_of_bounds");
    assert_eq!(err.report().details["line_count"], 2);
    assert_eq!(read(&run, "f.txt"), "1\n2\n");
}

#[tokio::test]
async fn identical_patch_is_rejected_on_second_attempt() {
    let temp = tempdir().unwrap();
    let mut run = run_with(temp.path(), LoopPolicy::default());
    write(&run, "f.txt", "a\n");

    let patch = Decision::new(
        "apply_patch",
        json!({
            "path": "f.txt",
            "edits": [{"start_line": 1, "end_line": 1, "replacement": "b\n"}]
        }),
    );
    run.dispatch(&patch).await.unwrap();

    // Same call, different shape.
    let reshaped = Decision::new(
        "ApplyPatch",
        json!(["apply_patch", {
            "file": "f.txt",
            "edits": [{"start_line": 1, "end_line": 1, "replacement": "b\n"}]
        }]),
    );
    let err = run.dispatch(&reshaped).await.unwrap_err();
    assert_eq!(rejection(err), RejectReason::IdenticalRepeat);
}

#[tokio::test]
async fn reads_are_allowed_twice_and_rejected_on_the_third() {
    let temp = tempdir().unwrap();
    let mut run = run_with(temp.path(), LoopPolicy::default());
    write(&run, "f.txt", "a\n");

    read_file(&mut run, "f.txt").await;
    read_file(&mut run, "f.txt").await;
    let err = run
        .dispatch(&Decision::new("read_file", json!({"path": "f.txt"})))
        .await
        .unwrap_err();
    assert_eq!(rejection(err), RejectReason::IdenticalRepeat);
}

#[tokio::test]
async fn verification_after_a_fresh_edit_is_admitted() {
    let temp = tempdir().unwrap();
    let mut policy = LoopPolicy::default();
    policy.set_classes(ActionClass::Verification, &["list_files"]);
    let mut run = run_with(temp.path(), policy);
    write(&run, "f.txt", "a\n");

    let check = Decision::new("list_files", json!({}));
    run.dispatch(&check).await.unwrap();
    run.dispatch(&check).await.unwrap();
    let err = run.dispatch(&check).await.unwrap_err();
    assert_eq!(rejection(err), RejectReason::NoProgressSinceCheck);

    run.dispatch(&Decision::new(
        "apply_patch",
        json!({
            "path": "f.txt",
            "edits": [{"start_line": 1, "end_line": 1, "replacement": "b\n"}]
        }),
    ))
    .await
    .unwrap();
    run.dispatch(&check).await.unwrap();
}

#[tokio::test]
async fn created_file_can_be_read_and_patched() {
    let temp = tempdir().unwrap();
    let mut run = run_with(temp.path(), LoopPolicy::default());

    let created = run
        .dispatch(&Decision::new(
            "create_file",
            json!({"path": "lib/greet.rb", "content": "puts 'hi'\n"}),
        ))
        .await
        .unwrap();
    assert_eq!(created["path"], "playground/lib/greet.rb");

    let out = run
        .dispatch(&Decision::new(
            "apply_patch",
            json!({
                "path": created["path"],
                "sha256": created["sha256"],
                "edits": [{"start_line": 1, "end_line": 1, "replacement": "puts 'hello'"}]
            }),
        ))
        .await
        .unwrap();
    assert_eq!(out["additions"], 1);
    assert_eq!(read(&run, "lib/greet.rb"), "puts 'hello'\n");

    let found = run
        .dispatch(&Decision::new("search", json!({"query": "HELLO"})))
        .await
        .unwrap();
    assert_eq!(found["results"][0]["file"], "playground/lib/greet.rb");
}
