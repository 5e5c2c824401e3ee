mod common;

use anyhow::Result;
use common::{DEFINITION, Workspace};
use predicates::prelude::*;
use testflow::{
    history::{RunStatus, RunStore},
    runner::RunMode,
    status_export::{RunDetailExport, RunListExport},
};

#[test]
fn status_json_lists_recorded_runs() -> Result<()> {
    let ws = Workspace::new(DEFINITION);
    ws.testflow()
        .arg("run")
        .arg("--work-dir")
        .arg(&ws.work_dir)
        .assert()
        .failure();
    ws.testflow()
        .arg("run")
        .arg("--work-dir")
        .arg(ws.path("dome"))
        .assert()
        .success();

    let assert = ws
        .testflow()
        .arg("status")
        .arg("--json")
        .arg("--limit")
        .arg("5")
        .assert()
        .success();
    let export: RunListExport = serde_json::from_slice(&assert.get_output().stdout)?;
    assert_eq!(export.runs.len(), 2);
    let suite_run = export
        .runs
        .iter()
        .find(|run| run.mode == "suite")
        .expect("suite run recorded");
    assert_eq!(suite_run.target, "nightly");
    assert_eq!(suite_run.status, "failed");
    assert_eq!(suite_run.failures, 1);
    let case_run = export
        .runs
        .iter()
        .find(|run| run.mode == "test_case")
        .expect("test case run recorded");
    assert_eq!(case_run.status, "passed");

    let assert = ws
        .testflow()
        .arg("status")
        .arg("--json")
        .arg("--run-id")
        .arg(&suite_run.run_id)
        .assert()
        .success();
    let detail: RunDetailExport = serde_json::from_slice(&assert.get_output().stdout)?;
    let names: Vec<&str> = detail.cases.iter().map(|case| case.name.as_str()).collect();
    assert_eq!(names, ["channel", "broken", "dome"]);
    assert!(detail.cases[1].error.is_some());
    Ok(())
}

#[test]
fn status_text_reads_seeded_history() -> Result<()> {
    let home = tempfile::tempdir()?;
    let store = RunStore::open(Some(home.path().join(".testflow")))?;
    store.begin("run-seeded", RunMode::Step, "channel/mesh", "/scratch")?;
    store.finish("run-seeded", RunStatus::Passed, &[])?;

    common::testflow()
        .env("TESTFLOW_HOME", home.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Recent runs:"))
        .stdout(predicate::str::contains("run-seeded [passed] step=channel/mesh"));
    Ok(())
}

#[test]
fn no_history_leaves_the_store_empty() {
    let ws = Workspace::new(DEFINITION);
    ws.testflow()
        .arg("run")
        .arg("--work-dir")
        .arg(ws.path("dome"))
        .arg("--no-history")
        .assert()
        .success();

    ws.testflow()
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("No runs recorded yet."));
}
