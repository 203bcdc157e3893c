// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end subprocess tests: a real trapped fault in a child process must
//! terminate it and leave a crash report behind.  The crash-under-test
//! binary installs the handler and triggers the requested fault category.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::process::ExitStatus;

fn run_test_app(fault_code: i32, output_dir: &Path) -> ExitStatus {
    std::process::Command::new(env!("CARGO_BIN_EXE_crashtrap-test-app"))
        .arg(fault_code.to_string())
        .arg(output_dir)
        .arg(env!("CARGO_BIN_EXE_crashtrap-reporter"))
        .status()
        .expect("failed to spawn the crash-under-test binary")
}

fn crash_report_dirs(output_dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(output_dir)
        .expect("output directory missing")
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir() && path.file_name().map_or(false, |name| name != "logs"))
        .collect()
}

fn read_manifest(report_dir: &Path) -> serde_json::Value {
    let file = std::fs::File::open(report_dir.join("crashdesc.json"))
        .expect("crashdesc.json missing from the report directory");
    serde_json::from_reader(file).expect("crashdesc.json is not valid JSON")
}

#[test]
fn trapped_sigsegv_terminates_and_reports() {
    let dir = tempfile::tempdir().unwrap();
    let status = run_test_app(11, dir.path());
    assert!(
        !status.success(),
        "a trapped fault with no callback must be fatal"
    );

    let mut dirs = crash_report_dirs(dir.path());
    assert_eq!(dirs.len(), 1, "expected exactly one crash report directory");
    let manifest = read_manifest(&dirs.pop().unwrap());
    assert_eq!(manifest["record"]["fault_kind"], 11);
    assert_eq!(manifest["record"]["crashed"], true);
    assert_eq!(manifest["record"]["manual_report"], false);
    assert_eq!(manifest["record"]["properties"]["test.fault-code"], "11");
}

#[test]
fn stack_overflow_reports_from_a_fresh_stack() {
    let dir = tempfile::tempdir().unwrap();
    let status = run_test_app(15, dir.path());
    assert!(!status.success(), "stack overflow is always fatal");

    // The pipeline ran to completion on the helper thread: the exhausted
    // stack never recursed into a second fault, and the report shipped.
    let mut dirs = crash_report_dirs(dir.path());
    assert_eq!(dirs.len(), 1, "expected exactly one crash report directory");
    let manifest = read_manifest(&dirs.pop().unwrap());
    assert_eq!(manifest["record"]["fault_kind"], 15);
    assert_eq!(manifest["record"]["crashed"], true);
}

#[test]
fn unknown_fault_code_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let status = run_test_app(900, dir.path());
    assert!(status.success(), "unknown categories must not crash");
    assert!(
        crash_report_dirs(dir.path()).is_empty(),
        "no report directory for a report that never ran"
    );
}
