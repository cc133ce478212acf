use std::path::Path;

use cwp_classify::{classify_run, RunKind, RunLayout};
use cwp_core::EngineError;
use tempfile::tempdir;

fn write_run(dir: &Path, status: &str, log: Option<&str>, stdout: &str, stderr: &str) {
    std::fs::write(dir.join("status.txt"), status).unwrap();
    if let Some(log) = log {
        std::fs::write(dir.join("pytest_log"), log).unwrap();
    }
    std::fs::write(dir.join("pytest.stdout"), stdout).unwrap();
    std::fs::write(dir.join("pytest.stderr"), stderr).unwrap();
}

const OK: &str = "okay::2024-03-01T10:00:00.000001::retcode=1\n";

#[test]
fn normal_run() {
    let dir = tempdir().unwrap();
    write_run(
        dir.path(),
        OK,
        Some(". l/test_lab1.py::test_a\nF l/test_lab1.py::test_b\n assert 0\n"),
        "1 failed, 1 passed",
        "",
    );
    let c = classify_run(dir.path(), &RunLayout::default()).unwrap();
    assert_eq!(c.kind, RunKind::Completed);
    assert!(c.terminated());
    assert_eq!(c.tally().fraction(), "1/1/2");
    assert!(c.operator_notice.is_none());
    assert!(!c.memory_error);
}

#[test]
fn unterminated_keeps_partial_results_and_adds_failure() {
    let dir = tempdir().unwrap();
    write_run(
        dir.path(),
        "fail::2024-03-01T10:00:00.000001::unterminated::\n",
        Some(". l/test_lab1.py::test_a\n"),
        "",
        "",
    );
    let c = classify_run(dir.path(), &RunLayout::default()).unwrap();
    assert_eq!(c.kind, RunKind::Unterminated);
    assert!(!c.terminated());
    assert_eq!(c.records.len(), 2);
    assert!(c.records[0].passed);
    assert!(!c.records[1].passed);
    assert!(c.records[1].detail.as_deref().unwrap().contains("did not terminate"));
}

#[test]
fn empty_log_with_crash_signature_is_import_failure() {
    let dir = tempdir().unwrap();
    write_run(
        dir.path(),
        OK,
        Some(""),
        "collecting ... INTERNALERROR> Traceback",
        "AttributeError: 'str' object has no attribute 'reprcrash'",
    );
    let c = classify_run(dir.path(), &RunLayout::default()).unwrap();
    assert_eq!(c.kind, RunKind::ImportFailed);
    assert_eq!(c.records.len(), 1);
    assert_eq!(c.records[0].name, "import s.py");
}

#[test]
fn empty_log_without_signature_is_internal() {
    let dir = tempdir().unwrap();
    write_run(dir.path(), OK, None, "", "");
    let err = classify_run(dir.path(), &RunLayout::default()).unwrap_err();
    let engine = err.downcast_ref::<EngineError>().unwrap();
    assert!(matches!(engine, EngineError::EmptyResultLog(_)));
    assert!(engine.is_internal());
}

#[test]
fn unknown_marker_notifies_operator_and_fails_submission() {
    let dir = tempdir().unwrap();
    write_run(dir.path(), OK, Some(". l/test_lab1.py::test_a\ns l/test_lab1.py::test_b\n"), "", "");
    let c = classify_run(dir.path(), &RunLayout::default()).unwrap();
    assert_eq!(c.kind, RunKind::ParseError);
    assert_eq!(c.records.len(), 1);
    assert_eq!(c.records[0].name, "Error parsing pytest_log");
    let notice = c.operator_notice.unwrap();
    assert_eq!(notice.subject, "Error parsing pytest_log");
    assert!(notice.body.contains("s l/test_lab1.py::test_b"));
}

#[test]
fn non_ascii_crash_signature_notifies_operator() {
    let dir = tempdir().unwrap();
    let log = "! /usr/lib/python3/dist-packages/_pytest/resultlog.py\n Traceback (most recent call last):\n";
    let stdout = "INTERNALERROR> Traceback (most recent call last):\n\
INTERNALERROR>     longrepr = str(report.longrepr.reprcrash)\n\
INTERNALERROR> AttributeError: CollectErrorRepr instance has no attribute 'reprcrash'\n";
    write_run(dir.path(), OK, Some(log), stdout, "");
    let c = classify_run(dir.path(), &RunLayout::default()).unwrap();
    assert_eq!(c.kind, RunKind::ImportFailed);
    assert_eq!(c.operator_notice.unwrap().subject, "Error importing student submission");
}

#[test]
fn memory_error_is_flagged() {
    let dir = tempdir().unwrap();
    write_run(dir.path(), OK, Some("F l/test_lab1.py::test_big\n E   MemoryError\n"), "E   MemoryError\n", "");
    let c = classify_run(dir.path(), &RunLayout::default()).unwrap();
    assert!(c.memory_error);
}

#[test]
fn missing_ledger_is_malformed() {
    let dir = tempdir().unwrap();
    let err = classify_run(dir.path(), &RunLayout::default()).unwrap_err();
    assert!(matches!(err.downcast_ref::<EngineError>(), Some(EngineError::MalformedLedger { .. })));
}
