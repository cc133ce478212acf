use std::path::Path;

use anyhow::{Context, Result};
use cwp_core::{read_final, EngineError, LedgerTag};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::guidance;
use crate::heuristics::{empty_log_import_crash, looks_like_import_crash, reports_memory_error};
use crate::result_log::{parse_result_log, TestRecord};
use crate::score::Tally;

/// File names inside a finished run directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLayout {
    pub status: String,
    pub log: String,
    pub stdout: String,
    pub stderr: String,
}

impl Default for RunLayout {
    fn default() -> Self {
        Self {
            status: "status.txt".into(),
            log: "pytest_log".into(),
            stdout: "pytest.stdout".into(),
            stderr: "pytest.stderr".into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunKind {
    Completed,
    Unterminated,
    /// The submission could not be imported; recognised from a runner crash signature.
    ImportFailed,
    /// The result log contained a line we do not understand.
    ParseError,
}

/// Something the operator must see, with the raw context attached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorNotice {
    pub subject: String,
    pub body: String,
}

#[derive(Clone, Debug)]
pub struct Classification {
    pub records: Vec<TestRecord>,
    pub kind: RunKind,
    pub final_status: LedgerTag,
    pub memory_error: bool,
    pub operator_notice: Option<OperatorNotice>,
    pub stdout: String,
}

impl Classification {
    pub fn terminated(&self) -> bool {
        self.kind != RunKind::Unterminated
    }

    pub fn tally(&self) -> Tally {
        Tally::of(&self.records)
    }
}

fn read_lossy(path: &Path) -> Result<String> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
    }
}

/// Turn a finished run directory into test records.
///
/// Errors are internal faults the operator has to look at: an unreadable status ledger, or an
/// empty result log that matches no known runner crash.
pub fn classify_run(dir: &Path, layout: &RunLayout) -> Result<Classification> {
    let final_entry = read_final(&dir.join(&layout.status))?;
    let log_path = dir.join(&layout.log);
    let log = read_lossy(&log_path)?;
    let stdout = read_lossy(&dir.join(&layout.stdout))?;
    let stderr = read_lossy(&dir.join(&layout.stderr))?;
    let memory_error = reports_memory_error(&stdout, &stderr);
    debug!(dir = %dir.display(), status = %final_entry, log_lines = log.lines().count(), "classifying run");

    let done = |records, kind, operator_notice| Classification {
        records,
        kind,
        final_status: final_entry.tag,
        memory_error,
        operator_notice,
        stdout: stdout.clone(),
    };

    if final_entry.is_unterminated() {
        warn!(dir = %dir.display(), "run did not terminate, reporting partial results");
        let mut records = parse_result_log(&log, &stdout).unwrap_or_default();
        let report = format!(
            "{}\n\nDebug information:\n  status = {}\n  reason = {}\n  Content of the result log:\n--\n{}\n--\n",
            guidance::UNTERMINATED,
            final_entry.tag.as_str(),
            final_entry.reason(),
            log
        );
        records.push(TestRecord::fail("unterminated problem in s.py", report));
        return Ok(done(records, RunKind::Unterminated, None));
    }

    if log.is_empty() {
        if empty_log_import_crash(&stdout, &stderr) {
            info!(dir = %dir.display(), "empty result log with runner crash signature, import failed");
            let records = vec![TestRecord::fail("import s.py", guidance::IMPORT_FAILED.trim_start())];
            return Ok(done(records, RunKind::ImportFailed, None));
        }
        return Err(EngineError::EmptyResultLog(log_path).into());
    }

    if looks_like_import_crash(&log, &stdout) {
        info!(dir = %dir.display(), "runner crash signature in result log, import failed");
        let notice = OperatorNotice {
            subject: "Error importing student submission".into(),
            body: format!(
                "Suspected runner crash while importing a submission (non-ASCII source?).\n\n\
                 This arose in directory {}. The following report has been mailed to the student.\n\n{}",
                dir.display(),
                guidance::IMPORT_FAILED
            ),
        };
        let records = vec![TestRecord::fail("import s.py", guidance::IMPORT_FAILED.trim_start())];
        return Ok(done(records, RunKind::ImportFailed, Some(notice)));
    }

    match parse_result_log(&log, &stdout) {
        Ok(records) => Ok(done(records, RunKind::Completed, None)),
        Err(bad) => {
            let err = EngineError::UnparseableResultLine { path: log_path, line_no: bad.line_no, line: bad.line };
            warn!(dir = %dir.display(), error = %err, "result log not understood");
            let notice = OperatorNotice {
                subject: "Error parsing pytest_log".into(),
                body: format!(
                    "{err}\n\nA line in the result log begins neither with '.' nor 'F'. The directory \
                     in which this arose is {} and the result log follows.\n\n{log}",
                    dir.display()
                ),
            };
            let records = vec![TestRecord::fail("Error parsing pytest_log", guidance::PARSE_ERROR)];
            Ok(done(records, RunKind::ParseError, Some(notice)))
        }
    }
}
