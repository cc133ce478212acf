//! Signatures of known test-runner faults that hide an import failure of the submission.
//!
//! Both faults only show up when the runner writes a result log: it crashes inside its own
//! reporting hook instead of reporting the import error, so the log is empty or full of the
//! runner's traceback.

use std::sync::OnceLock;

use regex::Regex;

/// Signal count above which a run is taken to be the non-ASCII import crash. No-signal output
/// scores 0 and the full signature scores 9.
pub const CRASH_SIGNATURE_THRESHOLD: usize = 3;

const LOG_PATTERNS: &[&str] = &[
    r"^! .*/_pytest/resultlog\.py$",
    r#"File ".*resultlog\.py.*line.*pytest_collectreport"#,
    r"longrepr = str\(report\.longrepr\.reprcrash\)",
    r"AttributeError: CollectErrorRepr instance has no attribute 'reprcrash'",
];

const STDOUT_PATTERNS: &[&str] = &[
    r"^INTERNALERROR> Traceback \(most recent call last\):",
    r#"^INTERNALERROR>   File ".*resultlog\.py", line .*, in pytest_collectreport"#,
    r"^INTERNALERROR>     longrepr = str\(report.longrepr.reprcrash\)",
    r"^INTERNALERROR> AttributeError: CollectErrorRepr instance has no attribute 'reprcrash'",
    r"^=+ 1 error in .* seconds =+",
];

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().map(|p| Regex::new(p).expect("signature regex")).collect()
}

fn log_res() -> &'static [Regex] {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| compile(LOG_PATTERNS))
}

fn stdout_res() -> &'static [Regex] {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| compile(STDOUT_PATTERNS))
}

fn count_matches(text: &str, res: &[Regex]) -> usize {
    text.lines().map(|l| res.iter().filter(|re| re.is_match(l)).count()).sum()
}

/// Empty result log plus the runner's internal-error traceback on stdout and stderr: the
/// submission failed to import (typically an indentation error).
pub fn empty_log_import_crash(stdout: &str, stderr: &str) -> bool {
    stdout.contains("INTERNALERROR") && stderr.contains("AttributeError") && stderr.contains("reprcrash")
}

/// Weighted match of the non-ASCII import crash across the result log and stdout.
pub fn crash_signature_score(log: &str, stdout: &str) -> usize {
    count_matches(log, log_res()) + count_matches(stdout, stdout_res())
}

pub fn looks_like_import_crash(log: &str, stdout: &str) -> bool {
    crash_signature_score(log, stdout) > CRASH_SIGNATURE_THRESHOLD
}

/// A `MemoryError` reported by the test runner (`E   MemoryError` lines).
pub fn reports_memory_error(stdout: &str, stderr: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(?m)^E\s+MemoryError").expect("memory error regex"));
    re.is_match(stdout) || re.is_match(stderr)
}
