//! Line-oriented result log written by the test runner.
//!
//! ```text
//! . lab1/test_lab1.py::test_distance
//! F lab1/test_lab1.py::test_volume
//!  def test_volume():
//!  >   assert volume(1) == 2
//! ```
//!
//! `.` marks a pass, `F` a failure; a failure is followed by its detail, one space-indented
//! line at a time.

use serde::{Deserialize, Serialize};

use crate::guidance;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRecord {
    pub passed: bool,
    pub name: String,
    pub detail: Option<String>,
}

impl TestRecord {
    pub fn pass(name: impl Into<String>) -> Self {
        Self { passed: true, name: name.into(), detail: None }
    }

    pub fn fail(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self { passed: false, name: name.into(), detail: Some(detail.into()) }
    }
}

/// First line that is neither a pass nor a fail marker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BadLine {
    /// 1-based.
    pub line_no: usize,
    pub line: String,
}

/// Parse the whole log. `stdout` is folded into the detail of a failure that names only the
/// test file (the submission could not be imported, so no test function ever ran).
pub fn parse_result_log(text: &str, stdout: &str) -> Result<Vec<TestRecord>, BadLine> {
    let lines: Vec<&str> = text.lines().collect();
    let mut records = vec![];
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        let name = line.get(1..).unwrap_or("").trim().to_string();
        match line.chars().next() {
            Some('.') => {
                records.push(TestRecord::pass(name));
                i += 1;
            }
            Some('F') => {
                let import_error = if line.trim_end().ends_with(".py") {
                    format!("\nThere was an error when importing your file:\n{stdout}{}", guidance::IMPORT_FAILED)
                } else {
                    String::new()
                };
                i += 1;
                let mut detail = String::new();
                while i < lines.len() && lines[i].starts_with(' ') {
                    detail.push_str(&lines[i][1..]);
                    detail.push('\n');
                    i += 1;
                }
                detail.push_str(&import_error);
                records.push(TestRecord::fail(name, detail));
            }
            _ => return Err(BadLine { line_no: i + 1, line: line.to_string() }),
        }
    }
    Ok(records)
}

/// `test_distance` out of `lab1/test_lab1.py::test_distance` (or the older `...py:test_x`
/// form). Names that do not look like a test path come back unchanged.
pub fn test_shortname(longname: &str) -> &str {
    use std::sync::OnceLock;
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        regex::Regex::new(r"([+.0-9a-zA-Z_-]+)/test_([+.0-9a-zA-Z_-]+:)").expect("shortname regex")
    });
    match re.find(longname) {
        Some(m) => longname[m.end()..].trim_start_matches(':'),
        None => longname,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = ". lab1/test_lab1.py::test_distance
F lab1/test_lab1.py::test_volume
 def test_volume():
 >   assert volume(1) == 2
 E   assert 3 == 2
. lab1/test_lab1.py::test_mean
";

    #[test]
    fn parses_passes_and_failures_with_detail() {
        let records = parse_result_log(LOG, "").unwrap();
        assert_eq!(records.len(), 3);
        assert!(records[0].passed);
        assert_eq!(records[1].name, "lab1/test_lab1.py::test_volume");
        let detail = records[1].detail.as_deref().unwrap();
        assert!(detail.starts_with("def test_volume():\n"));
        assert!(detail.contains("E   assert 3 == 2"));
        assert!(records[2].passed);
    }

    #[test]
    fn failure_on_the_file_itself_is_an_import_error() {
        let log = "F _test-2024-01-01/test_lab1.py\n  File \"s.py\", line 3\n";
        let records = parse_result_log(log, "SyntaxError: invalid syntax\n").unwrap();
        let detail = records[0].detail.as_deref().unwrap();
        assert!(detail.contains("error when importing your file"));
        assert!(detail.contains("SyntaxError"));
    }

    #[test]
    fn reports_first_unknown_marker() {
        let err = parse_result_log(". a/test_x.py::test_a\n? what\n", "").unwrap_err();
        assert_eq!(err, BadLine { line_no: 2, line: "? what".into() });

        let err = parse_result_log(". a/test_x.py::test_a\n\n", "").unwrap_err();
        assert_eq!(err.line_no, 2);
    }

    #[test]
    fn shortname_strips_path_and_file() {
        assert_eq!(test_shortname("test/test_tenfunc.py:test_powers"), "test_powers");
        assert_eq!(test_shortname("_test-2009-09-07-17:22:02/test_lab1.py::test_fall_time"), "test_fall_time");
        assert_eq!(test_shortname("import s.py"), "import s.py");
    }
}
