//! Append-only status ledger written into every sandbox run directory.
//!
//! One record per line: `<tag>::<iso timestamp>::<detail>`. The last line decides how the run
//! finished.

use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

use crate::error::EngineError;
use crate::model::LedgerTag;
use crate::time::now_iso;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerEntry {
    pub tag: LedgerTag,
    pub at: String,
    pub detail: String,
}

impl LedgerEntry {
    pub fn now(tag: LedgerTag, detail: impl Into<String>) -> Self {
        Self { tag, at: now_iso(), detail: detail.into() }
    }

    /// First `:`-separated word of the detail (`unterminated`, `retcode=1`, ...).
    pub fn reason(&self) -> &str {
        self.detail.split(':').next().unwrap_or("")
    }

    pub fn is_unterminated(&self) -> bool {
        self.tag == LedgerTag::Fail && self.reason() == "unterminated"
    }

    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.trim_end_matches(['\n', '\r']).splitn(3, "::");
        let tag = LedgerTag::parse(parts.next()?)?;
        let at = parts.next()?.to_string();
        let detail = parts.next().unwrap_or("").trim_end_matches(':').to_string();
        Some(Self { tag, at, detail })
    }
}

impl fmt::Display for LedgerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}::{}", self.tag.as_str(), self.at, self.detail)
    }
}

/// Append one record. The file is only ever opened in append mode.
pub fn append_entry(path: &Path, entry: &LedgerEntry) -> io::Result<()> {
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(f, "{}", entry)?;
    f.sync_data()
}

pub fn read_entries(path: &Path) -> Result<Vec<LedgerEntry>, EngineError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| EngineError::MalformedLedger { path: path.to_path_buf(), reason: e.to_string() })?;
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            LedgerEntry::parse(l).ok_or_else(|| EngineError::MalformedLedger {
                path: path.to_path_buf(),
                reason: format!("bad record {l:?}"),
            })
        })
        .collect()
}

/// The authoritative entry: the last one written.
pub fn read_final(path: &Path) -> Result<LedgerEntry, EngineError> {
    read_entries(path)?
        .pop()
        .ok_or_else(|| EngineError::MalformedLedger { path: path.to_path_buf(), reason: "no records".into() })
}
