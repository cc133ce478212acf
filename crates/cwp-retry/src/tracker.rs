use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cwp_core::{decide_escalation, Escalation, EscalationPolicy};
use fs2::FileExt;
use tracing::{info, warn};

use crate::state::RetryState;

pub const DEFAULT_MAX_RECENT: usize = 50;

/// What a success did to the streak.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SuccessReport {
    Clean,
    /// A failure streak just ended; the operator should hear that it cleared.
    Cleared { after_failures: u32, since: Option<DateTime<Utc>> },
}

#[derive(Clone, Debug)]
pub struct FailureReport {
    pub escalation: Escalation,
    pub state: RetryState,
}

/// Read-modify-write of a [`RetryState`] file under an exclusive `flock`, one call at a time.
#[derive(Clone, Debug)]
pub struct RetryTracker {
    path: PathBuf,
    policy: EscalationPolicy,
    max_recent: usize,
}

impl RetryTracker {
    pub fn new(path: impl Into<PathBuf>, policy: EscalationPolicy) -> Self {
        Self { path: path.into(), policy, max_recent: DEFAULT_MAX_RECENT }
    }

    pub fn with_max_recent(mut self, n: usize) -> Self {
        self.max_recent = n.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn policy(&self) -> &EscalationPolicy {
        &self.policy
    }

    /// Write a fresh state if none exists yet. Returns whether a file was created.
    pub fn init(&self) -> Result<bool> {
        if self.path.exists() {
            return Ok(false);
        }
        self.update(|_| ())?;
        info!(path = %self.path.display(), "initialized retry state");
        Ok(true)
    }

    pub fn snapshot(&self) -> Result<RetryState> {
        if !self.path.exists() {
            return Ok(RetryState::default());
        }
        let f = File::open(&self.path).with_context(|| format!("open {}", self.path.display()))?;
        FileExt::lock_shared(&f).with_context(|| format!("lock {}", self.path.display()))?;
        let state = read_state(&f, &self.path);
        FileExt::unlock(&f).ok();
        state
    }

    pub fn record_success(&self) -> Result<SuccessReport> {
        self.record_success_at(Utc::now())
    }

    pub fn record_success_at(&self, now: DateTime<Utc>) -> Result<SuccessReport> {
        self.update(|s| {
            let report = if s.consecutive_failures > 0 {
                SuccessReport::Cleared { after_failures: s.consecutive_failures, since: s.first_failure_at }
            } else {
                SuccessReport::Clean
            };
            s.consecutive_failures = 0;
            s.first_failure_at = None;
            s.recent_errors.clear();
            s.last_success_at = Some(now);
            report
        })
    }

    pub fn record_failure(&self, err: &str) -> Result<FailureReport> {
        self.record_failure_at(err, Utc::now())
    }

    pub fn record_failure_at(&self, err: &str, now: DateTime<Utc>) -> Result<FailureReport> {
        let policy = self.policy;
        let max_recent = self.max_recent;
        let report = self.update(|s| {
            s.consecutive_failures = s.consecutive_failures.saturating_add(1);
            if s.first_failure_at.is_none() {
                s.first_failure_at = Some(now);
            }
            s.last_failure_at = Some(now);
            s.recent_errors.push(err.to_string());
            if s.recent_errors.len() > max_recent {
                let excess = s.recent_errors.len() - max_recent;
                s.recent_errors.drain(..excess);
            }

            let escalation =
                decide_escalation(&policy, s.consecutive_failures, now, s.first_failure_at, s.last_escalation_at);
            if escalation.fires() {
                s.last_escalation_at = Some(now);
            }
            FailureReport { escalation, state: s.clone() }
        })?;
        if report.escalation.fires() {
            warn!(
                failures = report.state.consecutive_failures,
                escalation = ?report.escalation,
                "dependency failure streak escalated"
            );
        }
        Ok(report)
    }

    fn update<T>(&self, f: impl FnOnce(&mut RetryState) -> T) -> Result<T> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        FileExt::lock_exclusive(&file).with_context(|| format!("lock {}", self.path.display()))?;

        let result = (|| -> Result<T> {
            let mut state = read_state(&file, &self.path)?;
            let out = f(&mut state);
            let json = serde_json::to_vec_pretty(&state)?;
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&json)?;
            file.sync_data()?;
            Ok(out)
        })();

        FileExt::unlock(&file).ok();
        result
    }
}

fn read_state(mut file: &File, path: &Path) -> Result<RetryState> {
    let mut buf = String::new();
    file.read_to_string(&mut buf).with_context(|| format!("read {}", path.display()))?;
    if buf.trim().is_empty() {
        return Ok(RetryState::default());
    }
    serde_json::from_str(&buf).with_context(|| format!("parse retry state {}", path.display()))
}
