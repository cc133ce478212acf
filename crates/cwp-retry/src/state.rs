use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const RETRY_STATE_VERSION: u32 = 1;

/// Persisted failure streak for one downstream dependency.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    pub version: u32,
    pub consecutive_failures: u32,
    pub first_failure_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_escalation_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub recent_errors: Vec<String>,
}

impl Default for RetryState {
    fn default() -> Self {
        Self {
            version: RETRY_STATE_VERSION,
            consecutive_failures: 0,
            first_failure_at: None,
            last_failure_at: None,
            last_success_at: None,
            last_escalation_at: None,
            recent_errors: vec![],
        }
    }
}

impl RetryState {
    pub fn is_failing(&self) -> bool {
        self.consecutive_failures > 0
    }

    /// Distinct recent errors with how often each occurred, most frequent first.
    pub fn error_counts(&self) -> Vec<(String, usize)> {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for e in &self.recent_errors {
            *counts.entry(e.as_str()).or_default() += 1;
        }
        let mut out: Vec<(String, usize)> = counts.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        out
    }
}
