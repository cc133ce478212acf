use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use cwp_classify::{RunLayout, Weights};
use cwp_core::{EscalationPolicy, ExecPolicy};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub paths: PathsConfig,
    pub mail: MailConfig,
    pub sandbox: SandboxConfig,
    pub retry: RetryConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub assignments: BTreeMap<String, AssignmentConfig>,
}

/// Relative paths are resolved against the root directory; `~` is expanded.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PathsConfig {
    pub outgoing_queue: String,
    pub outgoing_locks: String,
    pub test_queue: String,
    pub test_locks: String,
    pub test_code: String,
    pub sandbox_tmp: String,
    pub log_file: String,
    pub pulse_dir: String,
    pub retry_state: String,
    #[serde(default)]
    pub dry_run_outbox: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MailConfig {
    pub module_address: String,
    pub operator_address: String,
    /// Short course tag used in subject lines, e.g. `CS101`.
    pub subject_tag: String,
    /// `sendmail` or `dry_run`.
    pub transport: String,
    pub sendmail_program: String,
    #[serde(default)]
    pub sendmail_args: Vec<String>,
    #[serde(default)]
    pub footer: String,
    /// Lines of the log file attached to operator escalations.
    #[serde(default = "default_log_tail")]
    pub log_tail_lines: usize,
}

fn default_log_tail() -> usize {
    100
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub deadline_secs: u64,
    pub poll_ms: u64,
    pub policy: ExecPolicy,
    #[serde(default)]
    pub exec_group: Option<String>,
    pub runner_program: String,
    /// `{test_file}` and `{log}` are substituted.
    pub runner_args: Vec<String>,
    pub status_file: String,
    pub stdout_file: String,
    pub stderr_file: String,
    pub log_file: String,
    pub command_file: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    pub threshold: u32,
    pub repeat_hours: u32,
    pub max_recent_errors: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    /// `directory` or `sqlite`.
    pub backend: String,
    pub sqlite_path: String,
    /// Also hold a kernel `flock` while the pipeline lock is held. Local disks only.
    #[serde(default)]
    pub kernel_lock: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { backend: "directory".into(), sqlite_path: "state/queues.db".into(), kernel_lock: false }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AssignmentConfig {
    /// File name under `<test_code>/<assignment>/`.
    pub test_file: String,
    /// Files looked up in the submitter's lab directory; missing ones are skipped.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Subset of `inputs` the tests may overwrite.
    #[serde(default)]
    pub writable_inputs: Vec<String>,
    #[serde(default)]
    pub default_weight: Option<f64>,
    #[serde(default)]
    pub weights: BTreeMap<String, f64>,
}

impl AssignmentConfig {
    pub fn weights(&self) -> Weights {
        Weights { default: self.default_weight.unwrap_or(1.0), per_test: self.weights.clone() }
    }
}

impl Config {
    pub fn default_for_root(course: &str) -> Self {
        Self {
            paths: PathsConfig {
                outgoing_queue: "queues/outgoing".into(),
                outgoing_locks: "locks/outgoing".into(),
                test_queue: "queues/subtest".into(),
                test_locks: "locks/subtest".into(),
                test_code: "test-code".into(),
                sandbox_tmp: "tmp".into(),
                log_file: "log/cwp.log".into(),
                pulse_dir: "log".into(),
                retry_state: "state/smtp-retry.json".into(),
                dry_run_outbox: None,
            },
            mail: MailConfig {
                module_address: format!("{}@localhost", course.to_lowercase()),
                operator_address: "root@localhost".into(),
                subject_tag: course.to_uppercase(),
                transport: "sendmail".into(),
                sendmail_program: "/usr/sbin/sendmail".into(),
                sendmail_args: vec!["-t".into(), "-oi".into()],
                footer: "This message was generated automatically.".into(),
                log_tail_lines: default_log_tail(),
            },
            sandbox: SandboxConfig {
                deadline_secs: 60,
                poll_ms: 100,
                policy: ExecPolicy::Unconstrained,
                exec_group: None,
                runner_program: "py.test".into(),
                runner_args: vec!["-p".into(), "resultlog".into(), "--resultlog={log}".into(), "{test_file}".into()],
                status_file: "status.txt".into(),
                stdout_file: "pytest.stdout".into(),
                stderr_file: "pytest.stderr".into(),
                log_file: "pytest_log".into(),
                command_file: "pytest.command".into(),
            },
            retry: RetryConfig { threshold: 5, repeat_hours: 24, max_recent_errors: 50 },
            queue: QueueConfig::default(),
            assignments: BTreeMap::new(),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: Config = toml::from_str(&s).with_context(|| "parse cwp.toml")?;
        Ok(cfg)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let s = toml::to_string_pretty(self).with_context(|| "serialize toml")?;
        std::fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    pub fn config_path(root: &Path) -> PathBuf {
        root.join(".cwp").join("cwp.toml")
    }

    pub fn escalation_policy(&self) -> EscalationPolicy {
        EscalationPolicy::new(self.retry.threshold, self.retry.repeat_hours)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.sandbox.deadline_secs)
    }

    pub fn run_layout(&self) -> RunLayout {
        RunLayout {
            status: self.sandbox.status_file.clone(),
            log: self.sandbox.log_file.clone(),
            stdout: self.sandbox.stdout_file.clone(),
            stderr: self.sandbox.stderr_file.clone(),
        }
    }
}

/// Expand `~` and anchor relative paths at `root`.
pub fn resolve(root: &Path, p: &str) -> PathBuf {
    let expanded = PathBuf::from(shellexpand::tilde(p).to_string());
    if expanded.is_absolute() {
        expanded
    } else {
        root.join(expanded)
    }
}
