use std::path::PathBuf;
use std::time::Duration;

use cwp_core::ExecPolicy;
use serde::{Deserialize, Serialize};

/// One file to place inside the run directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxInput {
    pub source: PathBuf,
    /// Name inside the run directory.
    pub name: String,
    /// The sandboxed process may overwrite it.
    #[serde(default)]
    pub group_writable: bool,
}

impl SandboxInput {
    pub fn new(source: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self { source: source.into(), name: name.into(), group_writable: false }
    }

    pub fn writable(mut self) -> Self {
        self.group_writable = true;
        self
    }
}

/// Names of the bookkeeping files inside a run directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFiles {
    pub status: String,
    pub stdout: String,
    pub stderr: String,
    pub command: String,
}

impl Default for RunFiles {
    fn default() -> Self {
        Self {
            status: "status.txt".into(),
            stdout: "pytest.stdout".into(),
            stderr: "pytest.stderr".into(),
            command: "pytest.command".into(),
        }
    }
}

/// Everything needed for one sandboxed run.
#[derive(Clone, Debug)]
pub struct SandboxSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub inputs: Vec<SandboxInput>,
    pub deadline: Duration,
    pub poll_interval: Duration,
    pub policy: ExecPolicy,
    /// Group the sandboxed process runs under. `None` keeps the run directory private to the
    /// invoking user.
    pub exec_group: Option<String>,
    /// Parent of the per-run directory.
    pub tmp_root: PathBuf,
    /// Explicit run directory; generated under `tmp_root` when absent. Must not exist yet.
    pub workdir: Option<PathBuf>,
    pub files: RunFiles,
}

impl SandboxSpec {
    pub fn new(program: impl Into<String>, tmp_root: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            env: vec![],
            inputs: vec![],
            deadline: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
            policy: ExecPolicy::default(),
            exec_group: None,
            tmp_root: tmp_root.into(),
            workdir: None,
            files: RunFiles::default(),
        }
    }

    pub fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(a.into());
        self
    }

    pub fn input(mut self, input: SandboxInput) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn deadline(mut self, d: Duration) -> Self {
        self.deadline = d;
        self
    }

    pub fn policy(mut self, p: ExecPolicy) -> Self {
        self.policy = p;
        self
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
