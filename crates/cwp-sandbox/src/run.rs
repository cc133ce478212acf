use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use cwp_core::{append_entry, dir_stamp, EngineError, LedgerEntry, LedgerTag, StatusTaxonomy};
use tracing::{debug, info, warn};

use crate::exit::{classify_exit, unterminated_verdict};
use crate::fs_ops::{move_dir, not_found, set_aside};
use crate::perms;
use crate::process::{kill_group, start_in_own_group, wait_with_deadline, Waited};
use crate::spec::{RunFiles, SandboxSpec};

/// A finished run. Owns its directory until [`SandboxRun::hand_off`] moves it elsewhere.
#[derive(Debug)]
pub struct SandboxRun {
    dir: PathBuf,
    files: RunFiles,
    pub outcome: StatusTaxonomy,
    pub exit_code: Option<i32>,
    pub ledger: LedgerEntry,
    pub elapsed: Duration,
    pub pid: u32,
}

impl SandboxRun {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn status_path(&self) -> PathBuf {
        self.dir.join(&self.files.status)
    }

    pub fn stdout_path(&self) -> PathBuf {
        self.dir.join(&self.files.stdout)
    }

    pub fn stderr_path(&self) -> PathBuf {
        self.dir.join(&self.files.stderr)
    }

    pub fn terminated(&self) -> bool {
        self.outcome != StatusTaxonomy::FailUnterminated
    }

    /// Move the run directory to `dest`. An existing `dest` is renamed aside first, never
    /// overwritten. Returns the new location.
    pub fn hand_off(mut self, dest: &Path) -> Result<PathBuf> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        set_aside(dest)?;
        move_dir(&self.dir, dest)?;
        info!(from = %self.dir.display(), to = %dest.display(), "run directory handed off");
        self.dir = dest.to_path_buf();
        Ok(self.dir)
    }
}

/// Run `spec` once: fresh directory, inputs, permission boundary, deadline-bounded process,
/// exactly one ledger record.
///
/// Deadline expiry is an ordinary outcome. A constrained exit code of 2 or more is recorded and
/// then returned as [`EngineError::UnexpectedExitCode`]; the run directory stays where it is for
/// inspection.
pub fn run_sandboxed(spec: &SandboxSpec) -> Result<SandboxRun> {
    let dir = create_workdir(spec)?;
    debug!(dir = %dir.display(), "sandbox directory created");

    copy_inputs(spec, &dir)?;

    let gid = match &spec.exec_group {
        Some(name) => Some(perms::lookup_group(name)?),
        None => None,
    };
    perms::open_for_group(&dir, gid)?;
    for input in spec.inputs.iter().filter(|i| i.group_writable) {
        perms::make_group_writable(&dir.join(&input.name))?;
    }

    let command_line = spec.command_line();
    {
        let mut f = OpenOptions::new().create(true).append(true).open(dir.join(&spec.files.command))?;
        writeln!(f, "cd {} && {}", dir.display(), command_line)?;
    }

    let stdout = File::create(dir.join(&spec.files.stdout))?;
    let stderr = File::create(dir.join(&spec.files.stderr))?;
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .current_dir(&dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));
    start_in_own_group(&mut cmd);

    info!(dir = %dir.display(), command = %command_line, deadline_s = spec.deadline.as_secs(), "starting sandboxed run");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            abandon_run(spec, &dir, "spawn-error");
            return Err(e).with_context(|| format!("spawn {}", spec.program));
        }
    };
    let pid = child.id();
    let waited = match wait_with_deadline(&mut child, spec.deadline, spec.poll_interval) {
        Ok(waited) => waited,
        Err(e) => {
            kill_group(pid).ok();
            child.wait().ok();
            abandon_run(spec, &dir, "wait-error");
            return Err(e).with_context(|| format!("wait for sandboxed process {pid}"));
        }
    };
    let elapsed = started.elapsed();

    let (verdict, exit_code) = match waited {
        Waited::Killed => (unterminated_verdict(), None),
        Waited::Exited(status) => (classify_exit(spec.policy, status.code()), status.code()),
    };

    perms::close_down(&dir)?;

    let status_path = dir.join(&spec.files.status);
    let entry = LedgerEntry::now(verdict.tag, verdict.detail.clone());
    append_entry(&status_path, &entry).with_context(|| format!("append {}", status_path.display()))?;

    match verdict.outcome {
        StatusTaxonomy::FailUnterminated => {
            warn!(dir = %dir.display(), elapsed_ms = elapsed.as_millis() as u64, "code did not terminate within the time limit")
        }
        outcome => info!(dir = %dir.display(), outcome = outcome.as_str(), exit_code, "sandboxed run finished"),
    }

    if verdict.unexpected {
        let code = exit_code.unwrap_or(-1);
        return Err(anyhow::Error::new(EngineError::UnexpectedExitCode {
            code,
            policy: format!("{:?}", spec.policy).to_lowercase(),
        })
        .context(format!("sandbox run in {}", dir.display())));
    }

    Ok(SandboxRun {
        dir,
        files: spec.files.clone(),
        outcome: verdict.outcome,
        exit_code,
        ledger: entry,
        elapsed,
        pid,
    })
}

/// Lock the directory down and leave a `fail` record when the process could not be run.
/// The original error is what the caller propagates, so failures here are only logged.
fn abandon_run(spec: &SandboxSpec, dir: &Path, reason: &str) {
    if let Err(e) = perms::close_down(dir) {
        warn!(dir = %dir.display(), error = %e, "could not close down run directory");
    }
    let status_path = dir.join(&spec.files.status);
    if let Err(e) = append_entry(&status_path, &LedgerEntry::now(LedgerTag::Fail, reason)) {
        warn!(path = %status_path.display(), error = %e, "could not record failed run");
    }
}

fn create_workdir(spec: &SandboxSpec) -> Result<PathBuf> {
    let dir = match &spec.workdir {
        Some(d) => d.clone(),
        None => {
            let short = uuid::Uuid::new_v4().simple().to_string();
            spec.tmp_root.join(format!("run-{}-{}", dir_stamp(), &short[..8]))
        }
    };
    if let Some(parent) = dir.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    std::fs::create_dir(&dir).with_context(|| format!("create run directory {}", dir.display()))?;
    Ok(dir)
}

fn copy_inputs(spec: &SandboxSpec, dir: &Path) -> Result<()> {
    for input in &spec.inputs {
        let dest = dir.join(&input.name);
        std::fs::copy(&input.source, &dest).map_err(|e| {
            let reason = if not_found(&e) { "source missing".to_string() } else { e.to_string() };
            EngineError::InputCopy { source_path: input.source.clone(), dest: dest.clone(), reason }
        })?;
        debug!(source = %input.source.display(), dest = %dest.display(), "copied input");
    }
    Ok(())
}
