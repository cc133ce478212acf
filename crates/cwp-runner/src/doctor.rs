use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use cwp_lock::find_locks;
use cwp_retry::RetryState;
use serde::Serialize;
use tracing::{info, warn};

use crate::engine::Engine;

/// Create every directory the engine writes into and the retry state file.
pub fn ensure_layout(engine: &Engine) -> Result<()> {
    let cfg = &engine.cfg.paths;
    let mut dirs = vec![
        engine.path(&cfg.outgoing_locks),
        engine.path(&cfg.test_locks),
        engine.path(&cfg.test_code),
        engine.path(&cfg.sandbox_tmp),
        engine.path(&cfg.pulse_dir),
    ];
    if engine.cfg.queue.backend == "directory" {
        dirs.push(engine.path(&cfg.outgoing_queue));
        dirs.push(engine.path(&cfg.test_queue));
    }
    if let Some(parent) = engine.log_file().parent() {
        dirs.push(parent.to_path_buf());
    }
    for d in &dirs {
        std::fs::create_dir_all(d).with_context(|| format!("create {}", d.display()))?;
    }
    if engine.tracker.init()? {
        info!(path = %engine.tracker.path().display(), "created retry state");
    }
    Ok(())
}

/// Check the configuration against the file system. All problems are reported together.
pub fn doctor(engine: &Engine) -> Result<()> {
    let mut problems = Vec::new();

    for (name, a) in &engine.cfg.assignments {
        let test_file = engine.path(&engine.cfg.paths.test_code).join(name).join(&a.test_file);
        if !test_file.is_file() {
            problems.push(format!("assignment {name}: test file {} missing", test_file.display()));
        }
        for w in &a.writable_inputs {
            if !a.inputs.contains(w) {
                problems.push(format!("assignment {name}: writable input {w:?} is not an input"));
            }
        }
    }
    if engine.cfg.retry.threshold == 0 {
        problems.push("retry.threshold must be at least 1".into());
    }
    if !engine.cfg.mail.operator_address.contains('@') {
        problems.push(format!("mail.operator_address {:?} is not an address", engine.cfg.mail.operator_address));
    }
    let tmp = engine.path(&engine.cfg.paths.sandbox_tmp);
    if !tmp.is_dir() {
        problems.push(format!("sandbox tmp {} missing; run `cwp init`", tmp.display()));
    }
    if let Err(e) = engine.tracker.snapshot() {
        problems.push(format!("retry state unreadable: {e:#}"));
    }

    for lock in find_locks(&engine.lock_dirs())? {
        warn!(token = %lock.display(), "lock token present (an invocation is running or one died)");
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(anyhow!("{} problem(s):\n  {}", problems.len(), problems.join("\n  ")))
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusReport {
    pub pending_outgoing: usize,
    pub pending_tests: usize,
    pub locks: Vec<PathBuf>,
    pub retry: RetryState,
}

pub fn status(engine: &Engine) -> Result<StatusReport> {
    Ok(StatusReport {
        pending_outgoing: engine.outgoing.list_pending()?.len(),
        pending_tests: engine.tests.list_pending()?.len(),
        locks: find_locks(&engine.lock_dirs())?,
        retry: engine.tracker.snapshot()?,
    })
}
