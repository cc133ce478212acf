use std::path::Path;

use anyhow::{Context, Result};
use cwp_core::{now_iso, now_unix};
use cwp_lock::SemaphoreLock;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::engine::Engine;

#[derive(Debug, PartialEq, Eq)]
pub enum Invocation<T> {
    Completed(T),
    /// Another invocation holds the lock; nothing was touched.
    Skipped,
}

/// Run `f` while holding `lock`. The lock is released on every exit path, panics included.
pub fn run_locked<T>(lock: &SemaphoreLock, f: impl FnOnce() -> Result<T>) -> Result<Invocation<T>> {
    let Some(guard) = lock.acquire_guard()? else {
        info!(dir = %lock.dir().display(), "other process running, quitting");
        return Ok(Invocation::Skipped);
    };
    let out = f();
    let released = guard.release();
    let out = out?;
    released?;
    Ok(Invocation::Completed(out))
}

/// Liveness record written after every invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pulse {
    pub now_secs: i64,
    pub now_iso: String,
    pub module: String,
    pub what: String,
}

pub fn write_pulse(path: &Path, module: &str, what: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let pulse = Pulse { now_secs: now_unix(), now_iso: now_iso(), module: module.to_string(), what: what.to_string() };
    std::fs::write(path, serde_json::to_vec_pretty(&pulse)?).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

pub fn read_pulse(path: &Path) -> Result<Pulse> {
    let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))
}

/// Queue an `URGENT` mail with the log tail after a pipeline failed outright.
pub fn report_malfunction(engine: &Engine, what: &str, err: &anyhow::Error) {
    error!(what, error = %format!("{err:#}"), "something went wrong, notifying operator");
    let subject = format!("URGENT: Malfunction in {} {} at {}", what, engine.tag(), now_iso());
    let body = format!("Error:\n{err:#}\n\nRecent log entries follow:\n\n{}", engine.log_tail());
    if let Err(e) = engine.outbox.notify_operator(&subject, &body) {
        error!(error = %e, "could not enqueue malfunction report");
    }
}

/// Lock, run, report a failure to the operator, always write the pulse.
pub fn invoke<T>(
    engine: &Engine,
    lock: &SemaphoreLock,
    what: &str,
    f: impl FnOnce() -> Result<T>,
) -> Result<Invocation<T>> {
    let res = run_locked(lock, f);
    if let Err(e) = &res {
        report_malfunction(engine, what, e);
    }
    let pulse = engine.path(&engine.cfg.paths.pulse_dir).join(format!("pulse-{what}.json"));
    write_pulse(&pulse, engine.tag(), what)?;
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn skipped_when_held_and_released_after_error() {
        let dir = tempfile::tempdir().unwrap();
        let lock = SemaphoreLock::new(dir.path());

        let held = lock.acquire_guard().unwrap().unwrap();
        let res = run_locked(&lock, || Ok(1)).unwrap();
        assert_eq!(res, Invocation::Skipped);
        drop(held);

        let res: Result<Invocation<()>> = run_locked(&lock, || Err(anyhow!("boom")));
        assert!(res.is_err());
        assert_eq!(run_locked(&lock, || Ok(2)).unwrap(), Invocation::Completed(2));
    }

    #[test]
    fn pulse_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("log").join("pulse-outgoing.json");
        write_pulse(&p, "CS101", "process-outgoing").unwrap();
        let pulse = read_pulse(&p).unwrap();
        assert_eq!(pulse.module, "CS101");
        assert_eq!(pulse.what, "process-outgoing");
        assert!(pulse.now_secs > 0);
    }
}
