use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cwp_core::TokenId;
use fs2::FileExt;
use tracing::{debug, warn};

pub const TOKEN_PREFIX: &str = "lock-";
const KERNEL_LOCK_FILE: &str = ".flock";

/// Advisory lock made of token files in a directory.
///
/// Acquire writes a uniquely named token, then lists the directory: any other token means
/// somebody else is (or was) running, so the fresh token is withdrawn and acquisition fails.
/// Works on filesystems where `flock(2)` cannot be trusted, at the price of a narrow race when
/// two writers list at the same instant; meant for invocations minutes apart, not a
/// linearizable mutex.
#[derive(Clone, Debug)]
pub struct SemaphoreLock {
    dir: PathBuf,
    kernel_lock: bool,
}

/// Proof of acquisition. Hand it back to [`SemaphoreLock::release`] or wrap it in a guard.
#[derive(Debug)]
pub struct LockToken {
    path: PathBuf,
    flock: Option<File>,
}

impl LockToken {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> String {
        self.path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()
    }
}

impl SemaphoreLock {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), kernel_lock: false }
    }

    /// Additionally hold an exclusive `flock` on `<dir>/.flock` while the token lives. Closes
    /// the listing race on local disks; harmless where the kernel lock is a no-op.
    pub fn with_kernel_lock(mut self, enabled: bool) -> Self {
        self.kernel_lock = enabled;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `Ok(None)` means another holder is present. That is contention, not an error.
    pub fn acquire(&self) -> Result<Option<LockToken>> {
        if !self.dir.exists() {
            std::fs::create_dir_all(&self.dir).with_context(|| format!("create lock dir {}", self.dir.display()))?;
        }

        let name = format!("{TOKEN_PREFIX}{}", TokenId::new());
        let path = self.dir.join(&name);
        let mut f = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("write lock token {}", path.display()))?;

        // From here on the token exists; any failure must withdraw it.
        let held = write!(f, "{}", chrono::Local::now().format("%a %b %e %H:%M:%S %Y"))
            .with_context(|| format!("write lock token {}", path.display()))
            .and_then(|()| {
                f.sync_all().ok();
                drop(f);
                self.check_alone(&name)
            });
        match held {
            Ok(Some(flock)) => {
                debug!(token = %name, "lock acquired");
                Ok(Some(LockToken { path, flock }))
            }
            Ok(None) => {
                remove_if_present(&path)?;
                Ok(None)
            }
            Err(e) => {
                if let Err(cleanup) = remove_if_present(&path) {
                    warn!(token = %path.display(), error = %cleanup, "could not withdraw lock token");
                }
                Err(e)
            }
        }
    }

    /// `Ok(None)` when another holder shows up; `Ok(Some(flock))` when we are alone.
    fn check_alone(&self, name: &str) -> Result<Option<Option<File>>> {
        let others: Vec<String> = list_tokens(&self.dir)?.into_iter().filter(|t| t != name).collect();
        if !others.is_empty() {
            warn!(dir = %self.dir.display(), others = ?others, "found other lock(s), backing off");
            return Ok(None);
        }
        if !self.kernel_lock {
            return Ok(Some(None));
        }
        match self.take_kernel_lock()? {
            Some(f) => Ok(Some(Some(f))),
            None => {
                warn!(dir = %self.dir.display(), "kernel lock held elsewhere, backing off");
                Ok(None)
            }
        }
    }

    /// Acquire wrapped in a guard that releases on every exit path.
    pub fn acquire_guard(&self) -> Result<Option<LockGuard>> {
        Ok(self.acquire()?.map(|token| LockGuard { token: Some(token) }))
    }

    /// Remove the token. Releasing a token that is already gone is fine.
    pub fn release(token: LockToken) -> Result<()> {
        let LockToken { path, flock } = token;
        remove_if_present(&path)?;
        if let Some(f) = flock {
            FileExt::unlock(&f).ok();
        }
        debug!(token = %path.display(), "lock released");
        Ok(())
    }

    fn take_kernel_lock(&self) -> Result<Option<File>> {
        let path = self.dir.join(KERNEL_LOCK_FILE);
        let f = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        match FileExt::try_lock_exclusive(&f) {
            Ok(()) => Ok(Some(f)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e).with_context(|| format!("lock {}", path.display())),
        }
    }
}

/// Scoped acquisition: the token is removed when the guard drops.
#[derive(Debug)]
pub struct LockGuard {
    token: Option<LockToken>,
}

impl LockGuard {
    pub fn token(&self) -> Option<&LockToken> {
        self.token.as_ref()
    }

    /// Release now and surface any error instead of logging it from `Drop`.
    pub fn release(mut self) -> Result<()> {
        match self.token.take() {
            Some(token) => SemaphoreLock::release(token),
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            let path = token.path().to_path_buf();
            if let Err(e) = SemaphoreLock::release(token) {
                warn!(token = %path.display(), error = %e, "failed to release lock");
            }
        }
    }
}

pub(crate) fn list_tokens(dir: &Path) -> Result<Vec<String>> {
    let mut out = vec![];
    for entry in std::fs::read_dir(dir).with_context(|| format!("list lock dir {}", dir.display()))? {
        let name = entry?.file_name().to_string_lossy().to_string();
        if name.starts_with(TOKEN_PREFIX) {
            out.push(name);
        }
    }
    Ok(out)
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove lock token {}", path.display())),
    }
}
