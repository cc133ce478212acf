use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use fs2::FileExt;

/// Monotonic id allocator backed by a plain-text integer file.
///
/// Safe for concurrent callers on one local filesystem: the read-modify-write runs under an
/// exclusive advisory lock on the counter file itself. Not claimed safe on network mounts.
#[derive(Clone, Debug)]
pub struct Counter {
    path: PathBuf,
}

impl Counter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Next id, starting at 1 for a fresh counter.
    pub fn next_id(&self) -> Result<u64> {
        next_id(&self.path)
    }

    /// Current value without incrementing (0 if the file does not exist yet).
    pub fn current(&self) -> Result<u64> {
        if !self.path.exists() {
            return Ok(0);
        }
        let mut f = File::open(&self.path).with_context(|| format!("open counter {}", self.path.display()))?;
        FileExt::lock_shared(&f).with_context(|| format!("lock counter {}", self.path.display()))?;
        let value = read_value(&mut f, &self.path);
        FileExt::unlock(&f).ok();
        value
    }
}

pub fn next_id(path: &Path) -> Result<u64> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create counter dir {}", parent.display()))?;
    }
    let mut f = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("open counter {}", path.display()))?;
    FileExt::lock_exclusive(&f).with_context(|| format!("lock counter {}", path.display()))?;

    let result = bump(&mut f, path);
    FileExt::unlock(&f).ok();
    result
}

fn bump(f: &mut File, path: &Path) -> Result<u64> {
    let next = read_value(f, path)?
        .checked_add(1)
        .ok_or_else(|| anyhow!("counter {} overflowed", path.display()))?;
    // truncate then write the whole value; never append
    f.set_len(0).with_context(|| format!("truncate counter {}", path.display()))?;
    f.seek(SeekFrom::Start(0))?;
    f.write_all(next.to_string().as_bytes()).with_context(|| format!("write counter {}", path.display()))?;
    f.sync_data().with_context(|| format!("sync counter {}", path.display()))?;
    Ok(next)
}

fn read_value(f: &mut File, path: &Path) -> Result<u64> {
    let mut s = String::new();
    f.seek(SeekFrom::Start(0))?;
    f.read_to_string(&mut s).with_context(|| format!("read counter {}", path.display()))?;
    let s = s.trim();
    if s.is_empty() {
        return Ok(0);
    }
    s.parse::<u64>().with_context(|| format!("counter {} holds non-integer {:?}", path.display(), s))
}
