use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::semaphore::TOKEN_PREFIX;

/// Every token file under the given lock directories, searched recursively.
///
/// Operator tooling: a token that outlives its process (crash, kill -9) blocks every later
/// invocation until it is removed by hand.
pub fn find_locks(dirs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut found = vec![];
    for dir in dirs {
        if !dir.is_dir() {
            warn!(dir = %dir.display(), "lock directory does not exist or is not a directory");
            continue;
        }
        walk(dir, &mut found)?;
    }
    found.sort();
    Ok(found)
}

fn walk(dir: &Path, found: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir).with_context(|| format!("list {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        let ty = entry.file_type()?;
        if ty.is_dir() {
            walk(&path, found)?;
        } else if ty.is_file() && entry.file_name().to_string_lossy().starts_with(TOKEN_PREFIX) {
            found.push(path);
        }
    }
    Ok(())
}

/// Delete the given token files; returns how many were actually removed.
pub fn remove_locks(paths: &[PathBuf]) -> Result<usize> {
    let mut removed = 0;
    for p in paths {
        match std::fs::remove_file(p) {
            Ok(()) => {
                info!(token = %p.display(), "removed lock");
                removed += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("remove {}", p.display())),
        }
    }
    Ok(removed)
}
