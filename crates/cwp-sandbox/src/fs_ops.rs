use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cwp_core::collision_suffix;
use tracing::{info, warn};

/// Move `from` to `to`, falling back to copy-and-remove across filesystems.
pub fn move_dir(from: &Path, to: &Path) -> Result<()> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device(&e) => {
            copy_tree(from, to)?;
            std::fs::remove_dir_all(from).with_context(|| format!("remove {}", from.display()))?;
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("rename {} -> {}", from.display(), to.display())),
    }
}

/// Rename an existing `path` to `<path><suffix>` so a new one can take its place.
pub fn set_aside(path: &Path) -> Result<Option<PathBuf>> {
    if std::fs::symlink_metadata(path).is_err() {
        return Ok(None);
    }
    let mut aside = path.as_os_str().to_owned();
    aside.push(format!(".{}", collision_suffix()));
    let aside = PathBuf::from(aside);
    warn!(from = %path.display(), to = %aside.display(), "destination exists, renaming it aside");
    std::fs::rename(path, &aside).with_context(|| format!("rename {} aside", path.display()))?;
    Ok(Some(aside))
}

pub fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    std::fs::create_dir_all(to).with_context(|| format!("create {}", to.display()))?;
    for entry in std::fs::read_dir(from).with_context(|| format!("list {}", from.display()))? {
        let entry = entry?;
        let src = entry.path();
        let dst = to.join(entry.file_name());
        let ty = entry.file_type()?;
        if ty.is_dir() {
            copy_tree(&src, &dst)?;
        } else if ty.is_file() {
            std::fs::copy(&src, &dst).with_context(|| format!("copy {} -> {}", src.display(), dst.display()))?;
        } else {
            info!(path = %src.display(), "skipping non-regular file while copying run directory");
        }
    }
    Ok(())
}

#[cfg(unix)]
fn is_cross_device(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::EXDEV)
}

#[cfg(not(unix))]
fn is_cross_device(e: &std::io::Error) -> bool {
    e.kind() == ErrorKind::Unsupported
}

pub(crate) fn not_found(e: &std::io::Error) -> bool {
    e.kind() == ErrorKind::NotFound
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_aside_keeps_both_copies() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("_test-x");
        assert!(set_aside(&target).unwrap().is_none());

        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("a"), "1").unwrap();
        let aside = set_aside(&target).unwrap().unwrap();
        assert!(!target.exists());
        assert_eq!(std::fs::read_to_string(aside.join("a")).unwrap(), "1");
    }

    #[test]
    fn copy_tree_recurses() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("sub")).unwrap();
        std::fs::write(src.join("sub").join("f"), "x").unwrap();
        copy_tree(&src, &dir.path().join("dst")).unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("dst/sub/f")).unwrap(), "x");
    }
}
