use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use cwp_core::{collision_suffix, Archive, ArchiveReceipt, EngineError, ItemId, WorkItem};
use tracing::{debug, info, warn};

use crate::counter::Counter;
use crate::traits::QueueBackend;

pub const COUNTER_FILE: &str = ".maxid";
const ID_WIDTH: usize = 10;

/// Directory-backed queue.
///
/// Layout: `<dir>/.maxid` (counter), `<dir>/<prefix><id:010>-<discriminator>` (pending),
/// `<dir>/processed/`, `<dir>/rejected/`. State transitions are single `rename(2)` calls that
/// never replace an existing archive entry.
#[derive(Clone, Debug)]
pub struct FsQueue {
    name: String,
    dir: PathBuf,
    prefix: char,
    counter: Counter,
}

impl FsQueue {
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>, prefix: char) -> Self {
        let dir = dir.into();
        let counter = Counter::new(dir.join(COUNTER_FILE));
        Self { name: name.into(), dir, prefix, counter }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn archive_dir(&self, archive: Archive) -> PathBuf {
        self.dir.join(archive.dir_name())
    }

    pub fn item_path(&self, item: &WorkItem) -> PathBuf {
        self.dir.join(&item.key)
    }

    pub fn file_name(&self, id: ItemId, discriminator: &str) -> String {
        format!("{}{:0width$}-{}", self.prefix, id.get(), sanitize_component(discriminator), width = ID_WIDTH)
    }

    fn ensure_dir(&self) -> Result<()> {
        if !self.dir.exists() {
            info!(queue = %self.name, dir = %self.dir.display(), "queue directory not found, creating it");
            std::fs::create_dir_all(&self.dir).with_context(|| format!("create queue dir {}", self.dir.display()))?;
        }
        Ok(())
    }

    fn parse_name(&self, file_name: &str) -> Option<(ItemId, String)> {
        let rest = file_name.strip_prefix(self.prefix)?;
        let digits = rest.get(..ID_WIDTH)?;
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let id = digits.parse::<u64>().ok()?;
        let disc = rest[ID_WIDTH..].strip_prefix('-').unwrap_or(&rest[ID_WIDTH..]);
        Some((ItemId(id), disc.to_string()))
    }

    fn scan(&self, dir: &Path) -> Result<Vec<WorkItem>> {
        let mut items = vec![];
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(items),
            Err(e) => return Err(e).with_context(|| format!("list {}", dir.display())),
        };
        for entry in entries {
            let entry = entry.with_context(|| format!("list {}", dir.display()))?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().to_string();
            let Some((id, discriminator)) = self.parse_name(&file_name) else {
                continue;
            };
            let created_at_unix = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            items.push(WorkItem { id, queue_name: self.name.clone(), discriminator, key: file_name, created_at_unix });
        }
        items.sort_by_key(|i| i.id);
        Ok(items)
    }

    /// Look for an earlier archival of `key`, including copies set aside under a suffix.
    fn find_archived(&self, key: &str) -> Option<(Archive, PathBuf)> {
        for archive in [Archive::Processed, Archive::Rejected] {
            let dir = self.archive_dir(archive);
            let exact = dir.join(key);
            if exact.exists() {
                return Some((archive, exact));
            }
            let suffixed = format!("{key}.");
            if let Ok(entries) = std::fs::read_dir(&dir) {
                for entry in entries.flatten() {
                    if entry.file_name().to_string_lossy().starts_with(&suffixed) {
                        return Some((archive, entry.path()));
                    }
                }
            }
        }
        None
    }
}

impl QueueBackend for FsQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn push(&self, discriminator: &str, payload: &[u8]) -> Result<ItemId> {
        self.ensure_dir()?;
        let id = ItemId(self.counter.next_id()?);
        let file_name = self.file_name(id, discriminator);
        let path = self.dir.join(&file_name);
        if path.exists() {
            return Err(EngineError::DuplicateItem(path.display().to_string()).into());
        }

        // Stage under a dot-name (never listed), then publish with link(2), which refuses to
        // replace an existing entry. Consumers therefore never see a half-written payload.
        let staging = self.dir.join(format!(".{file_name}.partial"));
        std::fs::write(&staging, payload).with_context(|| format!("write {}", staging.display()))?;
        let published = std::fs::hard_link(&staging, &path);
        std::fs::remove_file(&staging).ok();
        match published {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(EngineError::DuplicateItem(path.display().to_string()).into());
            }
            Err(e) => return Err(e).with_context(|| format!("publish {}", path.display())),
        }

        info!(queue = %self.name, id = id.get(), entry = %file_name, "enqueued");
        Ok(id)
    }

    fn list_pending(&self) -> Result<Vec<WorkItem>> {
        self.ensure_dir()?;
        self.scan(&self.dir)
    }

    fn read(&self, item: &WorkItem) -> Result<Vec<u8>> {
        let path = self.item_path(item);
        std::fs::read(&path).with_context(|| format!("read queue item {}", path.display()))
    }

    fn archive(&self, item: &WorkItem, archive: Archive) -> Result<ArchiveReceipt> {
        let source = self.item_path(item);
        if !source.exists() {
            if let Some((found_in, location)) = self.find_archived(&item.key) {
                debug!(queue = %self.name, entry = %item.key, "already archived, nothing to do");
                return Ok(ArchiveReceipt {
                    archive: found_in,
                    location: location.display().to_string(),
                    already_archived: true,
                });
            }
            return Err(EngineError::ItemNotFound(item.key.clone()).into());
        }

        let dest_dir = self.archive_dir(archive);
        if !dest_dir.exists() {
            info!(queue = %self.name, dir = %dest_dir.display(), "archive directory not found, creating it");
            std::fs::create_dir_all(&dest_dir).with_context(|| format!("create {}", dest_dir.display()))?;
        }

        let mut dest = dest_dir.join(&item.key);
        loop {
            match rename_no_replace(&source, &dest) {
                Ok(()) => break,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let aside = dest_dir.join(format!("{}.{}", item.key, collision_suffix()));
                    warn!(
                        queue = %self.name,
                        entry = %item.key,
                        renamed = %aside.display(),
                        "archive already holds an entry with this name, keeping both"
                    );
                    dest = aside;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("rename {} -> {}", source.display(), dest.display()))
                }
            }
        }
        info!(queue = %self.name, entry = %item.key, archive = archive.as_str(), "archived");
        Ok(ArchiveReceipt { archive, location: dest.display().to_string(), already_archived: false })
    }

    fn list_archived(&self, archive: Archive) -> Result<Vec<WorkItem>> {
        self.scan(&self.archive_dir(archive))
    }
}

/// `rename(2)` that fails with `AlreadyExists` instead of replacing `to`.
///
/// Linux uses `renameat2(RENAME_NOREPLACE)`, which is atomic. Filesystems without it (older
/// NFS) fall back to check-then-rename, which is only safe with a single consumer per queue;
/// the pipeline lock provides that.
pub(crate) fn rename_no_replace(from: &Path, to: &Path) -> std::io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        const RENAME_NOREPLACE: libc::c_uint = 1;
        let c_from = CString::new(from.as_os_str().as_bytes())?;
        let c_to = CString::new(to.as_os_str().as_bytes())?;
        // SAFETY: both paths are valid NUL-terminated strings for the duration of the call.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_renameat2,
                libc::AT_FDCWD,
                c_from.as_ptr(),
                libc::AT_FDCWD,
                c_to.as_ptr(),
                RENAME_NOREPLACE,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINVAL) | Some(libc::ENOSYS) => {
                debug!(to = %to.display(), "renameat2 unsupported here, falling back to rename");
            }
            _ => return Err(err),
        }
    }

    if to.exists() {
        return Err(std::io::Error::new(ErrorKind::AlreadyExists, format!("{} exists", to.display())));
    }
    std::fs::rename(from, to)
}

/// Directory-safe component: path separators and whitespace become `_`.
pub fn sanitize_component(s: &str) -> String {
    let cleaned: String =
        s.chars().map(|c| if c == '/' || c == '\\' || c.is_whitespace() || c == ':' { '_' } else { c }).collect();
    if cleaned.is_empty() {
        "item".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn names_embed_padded_id() {
        let q = FsQueue::new("mail", "/tmp/q", 'm');
        assert_eq!(q.file_name(ItemId(7), "a@b.org"), "m0000000007-a@b.org");
        assert_eq!(q.file_name(ItemId(7), "x/y z"), "m0000000007-x_y_z");
        assert_eq!(q.parse_name("m0000000007-a@b.org"), Some((ItemId(7), "a@b.org".to_string())));
        assert_eq!(q.parse_name("s0000000007-lab1"), None);
        assert_eq!(q.parse_name(".maxid"), None);
    }

    #[test]
    fn listing_skips_counter_archives_and_staging() {
        let dir = tempdir().unwrap();
        let q = FsQueue::new("mail", dir.path(), 'm');
        q.push("a@b.org", b"hello").unwrap();
        std::fs::write(dir.path().join(".m0000000099-x.partial"), b"x").unwrap();
        std::fs::create_dir_all(dir.path().join("processed")).unwrap();
        std::fs::write(dir.path().join("processed").join("m0000000050-old"), b"x").unwrap();
        std::fs::write(dir.path().join("README"), b"x").unwrap();

        let pending = q.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, ItemId(1));
        assert_eq!(pending[0].discriminator, "a@b.org");
    }

    #[test]
    fn collision_in_archive_keeps_both_files() {
        let dir = tempdir().unwrap();
        let q = FsQueue::new("mail", dir.path(), 'm');
        q.push("a", b"new").unwrap();
        let item = q.list_pending().unwrap().remove(0);
        let processed = dir.path().join("processed");
        std::fs::create_dir_all(&processed).unwrap();
        std::fs::write(processed.join(&item.key), b"old").unwrap();

        let receipt = q.archive(&item, Archive::Processed).unwrap();
        assert!(!receipt.already_archived);
        assert_eq!(std::fs::read(processed.join(&item.key)).unwrap(), b"old");
        assert_eq!(std::fs::read(&receipt.location).unwrap(), b"new");
        assert_eq!(std::fs::read_dir(&processed).unwrap().count(), 2);
    }

    #[test]
    fn rename_no_replace_refuses_to_clobber() {
        let dir = tempdir().unwrap();
        let (a, b) = (dir.path().join("a"), dir.path().join("b"));
        std::fs::write(&a, b"new").unwrap();
        std::fs::write(&b, b"old").unwrap();

        let err = rename_no_replace(&a, &b).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(std::fs::read(&a).unwrap(), b"new");
        assert_eq!(std::fs::read(&b).unwrap(), b"old");

        let c = dir.path().join("c");
        rename_no_replace(&a, &c).unwrap();
        assert!(!a.exists());
        assert_eq!(std::fs::read(&c).unwrap(), b"new");
    }

    #[test]
    fn archiving_unknown_item_fails() {
        let dir = tempdir().unwrap();
        let q = FsQueue::new("mail", dir.path(), 'm');
        let ghost = WorkItem {
            id: ItemId(9),
            queue_name: "mail".into(),
            discriminator: "x".into(),
            key: "m0000000009-x".into(),
            created_at_unix: 0,
        };
        let err = q.archive(&ghost, Archive::Rejected).unwrap_err();
        assert!(matches!(err.downcast_ref::<EngineError>(), Some(EngineError::ItemNotFound(_))));
    }
}
