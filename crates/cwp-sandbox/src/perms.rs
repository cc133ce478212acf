//! Permission boundary around a run directory.
//!
//! Before the run the directory belongs to the execution group with mode `2770`, so files the
//! sandboxed process creates inherit that group and nobody else can look in. Afterwards it is
//! closed down to `0700` so the next job cannot read this one's leftovers.

use std::path::Path;

use cwp_core::EngineError;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

pub const OPEN_MODE: u32 = 0o2770;
pub const PRIVATE_MODE: u32 = 0o700;
pub const WRITABLE_INPUT_MODE: u32 = 0o664;

fn boundary_err(path: &Path, reason: impl Into<String>) -> EngineError {
    EngineError::PermissionBoundary { path: path.to_path_buf(), reason: reason.into() }
}

#[cfg(unix)]
pub fn lookup_group(name: &str) -> Result<u32, EngineError> {
    let cname = std::ffi::CString::new(name)
        .map_err(|_| boundary_err(Path::new(name), "group name contains a NUL byte"))?;
    let gr = unsafe { libc::getgrnam(cname.as_ptr()) };
    if gr.is_null() {
        return Err(boundary_err(Path::new(name), format!("unknown group {name:?}")));
    }
    Ok(unsafe { (*gr).gr_gid })
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), EngineError> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| boundary_err(path, format!("chmod {mode:o}: {e}")))
}

/// Hand the directory and everything already in it to `gid`.
#[cfg(unix)]
pub fn open_for_group(dir: &Path, gid: Option<u32>) -> Result<(), EngineError> {
    let Some(gid) = gid else {
        return set_mode(dir, PRIVATE_MODE);
    };
    std::os::unix::fs::chown(dir, None, Some(gid))
        .map_err(|e| boundary_err(dir, format!("chgrp {gid}: {e} (is this account a member of the group?)")))?;
    set_mode(dir, OPEN_MODE)?;
    let entries = std::fs::read_dir(dir).map_err(|e| boundary_err(dir, e.to_string()))?;
    for entry in entries {
        let path = entry.map_err(|e| boundary_err(dir, e.to_string()))?.path();
        std::os::unix::fs::chown(&path, None, Some(gid)).map_err(|e| boundary_err(&path, format!("chgrp {gid}: {e}")))?;
    }
    Ok(())
}

#[cfg(unix)]
pub fn make_group_writable(path: &Path) -> Result<(), EngineError> {
    set_mode(path, WRITABLE_INPUT_MODE)
}

#[cfg(unix)]
pub fn close_down(dir: &Path) -> Result<(), EngineError> {
    set_mode(dir, PRIVATE_MODE)
}

#[cfg(not(unix))]
pub fn lookup_group(name: &str) -> Result<u32, EngineError> {
    Err(boundary_err(Path::new(name), "execution groups need a unix host"))
}

#[cfg(not(unix))]
pub fn open_for_group(dir: &Path, gid: Option<u32>) -> Result<(), EngineError> {
    match gid {
        None => Ok(()),
        Some(_) => Err(boundary_err(dir, "execution groups need a unix host")),
    }
}

#[cfg(not(unix))]
pub fn make_group_writable(_path: &Path) -> Result<(), EngineError> {
    Ok(())
}

#[cfg(not(unix))]
pub fn close_down(_dir: &Path) -> Result<(), EngineError> {
    Ok(())
}
