//! Child process with its own process group and a wall-clock deadline.

use std::io;
use std::process::{Child, Command, ExitStatus};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

#[cfg(unix)]
pub fn start_in_own_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    unsafe {
        cmd.pre_exec(|| {
            if libc::setpgid(0, 0) == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
pub fn start_in_own_group(_cmd: &mut Command) {}

/// SIGKILL the whole group led by `pid`. Already-gone groups are fine.
#[cfg(unix)]
pub fn kill_group(pid: u32) -> io::Result<()> {
    let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if rc == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn kill_group(_pid: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
pub fn is_running(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
pub fn is_running(_pid: u32) -> bool {
    false
}

#[derive(Debug)]
pub enum Waited {
    Exited(ExitStatus),
    /// Deadline hit; the group was killed and the child reaped.
    Killed,
}

/// Poll `try_wait` until the child exits or `deadline` elapses.
pub fn wait_with_deadline(child: &mut Child, deadline: Duration, poll: Duration) -> io::Result<Waited> {
    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            debug!(pid = child.id(), ?status, elapsed_ms = started.elapsed().as_millis() as u64, "child exited");
            return Ok(Waited::Exited(status));
        }
        if started.elapsed() >= deadline {
            break;
        }
        std::thread::sleep(poll.min(deadline.saturating_sub(started.elapsed())).max(Duration::from_millis(1)));
    }

    let pid = child.id();
    warn!(pid, deadline_s = deadline.as_secs_f64(), "deadline exceeded, killing process group");
    kill_group(pid)?;
    // the group kill already covers the child; this only matters if setpgid never ran
    if let Err(e) = child.kill() {
        debug!(pid, error = %e, "direct kill after group kill");
    }
    child.wait()?;
    if is_running(pid) {
        return Err(io::Error::new(io::ErrorKind::Other, format!("process {pid} survived SIGKILL")));
    }
    Ok(Waited::Killed)
}
