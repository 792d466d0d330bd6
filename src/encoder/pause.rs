//! Pause/resume for the transcoder child.
//!
//! Two strategies sit behind one seam: hosts with stop/continue
//! signals get a hard suspend; everywhere else a degraded strategy
//! keeps the child at minimum scheduling priority and says so once.

use std::io;

pub trait SuspendStrategy: Send {
    fn pause(&mut self, pid: u32) -> io::Result<()>;
    fn resume(&mut self, pid: u32) -> io::Result<()>;
    /// Whether `pause` actually halts the child (as opposed to merely
    /// de-prioritising it).
    fn is_hard(&self) -> bool;
}

pub fn platform_strategy() -> Box<dyn SuspendStrategy> {
    #[cfg(unix)]
    {
        Box::new(SignalSuspend)
    }
    #[cfg(not(unix))]
    {
        Box::new(PriorityFloor { warned: false })
    }
}

#[cfg(unix)]
struct SignalSuspend;

#[cfg(unix)]
impl SuspendStrategy for SignalSuspend {
    fn pause(&mut self, pid: u32) -> io::Result<()> {
        signal(pid, libc::SIGSTOP)
    }

    fn resume(&mut self, pid: u32) -> io::Result<()> {
        signal(pid, libc::SIGCONT)
    }

    fn is_hard(&self) -> bool {
        true
    }
}

#[cfg(unix)]
fn signal(pid: u32, sig: libc::c_int) -> io::Result<()> {
    let result = unsafe { libc::kill(pid as libc::pid_t, sig) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
struct PriorityFloor {
    warned: bool,
}

#[cfg(not(unix))]
impl SuspendStrategy for PriorityFloor {
    fn pause(&mut self, pid: u32) -> io::Result<()> {
        if !self.warned {
            tracing::warn!(
                pid,
                "hard process suspension unavailable on this host; \
                 throttling via scheduling priority only"
            );
            self.warned = true;
        }
        Ok(())
    }

    fn resume(&mut self, _pid: u32) -> io::Result<()> {
        Ok(())
    }

    fn is_hard(&self) -> bool {
        false
    }
}

/// Lower the child's scheduling priority to the configured background
/// nice level. Best-effort; failures are logged, never fatal.
pub fn set_background_priority(pid: u32, nice_level: i32) {
    #[cfg(unix)]
    {
        let result = unsafe {
            libc::setpriority(libc::PRIO_PROCESS as _, pid as _, nice_level.clamp(-20, 19))
        };
        if result != 0 {
            tracing::debug!(
                pid,
                nice_level,
                error = %io::Error::last_os_error(),
                "could not set child priority"
            );
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, nice_level);
    }
}

/// Ask the child to terminate gracefully. A stopped child is continued
/// first so the termination request can be delivered.
pub fn request_terminate(pid: u32) {
    #[cfg(unix)]
    {
        let _ = signal(pid, libc::SIGCONT);
        let _ = signal(pid, libc::SIGTERM);
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn suspend_and_resume_a_real_child() {
        use std::process::Command;

        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        let mut strategy = platform_strategy();
        assert!(strategy.is_hard());

        strategy.pause(pid).unwrap();
        // A stopped process does not exit.
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(child.try_wait().unwrap().is_none());

        strategy.resume(pid).unwrap();
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    #[cfg(unix)]
    fn signalling_a_dead_pid_errors() {
        let mut strategy = platform_strategy();
        // PID 0 would signal our own process group; use an absurd pid.
        assert!(strategy.pause(u32::MAX - 1).is_err());
    }
}
