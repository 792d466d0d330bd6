use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

/// Captured result of a bounded subprocess run.
pub(crate) struct CapturedRun {
    pub status: ExitStatus,
    pub timed_out: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Run a command to completion with a hard deadline, capturing both
/// output streams. The child is killed when the deadline passes.
pub(crate) fn run_with_timeout(
    mut cmd: Command,
    timeout: Duration,
) -> Result<CapturedRun, std::io::Error> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn()?;

    let stdout = child.stdout.take();
    let stdout_handle = std::thread::spawn(move || drain(stdout));
    let stderr = child.stderr.take();
    let stderr_handle = std::thread::spawn(move || drain(stderr));

    let start = Instant::now();
    let mut timed_out = false;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if start.elapsed() >= timeout {
            timed_out = true;
            drop(child.kill());
            break child.wait()?;
        }
        std::thread::sleep(Duration::from_millis(10));
    };

    Ok(CapturedRun {
        status,
        timed_out,
        stdout: stdout_handle.join().unwrap_or_default(),
        stderr: stderr_handle.join().unwrap_or_default(),
    })
}

fn drain<R: Read>(reader: Option<R>) -> Vec<u8> {
    let Some(mut reader) = reader else {
        return Vec::new();
    };
    let mut captured = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => captured.extend_from_slice(&buf[..n]),
        }
    }
    captured
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn captures_output_and_exit_status() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo out; echo err >&2");
        let run = run_with_timeout(cmd, Duration::from_secs(5)).unwrap();
        assert!(run.status.success());
        assert!(!run.timed_out);
        assert_eq!(String::from_utf8_lossy(&run.stdout).trim(), "out");
        assert_eq!(String::from_utf8_lossy(&run.stderr).trim(), "err");
    }

    #[test]
    #[cfg(unix)]
    fn kills_on_deadline() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 30");
        let start = Instant::now();
        let run = run_with_timeout(cmd, Duration::from_millis(200)).unwrap();
        assert!(run.timed_out);
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}
