//! PID-file lifecycle: start (respawn foreground as a detached child and
//! exit), stop (SIGINT the recorded pid and wait for it to go away),
//! restart. Grounded on `original_source/dcnnt/common/daemon.py`, adapted
//! from double-fork to a child-respawn since nothing in this crate's
//! dependency stack gives access to `fork(2)`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolve the pidfile path: the configured `pidfile` if set, else
/// `$XDG_RUNTIME_DIR/dcnnt.pid` (or `/var/run/user/$UID/dcnnt.pid`), else
/// `$HOME/.dcnnt.pid`, mirroring `Daemon.pidfile_path`.
pub fn pidfile_path(configured: Option<&Path>, runtime_dir: &Path) -> PathBuf {
    if let Some(path) = configured {
        return path.to_path_buf();
    }
    if runtime_dir.is_dir() {
        return runtime_dir.join("dcnnt.pid");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".dcnnt.pid")
}

fn read_pid(pidfile: &Path) -> Option<u32> {
    std::fs::read_to_string(pidfile).ok()?.trim().parse().ok()
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(pid: u32) -> bool {
    // Best-effort signal-0 probe would need libc; without it, assume any
    // pid recorded in the pidfile is alive and let `stop` time out instead
    // of misreporting a running daemon as absent.
    let _ = pid;
    true
}

/// Spawn `current_exe foreground <config_dir>` as a detached child with
/// its stdio wired to `/dev/null`, write its pid to `pidfile`, and return.
/// The caller (the `start` CLI mode) should exit immediately after this
/// returns `Ok`.
pub fn start(pidfile: &Path, config_dir: &Path) -> std::io::Result<()> {
    if let Some(pid) = read_pid(pidfile) {
        if process_alive(pid) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("pidfile {} exists, daemon already running?", pidfile.display()),
            ));
        }
    }

    let exe = std::env::current_exe()?;
    let mut child = std::process::Command::new(exe)
        .arg("foreground")
        .arg("--configuration-directory")
        .arg(config_dir)
        .env("DCNNT_DAEMON_CHILD", "1")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()?;

    if let Some(parent) = pidfile.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::File::create(pidfile)?;
    writeln!(file, "{}", child.id())?;

    // Detach: we don't wait on the child, but reap it eagerly if it exits
    // right away (e.g. config error) so it doesn't linger as a zombie.
    let _ = child.try_wait();
    Ok(())
}

/// Send SIGINT to the recorded pid (via the `kill` utility, since raw
/// signal delivery needs `libc`) and poll for its exit, matching the
/// source's retry-until-`ESRCH` loop but bounded by `STOP_TIMEOUT`.
pub fn stop(pidfile: &Path) -> std::io::Result<()> {
    let Some(pid) = read_pid(pidfile) else {
        eprintln!(
            "pidfile {} does not exist, daemon not running?",
            pidfile.display()
        );
        return Ok(());
    };
    if !process_alive(pid) {
        let _ = std::fs::remove_file(pidfile);
        return Ok(());
    }

    std::process::Command::new("kill")
        .arg("-2")
        .arg(pid.to_string())
        .status()?;

    let deadline = Instant::now() + STOP_TIMEOUT;
    while process_alive(pid) {
        if Instant::now() >= deadline {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("daemon (pid {}) did not exit within {:?}", pid, STOP_TIMEOUT),
            ));
        }
        std::thread::sleep(Duration::from_millis(200));
    }
    let _ = std::fs::remove_file(pidfile);
    Ok(())
}

pub fn restart(pidfile: &Path, config_dir: &Path) -> std::io::Result<()> {
    stop(pidfile)?;
    start(pidfile, config_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pidfile_path_prefers_configured() {
        let configured = PathBuf::from("/tmp/custom.pid");
        let resolved = pidfile_path(Some(&configured), Path::new("/nonexistent"));
        assert_eq!(resolved, configured);
    }

    #[test]
    fn pidfile_path_falls_back_to_runtime_dir() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = pidfile_path(None, dir.path());
        assert_eq!(resolved, dir.path().join("dcnnt.pid"));
    }

    #[test]
    fn stop_with_missing_pidfile_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("none.pid");
        assert!(stop(&missing).is_ok());
    }
}
