//! Timeout-bound external command execution, used by plugins that shell
//! out to clipboard tools and must not block a session thread forever.

use std::io::Write;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

pub struct TimedOut;

/// Run `sh -c cmd`, optionally piping `input` to stdin, killing it if it
/// hasn't exited within `timeout`. Returns the captured stdout on success.
pub fn run_with_timeout(
    cmd: &str,
    input: Option<&[u8]>,
    timeout: Duration,
) -> std::io::Result<Result<Vec<u8>, TimedOut>> {
    let mut command = Command::new("sh");
    command.arg("-c").arg(cmd);
    command.stdout(Stdio::piped());
    command.stderr(Stdio::null());
    if input.is_some() {
        command.stdin(Stdio::piped());
    } else {
        command.stdin(Stdio::null());
    }
    let mut child: Child = command.spawn()?;
    if let Some(data) = input {
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(data);
        }
    }

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait()? {
            Some(_) => {
                let mut stdout = Vec::new();
                if let Some(mut pipe) = child.stdout.take() {
                    use std::io::Read;
                    let _ = pipe.read_to_end(&mut stdout);
                }
                return Ok(Ok(stdout));
            }
            None if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(Err(TimedOut));
            }
            None => std::thread::sleep(Duration::from_millis(20)),
        }
    }
}
