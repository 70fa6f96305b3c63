//! Child process runner with captured output and a hard timeout.

use super::CommandOutput;
use crate::error::{Error, Result};
use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Spawn `command`, feed `stdin`, and wait for it to exit.
///
/// On timeout the child is killed and [`Error::Timeout`] is returned.
pub fn run(
    mut command: Command,
    stdin: Option<&str>,
    timeout: Option<Duration>,
    host: &str,
    display: &str,
) -> Result<CommandOutput> {
    command
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn()?;

    if let Some(input) = stdin
        && let Some(mut pipe) = child.stdin.take()
    {
        let input = input.to_string();
        // Writer thread so a child that never reads cannot block us.
        thread::spawn(move || {
            let _ = pipe.write_all(input.as_bytes());
        });
    }

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = match wait(&mut child, timeout)? {
        Some(code) => code,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Timeout {
                host: host.to_string(),
                command: display.to_string(),
                timeout: timeout.unwrap_or_default(),
            });
        }
    };

    Ok(CommandOutput {
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
        status,
    })
}

/// Poll the child until it exits. `None` means the timeout expired.
fn wait(child: &mut Child, timeout: Option<Duration>) -> Result<Option<i32>> {
    let Some(timeout) = timeout else {
        let status = child.wait()?;
        return Ok(Some(status.code().unwrap_or(-1)));
    };

    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status.code().unwrap_or(-1)));
        }
        if started.elapsed() >= timeout {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bash(script: &str) -> Command {
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn test_captures_stdout_and_status() {
        let out = run(bash("echo hello; echo oops >&2; exit 3"), None, None, "local", "t").unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert_eq!(out.status, 3);
    }

    #[test]
    fn test_stdin_is_delivered() {
        let out = run(bash("cat"), Some("side channel"), None, "local", "cat").unwrap();
        assert_eq!(out.stdout, "side channel");
    }

    #[test]
    fn test_timeout_kills_child() {
        let started = Instant::now();
        let err = run(
            bash("sleep 5"),
            None,
            Some(Duration::from_millis(200)),
            "local",
            "sleep 5",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
