//! Host sessions: `ssh` for real runs, a logging stand-in for `--dry-run`

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use stepflow::{CommandOutput, Error, HostSession, Result};

use crate::ui;

/// Exit status ssh uses for its own failures (connection, auth, ...)
const SSH_FAILURE: i32 = 255;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Runs commands through the system `ssh` client in batch mode
#[derive(Debug, Clone)]
pub struct SshSession {
    user: Option<String>,
    connect_timeout_secs: u64,
}

impl SshSession {
    pub fn new(user: Option<String>) -> Self {
        Self {
            user,
            connect_timeout_secs: 15,
        }
    }

    fn destination(&self, host: &str) -> String {
        match &self.user {
            Some(user) => format!("{user}@{host}"),
            None => host.to_string(),
        }
    }

    fn command(&self, host: &str, command: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(["-o", "BatchMode=yes"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout_secs))
            .arg(self.destination(host))
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

fn drain(pipe: Option<impl Read + Send + 'static>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut buf);
        }
        buf
    })
}

/// Wait for `child`, killing it once `timeout` has passed
fn wait_with_timeout(child: &mut Child, timeout: Duration) -> std::io::Result<Option<i32>> {
    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status.code().unwrap_or(-1)));
        }
        if started.elapsed() >= timeout {
            child.kill()?;
            child.wait()?;
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

impl HostSession for SshSession {
    fn run(&self, host: &str, command: &str, timeout: Duration) -> Result<CommandOutput> {
        log::debug!("ssh {}: {}", host, command);
        let mut child = self
            .command(host, command)
            .spawn()
            .map_err(|e| Error::HostUnreachable {
                host: host.to_string(),
                message: format!("could not start ssh: {e}"),
            })?;

        // drain both pipes so a chatty command cannot block on a full pipe
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let status = wait_with_timeout(&mut child, timeout)?;
        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        match status {
            None => Err(Error::Timeout {
                host: host.to_string(),
                command: command.to_string(),
                timeout,
            }),
            Some(SSH_FAILURE) => Err(Error::HostUnreachable {
                host: host.to_string(),
                message: stderr.trim().to_string(),
            }),
            Some(exit_code) => Ok(CommandOutput {
                exit_code,
                stdout,
                stderr,
            }),
        }
    }
}

/// Prints each command instead of running it and reports success
#[derive(Debug, Default)]
pub struct DryRunSession {
    quiet: bool,
}

impl DryRunSession {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }
}

impl HostSession for DryRunSession {
    fn run(&self, host: &str, command: &str, _timeout: Duration) -> Result<CommandOutput> {
        log::info!("[dry-run] {}: {}", host, command);
        if !self.quiet {
            ui::dim(&format!("{host}: {command}"));
        }
        Ok(CommandOutput::ok(""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination() {
        assert_eq!(SshSession::new(None).destination("vm01"), "vm01");
        assert_eq!(
            SshSession::new(Some("opc".into())).destination("vm01"),
            "opc@vm01"
        );
    }

    #[test]
    fn test_ssh_arguments() {
        let session = SshSession::new(Some("opc".into()));
        let cmd = session.command("kvm01", "uptime");
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec!["-o", "BatchMode=yes", "-o", "ConnectTimeout=15", "opc@kvm01", "uptime"]
        );
    }

    #[test]
    fn test_wait_with_timeout_kills() {
        let mut child = Command::new("sleep").arg("5").spawn().unwrap();
        let status = wait_with_timeout(&mut child, Duration::from_millis(200)).unwrap();
        assert!(status.is_none());
    }

    #[test]
    fn test_wait_with_timeout_exit_code() {
        let mut child = Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
        let status = wait_with_timeout(&mut child, Duration::from_secs(5)).unwrap();
        assert_eq!(status, Some(3));
    }

    #[test]
    fn test_dry_run_succeeds() {
        let session = DryRunSession::new(true);
        let output = session.run("vm01", "rm -rf /u01", Duration::from_secs(1)).unwrap();
        assert!(output.success());
    }
}
