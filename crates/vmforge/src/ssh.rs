//! Remote shell sessions for post-boot provisioning.
//!
//! Sessions ride the system `ssh` client against `localhost` on the guest's
//! forwarded shell port. When the resolved credentials require a password,
//! `sshpass` wraps the invocation; otherwise plain `ssh` is used. Host-key
//! checking is disabled since every session targets a throwaway localhost
//! forward whose key changes with each reinstall.

use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::Auth;
use crate::errors::Error;

/// How long to keep probing for the guest shell before giving up.
pub const READY_TIMEOUT: Duration = Duration::from_secs(180);

/// Delay between readiness probes.
const READY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Per-attempt connection timeout handed to the ssh client.
const CONNECT_TIMEOUT_SECS: u32 = 5;

/// A provisioning shell session against one booted guest.
#[derive(Debug, Clone)]
pub struct ShellSession {
    port: u16,
    auth: Auth,
    ready_timeout: Duration,
}

impl ShellSession {
    pub fn new(port: u16, auth: Auth) -> Self {
        ShellSession {
            port,
            auth,
            ready_timeout: READY_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Build the client invocation for one remote command. `quiet` drops
    /// the client's own chatter, used while probing readiness.
    fn command(&self, remote: &str, quiet: bool) -> Command {
        let mut cmd = if self.auth.required {
            let mut cmd = Command::new("sshpass");
            cmd.args(["-p", &self.auth.password, "ssh"]);
            cmd
        } else {
            Command::new("ssh")
        };

        cmd.args(["-p", &self.port.to_string()]);
        cmd.args(["-o", "StrictHostKeyChecking=no"]);
        cmd.args(["-o", "UserKnownHostsFile=/dev/null"]);
        cmd.args(["-o", &format!("ConnectTimeout={CONNECT_TIMEOUT_SECS}")]);
        if quiet {
            cmd.args(["-o", "LogLevel=ERROR"]);
        }

        if self.auth.required && !self.auth.user.is_empty() {
            cmd.arg(format!("{}@localhost", self.auth.user));
        } else {
            cmd.arg("localhost");
        }
        cmd.arg(remote);
        cmd
    }

    /// Poll until the guest shell answers a trivial command, or time out.
    /// Returns how long readiness took.
    pub fn wait_ready(&self) -> Result<Duration, Error> {
        let start = Instant::now();
        loop {
            if self.probe() {
                let elapsed = start.elapsed();
                debug!("shell on localhost:{} ready after {elapsed:?}", self.port);
                return Ok(elapsed);
            }
            if start.elapsed() >= self.ready_timeout {
                return Err(Error::ShellConnect(format!(
                    "shell on localhost:{} not reachable after {}s",
                    self.port,
                    self.ready_timeout.as_secs()
                )));
            }
            std::thread::sleep(READY_POLL_INTERVAL);
        }
    }

    fn probe(&self) -> bool {
        self.command("true", true)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    /// Run one provisioning command verbatim on the guest, streaming its
    /// output to the operator. The exit status is returned for the caller's
    /// failure policy to judge.
    pub fn exec(&self, command_text: &str) -> Result<ExitStatus, Error> {
        debug!("remote exec on localhost:{}: {command_text}", self.port);
        self.command(command_text, false)
            .stdin(Stdio::null())
            .status()
            .map_err(|err| {
                Error::ShellConnect(format!(
                    "failed to start shell client for localhost:{}: {err}",
                    self.port
                ))
            })
    }
}
