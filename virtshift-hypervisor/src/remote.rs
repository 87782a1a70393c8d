//! Remote execution channel.
//!
//! The migration engine never authenticates by itself; it consumes a
//! pre-authenticated per-host session. [`SshChannel`] is that session for
//! production (key-based ssh in batch mode), the mock host in
//! [`crate::mock`] is the in-process stand-in for tests.

use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::RemoteExecError;

/// Per-call behavior switches, mirroring the shell semantics the engine
/// depends on: `warn_only` downgrades a non-zero exit to a logged warning,
/// `silent` suppresses output logging for chatty queries.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOpts {
    pub silent: bool,
    pub warn_only: bool,
}

impl RunOpts {
    pub fn silent() -> Self {
        Self {
            silent: true,
            warn_only: false,
        }
    }

    pub fn warn_only() -> Self {
        Self {
            silent: false,
            warn_only: true,
        }
    }
}

/// A capability to run shell commands and move files on one named host.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// The host this channel is bound to.
    fn hostname(&self) -> &str;

    /// Execute a shell command, returning its stdout.
    async fn run(&self, cmd: &str, opts: RunOpts) -> Result<String, RemoteExecError>;

    /// Upload file contents with the given octal mode (e.g. `"0640"`).
    async fn put(&self, path: &str, data: Bytes, mode: &str) -> Result<(), RemoteExecError>;

    /// Read a remote file.
    async fn read_file(&self, path: &str) -> Result<Bytes, RemoteExecError>;
}

/// Remote execution over ssh in batch mode.
///
/// Authentication is the environment's concern (agent or host keys); a
/// password prompt is a hard failure here, never an interaction.
pub struct SshChannel {
    host: String,
    user: String,
    extra_args: Vec<String>,
}

impl SshChannel {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            extra_args: Vec::new(),
        }
    }

    /// Additional raw ssh arguments (e.g. a jump host or custom port).
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .args(&self.extra_args)
            .arg(format!("{}@{}", self.user, self.host));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    fn transport_err(&self, source: std::io::Error) -> RemoteExecError {
        RemoteExecError::Transport {
            host: self.host.clone(),
            source,
        }
    }
}

#[async_trait]
impl RemoteExec for SshChannel {
    fn hostname(&self) -> &str {
        &self.host
    }

    async fn run(&self, cmd: &str, opts: RunOpts) -> Result<String, RemoteExecError> {
        debug!(host = %self.host, command = %cmd, "Executing remote command");

        let output = self
            .command()
            .arg("--")
            .arg(cmd)
            .output()
            .await
            .map_err(|e| self.transport_err(e))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let status = output.status.code().unwrap_or(-1);
            if opts.warn_only {
                warn!(
                    host = %self.host,
                    command = %cmd,
                    status,
                    stderr = %stderr,
                    "Remote command failed, continuing"
                );
                return Ok(stdout);
            }
            return Err(RemoteExecError::CommandFailed {
                host: self.host.clone(),
                cmd: cmd.to_string(),
                status,
                stderr,
            });
        }

        if !opts.silent {
            debug!(host = %self.host, output = %stdout.trim_end(), "Remote command finished");
        }
        Ok(stdout)
    }

    async fn put(&self, path: &str, data: Bytes, mode: &str) -> Result<(), RemoteExecError> {
        debug!(host = %self.host, path = %path, bytes = data.len(), "Uploading file");

        let mut cmd = self.command();
        cmd.stdin(Stdio::piped());
        let mut child = cmd
            .arg("--")
            .arg(format!("cat > {path} && chmod {mode} {path}"))
            .spawn()
            .map_err(|e| self.transport_err(e))?;

        let mut stdin = child.stdin.take().ok_or_else(|| RemoteExecError::Channel {
            host: self.host.clone(),
            reason: "no stdin pipe".to_string(),
        })?;
        stdin
            .write_all(&data)
            .await
            .map_err(|e| self.transport_err(e))?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| self.transport_err(e))?;
        if !output.status.success() {
            return Err(RemoteExecError::TransferFailed {
                host: self.host.clone(),
                path: path.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Bytes, RemoteExecError> {
        let output = self
            .command()
            .arg("--")
            .arg(format!("cat {path}"))
            .output()
            .await
            .map_err(|e| self.transport_err(e))?;

        if !output.status.success() {
            return Err(RemoteExecError::TransferFailed {
                host: self.host.clone(),
                path: path.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(Bytes::from(output.stdout))
    }
}
