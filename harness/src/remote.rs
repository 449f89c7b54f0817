//! Remote command execution collaborators
//!
//! The core never talks to a host directly; it goes through a
//! [`RemoteExecutor`]. [`LocalExecutor`] runs commands through the local shell
//! and [`SshExecutor`] forwards them over `ssh`.

use std::collections::HashMap;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{HarnessError, Result};
use crate::poll::{retry_transient, PollSchedule};

/// Captured result of a foreground command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Capability to run commands on a host
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run a command to completion and capture its output
    async fn execute(&self, host: &str, command: &str) -> Result<CommandOutput>;

    /// Start a detached command and return its pid
    async fn execute_background(&self, host: &str, command: &str) -> Result<u32>;

    /// Block until the process exits; yields the exit code when known
    async fn waitpid(&self, host: &str, pid: u32) -> Result<Option<i32>>;

    async fn read_file(&self, host: &str, path: &str) -> Result<Vec<u8>>;
}

/// A program invocation rendered to a shell command line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ShellCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Shell form; environment is passed through `env` so the result can
    /// follow `exec`
    pub fn render(&self) -> String {
        let mut parts = Vec::with_capacity(self.env.len() + self.args.len() + 2);
        if !self.env.is_empty() {
            parts.push("env".to_string());
            for (key, value) in &self.env {
                parts.push(format!("{}={}", key, shell_quote(value)));
            }
        }
        parts.push(shell_quote(&self.program));
        parts.extend(self.args.iter().map(|arg| shell_quote(arg)));
        parts.join(" ")
    }
}

impl fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Quote a word for POSIX `sh`; plain words are left as they are
pub fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,@%+".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

fn capture(output: std::process::Output) -> CommandOutput {
    CommandOutput {
        status: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    }
}

/// Runs commands on this machine through `sh -c`
#[derive(Default)]
pub struct LocalExecutor {
    children: Mutex<HashMap<u32, Child>>,
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RemoteExecutor for LocalExecutor {
    async fn execute(&self, host: &str, command: &str) -> Result<CommandOutput> {
        debug!("[{}] sh -c {}", host, command);
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| HarnessError::launch(host, format!("sh: {}", e)))?;
        Ok(capture(output))
    }

    async fn execute_background(&self, host: &str, command: &str) -> Result<u32> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| HarnessError::launch(host, format!("sh: {}", e)))?;

        let pid = child
            .id()
            .ok_or_else(|| HarnessError::launch(host, "process exited before a pid was assigned"))?;
        info!("[{}] started background process {}", host, pid);
        self.children.lock().await.insert(pid, child);
        Ok(pid)
    }

    async fn waitpid(&self, host: &str, pid: u32) -> Result<Option<i32>> {
        let child = self.children.lock().await.remove(&pid);
        let mut child =
            child.ok_or_else(|| HarnessError::remote(host, format!("no tracked process {}", pid)))?;
        let status = child.wait().await?;
        debug!("[{}] process {} exited with {}", host, pid, status);
        Ok(status.code())
    }

    async fn read_file(&self, _host: &str, path: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(path).await?)
    }
}

/// `ssh` reports connection problems with this exit code
const SSH_UNREACHABLE: i32 = 255;

/// Runs commands on another machine over `ssh`
///
/// An unreachable host is a launch failure while a process is being started.
/// Once it runs, connection drops are retried with backoff and, when the host
/// stays away, reported as a remote failure of the run.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    program: String,
    ssh_options: Vec<String>,
    liveness_interval: Duration,
    reconnect: PollSchedule,
}

impl Default for SshExecutor {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            ssh_options: vec!["-o".to_string(), "BatchMode=yes".to_string()],
            liveness_interval: Duration::from_secs(1),
            reconnect: PollSchedule::new(Duration::from_secs(1), Duration::MAX).with_retries(
                5,
                Duration::from_millis(500),
                Duration::from_secs(8),
            ),
        }
    }
}

impl SshExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client binary, `ssh` from `PATH` by default
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_option(mut self, option: impl Into<String>) -> Self {
        self.ssh_options.push("-o".to_string());
        self.ssh_options.push(option.into());
        self
    }

    /// How often `waitpid` checks whether the remote process is still alive
    pub fn with_liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval;
        self
    }

    /// Reconnect attempts for a host lost while a process runs
    pub fn with_reconnect(mut self, retries: u32, base: Duration, max: Duration) -> Self {
        self.reconnect = self.reconnect.with_retries(retries, base, max);
        self
    }

    async fn ssh(&self, host: &str, command: &str) -> Result<CommandOutput> {
        debug!("{} {} {}", self.program, host, command);
        let output = Command::new(&self.program)
            .args(&self.ssh_options)
            .arg(host)
            .arg(command)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| HarnessError::launch(host, format!("{}: {}", self.program, e)))?;
        Ok(capture(output))
    }

    /// Used before anything runs on the host
    async fn ssh_launching(&self, host: &str, command: &str) -> Result<CommandOutput> {
        let output = self.ssh(host, command).await?;
        if output.status == Some(SSH_UNREACHABLE) {
            return Err(HarnessError::launch(
                host,
                format!("host unreachable: {}", output.stderr.trim()),
            ));
        }
        Ok(output)
    }

    /// Used while a started process is observed
    async fn ssh_running(&self, host: &str, command: &str) -> Result<CommandOutput> {
        let attempt = move || async move {
            let output = self.ssh(host, command).await?;
            if output.status == Some(SSH_UNREACHABLE) {
                return Err(HarnessError::transient(format!(
                    "connection lost: {}",
                    output.stderr.trim()
                )));
            }
            Ok::<_, HarnessError>(output)
        };
        retry_transient(&self.reconnect, attempt)
            .await
            .map_err(|e| match e {
                HarnessError::TransientPoll { reason } => HarnessError::remote(host, reason),
                other => other,
            })
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(&self, host: &str, command: &str) -> Result<CommandOutput> {
        self.ssh_launching(host, command).await
    }

    async fn execute_background(&self, host: &str, command: &str) -> Result<u32> {
        let detached = format!(
            "nohup sh -c {} </dev/null >/dev/null 2>&1 & echo $!",
            shell_quote(command)
        );
        let output = self.ssh_launching(host, &detached).await?;
        if !output.success() {
            return Err(HarnessError::launch(host, output.stderr.trim().to_string()));
        }
        let pid = output.stdout.trim().parse().map_err(|_| {
            HarnessError::launch(host, format!("unexpected pid output {:?}", output.stdout))
        })?;
        info!("[{}] started background process {}", host, pid);
        Ok(pid)
    }

    async fn waitpid(&self, host: &str, pid: u32) -> Result<Option<i32>> {
        let liveness = format!("kill -0 {}", pid);
        loop {
            let output = self.ssh_running(host, &liveness).await?;
            if !output.success() {
                debug!("[{}] process {} is gone", host, pid);
                // exit status of a non-child is not observable remotely
                return Ok(None);
            }
            tokio::time::sleep(self.liveness_interval).await;
        }
    }

    async fn read_file(&self, host: &str, path: &str) -> Result<Vec<u8>> {
        let output = self
            .ssh_running(host, &format!("cat {}", shell_quote(path)))
            .await?;
        if !output.success() {
            return Err(HarnessError::remote(
                host,
                format!("cannot read {}: {}", path, output.stderr.trim()),
            ));
        }
        Ok(output.stdout.into_bytes())
    }
}
