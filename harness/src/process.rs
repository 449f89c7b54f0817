//! Launching external benchmark processes and waiting on them with a deadline
//!
//! The remote wait blocks for as long as the process lives, so it runs on a
//! bounded [`WaitPool`] and reports back through a oneshot channel. Waiting
//! on a [`ProcessHandle`] only races that channel against a timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{HarnessError, Result};
use crate::remote::{shell_quote, RemoteExecutor, ShellCommand};

type Completion = oneshot::Receiver<Result<Option<i32>>>;

/// Fixed-size set of workers for blocking process waits
#[derive(Clone)]
pub struct WaitPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WaitPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for `pid` on a pool worker; the receiver resolves when it exits
    fn spawn_wait(
        &self,
        executor: Arc<dyn RemoteExecutor>,
        host: String,
        pid: u32,
        completed: Arc<AtomicBool>,
    ) -> Completion {
        let (tx, rx) = oneshot::channel();
        let permits = self.permits.clone();

        tokio::spawn(async move {
            let result = match permits.acquire_owned().await {
                Ok(_permit) => {
                    let result = executor.waitpid(&host, pid).await;
                    completed.store(true, Ordering::SeqCst);
                    result
                }
                Err(_) => Err(HarnessError::remote(&host, "wait pool closed")),
            };
            // the handle may have been dropped after a timeout
            let _ = tx.send(result);
        });

        rx
    }
}

/// A launched process, owned by the session that started it
pub struct ProcessHandle {
    host: String,
    pid: u32,
    stdout_path: String,
    stderr_path: String,
    completed: Arc<AtomicBool>,
    completion: Option<Completion>,
    exit_code: Option<i32>,
    launched_at: Instant,
}

impl ProcessHandle {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn stdout_path(&self) -> &str {
        &self.stdout_path
    }

    pub fn stderr_path(&self) -> &str {
        &self.stderr_path
    }

    /// Set by the wait worker once the process has exited
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn elapsed(&self) -> Duration {
        self.launched_at.elapsed()
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("host", &self.host)
            .field("pid", &self.pid)
            .field("stdout_path", &self.stdout_path)
            .field("stderr_path", &self.stderr_path)
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// Result of waiting on a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed {
        elapsed: Duration,
        exit_code: Option<i32>,
    },
    /// The process is still running; its handle stays valid
    TimedOut { elapsed: Duration },
}

/// Launches commands through a [`RemoteExecutor`] and awaits them
#[derive(Clone)]
pub struct ExternalProcessRunner {
    executor: Arc<dyn RemoteExecutor>,
    pool: WaitPool,
}

impl ExternalProcessRunner {
    pub fn new(executor: Arc<dyn RemoteExecutor>, pool_size: usize) -> Self {
        Self {
            executor,
            pool: WaitPool::new(pool_size),
        }
    }

    pub fn executor(&self) -> &Arc<dyn RemoteExecutor> {
        &self.executor
    }

    pub fn pool(&self) -> &WaitPool {
        &self.pool
    }

    /// Start `command` detached on `host` with its output sent to the two files
    pub async fn launch(
        &self,
        host: &str,
        command: &ShellCommand,
        stdout_path: &str,
        stderr_path: &str,
    ) -> Result<ProcessHandle> {
        let lookup = format!("command -v {}", shell_quote(&command.program));
        let found = self.executor.execute(host, &lookup).await?;
        if !found.success() {
            error!("[{}] command not found: {}", host, command.program);
            return Err(HarnessError::launch(
                host,
                format!("command not found: {}", command.program),
            ));
        }

        // exec keeps the shell's pid for the benchmark process itself
        let line = format!(
            "exec {} 1> {} 2> {}",
            command.render(),
            shell_quote(stdout_path),
            shell_quote(stderr_path)
        );
        let pid = self.executor.execute_background(host, &line).await?;
        info!("[{}] launched {} as pid {}", host, command.program, pid);

        let completed = Arc::new(AtomicBool::new(false));
        let completion =
            self.pool
                .spawn_wait(self.executor.clone(), host.to_string(), pid, completed.clone());

        Ok(ProcessHandle {
            host: host.to_string(),
            pid,
            stdout_path: stdout_path.to_string(),
            stderr_path: stderr_path.to_string(),
            completed,
            completion: Some(completion),
            exit_code: None,
            launched_at: Instant::now(),
        })
    }

    /// Wait up to `timeout` for the process to exit
    pub async fn wait_for(
        &self,
        handle: &mut ProcessHandle,
        timeout: Duration,
    ) -> Result<ProcessOutcome> {
        let Some(completion) = handle.completion.as_mut() else {
            return Ok(ProcessOutcome::Completed {
                elapsed: handle.elapsed(),
                exit_code: handle.exit_code,
            });
        };

        let waited = tokio::time::timeout(timeout, completion).await;
        match waited {
            Ok(Ok(Ok(exit_code))) => {
                handle.completion = None;
                handle.exit_code = exit_code;
                let elapsed = handle.elapsed();
                info!(
                    "[{}] pid {} finished in {:?} (exit {:?})",
                    handle.host, handle.pid, elapsed, exit_code
                );
                Ok(ProcessOutcome::Completed { elapsed, exit_code })
            }
            Ok(Ok(Err(err))) => {
                handle.completion = None;
                Err(err)
            }
            Ok(Err(_)) => {
                handle.completion = None;
                Err(HarnessError::remote(&handle.host, "wait worker went away"))
            }
            Err(_) => {
                let elapsed = handle.elapsed();
                warn!(
                    "[{}] pid {} still running after {:?}; leaving it alive",
                    handle.host, handle.pid, elapsed
                );
                Ok(ProcessOutcome::TimedOut { elapsed })
            }
        }
    }

    pub async fn read_stdout(&self, handle: &ProcessHandle) -> Result<String> {
        self.read_text(&handle.host, &handle.stdout_path).await
    }

    pub async fn read_stderr(&self, handle: &ProcessHandle) -> Result<String> {
        self.read_text(&handle.host, &handle.stderr_path).await
    }

    async fn read_text(&self, host: &str, path: &str) -> Result<String> {
        let bytes = self.executor.read_file(host, path).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Remove the output files; the process itself is left untouched
    pub async fn reap(&self, handle: ProcessHandle) -> Result<()> {
        let command = format!(
            "rm -f {} {}",
            shell_quote(&handle.stdout_path),
            shell_quote(&handle.stderr_path)
        );
        let output = self.executor.execute(&handle.host, &command).await?;
        if !output.success() {
            return Err(HarnessError::remote(
                &handle.host,
                format!("could not remove output files: {}", output.stderr.trim()),
            ));
        }
        debug!("[{}] reaped output of pid {}", handle.host, handle.pid);
        Ok(())
    }
}
