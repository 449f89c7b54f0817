use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use drover_harness::{CommandOutput, HarnessError, RemoteExecutor, Result};

use super::EventLog;

/// How a launched fake process ends
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessBehavior {
    /// Writes `stdout` to its output file and exits with `code`
    Exits { stdout: String, code: i32 },
    /// Never exits
    Hangs,
}

/// Scripted stand-in for a remote host
///
/// Every call is appended to the event log as `"<call> <host> <command>"`.
/// Output files are keyed by the paths found in the launch line.
pub struct FakeExecutor {
    behavior: ProcessBehavior,
    unreachable: bool,
    missing_programs: Vec<String>,
    next_pid: AtomicU32,
    files: Mutex<HashMap<String, Vec<u8>>>,
    exits: Mutex<HashMap<u32, i32>>,
    log: EventLog,
}

impl FakeExecutor {
    pub fn new(behavior: ProcessBehavior) -> Self {
        Self {
            behavior,
            unreachable: false,
            missing_programs: Vec::new(),
            next_pid: AtomicU32::new(1000),
            files: Mutex::new(HashMap::new()),
            exits: Mutex::new(HashMap::new()),
            log: EventLog::new(),
        }
    }

    /// Process printing `stdout` and exiting 0
    pub fn printing(stdout: impl Into<String>) -> Self {
        Self::new(ProcessBehavior::Exits {
            stdout: stdout.into(),
            code: 0,
        })
    }

    pub fn hanging() -> Self {
        Self::new(ProcessBehavior::Hangs)
    }

    /// Every call fails as if ssh could not reach the host
    pub fn unreachable() -> Self {
        let mut executor = Self::hanging();
        executor.unreachable = true;
        executor
    }

    pub fn with_missing_program(mut self, program: impl Into<String>) -> Self {
        self.missing_programs.push(program.into());
        self
    }

    pub fn with_log(mut self, log: EventLog) -> Self {
        self.log = log;
        self
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn launches(&self) -> Vec<String> {
        self.log
            .events()
            .into_iter()
            .filter(|e| e.starts_with("background "))
            .collect()
    }

    /// Whether a file is still present on the fake host
    pub fn has_file(&self, path: &str) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }

    fn check_reachable(&self, host: &str) -> Result<()> {
        if self.unreachable {
            return Err(HarnessError::launch(host, "ssh: connect to host: Connection refused"));
        }
        Ok(())
    }
}

/// Redirect targets in `exec <cmd> 1> <out> 2> <err>`
fn redirect_paths(line: &str) -> Option<(String, String)> {
    let (_, redirects) = line.rsplit_once(" 1> ")?;
    let (stdout, stderr) = redirects.split_once(" 2> ")?;
    Some((unquote(stdout), unquote(stderr)))
}

fn unquote(word: &str) -> String {
    word.trim().trim_matches('\'').to_string()
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
    async fn execute(&self, host: &str, command: &str) -> Result<CommandOutput> {
        self.check_reachable(host)?;
        self.log.push(format!("execute {} {}", host, command));

        if let Some(program) = command.strip_prefix("command -v ") {
            let program = unquote(program);
            let found = !self.missing_programs.contains(&program);
            return Ok(CommandOutput {
                status: Some(if found { 0 } else { 1 }),
                stdout: if found { format!("/usr/bin/{}\n", program) } else { String::new() },
                stderr: String::new(),
            });
        }

        if let Some(paths) = command.strip_prefix("rm -f ") {
            let mut files = self.files.lock().unwrap();
            for path in paths.split_whitespace() {
                files.remove(&unquote(path));
            }
        }

        Ok(CommandOutput {
            status: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn execute_background(&self, host: &str, command: &str) -> Result<u32> {
        self.check_reachable(host)?;
        self.log.push(format!("background {} {}", host, command));

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        if let Some((stdout_path, stderr_path)) = redirect_paths(command) {
            let mut files = self.files.lock().unwrap();
            let stdout = match &self.behavior {
                ProcessBehavior::Exits { stdout, .. } => stdout.clone().into_bytes(),
                ProcessBehavior::Hangs => Vec::new(),
            };
            files.insert(stdout_path, stdout);
            files.insert(stderr_path, Vec::new());
        }
        if let ProcessBehavior::Exits { code, .. } = &self.behavior {
            self.exits.lock().unwrap().insert(pid, *code);
        }
        Ok(pid)
    }

    async fn waitpid(&self, host: &str, pid: u32) -> Result<Option<i32>> {
        self.log.push(format!("waitpid {} {}", host, pid));
        let code = self.exits.lock().unwrap().get(&pid).copied();
        match code {
            Some(code) => Ok(Some(code)),
            None => std::future::pending().await,
        }
    }

    async fn read_file(&self, host: &str, path: &str) -> Result<Vec<u8>> {
        self.log.push(format!("read {} {}", host, path));
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| HarnessError::remote(host, format!("cat: {}: No such file or directory", path)))
    }
}
