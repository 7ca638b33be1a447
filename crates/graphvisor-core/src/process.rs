use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::process::ExitStatus;
use tokio::io::AsyncRead;

/// Operating system identifier of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId {
    fn from(pid: u32) -> Self {
        ProcessId(pid)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of a process termination operation
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Process was successfully terminated
    Success,
    /// Process was not found (already exited)
    ProcessNotFound,
    /// Permission denied (insufficient privileges)
    PermissionDenied,
    /// Operation failed with specific error message
    Failed(String),
}

impl TerminationResult {
    /// Whether the process is gone afterwards
    pub fn is_gone(&self) -> bool {
        matches!(self, TerminationResult::Success | TerminationResult::ProcessNotFound)
    }
}

pub type OutputPipe = Box<dyn AsyncRead + Send + Unpin>;

/// The two output pipes of a spawned process
pub struct OutputPipes {
    pub stdout: OutputPipe,
    pub stderr: OutputPipe,
}

impl fmt::Debug for OutputPipes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OutputPipes")
    }
}

/// Core trait for process lifecycle management
#[async_trait]
pub trait ProcessLifecycle: Send + Sync {
    /// The type of process handle this lifecycle manager produces
    type Handle: ProcessHandle + 'static;

    /// Spawn a new process in its own process group with piped stdout and stderr
    async fn spawn_process(
        &self,
        command: &str,
        args: &[String],
        working_dir: Option<&Path>,
        env: &HashMap<String, String>,
    ) -> Result<Self::Handle>;
}

/// Trait for killing a process and everything it started
#[async_trait]
pub trait ProcessTermination: Send + Sync {
    /// Force kill a single process (SIGKILL on Unix)
    async fn force_kill(&self, handle: &mut dyn ProcessHandle) -> TerminationResult;

    /// Find all child processes of a given process
    async fn find_child_processes(&self, pid: ProcessId) -> Result<Vec<ProcessId>>;

    /// Kill an entire process tree (parent and all descendants)
    async fn terminate_process_tree(&self, root_pid: ProcessId) -> TerminationResult;

    /// Kill the process group led by `pid`
    async fn terminate_process_group(&self, pid: ProcessId) -> TerminationResult;

    /// Synchronous group kill for use where no runtime can be awaited (drop paths)
    fn kill_process_group_now(&self, pid: ProcessId) -> TerminationResult;

    /// Complete termination strategy: process group -> process tree -> individual process
    async fn terminate_completely(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
        if let Some(pid) = handle.get_pid() {
            let result = match self.terminate_process_group(pid).await {
                TerminationResult::Success => TerminationResult::Success,
                _ => self.terminate_process_tree(pid).await,
            };

            // Reap the direct child so it doesn't linger as a zombie
            if let Err(e) = handle.kill().await {
                tracing::debug!("Reaping process {pid} after kill: {e:#}");
            }

            if result.is_gone() {
                return TerminationResult::Success;
            }
        }

        match self.force_kill(handle).await {
            TerminationResult::ProcessNotFound => TerminationResult::Success,
            other => other,
        }
    }
}

/// Trait representing a handle to a running process
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Get the process ID (None if process has exited)
    fn get_pid(&self) -> Option<ProcessId>;

    /// Take ownership of the stdout/stderr pipes; `None` after the first call
    fn take_output(&mut self) -> Option<OutputPipes>;

    /// Wait for the process to exit and reap it
    async fn wait(&mut self) -> Result<ExitStatus>;

    /// Kill the process and reap it
    async fn kill(&mut self) -> Result<()>;
}

/// High-level process manager trait that combines lifecycle and termination
pub trait ProcessManager: ProcessLifecycle + ProcessTermination {
    /// Create a new process manager instance
    fn new() -> Self
    where
        Self: Sized;
}

/// Factory trait for creating platform-specific process managers
pub trait ProcessManagerFactory {
    /// The type of process manager this factory creates
    type Manager: ProcessManager;

    /// Create a process manager for the current platform
    fn create_process_manager() -> Self::Manager;

    /// Get the platform name for logging and debugging
    fn platform_name() -> &'static str;
}
