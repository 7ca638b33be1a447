use anyhow::Result;
use async_trait::async_trait;
use graphvisor_core::{
    OutputPipes, ProcessHandle, ProcessId, ProcessLifecycle, ProcessManager, ProcessTermination,
    TerminationResult,
};
use std::collections::HashMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;
    use sysinfo::System;
    use tokio::process::{Child, Command};
    use tracing::{debug, info, warn};

    /// Unix-specific process handle implementation
    pub struct UnixProcessHandle {
        child: Child,
    }

    impl UnixProcessHandle {
        pub fn new(child: Child) -> Self {
            Self { child }
        }
    }

    #[async_trait]
    impl ProcessHandle for UnixProcessHandle {
        fn get_pid(&self) -> Option<ProcessId> {
            self.child.id().map(ProcessId::from)
        }

        fn take_output(&mut self) -> Option<OutputPipes> {
            let stdout = self.child.stdout.take()?;
            let stderr = self.child.stderr.take()?;
            Some(OutputPipes {
                stdout: Box::new(stdout),
                stderr: Box::new(stderr),
            })
        }

        async fn wait(&mut self) -> Result<ExitStatus> {
            Ok(self.child.wait().await?)
        }

        async fn kill(&mut self) -> Result<()> {
            match self.child.kill().await {
                Ok(()) => Ok(()),
                // Already reaped
                Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
                Err(e) => Err(anyhow::anyhow!("Failed to kill process: {}", e)),
            }
        }
    }

    /// Unix-specific process manager with process group and tree termination
    pub struct UnixProcessManager {
        system: std::sync::Mutex<System>,
    }

    impl Default for UnixProcessManager {
        fn default() -> Self {
            <Self as ProcessManager>::new()
        }
    }

    #[async_trait]
    impl ProcessLifecycle for UnixProcessManager {
        type Handle = UnixProcessHandle;

        async fn spawn_process(
            &self,
            command: &str,
            args: &[String],
            working_dir: Option<&Path>,
            env: &HashMap<String, String>,
        ) -> Result<UnixProcessHandle> {
            let mut cmd = Command::new(command);
            cmd.args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            if let Some(dir) = working_dir {
                cmd.current_dir(dir);
            }

            for (key, value) in env {
                cmd.env(key, value);
            }

            // New process group so the whole tree can be signalled at once
            cmd.process_group(0);

            let child = cmd.spawn()?;

            if let Some(pid) = child.id() {
                info!(
                    "Spawned Unix process: {} (PID: {}) with args: {:?}",
                    command, pid, args
                );
            }

            Ok(UnixProcessHandle::new(child))
        }
    }

    #[async_trait]
    impl ProcessTermination for UnixProcessManager {
        async fn force_kill(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
            let Some(pid) = handle.get_pid() else {
                return TerminationResult::ProcessNotFound;
            };

            let result = Self::sigkill(pid);
            if result == TerminationResult::Success {
                if let Err(e) = handle.kill().await {
                    warn!("Handle kill cleanup failed: {}", e);
                }
            }
            result
        }

        async fn find_child_processes(&self, parent_pid: ProcessId) -> Result<Vec<ProcessId>> {
            let mut system = self
                .system
                .lock()
                .map_err(|_| anyhow::anyhow!("process table lock poisoned"))?;
            system.refresh_processes_specifics(
                sysinfo::ProcessesToUpdate::All,
                true,
                sysinfo::ProcessRefreshKind::default(),
            );

            let mut children = Vec::new();
            Self::find_children_recursive(&system, parent_pid.0, &mut children);

            Ok(children.into_iter().map(ProcessId::from).collect())
        }

        async fn terminate_process_tree(&self, root_pid: ProcessId) -> TerminationResult {
            info!("Killing process tree for root PID {}", root_pid);

            let children = match self.find_child_processes(root_pid).await {
                Ok(children) => children,
                Err(e) => {
                    warn!("Failed to find child processes for PID {}: {}", root_pid, e);
                    return TerminationResult::Failed(format!("Failed to enumerate children: {e}"));
                }
            };

            if !children.is_empty() {
                debug!("Found {} child processes to kill", children.len());
                // Deepest descendants come first
                for child_pid in &children {
                    match Self::sigkill(*child_pid) {
                        TerminationResult::Success | TerminationResult::ProcessNotFound => {}
                        result => {
                            warn!("Failed to kill child process {}: {:?}", child_pid, result);
                        }
                    }
                }
            }

            Self::sigkill(root_pid)
        }

        async fn terminate_process_group(&self, pid: ProcessId) -> TerminationResult {
            self.kill_process_group_now(pid)
        }

        fn kill_process_group_now(&self, pid: ProcessId) -> TerminationResult {
            let pgid = NixPid::from_raw(pid.0 as i32);

            match signal::killpg(pgid, Signal::SIGKILL) {
                Ok(()) => {
                    info!("Sent SIGKILL to process group {}", pid);
                    TerminationResult::Success
                }
                Err(Errno::ESRCH) => {
                    debug!("Process group {} not found (already terminated)", pid);
                    TerminationResult::ProcessNotFound
                }
                Err(Errno::EPERM) => {
                    warn!("Permission denied to kill process group {}", pid);
                    TerminationResult::PermissionDenied
                }
                Err(e) => {
                    warn!("Failed to send SIGKILL to process group {}: {}", pid, e);
                    TerminationResult::Failed(format!("SIGKILL to process group failed: {e}"))
                }
            }
        }
    }

    impl UnixProcessManager {
        fn sigkill(pid: ProcessId) -> TerminationResult {
            let nix_pid = NixPid::from_raw(pid.0 as i32);

            match signal::kill(nix_pid, Signal::SIGKILL) {
                Ok(()) => {
                    info!("Sent SIGKILL to process {}", pid);
                    TerminationResult::Success
                }
                Err(Errno::ESRCH) => {
                    debug!("Process {} not found (already terminated)", pid);
                    TerminationResult::ProcessNotFound
                }
                Err(Errno::EPERM) => {
                    warn!("Permission denied to kill process {}", pid);
                    TerminationResult::PermissionDenied
                }
                Err(e) => {
                    warn!("Failed to kill process {}: {}", pid, e);
                    TerminationResult::Failed(format!("SIGKILL failed: {e}"))
                }
            }
        }

        /// Recursively find all child processes, deepest first
        fn find_children_recursive(system: &System, parent_pid: u32, result: &mut Vec<u32>) {
            for (pid, process) in system.processes() {
                if process.parent().map(|ppid| ppid.as_u32()) == Some(parent_pid) {
                    let child_pid = pid.as_u32();
                    Self::find_children_recursive(system, child_pid, result);
                    result.push(child_pid);
                }
            }
        }
    }

    impl ProcessManager for UnixProcessManager {
        fn new() -> Self {
            info!("Initializing Unix process manager");
            Self {
                system: std::sync::Mutex::new(System::new()),
            }
        }
    }

}

#[cfg(unix)]
pub use unix_impl::{UnixProcessHandle, UnixProcessManager};
