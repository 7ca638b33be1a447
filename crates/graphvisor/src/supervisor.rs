use crate::output::OutputStream;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use graphvisor_core::{
    EchoSink, LogMonitor, MonitoredOutput, Outcome, ProcessHandle, ProcessId, ProcessManager,
    SupervisorError, TerminationResult,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long a process whose output closed gets to report its exit status
const EXIT_STATUS_WAIT: Duration = Duration::from_secs(1);

/// The one external process a supervisor owns
struct ManagedProcess<H> {
    handle: H,
    pid: ProcessId,
    label: String,
    started_at: DateTime<Utc>,
    log_path: PathBuf,
}

/// Owns at most one external process: spawn, monitor, terminate
pub struct ProcessSupervisor<M: ProcessManager> {
    platform: Arc<M>,
    working_dir: PathBuf,
    process: Mutex<Option<ManagedProcess<M::Handle>>>,
    output: Mutex<Option<OutputStream>>,
    drain: Mutex<Option<CancellationToken>>,
}

impl<M: ProcessManager + 'static> ProcessSupervisor<M> {
    pub fn new(platform: Arc<M>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            platform,
            working_dir: working_dir.into(),
            process: Mutex::new(None),
            output: Mutex::new(None),
            drain: Mutex::new(None),
        }
    }

    /// Launch `program` with merged output captured to `log_path`
    ///
    /// Any process still owned by this supervisor is killed first.
    pub async fn spawn(
        &self,
        label: &str,
        program: &str,
        args: &[String],
        log_path: &Path,
    ) -> Result<ProcessId, SupervisorError> {
        if self.is_active().await {
            warn!(label, "Spawning while a process is still active; killing it first");
            self.terminate().await;
        }

        let command_line = std::iter::once(program)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        let spawn_error = |reason: String| SupervisorError::Spawn {
            command: command_line.clone(),
            reason,
        };

        let log = tokio::fs::File::create(log_path)
            .await
            .with_context(|| format!("Failed to create log file {}", log_path.display()))
            .map_err(|e| spawn_error(format!("{e:#}")))?;

        let mut handle = self
            .platform
            .spawn_process(program, args, Some(&self.working_dir), &HashMap::new())
            .await
            .with_context(|| format!("Failed to spawn process: {program}"))
            .map_err(|e| spawn_error(format!("{e:#}")))?;

        let Some(pid) = handle.get_pid() else {
            return Err(spawn_error("process exited before its PID was read".to_string()));
        };
        let Some(pipes) = handle.take_output() else {
            self.platform.terminate_completely(&mut handle).await;
            return Err(spawn_error("process output was not captured".to_string()));
        };

        info!(%pid, label, log = %log_path.display(), "Started {}", command_line);

        *self.output.lock().await = Some(OutputStream::new(pipes, Some(log)));
        *self.process.lock().await = Some(ManagedProcess {
            handle,
            pid,
            label: label.to_string(),
            started_at: Utc::now(),
            log_path: log_path.to_path_buf(),
        });

        Ok(pid)
    }

    /// Run `monitor` over the output of the current process
    ///
    /// If the process is still running afterwards, call [`observe`](Self::observe)
    /// or [`terminate`](Self::terminate). Until then its lines queue up in memory,
    /// and once the backlog is full they only reach the log file.
    pub async fn monitor(&self, monitor: &LogMonitor) -> Result<Outcome, SupervisorError> {
        let mut output = self
            .output
            .lock()
            .await
            .take()
            .ok_or(SupervisorError::NoProcess)?;

        let outcome = {
            let mut supervised = SupervisedOutput {
                output: &mut output,
                supervisor: self,
            };
            monitor.run(&mut supervised).await
        };

        if self.is_active().await {
            *self.output.lock().await = Some(output);
        }

        Ok(outcome)
    }

    /// Keep draining the running process's output after monitoring finished
    ///
    /// Lines are echoed to `echo` when given. The returned task yields `true`
    /// when the output closed by itself and `false` when [`terminate`](Self::terminate)
    /// stopped it.
    pub async fn observe(&self, echo: Option<EchoSink>) -> Result<JoinHandle<bool>, SupervisorError> {
        let mut output = self
            .output
            .lock()
            .await
            .take()
            .ok_or(SupervisorError::NoProcess)?;

        let token = CancellationToken::new();
        if let Some(previous) = self.drain.lock().await.replace(token.clone()) {
            previous.cancel();
        }

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return false,
                    line = output.recv() => match line {
                        Some(line) => {
                            if let Some(echo) = &echo {
                                echo.line(&line).await;
                            }
                        }
                        None => {
                            debug!("Observed process closed its output");
                            return true;
                        }
                    },
                }
            }
        }))
    }

    /// Kill the current process and everything it started; no-op without one
    pub async fn terminate(&self) -> TerminationResult {
        if let Some(token) = self.drain.lock().await.take() {
            token.cancel();
        }

        let taken = self.process.lock().await.take();
        self.output.lock().await.take();

        let Some(mut process) = taken else {
            debug!("Terminate requested with no managed process");
            return TerminationResult::ProcessNotFound;
        };

        let result = self.platform.terminate_completely(&mut process.handle).await;
        match &result {
            TerminationResult::Success | TerminationResult::ProcessNotFound => {
                info!(
                    pid = %process.pid,
                    label = %process.label,
                    uptime_secs = (Utc::now() - process.started_at).num_seconds(),
                    "Process terminated"
                );
            }
            other => {
                error!(pid = %process.pid, label = %process.label, "Failed to terminate process: {:?}", other);
            }
        }
        result
    }

    pub async fn pid(&self) -> Option<ProcessId> {
        self.process.lock().await.as_ref().map(|p| p.pid)
    }

    pub async fn log_path(&self) -> Option<PathBuf> {
        self.process.lock().await.as_ref().map(|p| p.log_path.clone())
    }

    pub async fn is_active(&self) -> bool {
        self.process.lock().await.is_some()
    }

    /// Reap the current process after its output closed
    async fn exit_code(&self) -> Option<i32> {
        let mut guard = self.process.lock().await;
        let process = guard.as_mut()?;
        match tokio::time::timeout(EXIT_STATUS_WAIT, process.handle.wait()).await {
            Ok(Ok(status)) => {
                info!(pid = %process.pid, label = %process.label, %status, "Process exited");
                status.code()
            }
            Ok(Err(e)) => {
                warn!(pid = %process.pid, "Failed to read exit status: {e:#}");
                None
            }
            Err(_) => {
                debug!(pid = %process.pid, "Output closed but process is still running");
                None
            }
        }
    }

    /// Immediate kill from the rule monitor; drops ownership of the process
    async fn kill_current(&self) -> anyhow::Result<()> {
        let taken = self.process.lock().await.take();
        if let Some(mut process) = taken {
            info!(pid = %process.pid, label = %process.label, "Killing process");
            match self.platform.terminate_completely(&mut process.handle).await {
                TerminationResult::Success | TerminationResult::ProcessNotFound => {}
                other => anyhow::bail!("kill of process {} failed: {:?}", process.pid, other),
            }
        }
        Ok(())
    }
}

impl<M: ProcessManager> Drop for ProcessSupervisor<M> {
    fn drop(&mut self) {
        if let Some(token) = self.drain.get_mut().take() {
            token.cancel();
        }
        if let Some(process) = self.process.get_mut().take() {
            warn!(
                pid = %process.pid,
                label = %process.label,
                "ProcessSupervisor dropped with an active process - attempting emergency cleanup"
            );
            let result = self.platform.kill_process_group_now(process.pid);
            if !matches!(
                result,
                TerminationResult::Success | TerminationResult::ProcessNotFound
            ) {
                warn!("Emergency cleanup failed for process {}: {:?}", process.pid, result);
            }
        }
    }
}

/// Monitor's view of the supervised process
struct SupervisedOutput<'a, M: ProcessManager + 'static> {
    output: &'a mut OutputStream,
    supervisor: &'a ProcessSupervisor<M>,
}

#[async_trait]
impl<M: ProcessManager + 'static> MonitoredOutput for SupervisedOutput<'_, M> {
    async fn next_line(&mut self) -> Option<String> {
        self.output.recv().await
    }

    async fn kill(&mut self) -> anyhow::Result<()> {
        self.supervisor.kill_current().await
    }

    async fn exit_code(&mut self) -> Option<i32> {
        self.supervisor.exit_code().await
    }
}
