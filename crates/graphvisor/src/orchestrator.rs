use crate::install::{EngineInstaller, HttpEngineInstaller};
use crate::provision::{DataFetcher, DataProvisioner};
use crate::shutdown::{CleanupRegistration, InterruptHandle, exit_process};
use crate::supervisor::ProcessSupervisor;
use backon::{ExponentialBuilder, Retryable};
use graphvisor_core::{
    CommandContext, EchoSink, LogMonitor, PortAllocator, ProcessId, ProcessManager, RetryConfig,
    Stage, StageStore, SupervisorConfig, SupervisorError, TriggerRule, Workspace,
};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Where the orchestrator is in the staged lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Init,
    DataProvisioned,
    GraphBuilt,
    ServerStarting,
    ServerRunning,
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Init => "init",
            LifecycleState::DataProvisioned => "data_provisioned",
            LifecycleState::GraphBuilt => "graph_built",
            LifecycleState::ServerStarting => "server_starting",
            LifecycleState::ServerRunning => "server_running",
            LifecycleState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A server that reported ready
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningServer {
    pub ports: Vec<u16>,
    pub pid: ProcessId,
    pub transit_available: bool,
    pub log_path: PathBuf,
}

/// Creates a retry strategy from the start-step retry configuration
pub(crate) fn create_retry_strategy(retry_config: &RetryConfig) -> ExponentialBuilder {
    let mut retry_builder = ExponentialBuilder::default()
        .with_min_delay(retry_config.min_delay())
        .with_max_delay(retry_config.max_delay())
        .with_max_times(retry_config.retries());

    if !retry_config.use_exponential_backoff {
        retry_builder = retry_builder.with_factor(1.0);
    }

    if retry_config.jitter {
        retry_builder = retry_builder.with_jitter();
    }

    retry_builder
}

/// Drives provisioning, graph build and server start for one workspace
pub struct LifecycleOrchestrator<M: ProcessManager, F> {
    config: SupervisorConfig,
    workspace: Workspace,
    supervisor: Arc<ProcessSupervisor<M>>,
    provisioner: DataProvisioner<F>,
    ports: PortAllocator,
    echo: Option<EchoSink>,
    installer: Option<Arc<dyn EngineInstaller>>,
    cleanup: Arc<CleanupRegistration>,
    state: Arc<watch::Sender<LifecycleState>>,
}

impl<M, F> LifecycleOrchestrator<M, F>
where
    M: ProcessManager + 'static,
    F: DataFetcher,
{
    pub fn new(config: SupervisorConfig, platform: Arc<M>, fetcher: F) -> Result<Self, SupervisorError> {
        let workspace = Workspace::create(&config.name, config.bbox, &config.graph_root)?;
        let supervisor = Arc::new(ProcessSupervisor::new(platform, config.base_path.clone()));
        let provisioner =
            DataProvisioner::new(fetcher, config.map_options.clone(), config.require_transit);
        let ports = PortAllocator::new(config.ports.clone());
        let echo = config.show_output.then(EchoSink::stdout);
        let cleanup = Arc::new(CleanupRegistration::for_supervisor(supervisor.clone()));
        let (state, _) = watch::channel(LifecycleState::Init);

        Ok(Self {
            config,
            workspace,
            supervisor,
            provisioner,
            ports,
            echo,
            installer: None,
            cleanup,
            state: Arc::new(state),
        })
    }

    /// Replace where supervised output is echoed; `None` silences it
    pub fn with_echo(mut self, echo: Option<EchoSink>) -> Self {
        self.echo = echo;
        self
    }

    /// Install missing engines with `installer` instead of over HTTP
    pub fn with_installer(mut self, installer: impl EngineInstaller + 'static) -> Self {
        self.installer = Some(Arc::new(installer));
        self
    }

    /// Interrupts this orchestrator from another task, e.g. during [`run`](Self::run)
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle::new(&self.cleanup)
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor<M>> {
        &self.supervisor
    }

    /// Run every stage up to a ready server
    ///
    /// Signal handling is armed before the first stage. Cleanup runs on
    /// failure, on interrupt, or when the server later exits.
    pub async fn run(&mut self) -> Result<RunningServer, SupervisorError> {
        if self.state() != LifecycleState::Init {
            return Err(SupervisorError::Configuration(format!(
                "orchestrator already ran (state: {})",
                self.state()
            )));
        }

        let cleanup = self.cleanup.clone();
        cleanup.listen(self.config.exit_on_signal.then(exit_process));

        info!(workspace = %self.workspace.dir().display(), "Starting lifecycle");

        let result = tokio::select! {
            result = self.advance(&cleanup) => result,
            _ = cleanup.interrupted() => Err(SupervisorError::Interrupted),
        };

        match result {
            Ok(server) => {
                self.set_state(LifecycleState::ServerRunning);
                info!(ports = ?server.ports, pid = %server.pid, "Server running");
                Ok(server)
            }
            Err(e) => {
                error!("Lifecycle failed: {}", e);
                self.set_state(LifecycleState::Failed);
                cleanup.run().await;
                Err(e)
            }
        }
    }

    /// Kill the server and stop listening for signals
    pub async fn stop(&self) {
        self.cleanup.run().await;
        self.cleanup.disarm();
    }

    /// Run the signal path without exiting the program
    pub async fn interrupt(&self) {
        self.cleanup.interrupt().await;
    }

    async fn advance(&self, cleanup: &Arc<CleanupRegistration>) -> Result<RunningServer, SupervisorError> {
        let engine_jar = self.ensure_engine().await?;
        let engine_jar = engine_jar.as_deref();
        let mut stages = StageStore::open(&self.workspace)?;

        let report = self.provisioner.provision(&self.workspace, &mut stages).await?;
        self.set_state(LifecycleState::DataProvisioned);

        self.build_graph(&mut stages, engine_jar).await?;
        self.set_state(LifecycleState::GraphBuilt);

        self.set_state(LifecycleState::ServerStarting);
        let (ports, pid, log_path) = self.start_server(engine_jar).await?;

        self.watch_server(cleanup).await?;

        Ok(RunningServer {
            ports,
            pid,
            transit_available: report.transit_available,
            log_path,
        })
    }

    /// Absolute path of the engine jar, installing the engine when allowed
    async fn ensure_engine(&self) -> Result<Option<PathBuf>, SupervisorError> {
        let Some(artifact) = &self.config.engine.artifact else {
            return Ok(None);
        };

        let jar = match artifact.locate_jar() {
            Some(jar) => jar,
            None if !self.config.auto_download_engine => {
                return Err(SupervisorError::EngineUnavailable(format!(
                    "nothing installed at {} (enable auto_download_engine to fetch {})",
                    artifact.location().display(),
                    artifact.url()
                )));
            }
            None => {
                let installed = match &self.installer {
                    Some(installer) => installer.install(artifact).await,
                    None => HttpEngineInstaller::new()?.install(artifact).await,
                };
                installed.map_err(|e| {
                    SupervisorError::EngineUnavailable(format!("install from {} failed: {e:#}", artifact.url()))
                })?;
                artifact.locate_jar().ok_or_else(|| {
                    SupervisorError::EngineUnavailable(format!(
                        "no jar in {} after install",
                        artifact.location().display()
                    ))
                })?
            }
        };

        let jar = std::fs::canonicalize(&jar).map_err(|e| {
            SupervisorError::EngineUnavailable(format!("cannot resolve {}: {e}", jar.display()))
        })?;
        debug!(jar = %jar.display(), "Routing engine ready");
        Ok(Some(jar))
    }

    async fn build_graph(&self, stages: &mut StageStore, engine_jar: Option<&Path>) -> Result<(), SupervisorError> {
        if stages.is_complete(Stage::GraphBuild) {
            info!(stage = %Stage::GraphBuild, "Stage already complete, skipping");
            return Ok(());
        }

        let engine = &self.config.engine;
        let osm_file = self.workspace.latest_map_file();
        let args = engine
            .build
            .expand(&self.command_context(osm_file.as_deref(), engine_jar, &[]))?;
        let log_path = self.workspace.log_path("build");

        info!(stage = %Stage::GraphBuild, log = %log_path.display(), "Building graph");
        self.supervisor
            .spawn("build", &engine.build.program, &args, &log_path)
            .await?;

        let monitor = LogMonitor::new(vec![
            TriggerRule::failure(&engine.markers.error).killing(),
            TriggerRule::success(&engine.markers.build_complete).killing(),
        ])
        .echo(self.echo.clone())
        .idle_timeout(self.config.build_idle_timeout)
        .kill_grace(self.config.kill_grace);

        let outcome = self.supervisor.monitor(&monitor).await?;
        self.supervisor.terminate().await;

        match outcome.failure_reason() {
            None => {
                stages.mark_complete(Stage::GraphBuild)?;
                Ok(())
            }
            Some(reason) => {
                error!(stage = %Stage::GraphBuild, "Graph build failed: {}", reason);
                Err(SupervisorError::BuildFailure(reason))
            }
        }
    }

    async fn start_server(&self, engine_jar: Option<&Path>) -> Result<(Vec<u16>, ProcessId, PathBuf), SupervisorError> {
        let attempts = AtomicU32::new(0);
        let attempts = &attempts;

        (move || async move {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            self.start_attempt(attempt, engine_jar).await
        })
        .retry(create_retry_strategy(&self.config.retry_config))
        .when(|e: &SupervisorError| e.is_retryable())
        .notify(|e: &SupervisorError, delay| {
            warn!("{}; retrying in {:?}", e, delay);
        })
        .await
    }

    async fn start_attempt(
        &self,
        attempt: u32,
        engine_jar: Option<&Path>,
    ) -> Result<(Vec<u16>, ProcessId, PathBuf), SupervisorError> {
        let engine = &self.config.engine;
        info!(attempt, "Starting server");

        let ports = self.ports.allocate(engine.port_count).await?;
        let osm_file = self.workspace.latest_map_file();
        let args = engine
            .server
            .expand(&self.command_context(osm_file.as_deref(), engine_jar, &ports))?;
        let log_path = self.workspace.log_path("server");

        let pid = self
            .supervisor
            .spawn("server", &engine.server.program, &args, &log_path)
            .await?;

        let monitor = LogMonitor::new(vec![
            TriggerRule::failure(&engine.markers.error).killing(),
            TriggerRule::success(&engine.markers.server_ready),
        ])
        .echo(self.echo.clone())
        .idle_timeout(self.config.startup_idle_timeout)
        .kill_grace(self.config.kill_grace);

        let outcome = self.supervisor.monitor(&monitor).await?;
        match outcome.failure_reason() {
            None => Ok((ports, pid, log_path)),
            Some(reason) => {
                self.supervisor.terminate().await;
                Err(SupervisorError::StartFailure { attempt, reason })
            }
        }
    }

    /// Drain the running server's output and clean up if it exits on its own
    async fn watch_server(&self, cleanup: &Arc<CleanupRegistration>) -> Result<(), SupervisorError> {
        let exited = self.supervisor.observe(self.echo.clone()).await?;
        // Weak: dropping the orchestrator must still release the supervisor
        let cleanup = Arc::downgrade(cleanup);
        let state = self.state.clone();

        tokio::spawn(async move {
            if let Ok(true) = exited.await {
                warn!("Server process exited on its own");
                state.send_replace(LifecycleState::Failed);
                if let Some(cleanup) = cleanup.upgrade() {
                    cleanup.run().await;
                }
            }
        });
        Ok(())
    }

    fn command_context<'a>(
        &'a self,
        osm_file: Option<&'a Path>,
        engine_jar: Option<&'a Path>,
        ports: &'a [u16],
    ) -> CommandContext<'a> {
        CommandContext {
            base_path: &self.config.base_path,
            graph_dir: self.workspace.dir(),
            router: self.workspace.name(),
            osm_file,
            engine_jar,
            ports,
        }
    }

    fn set_state(&self, next: LifecycleState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "Lifecycle transition");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backon::BackoffBuilder;
    use std::time::Duration;

    #[test]
    fn test_retry_strategy_is_bounded_by_attempts() {
        let config = RetryConfig {
            min_delay_ms: 10,
            max_delay_ms: 10,
            max_attempts: 3,
            use_exponential_backoff: false,
            jitter: false,
        };
        let delays: Vec<Duration> = create_retry_strategy(&config).build().collect();
        assert_eq!(delays, vec![Duration::from_millis(10); 2]);
    }

    #[test]
    fn test_no_retry_strategy_is_empty() {
        let delays: Vec<Duration> = create_retry_strategy(&RetryConfig::no_retry()).build().collect();
        assert!(delays.is_empty());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(LifecycleState::ServerRunning.to_string(), "server_running");
    }
}
