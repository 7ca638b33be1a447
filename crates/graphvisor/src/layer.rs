use crate::factory::{PlatformProcessManager, PlatformProcessManagerFactory};
use crate::fetch::HttpFetcher;
use crate::install::EngineInstaller;
use crate::orchestrator::{LifecycleOrchestrator, LifecycleState, RunningServer};
use crate::provision::DataFetcher;
use crate::shutdown::InterruptHandle;
use graphvisor_core::{
    EchoSink, ProcessId, ProcessManager, ProcessManagerFactory, SupervisorConfig, SupervisorError,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

pub struct Idle;

pub struct Running;

/// High-level handle over one managed routing graph
pub struct GraphSupervisor<Status, M = PlatformProcessManager, F = HttpFetcher>
where
    M: ProcessManager,
{
    orchestrator: LifecycleOrchestrator<M, F>,
    server: Option<RunningServer>,
    _status: std::marker::PhantomData<Status>,
}

impl<Status, M, F> std::fmt::Debug for GraphSupervisor<Status, M, F>
where
    M: ProcessManager,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphSupervisor")
            .field("status", &std::any::type_name::<Status>())
            .field("running", &self.server.is_some())
            .finish_non_exhaustive()
    }
}

impl GraphSupervisor<Idle> {
    /// Create a supervisor using the platform process manager and the HTTP fetcher
    pub fn new(config: SupervisorConfig) -> Result<Self, SupervisorError> {
        info!(
            "Created GraphSupervisor with platform: {}",
            PlatformProcessManagerFactory::platform_name()
        );
        let manager = PlatformProcessManagerFactory::create_process_manager();
        Self::with_parts(config, Arc::new(manager), HttpFetcher::new()?)
    }
}

impl<M, F> GraphSupervisor<Idle, M, F>
where
    M: ProcessManager + 'static,
    F: DataFetcher,
{
    pub fn with_parts(config: SupervisorConfig, manager: Arc<M>, fetcher: F) -> Result<Self, SupervisorError> {
        Ok(Self {
            orchestrator: LifecycleOrchestrator::new(config, manager, fetcher)?,
            server: None,
            _status: Default::default(),
        })
    }

    pub fn with_echo(mut self, echo: Option<EchoSink>) -> Self {
        self.orchestrator = self.orchestrator.with_echo(echo);
        self
    }

    pub fn with_installer(mut self, installer: impl EngineInstaller + 'static) -> Self {
        self.orchestrator = self.orchestrator.with_installer(installer);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.orchestrator.subscribe()
    }

    /// Stops a pending [`start`](Self::start) from another task
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.orchestrator.interrupt_handle()
    }

    /// Provision, build and start; returns once the server reported ready
    pub async fn start(mut self) -> Result<GraphSupervisor<Running, M, F>, SupervisorError> {
        let server = self.orchestrator.run().await?;
        Ok(GraphSupervisor {
            orchestrator: self.orchestrator,
            server: Some(server),
            _status: Default::default(),
        })
    }
}

impl<M, F> GraphSupervisor<Running, M, F>
where
    M: ProcessManager + 'static,
    F: DataFetcher,
{
    pub fn server(&self) -> Option<&RunningServer> {
        self.server.as_ref()
    }

    /// Ports the server was started with
    pub fn ports(&self) -> &[u16] {
        self.server.as_ref().map(|s| s.ports.as_slice()).unwrap_or_default()
    }

    pub fn pid(&self) -> Option<ProcessId> {
        self.server.as_ref().map(|s| s.pid)
    }

    pub fn state(&self) -> LifecycleState {
        self.orchestrator.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.orchestrator.subscribe()
    }

    /// Simulate Ctrl-C: run the cleanup without exiting the program
    pub async fn interrupt(&self) {
        self.orchestrator.interrupt().await;
    }

    /// Kill the server and release the supervisor
    pub async fn stop(self) {
        info!("Stopping GraphSupervisor");
        self.orchestrator.stop().await;
    }
}
