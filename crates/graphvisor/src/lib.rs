//! Graphvisor - staged lifecycle supervision for routing-engine servers
//!
//! Downloads map and transit data for a bounding box, builds a routing graph
//! with an external engine, then starts and watches the engine's server.
//! Completed stages are recorded on disk so an interrupted run resumes where
//! it stopped.

mod factory;
mod fetch;
mod install;
mod layer;
mod orchestrator;
mod output;
mod provision;
mod shutdown;
mod supervisor;

pub use factory::{PlatformProcessManager, PlatformProcessManagerFactory};
pub use fetch::{DEFAULT_OVERPASS_URL, DEFAULT_TRANSITLAND_URL, HttpFetcher};
pub use install::{EngineInstaller, HttpEngineInstaller};
pub use layer::{GraphSupervisor, Idle, Running};
pub use orchestrator::{LifecycleOrchestrator, LifecycleState, RunningServer};
pub use output::OutputStream;
pub use provision::{DataFetcher, DataProvisioner, ProvisionReport};
pub use shutdown::{CleanupRegistration, ExitHook, INTERRUPTED_EXIT_CODE, InterruptHandle, exit_process};
pub use supervisor::ProcessSupervisor;

// Re-export core functionality
pub use graphvisor_core::*;
