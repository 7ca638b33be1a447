use graphvisor_core::ProcessManagerFactory;

/// Platform-independent factory that selects the appropriate implementation at compile time
pub struct PlatformProcessManagerFactory;

#[cfg(unix)]
impl ProcessManagerFactory for PlatformProcessManagerFactory {
    type Manager = graphvisor_unix::UnixProcessManager;

    fn create_process_manager() -> Self::Manager {
        graphvisor_unix::UnixProcessManagerFactory::create_process_manager()
    }

    fn platform_name() -> &'static str {
        graphvisor_unix::UnixProcessManagerFactory::platform_name()
    }
}

#[cfg(not(unix))]
compile_error!("graphvisor supervises process groups and currently supports Unix platforms only");

/// Process manager used when none is supplied
pub type PlatformProcessManager = <PlatformProcessManagerFactory as ProcessManagerFactory>::Manager;
