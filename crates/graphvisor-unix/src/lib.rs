mod unix_process_manager;

use graphvisor_core::{ProcessManager, ProcessManagerFactory};
pub use unix_process_manager::{UnixProcessHandle, UnixProcessManager};

pub struct UnixProcessManagerFactory;

impl ProcessManagerFactory for UnixProcessManagerFactory {
    type Manager = UnixProcessManager;

    fn create_process_manager() -> UnixProcessManager {
        <UnixProcessManager as ProcessManager>::new()
    }

    fn platform_name() -> &'static str {
        "Unix"
    }
}
