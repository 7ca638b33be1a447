use crate::supervisor::ProcessSupervisor;
use graphvisor_core::ProcessManager;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Exit status used after signal-driven cleanup
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

type CleanupFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type CleanupAction = Box<dyn Fn() -> CleanupFuture + Send + Sync>;

/// Called with the exit status once a signal has been handled
pub type ExitHook = Arc<dyn Fn(i32) + Send + Sync>;

/// The default [`ExitHook`]: end the program
pub fn exit_process() -> ExitHook {
    Arc::new(|code| std::process::exit(code))
}

struct Inner {
    action: CleanupAction,
    done: OnceCell<()>,
    interrupted: CancellationToken,
}

impl Inner {
    async fn run(&self) {
        self.done
            .get_or_init(|| async {
                info!("Running cleanup");
                (self.action)().await;
            })
            .await;
    }
}

/// A cleanup action that runs exactly once: on a signal, on request, or never
///
/// Every caller of [`run`](Self::run) waits for the one execution to finish.
pub struct CleanupRegistration {
    inner: Arc<Inner>,
    listener: CancellationToken,
}

impl CleanupRegistration {
    pub fn from_fn<F, Fut>(action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                action: Box::new(move || Box::pin(action())),
                done: OnceCell::new(),
                interrupted: CancellationToken::new(),
            }),
            listener: CancellationToken::new(),
        }
    }

    /// Cleanup that terminates `supervisor`'s process
    pub fn for_supervisor<M: ProcessManager + 'static>(supervisor: Arc<ProcessSupervisor<M>>) -> Self {
        Self::from_fn(move || {
            let supervisor = supervisor.clone();
            async move {
                supervisor.terminate().await;
            }
        })
    }

    /// Run the cleanup on Ctrl-C or SIGTERM
    ///
    /// With an `exit` hook the hook receives [`INTERRUPTED_EXIT_CODE`] once
    /// cleanup is done. After [`disarm`](Self::disarm) or drop a signal still
    /// reaches the hook, without cleanup; without a hook the signal is ignored.
    /// Signal handlers are registered before this returns.
    pub fn listen(&self, exit: Option<ExitHook>) {
        let mut signals = Signals::register();
        let inner = Arc::downgrade(&self.inner);
        let listener = self.listener.clone();

        tokio::spawn(async move {
            let armed = tokio::select! {
                _ = listener.cancelled() => false,
                _ = signals.recv() => true,
            };

            if armed {
                let name = signals.last;
                match inner.upgrade() {
                    Some(inner) => {
                        warn!("Received {name}, cleaning up");
                        inner.interrupted.cancel();
                        inner.run().await;
                    }
                    None => warn!("Received {name} after cleanup was released"),
                }
            } else {
                drop(inner);
                if exit.is_none() {
                    return;
                }
                signals.recv().await;
                warn!("Received {} after disarm, exiting", signals.last);
            }

            if let Some(exit) = exit {
                exit(INTERRUPTED_EXIT_CODE);
            }
        });
    }

    /// Run the cleanup unless it already ran
    pub async fn run(&self) {
        self.inner.run().await;
    }

    /// Behave as if a signal arrived, without exiting the program
    pub async fn interrupt(&self) {
        self.inner.interrupted.cancel();
        self.inner.run().await;
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.is_cancelled()
    }

    /// Resolves once a signal or [`interrupt`](Self::interrupt) was received
    pub async fn interrupted(&self) {
        self.inner.interrupted.cancelled().await;
    }

    pub fn has_run(&self) -> bool {
        self.inner.done.initialized()
    }

    /// Stop cleaning up on signals; the cleanup itself stays callable
    pub fn disarm(&self) {
        self.listener.cancel();
    }
}

impl Drop for CleanupRegistration {
    fn drop(&mut self) {
        self.listener.cancel();
    }
}

/// Triggers a [`CleanupRegistration`]'s interrupt path without owning it
#[derive(Clone)]
pub struct InterruptHandle(Weak<CleanupRegistration>);

impl InterruptHandle {
    pub(crate) fn new(cleanup: &Arc<CleanupRegistration>) -> Self {
        Self(Arc::downgrade(cleanup))
    }

    /// Same as [`CleanupRegistration::interrupt`]; does nothing once the registration is gone
    pub async fn interrupt(&self) {
        if let Some(cleanup) = self.0.upgrade() {
            cleanup.interrupt().await;
        }
    }
}

/// SIGINT and SIGTERM streams, registered up front
struct Signals {
    interrupt: Option<Signal>,
    terminate: Option<Signal>,
    last: &'static str,
}

impl Signals {
    fn register() -> Self {
        Self {
            interrupt: register(SignalKind::interrupt(), "SIGINT"),
            terminate: register(SignalKind::terminate(), "SIGTERM"),
            last: "",
        }
    }

    async fn recv(&mut self) {
        self.last = tokio::select! {
            _ = next(&mut self.interrupt) => "SIGINT",
            _ = next(&mut self.terminate) => "SIGTERM",
        };
    }
}

fn register(kind: SignalKind, name: &str) -> Option<Signal> {
    match signal(kind) {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!("Cannot listen for {}: {}", name, e);
            None
        }
    }
}

async fn next(stream: &mut Option<Signal>) {
    if let Some(stream) = stream {
        if stream.recv().await.is_some() {
            return;
        }
    }
    std::future::pending::<()>().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting() -> (CleanupRegistration, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let registration = CleanupRegistration::from_fn(move || {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        (registration, runs)
    }

    #[tokio::test]
    async fn test_runs_exactly_once() {
        let (registration, runs) = counting();

        tokio::join!(registration.run(), registration.interrupt(), registration.run());
        registration.run().await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(registration.has_run());
        assert!(registration.is_interrupted());
    }

    #[tokio::test]
    async fn test_plain_run_is_not_an_interrupt() {
        let (registration, runs) = counting();
        registration.run().await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!registration.is_interrupted());
    }

    #[tokio::test]
    async fn test_interrupt_wakes_waiters() {
        let (registration, _runs) = counting();
        let registration = Arc::new(registration);

        let waiter = {
            let registration = registration.clone();
            tokio::spawn(async move { registration.interrupted().await })
        };
        registration.interrupt().await;

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    // raised signals reach every registered listener in the process
    static SIGNAL_TESTS: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn recording_exit() -> (ExitHook, tokio::sync::mpsc::UnboundedReceiver<i32>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let hook: ExitHook = Arc::new(move |code| {
            let _ = tx.send(code);
        });
        (hook, rx)
    }

    // Both tests raise SIGTERM at this test process; the runtime's handler
    // stays installed, so the process itself is not terminated.
    #[tokio::test]
    async fn test_signal_cleans_up_then_exits() {
        let _serial = SIGNAL_TESTS.lock().unwrap_or_else(|e| e.into_inner());
        let (registration, runs) = counting();
        let (exit, mut codes) = recording_exit();
        registration.listen(Some(exit));

        nix::sys::signal::raise(nix::sys::signal::Signal::SIGTERM).unwrap();

        let code = tokio::time::timeout(Duration::from_secs(5), codes.recv())
            .await
            .unwrap();
        assert_eq!(code, Some(INTERRUPTED_EXIT_CODE));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(registration.is_interrupted());
    }

    #[tokio::test]
    async fn test_signal_after_disarm_still_exits_without_cleanup() {
        let _serial = SIGNAL_TESTS.lock().unwrap_or_else(|e| e.into_inner());
        let (registration, runs) = counting();
        let (exit, mut codes) = recording_exit();
        registration.listen(Some(exit));
        registration.disarm();
        tokio::task::yield_now().await;

        nix::sys::signal::raise(nix::sys::signal::Signal::SIGTERM).unwrap();

        let code = tokio::time::timeout(Duration::from_secs(5), codes.recv())
            .await
            .unwrap();
        assert_eq!(code, Some(INTERRUPTED_EXIT_CODE));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(!registration.has_run());
    }
}
