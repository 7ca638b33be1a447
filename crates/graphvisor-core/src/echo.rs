use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Shared writer that supervised output is echoed to
pub struct EchoSink(Arc<Mutex<Box<dyn AsyncWrite + Unpin + Sync + Send>>>);

impl Clone for EchoSink {
    fn clone(&self) -> Self {
        EchoSink(self.0.clone())
    }
}

impl std::fmt::Debug for EchoSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EchoSink")
    }
}

impl EchoSink {
    pub fn new(t: Box<dyn AsyncWrite + Unpin + Sync + Send>) -> EchoSink {
        EchoSink(Arc::new(Mutex::new(t)))
    }

    pub fn stdout() -> EchoSink {
        Self::new(Box::new(tokio::io::stdout()))
    }

    /// Write one supervised line as `>> line`
    pub async fn line(&self, line: &str) {
        let mut lock = self.0.lock().await;
        let _ = lock.write_all(format!(">> {line}\n").as_bytes()).await;
        let _ = lock.flush().await;
    }
}
