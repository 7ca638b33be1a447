use graphvisor_core::{OutputPipe, OutputPipes};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::StreamExt;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{debug, warn};

/// Splits raw output into lines, replacing invalid UTF-8
struct LineCodec;

impl LineCodec {
    fn to_line(bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes)
            .trim_end_matches(['\n', '\r'])
            .to_string()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match src.iter().position(|b| *b == b'\n') {
            Some(end) => {
                let line = src.split_to(end + 1);
                Ok(Some(Self::to_line(&line)))
            }
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split_to(src.len());
        Ok(Some(Self::to_line(&rest)))
    }
}

type SharedLog = Arc<Mutex<File>>;

/// Lines held for a receiver that is not keeping up
pub const OUTPUT_BACKLOG_LINES: usize = 65_536;

/// Merged stdout and stderr of one process, one line per item
///
/// Reader tasks keep draining both pipes into the log file for as long as the
/// process writes, whether or not anyone receives the lines. At most
/// [`OUTPUT_BACKLOG_LINES`] lines wait for the receiver; further lines are
/// only logged.
pub struct OutputStream {
    lines: mpsc::Receiver<String>,
}

impl OutputStream {
    pub fn new(pipes: OutputPipes, log: Option<File>) -> Self {
        Self::with_backlog(pipes, log, OUTPUT_BACKLOG_LINES)
    }

    pub(crate) fn with_backlog(pipes: OutputPipes, log: Option<File>, backlog: usize) -> Self {
        let (tx, lines) = mpsc::channel(backlog);
        let log = log.map(|file| Arc::new(Mutex::new(file)));

        tokio::spawn(pump("stdout", pipes.stdout, log.clone(), tx.clone()));
        tokio::spawn(pump("stderr", pipes.stderr, log, tx));

        Self { lines }
    }

    /// Next line from either pipe; `None` once both pipes are closed
    pub async fn recv(&mut self) -> Option<String> {
        self.lines.recv().await
    }
}

async fn pump(
    source: &'static str,
    pipe: OutputPipe,
    log: Option<SharedLog>,
    tx: mpsc::Sender<String>,
) {
    let mut frames = FramedRead::with_capacity(pipe, LineCodec, 1024);
    let mut dropped = 0u64;

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(line) => {
                if let Some(log) = &log {
                    let mut file = log.lock().await;
                    if let Err(e) = write_line(&mut file, &line).await {
                        warn!(source, "Failed to write log line: {}", e);
                    }
                }
                // Receiver may be gone or behind; the pipe still has to be drained
                if let Err(TrySendError::Full(_)) = tx.try_send(line) {
                    if dropped == 0 {
                        warn!(source, "Output backlog full, further lines only go to the log");
                    }
                    dropped += 1;
                }
            }
            Err(e) => {
                warn!(source, "Output read failed: {}", e);
                break;
            }
        }
    }

    debug!(source, dropped, "Output pipe closed");
}

async fn write_line(file: &mut File, line: &str) -> std::io::Result<()> {
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await
}
