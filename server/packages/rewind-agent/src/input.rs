use std::io::{self, BufRead};
use std::sync::mpsc as std_mpsc;

use tokio::sync::mpsc;

type LineResult = io::Result<Option<String>>;

/// Reads lines on a dedicated OS thread, one line per request.
///
/// A blocking read cannot be cancelled, so it lives on a detached thread
/// rather than the runtime's blocking pool and never holds up shutdown. A
/// read is only issued when a line is asked for, so nothing competes with
/// the key watcher while a response streams. A line whose caller stopped
/// waiting (Ctrl-C at a prompt) goes to the next caller.
#[derive(Debug)]
pub struct ThreadLines {
    requests: std_mpsc::Sender<()>,
    lines: mpsc::UnboundedReceiver<LineResult>,
    pending: bool,
}

impl ThreadLines {
    pub fn stdin() -> io::Result<Self> {
        Self::spawn(|| io::stdin().lock())
    }

    /// `open` runs on the reader thread, so the reader itself need not be
    /// `Send`.
    pub fn spawn<R, F>(open: F) -> io::Result<Self>
    where
        R: BufRead,
        F: FnOnce() -> R + Send + 'static,
    {
        let (request_tx, request_rx) = std_mpsc::channel::<()>();
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("rewind-agent-input".to_string())
            .spawn(move || {
                let mut reader = open();
                for () in request_rx {
                    let mut line = String::new();
                    let read = match reader.read_line(&mut line) {
                        Ok(0) => Ok(None),
                        Ok(_) => Ok(Some(line)),
                        Err(err) => Err(err),
                    };
                    let finished = !matches!(read, Ok(Some(_)));
                    if line_tx.send(read).is_err() || finished {
                        break;
                    }
                }
                tracing::debug!("input: reader thread finished");
            })?;

        Ok(Self {
            requests: request_tx,
            lines: line_rx,
            pending: false,
        })
    }

    /// Next line, or `None` at end of input. Cancel safe.
    pub async fn next_line(&mut self) -> LineResult {
        if !self.pending {
            if self.requests.send(()).is_err() {
                return Ok(None);
            }
            self.pending = true;
        }
        let line = self.lines.recv().await;
        self.pending = false;
        line.unwrap_or(Ok(None))
    }
}
