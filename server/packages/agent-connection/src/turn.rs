use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};

use crate::{AgentEvent, ConnectionError, EventStream};

/// Per-connection turn bookkeeping shared by every transport.
///
/// The receiver is held by at most one response stream at a time. A turn is
/// open from `begin_turn` until its `result` event has been read; a turn left
/// open by an abandoned stream is drained by the next `begin_turn`.
#[derive(Debug)]
pub(crate) struct TurnQueue {
    receiver: Arc<Mutex<mpsc::Receiver<AgentEvent>>>,
    turn_open: Arc<AtomicBool>,
    drain_timeout: Duration,
}

impl TurnQueue {
    pub(crate) fn new(receiver: mpsc::Receiver<AgentEvent>, drain_timeout: Duration) -> Self {
        Self {
            receiver: Arc::new(Mutex::new(receiver)),
            turn_open: Arc::new(AtomicBool::new(false)),
            drain_timeout,
        }
    }

    pub(crate) async fn begin_turn(&self) -> Result<(), ConnectionError> {
        if self.turn_open.load(Ordering::SeqCst) {
            let mut receiver = self
                .receiver
                .clone()
                .try_lock_owned()
                .map_err(|_| ConnectionError::QueryInFlight)?;
            match tokio::time::timeout(self.drain_timeout, drain_until_result(&mut receiver)).await
            {
                Ok(true) => {
                    tracing::debug!("turn: drained abandoned response");
                    self.turn_open.store(false, Ordering::SeqCst);
                }
                Ok(false) => return Err(ConnectionError::Closed),
                Err(_) => {
                    tracing::warn!(
                        drain_timeout_ms = self.drain_timeout.as_millis() as u64,
                        "turn: previous response did not finish draining"
                    );
                    return Err(ConnectionError::QueryInFlight);
                }
            }
        }

        self.turn_open
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| ConnectionError::QueryInFlight)
    }

    /// Undo `begin_turn` when the prompt could not be delivered.
    pub(crate) fn abort_turn(&self) {
        self.turn_open.store(false, Ordering::SeqCst);
    }

    pub(crate) fn response_stream(&self) -> Result<EventStream, ConnectionError> {
        if !self.turn_open.load(Ordering::SeqCst) {
            return Err(ConnectionError::NoQuery);
        }
        let receiver = self
            .receiver
            .clone()
            .try_lock_owned()
            .map_err(|_| ConnectionError::QueryInFlight)?;
        let turn_open = self.turn_open.clone();

        Ok(stream::unfold(Some((receiver, turn_open)), next_event).boxed())
    }
}

type StreamState = Option<(OwnedMutexGuard<mpsc::Receiver<AgentEvent>>, Arc<AtomicBool>)>;

async fn next_event(
    state: StreamState,
) -> Option<(Result<AgentEvent, ConnectionError>, StreamState)> {
    let (mut receiver, turn_open) = state?;
    match receiver.recv().await {
        Some(event) if event.is_result() => {
            turn_open.store(false, Ordering::SeqCst);
            Some((Ok(event), None))
        }
        Some(event) => Some((Ok(event), Some((receiver, turn_open)))),
        None => Some((Err(ConnectionError::Closed), None)),
    }
}

async fn drain_until_result(receiver: &mut mpsc::Receiver<AgentEvent>) -> bool {
    while let Some(event) = receiver.recv().await {
        if event.is_result() {
            return true;
        }
    }
    false
}
