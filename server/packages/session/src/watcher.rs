use std::io;

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tokio::task::JoinHandle;

use crate::interrupt::{InterruptChannel, InterruptOwner, InterruptSignal};

/// Source of raw key presses for one armed channel.
pub type KeyStream = BoxStream<'static, io::Result<Key>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Esc,
    CtrlC,
    Enter,
    Char(char),
    Other,
}

impl Key {
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Key::Esc | Key::CtrlC)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// An interrupt key tripped the channel.
    Interrupted,
    /// The owner closed the channel first.
    Stopped,
    InputEnded,
    InputFailed,
}

/// Waits on the next key or the stop signal, whichever comes first.
///
/// A stop that is already pending wins over a buffered key, so a watcher told
/// to stop never trips the channel.
pub async fn watch<S>(mut keys: S, signal: InterruptSignal) -> WatchOutcome
where
    S: Stream<Item = io::Result<Key>> + Unpin,
{
    loop {
        tokio::select! {
            biased;
            _ = signal.stopped() => return WatchOutcome::Stopped,
            next = keys.next() => match next {
                Some(Ok(key)) if key.is_interrupt() => {
                    return if signal.trip() {
                        tracing::debug!(?key, "watcher: interrupt requested");
                        WatchOutcome::Interrupted
                    } else {
                        WatchOutcome::Stopped
                    };
                }
                Some(Ok(key)) => {
                    tracing::debug!(?key, "watcher: ignoring key, press Esc to interrupt");
                }
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "watcher: key input failed");
                    return WatchOutcome::InputFailed;
                }
                None => return WatchOutcome::InputEnded,
            },
        }
    }
}

/// An armed interrupt channel plus the watcher task feeding it.
#[derive(Debug)]
pub struct InterruptScope {
    owner: InterruptOwner,
    watcher: Option<JoinHandle<WatchOutcome>>,
}

impl InterruptScope {
    pub fn spawn<S>(keys: S) -> Self
    where
        S: Stream<Item = io::Result<Key>> + Send + Unpin + 'static,
    {
        let (owner, signal) = InterruptChannel::arm();
        let watcher = tokio::spawn(watch(keys, signal));
        Self {
            owner,
            watcher: Some(watcher),
        }
    }

    /// A scope with nobody watching; it only ends by `finish`.
    pub fn disabled() -> Self {
        let (owner, _signal) = InterruptChannel::arm();
        Self {
            owner,
            watcher: None,
        }
    }

    pub fn owner(&self) -> &InterruptOwner {
        &self.owner
    }

    pub async fn tripped(&self) {
        self.owner.tripped().await
    }

    /// Closes the channel and waits for the watcher to exit, so the key
    /// source (and any terminal mode it holds) is released on return.
    pub async fn finish(mut self) -> Option<WatchOutcome> {
        self.owner.close();
        let watcher = self.watcher.take()?;
        match watcher.await {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                tracing::warn!(error = %err, "watcher task failed");
                None
            }
        }
    }
}

impl Drop for InterruptScope {
    fn drop(&mut self) {
        self.owner.close();
    }
}
