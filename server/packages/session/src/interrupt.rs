use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptState {
    Armed,
    Tripped,
    Closed,
}

/// One-shot latch shared by the call streaming a response (the owner) and
/// the activity that may cancel it (the signal side).
///
/// The latch only ever leaves `Armed`: either the signal side trips it, or
/// the owner closes it when the stream is over. Both transitions are final.
#[derive(Debug)]
pub struct InterruptChannel;

impl InterruptChannel {
    pub fn arm() -> (InterruptOwner, InterruptSignal) {
        let (sender, _) = watch::channel(InterruptState::Armed);
        let state = Arc::new(sender);
        (
            InterruptOwner {
                state: state.clone(),
            },
            InterruptSignal { state },
        )
    }
}

/// Held by the streaming call for the lifetime of one query. Dropping it
/// closes the channel.
#[derive(Debug)]
pub struct InterruptOwner {
    state: Arc<watch::Sender<InterruptState>>,
}

impl InterruptOwner {
    pub fn state(&self) -> InterruptState {
        *self.state.borrow()
    }

    pub fn is_tripped(&self) -> bool {
        self.state() == InterruptState::Tripped
    }

    /// Resolves once the channel is tripped. Never resolves after `close`.
    pub async fn tripped(&self) {
        let mut receiver = self.state.subscribe();
        loop {
            let state = *receiver.borrow_and_update();
            if state == InterruptState::Tripped {
                return;
            }
            if receiver.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Moves an armed channel to `Closed`; a tripped channel stays tripped.
    pub fn close(&self) {
        self.state.send_if_modified(|state| {
            if *state == InterruptState::Armed {
                *state = InterruptState::Closed;
                true
            } else {
                false
            }
        });
    }
}

impl Drop for InterruptOwner {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug, Clone)]
pub struct InterruptSignal {
    state: Arc<watch::Sender<InterruptState>>,
}

impl InterruptSignal {
    pub fn state(&self) -> InterruptState {
        *self.state.borrow()
    }

    /// Returns true for the one call that moved the channel out of `Armed`.
    pub fn trip(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == InterruptState::Armed {
                *state = InterruptState::Tripped;
                true
            } else {
                false
            }
        })
    }

    /// Resolves as soon as the channel is no longer armed.
    pub async fn stopped(&self) {
        let mut receiver = self.state.subscribe();
        loop {
            let state = *receiver.borrow_and_update();
            if state != InterruptState::Armed {
                return;
            }
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }
}
