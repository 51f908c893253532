use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use rewind_agent_connection::{AgentConnection, AgentEvent, ConnectionError};
use rewind_agent_error::SessionError;

use crate::interrupt::InterruptOwner;
use crate::session::SessionBinding;

/// Destination for the events of a turn, in the order they arrive.
pub trait EventSink: Send {
    fn deliver<'a>(&'a mut self, event: &'a AgentEvent)
        -> BoxFuture<'a, Result<(), SessionError>>;

    /// Called once when an interrupt is noticed, before the agent is asked to
    /// stop. The agent may take a while to acknowledge.
    fn interrupting(&mut self) -> BoxFuture<'_, Result<(), SessionError>> {
        async { Ok(()) }.boxed()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed { subtype: String, is_error: bool },
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnReport {
    pub outcome: TurnOutcome,
    /// Session id carried by this turn's `init` event, if any.
    pub session_id: Option<String>,
    pub recorded: bool,
}

/// Checkpoints seen during the current turn only.
#[derive(Debug, Default)]
struct TurnCapture {
    session_id: Option<String>,
    saw_user: bool,
    user_checkpoint: Option<String>,
    assistant_checkpoint: Option<String>,
}

impl TurnCapture {
    fn observe(&mut self, event: &AgentEvent) {
        match event {
            AgentEvent::User(echo) if !self.saw_user => {
                self.saw_user = true;
                // A leading tool-result continuation has no text and does not
                // mark the start of a prompt.
                if echo.text.is_some() {
                    self.user_checkpoint = echo.uuid.clone();
                }
            }
            AgentEvent::Assistant(message) => {
                if let Some(uuid) = &message.uuid {
                    self.assistant_checkpoint = Some(uuid.clone());
                }
            }
            _ => {}
        }
    }
}

/// Sends `prompt` and relays the response to `sink` until its `result`
/// event, or until `interrupt` trips.
///
/// The turn is recorded into history only when it completed and both of its
/// checkpoints were captured. Sink failures detach the sink; the relay keeps
/// consuming so the turn still completes on the agent side.
pub async fn run_turn<B, S>(
    connection: &dyn AgentConnection,
    binding: &mut B,
    prompt: &str,
    sink: &mut S,
    interrupt: &InterruptOwner,
) -> Result<TurnReport, SessionError>
where
    B: SessionBinding + ?Sized,
    S: EventSink + ?Sized,
{
    connection.query(prompt).await.map_err(connection_error)?;
    let mut events = connection.receive_response().map_err(connection_error)?;
    let mut capture = TurnCapture::default();
    let mut sink_attached = true;

    loop {
        let next = tokio::select! {
            biased;
            _ = interrupt.tripped() => {
                tracing::info!("relay: interrupting response");
                if sink_attached {
                    if let Err(err) = sink.interrupting().await {
                        tracing::warn!(error = %err, "relay: sink failed to show interrupt");
                    }
                }
                if let Err(err) = connection.interrupt().await {
                    tracing::warn!(error = %err, "relay: interrupt request failed");
                }
                return Ok(TurnReport {
                    outcome: TurnOutcome::Interrupted,
                    session_id: capture.session_id,
                    recorded: false,
                });
            }
            next = events.next() => next,
        };

        let event = match next {
            Some(Ok(event)) => event,
            Some(Err(err)) => return Err(connection_error(err)),
            None => {
                return Err(SessionError::StreamError {
                    message: "response ended before its result".to_string(),
                })
            }
        };
        tracing::debug!(kind = event.kind(), event = ?event, "relay: event");

        if let AgentEvent::Init(init) = &event {
            if capture.session_id.is_none() {
                binding.bind_session_id(&init.session_id).await?;
                capture.session_id = Some(init.session_id.clone());
            }
        }
        capture.observe(&event);

        if sink_attached {
            if let Err(err) = sink.deliver(&event).await {
                tracing::warn!(error = %err, "relay: sink failed, continuing without it");
                sink_attached = false;
            }
        }

        if let AgentEvent::Result(result) = event {
            let recorded = match (capture.user_checkpoint, capture.assistant_checkpoint) {
                (Some(user), Some(assistant)) => {
                    binding.state().history.record(user, assistant, prompt);
                    true
                }
                _ => {
                    tracing::debug!("relay: turn not recorded, checkpoints missing");
                    false
                }
            };
            return Ok(TurnReport {
                outcome: TurnOutcome::Completed {
                    subtype: result.subtype,
                    is_error: result.is_error,
                },
                session_id: capture.session_id,
                recorded,
            });
        }
    }
}

pub fn connection_error(err: ConnectionError) -> SessionError {
    match err {
        ConnectionError::QueryInFlight => SessionError::Conflict {
            message: err.to_string(),
        },
        ConnectionError::Timeout { operation } => SessionError::Timeout {
            message: Some(operation),
        },
        ConnectionError::Spawn { .. }
        | ConnectionError::MissingStdin
        | ConnectionError::MissingStdout
        | ConnectionError::MissingStderr
        | ConnectionError::Connect(_) => SessionError::ConnectionUnavailable {
            message: err.to_string(),
        },
        other => SessionError::StreamError {
            message: other.to_string(),
        },
    }
}
