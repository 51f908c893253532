use futures::future::BoxFuture;
use futures::FutureExt;
use rewind_agent_error::SessionError;

use crate::history::History;

/// Conversation state owned by one session loop.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub session_id: Option<String>,
    pub history: History,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resumed(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            history: History::new(),
        }
    }

    /// Adopts the id reported by the agent. Returns true when the id was
    /// unknown until now. A different id than the one already held is an
    /// error and leaves the state untouched.
    pub fn observe_session_id(&mut self, reported: &str) -> Result<bool, SessionError> {
        match self.session_id.as_deref() {
            None => {
                tracing::info!(session_id = reported, "session id resolved");
                self.session_id = Some(reported.to_string());
                Ok(true)
            }
            Some(known) if known == reported => Ok(false),
            Some(known) => {
                tracing::error!(
                    expected = known,
                    reported,
                    "agent reported a different session id"
                );
                Err(SessionError::SessionIdentityMismatch {
                    expected: known.to_string(),
                    reported: reported.to_string(),
                })
            }
        }
    }
}

/// What the response relay updates while a turn runs: the session's state,
/// and wherever the session id has to be made visible once known.
pub trait SessionBinding: Send {
    fn state(&mut self) -> &mut SessionState;

    fn bind_session_id<'a>(
        &'a mut self,
        session_id: &'a str,
    ) -> BoxFuture<'a, Result<(), SessionError>>;
}

impl SessionBinding for SessionState {
    fn state(&mut self) -> &mut SessionState {
        self
    }

    fn bind_session_id<'a>(
        &'a mut self,
        session_id: &'a str,
    ) -> BoxFuture<'a, Result<(), SessionError>> {
        let result = self.observe_session_id(session_id).map(|_| ());
        futures::future::ready(result).boxed()
    }
}
