//! Connection contract for a streaming coding agent.
//!
//! An [`AgentConnection`] accepts one prompt at a time and yields the typed
//! [`AgentEvent`]s of the resulting turn until its `result` event. The crate
//! ships two transports: [`process::ProcessConnector`], which drives the agent
//! CLI over line-delimited JSON on stdio, and [`mock::MockConnector`], an
//! in-process agent for tests and offline runs.

use std::fmt::Debug;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use thiserror::Error;

pub mod events;
pub mod launch;
pub mod mock;
pub mod process;
mod turn;

pub use events::{AgentEvent, AssistantMessage, ContentBlock, InitEvent, ResultEvent, UserEcho};

/// Events of a single turn, ending after the `result` event.
pub type EventStream = BoxStream<'static, Result<AgentEvent, ConnectionError>>;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to spawn subprocess `{command}`: {error}")]
    Spawn {
        command: String,
        #[source]
        error: std::io::Error,
    },
    #[error("failed to capture subprocess stdin")]
    MissingStdin,
    #[error("failed to capture subprocess stdout")]
    MissingStdout,
    #[error("failed to capture subprocess stderr")]
    MissingStderr,
    #[error("failed to serialize agent message: {0}")]
    Serialize(serde_json::Error),
    #[error("failed to write subprocess stdin: {0}")]
    Write(std::io::Error),
    #[error("timeout waiting for {operation}")]
    Timeout { operation: String },
    #[error("a query is already in flight on this connection")]
    QueryInFlight,
    #[error("no query has been issued on this connection")]
    NoQuery,
    #[error("connection closed")]
    Closed,
    #[error("control request `{subtype}` failed: {message}")]
    ControlFailed { subtype: String, message: String },
    #[error("connect failed: {0}")]
    Connect(String),
}

/// How a new connection should position itself in an existing session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Session to resume; `None` starts a new session.
    pub resume: Option<String>,
    /// Assistant checkpoint to resume the conversation context from.
    pub resume_session_at: Option<String>,
}

impl ConnectOptions {
    pub fn new_session() -> Self {
        Self::default()
    }

    pub fn resume(session_id: impl Into<String>) -> Self {
        Self {
            resume: Some(session_id.into()),
            resume_session_at: None,
        }
    }

    pub fn at_checkpoint(mut self, assistant_checkpoint: impl Into<String>) -> Self {
        self.resume_session_at = Some(assistant_checkpoint.into());
        self
    }
}

/// A live, long-lived connection to one agent session.
///
/// Only one query may be outstanding at a time: `query` fails with
/// [`ConnectionError::QueryInFlight`] while the previous response stream is
/// still being consumed.
pub trait AgentConnection: Send + Sync + Debug {
    fn query<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<(), ConnectionError>>;

    fn receive_response(&self) -> Result<EventStream, ConnectionError>;

    /// Best-effort cancellation of the in-flight response.
    fn interrupt(&self) -> BoxFuture<'_, Result<(), ConnectionError>>;

    /// Restore workspace files to the state captured at `checkpoint_id`.
    fn restore_checkpoint<'a>(
        &'a self,
        checkpoint_id: &'a str,
    ) -> BoxFuture<'a, Result<(), ConnectionError>>;

    fn close(&self) -> BoxFuture<'_, ()>;
}

pub trait AgentConnector: Send + Sync + Debug {
    fn connect(
        &self,
        options: ConnectOptions,
    ) -> BoxFuture<'_, Result<Arc<dyn AgentConnection>, ConnectionError>>;
}
