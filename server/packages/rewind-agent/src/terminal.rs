use std::io;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use rewind_agent_connection::{AgentConnection, AgentConnector, AgentEvent, ConnectOptions};
use rewind_agent_error::SessionError;
use rewind_agent_session::relay::connection_error;
use rewind_agent_session::{
    run_turn, EventSink, InterruptScope, KeyStream, RewindPlan, SessionState, TerminalKeys,
    TurnOutcome,
};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::input::ThreadLines;

const REWOUND_PREVIEW_CHARS: usize = 30;

/// Opens a fresh key source each time a response starts streaming.
pub type KeySourceFactory = Box<dyn Fn() -> io::Result<KeyStream> + Send + Sync>;

/// Resolves when the user aborts input at a prompt.
pub type AbortSignalFactory = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

enum LoopExit {
    Exit,
    Rewind { session_id: String, plan: RewindPlan },
}

/// Line-oriented chat loop with Esc-to-interrupt and `/rewind`.
///
/// Each connection lives until the user exits or rewinds; a rewind closes it
/// and reconnects to the same session positioned at the chosen checkpoint.
pub struct TerminalSession<W> {
    input: ThreadLines,
    output: W,
    connector: Arc<dyn AgentConnector>,
    key_source: KeySourceFactory,
    abort_signal: AbortSignalFactory,
    state: SessionState,
    interrupt_disabled_logged: bool,
}

impl<W> TerminalSession<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(input: ThreadLines, output: W, connector: Arc<dyn AgentConnector>) -> Self {
        Self {
            input,
            output,
            connector,
            key_source: Box::new(|| TerminalKeys::open().map(|keys| keys.boxed())),
            abort_signal: Box::new(|| {
                async {
                    if let Err(err) = tokio::signal::ctrl_c().await {
                        tracing::warn!(error = %err, "ctrl-c handler unavailable");
                        futures::future::pending::<()>().await;
                    }
                }
                .boxed()
            }),
            state: SessionState::new(),
            interrupt_disabled_logged: false,
        }
    }

    pub fn with_key_source(
        mut self,
        key_source: impl Fn() -> io::Result<KeyStream> + Send + Sync + 'static,
    ) -> Self {
        self.key_source = Box::new(key_source);
        self
    }

    pub fn with_abort_signal(
        mut self,
        abort_signal: impl Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    ) -> Self {
        self.abort_signal = Box::new(abort_signal);
        self
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn into_output(self) -> W {
        self.output
    }

    pub async fn run(&mut self) -> Result<(), SessionError> {
        let mut rewind: Option<(String, RewindPlan)> = None;
        loop {
            let options = match (&rewind, &self.state.session_id) {
                (Some((session_id, plan)), _) => ConnectOptions::resume(session_id.clone())
                    .at_checkpoint(plan.resume_assistant_checkpoint.clone()),
                (None, Some(session_id)) => ConnectOptions::resume(session_id.clone()),
                (None, None) => ConnectOptions::new_session(),
            };
            let connection = self
                .connector
                .connect(options)
                .await
                .map_err(connection_error)?;

            if let Some((_, plan)) = rewind.take() {
                let prompt: String = plan
                    .target
                    .prompt_text
                    .chars()
                    .take(REWOUND_PREVIEW_CHARS)
                    .collect();
                self.write_line(&format!("[Rewound to: {prompt}...]"))
                    .await?;
            }

            let exit = self.converse(connection.as_ref()).await;
            connection.close().await;
            match exit? {
                LoopExit::Exit => {
                    self.write_line("Bye!").await?;
                    return Ok(());
                }
                LoopExit::Rewind { session_id, plan } => rewind = Some((session_id, plan)),
            }
        }
    }

    async fn converse(&mut self, connection: &dyn AgentConnection) -> Result<LoopExit, SessionError> {
        loop {
            self.write("> ").await?;
            let Some(line) = self.read_line().await? else {
                tracing::debug!("input aborted at prompt");
                self.write_line("").await?;
                return Ok(LoopExit::Exit);
            };
            let line = line.trim();

            if line.eq_ignore_ascii_case("/exit") {
                return Ok(LoopExit::Exit);
            }
            if line.eq_ignore_ascii_case("/rewind") {
                if let Some((session_id, plan)) = self.rewind_menu(connection).await? {
                    return Ok(LoopExit::Rewind { session_id, plan });
                }
                continue;
            }
            if line.is_empty() {
                continue;
            }

            self.turn(connection, line).await?;
        }
    }

    async fn turn(&mut self, connection: &dyn AgentConnection, prompt: &str) -> Result<(), SessionError> {
        let scope = self.interrupt_scope();
        let mut sink = TerminalSink {
            output: &mut self.output,
        };
        let result = run_turn(connection, &mut self.state, prompt, &mut sink, scope.owner()).await;
        let watched = scope.finish().await;
        tracing::debug!(?watched, "watcher finished");

        match result {
            Ok(report) if report.outcome == TurnOutcome::Interrupted => {
                self.write_line("[interrupted]").await?;
            }
            Ok(_) => {}
            Err(err @ SessionError::SessionIdentityMismatch { .. }) => return Err(err),
            Err(err) => {
                tracing::warn!(error = %err, "turn failed");
                self.write_line(&format!("error: {err}")).await?;
            }
        }
        Ok(())
    }

    async fn rewind_menu(
        &mut self,
        connection: &dyn AgentConnection,
    ) -> Result<Option<(String, RewindPlan)>, SessionError> {
        let targets = self.state.history.rewind_targets();
        if targets.is_empty() {
            self.write_line("No messages to rewind to.").await?;
            return Ok(None);
        }
        // Resuming at a checkpoint needs the session it belongs to.
        let Some(session_id) = self.state.session_id.clone() else {
            tracing::warn!(turns = targets.len() + 1, "rewind: agent never reported a session id");
            self.write_line("error: session id unknown, cannot rewind").await?;
            return Ok(None);
        };

        self.write_line("\n=== Rewind to: ===").await?;
        for target in &targets {
            self.write_line(&format!("  {}. {}", target.number, target.preview))
                .await?;
        }
        self.write_line("  0. Cancel").await?;
        self.write("Select: ").await?;

        let choice = self
            .read_line()
            .await?
            .and_then(|line| line.trim().parse::<usize>().ok());
        let Some(target) = choice
            .filter(|number| *number >= 1)
            .and_then(|number| targets.get(number - 1))
        else {
            return Ok(None);
        };

        self.write_line("[Restoring files...]").await?;
        if let Err(err) = connection
            .restore_checkpoint(&target.user_checkpoint_id)
            .await
        {
            let err = connection_error(err);
            tracing::warn!(error = %err, "file restore failed");
            self.write_line(&format!("error: {err}")).await?;
            return Ok(None);
        }

        match self.state.history.resolve_rewind(&target.assistant_checkpoint_id) {
            Ok(plan) => Ok(Some((session_id, plan))),
            Err(err) => {
                self.write_line(&format!("error: {err}")).await?;
                Ok(None)
            }
        }
    }

    fn interrupt_scope(&mut self) -> InterruptScope {
        match (self.key_source)() {
            Ok(keys) => InterruptScope::spawn(keys),
            Err(err) => {
                if !self.interrupt_disabled_logged {
                    tracing::warn!(error = %err, "interrupt support disabled");
                    self.interrupt_disabled_logged = true;
                }
                InterruptScope::disabled()
            }
        }
    }

    /// `None` on end of input or Ctrl-C.
    async fn read_line(&mut self) -> Result<Option<String>, SessionError> {
        let aborted = (self.abort_signal)();
        tokio::select! {
            line = self.input.next_line() => line.map_err(terminal_error),
            _ = aborted => Ok(None),
        }
    }

    async fn write(&mut self, text: &str) -> Result<(), SessionError> {
        self.output
            .write_all(text.as_bytes())
            .await
            .map_err(terminal_error)?;
        self.output.flush().await.map_err(terminal_error)
    }

    async fn write_line(&mut self, text: &str) -> Result<(), SessionError> {
        self.write(&format!("{text}\n")).await
    }
}

/// Prints assistant text as `● <text>` followed by a blank line.
struct TerminalSink<'a, W> {
    output: &'a mut W,
}

impl<W> EventSink for TerminalSink<'_, W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn deliver<'a>(
        &'a mut self,
        event: &'a AgentEvent,
    ) -> BoxFuture<'a, Result<(), SessionError>> {
        async move {
            let AgentEvent::Assistant(message) = event else {
                return Ok(());
            };
            let text = message.text();
            if text.is_empty() {
                return Ok(());
            }
            self.output
                .write_all(format!("● {text}\n\n").as_bytes())
                .await
                .map_err(terminal_error)?;
            self.output.flush().await.map_err(terminal_error)
        }
        .boxed()
    }

    fn interrupting(&mut self) -> BoxFuture<'_, Result<(), SessionError>> {
        async move {
            self.output
                .write_all(b"\n[Esc: Interrupting...]\n")
                .await
                .map_err(terminal_error)?;
            self.output.flush().await.map_err(terminal_error)
        }
        .boxed()
    }
}

fn terminal_error(err: io::Error) -> SessionError {
    SessionError::Terminal {
        message: err.to_string(),
    }
}
