use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch, Mutex};

use crate::launch::LaunchSpec;
use crate::turn::TurnQueue;
use crate::{
    AgentConnection, AgentConnector, AgentEvent, ConnectOptions, ConnectionError, EventStream,
};

const EVENT_CHANNEL_SIZE: usize = 512;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(120_000);
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Starts one agent CLI subprocess per connection.
#[derive(Debug, Clone)]
pub struct ProcessConnector {
    launch: LaunchSpec,
    request_timeout: Duration,
    drain_timeout: Duration,
}

impl ProcessConnector {
    pub fn new(launch: LaunchSpec) -> Self {
        Self {
            launch,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, request_timeout: Duration, drain_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self.drain_timeout = drain_timeout;
        self
    }
}

impl AgentConnector for ProcessConnector {
    fn connect(
        &self,
        options: ConnectOptions,
    ) -> BoxFuture<'_, Result<Arc<dyn AgentConnection>, ConnectionError>> {
        async move {
            let connection = ProcessConnection::start(
                &self.launch,
                &options,
                self.request_timeout,
                self.drain_timeout,
            )
            .await?;
            Ok(Arc::new(connection) as Arc<dyn AgentConnection>)
        }
        .boxed()
    }
}

#[derive(Debug)]
pub struct ProcessConnection {
    inner: Arc<ProcessInner>,
}

#[derive(Debug)]
struct ProcessInner {
    stdin: Mutex<ChildStdin>,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>,
    turns: TurnQueue,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    exited: watch::Receiver<bool>,
    request_counter: AtomicU64,
    request_timeout: Duration,
    shutting_down: AtomicBool,
    spawned_at: Instant,
}

impl ProcessConnection {
    pub async fn start(
        launch: &LaunchSpec,
        options: &ConnectOptions,
        request_timeout: Duration,
        drain_timeout: Duration,
    ) -> Result<Self, ConnectionError> {
        let spawn_start = Instant::now();
        let args = launch.command_args(options);

        let mut command = Command::new(&launch.program);
        command
            .args(&args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in launch.command_env() {
            command.env(key, value);
        }
        if let Some(cwd) = &launch.cwd {
            command.current_dir(cwd);
        }

        tracing::info!(
            program = ?launch.program,
            resume = ?options.resume,
            resume_session_at = ?options.resume_session_at,
            "spawning agent process"
        );

        let mut child = command.spawn().map_err(|err| {
            tracing::error!(program = ?launch.program, error = %err, "failed to spawn agent process");
            ConnectionError::Spawn {
                command: format_command_for_display(&launch.program, &args),
                error: err,
            }
        })?;

        tracing::info!(
            pid = child.id().unwrap_or(0),
            elapsed_ms = spawn_start.elapsed().as_millis() as u64,
            "agent process spawned"
        );

        let stdin = child.stdin.take().ok_or(ConnectionError::MissingStdin)?;
        let stdout = child.stdout.take().ok_or(ConnectionError::MissingStdout)?;
        let stderr = child.stderr.take().ok_or(ConnectionError::MissingStderr)?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);
        let pending = Arc::new(Mutex::new(HashMap::new()));

        spawn_stdout_loop(stdout, pending.clone(), event_tx, spawn_start);
        spawn_stderr_loop(stderr, spawn_start);
        spawn_exit_watcher(child, kill_rx, exited_tx, spawn_start);

        let connection = Self {
            inner: Arc::new(ProcessInner {
                stdin: Mutex::new(stdin),
                pending,
                turns: TurnQueue::new(event_rx, drain_timeout),
                kill: Mutex::new(Some(kill_tx)),
                exited: exited_rx,
                request_counter: AtomicU64::new(1),
                request_timeout,
                shutting_down: AtomicBool::new(false),
                spawned_at: spawn_start,
            }),
        };

        if let Err(err) = connection
            .control_request(json!({ "subtype": "initialize", "hooks": null }))
            .await
        {
            tracing::error!(error = %err, "agent process failed to initialize");
            connection.shutdown().await;
            return Err(err);
        }
        tracing::info!(
            ready_ms = spawn_start.elapsed().as_millis() as u64,
            "agent process ready"
        );

        Ok(connection)
    }

    async fn control_request(&self, request: Value) -> Result<Value, ConnectionError> {
        let subtype = request
            .get("subtype")
            .and_then(Value::as_str)
            .unwrap_or("<none>")
            .to_string();
        let request_id = format!(
            "req_{}",
            self.inner.request_counter.fetch_add(1, Ordering::SeqCst)
        );
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .await
            .insert(request_id.clone(), tx);

        let envelope = json!({
            "type": "control_request",
            "request_id": request_id,
            "request": request,
        });
        if let Err(err) = self.send_to_subprocess(&envelope).await {
            self.inner.pending.lock().await.remove(&request_id);
            return Err(err);
        }

        let response = match tokio::time::timeout(self.inner.request_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                tracing::error!(
                    request_id = %request_id,
                    subtype = %subtype,
                    "control: response channel dropped (agent process may have exited)"
                );
                return Err(ConnectionError::Closed);
            }
            Err(_) => {
                self.inner.pending.lock().await.remove(&request_id);
                tracing::error!(
                    request_id = %request_id,
                    subtype = %subtype,
                    timeout_ms = self.inner.request_timeout.as_millis() as u64,
                    age_ms = self.inner.spawned_at.elapsed().as_millis() as u64,
                    "control: TIMEOUT waiting for agent response"
                );
                return Err(ConnectionError::Timeout {
                    operation: format!("control request `{subtype}`"),
                });
            }
        };

        if response.pointer("/response/subtype").and_then(Value::as_str) == Some("error") {
            let message = response
                .pointer("/response/error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            return Err(ConnectionError::ControlFailed { subtype, message });
        }
        Ok(response)
    }

    async fn send_to_subprocess(&self, payload: &Value) -> Result<(), ConnectionError> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }
        let kind = payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("<none>");
        let bytes = serde_json::to_vec(payload).map_err(ConnectionError::Serialize)?;
        tracing::debug!(kind = kind, bytes = bytes.len(), "stdin: writing message to agent");

        let mut stdin = self.inner.stdin.lock().await;
        stdin.write_all(&bytes).await.map_err(|err| {
            tracing::error!(kind = kind, error = %err, "stdin: write_all failed");
            ConnectionError::Write(err)
        })?;
        stdin.write_all(b"\n").await.map_err(ConnectionError::Write)?;
        stdin.flush().await.map_err(ConnectionError::Write)?;
        Ok(())
    }

    async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(
            age_ms = self.inner.spawned_at.elapsed().as_millis() as u64,
            "shutting down agent process"
        );

        self.inner.pending.lock().await.clear();
        if let Some(kill) = self.inner.kill.lock().await.take() {
            let _ = kill.send(());
        }
        let exited = self.inner.exited.clone();
        if tokio::time::timeout(self.inner.request_timeout, wait_exited(exited))
            .await
            .is_err()
        {
            tracing::warn!("agent process did not exit before shutdown timeout");
        }
    }
}

impl AgentConnection for ProcessConnection {
    fn query<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<(), ConnectionError>> {
        async move {
            self.inner.turns.begin_turn().await?;
            let message = json!({
                "type": "user",
                "message": { "role": "user", "content": prompt },
                "parent_tool_use_id": null,
                "session_id": "default",
            });
            if let Err(err) = self.send_to_subprocess(&message).await {
                self.inner.turns.abort_turn();
                return Err(err);
            }
            Ok(())
        }
        .boxed()
    }

    fn receive_response(&self) -> Result<EventStream, ConnectionError> {
        self.inner.turns.response_stream()
    }

    fn interrupt(&self) -> BoxFuture<'_, Result<(), ConnectionError>> {
        async move {
            self.control_request(json!({ "subtype": "interrupt" }))
                .await
                .map(|_| ())
        }
        .boxed()
    }

    fn restore_checkpoint<'a>(
        &'a self,
        checkpoint_id: &'a str,
    ) -> BoxFuture<'a, Result<(), ConnectionError>> {
        async move {
            self.control_request(json!({
                "subtype": "rewind_files",
                "user_message_id": checkpoint_id,
            }))
            .await
            .map(|_| ())
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        self.shutdown().boxed()
    }
}

fn spawn_stdout_loop(
    stdout: tokio::process::ChildStdout,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>,
    events: mpsc::Sender<AgentEvent>,
    spawned_at: Instant,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        let mut line_count: u64 = 0;

        while let Ok(Some(line)) = lines.next_line().await {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            line_count += 1;

            let payload = match serde_json::from_str::<Value>(trimmed) {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        line_number = line_count,
                        raw = %truncate_for_log(trimmed),
                        "agent stdout: invalid JSON"
                    );
                    continue;
                }
            };

            match payload.get("type").and_then(Value::as_str) {
                Some("control_response") => {
                    let request_id = payload
                        .pointer("/response/request_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    match pending.lock().await.remove(&request_id) {
                        Some(tx) => {
                            let _ = tx.send(payload);
                        }
                        None => tracing::warn!(
                            request_id = %request_id,
                            "agent stdout: control response has no matching pending request (orphan)"
                        ),
                    }
                    continue;
                }
                Some("control_request") => {
                    tracing::warn!(
                        raw = %truncate_for_log(trimmed),
                        "agent stdout: unsolicited control request ignored"
                    );
                    continue;
                }
                _ => {}
            }

            tracing::debug!(line_number = line_count, raw = %payload, "agent stdout: message");
            let Some(event) = AgentEvent::from_wire(&payload) else {
                continue;
            };
            if events.send(event).await.is_err() {
                break;
            }
        }

        pending.lock().await.clear();
        tracing::info!(
            total_lines = line_count,
            age_ms = spawned_at.elapsed().as_millis() as u64,
            "agent stdout: stream ended"
        );
    });
}

fn spawn_stderr_loop(stderr: tokio::process::ChildStderr, spawned_at: Instant) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut line_count: u64 = 0;

        while let Ok(Some(line)) = lines.next_line().await {
            line_count += 1;
            tracing::info!(
                line_number = line_count,
                age_ms = spawned_at.elapsed().as_millis() as u64,
                "agent stderr: {}",
                line
            );
        }
    });
}

fn spawn_exit_watcher(
    mut child: Child,
    kill: oneshot::Receiver<()>,
    exited: watch::Sender<bool>,
    spawned_at: Instant,
) {
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status.ok(),
            _ = kill => {
                let _ = child.kill().await;
                child.wait().await.ok()
            }
        };

        let age_ms = spawned_at.elapsed().as_millis() as u64;
        match status {
            Some(status) => tracing::info!(
                success = status.success(),
                code = status.code(),
                age_ms = age_ms,
                "agent process exited"
            ),
            None => tracing::error!(age_ms = age_ms, "agent process: failed to get exit status"),
        }
        let _ = exited.send(true);
    });
}

async fn wait_exited(mut exited: watch::Receiver<bool>) {
    while !*exited.borrow() {
        if exited.changed().await.is_err() {
            return;
        }
    }
}

fn truncate_for_log(line: &str) -> String {
    if line.len() > 200 {
        let mut end = 200;
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &line[..end])
    } else {
        line.to_string()
    }
}

fn format_command_for_display(program: &std::path::Path, args: &[String]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(shell_quote(program.to_string_lossy().as_ref()));
    for arg in args {
        parts.push(shell_quote(arg));
    }
    parts.join(" ")
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}
