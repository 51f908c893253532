use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, Notify};

use crate::events::{AssistantMessage, ContentBlock, InitEvent, ResultEvent, UserEcho};
use crate::process::DEFAULT_DRAIN_TIMEOUT;
use crate::turn::TurnQueue;
use crate::{
    AgentConnection, AgentConnector, AgentEvent, ConnectOptions, ConnectionError, EventStream,
};

const MOCK_WORD_STREAM_DELAY_MS: u64 = 30;
const MOCK_EVENT_CHANNEL_SIZE: usize = 256;

/// What the mock agent does with each prompt.
#[derive(Debug, Clone)]
enum MockBehavior {
    /// `Echo: <prompt>`, streamed one word per assistant event.
    Echo,
    /// Replays the next script from a queue shared by every connection.
    Scripted(Arc<StdMutex<VecDeque<Vec<AgentEvent>>>>),
    /// Starts responding, then waits until interrupted.
    Stall,
}

/// Everything the mock observed, for assertions.
#[derive(Debug, Default)]
pub struct MockLog {
    connects: StdMutex<Vec<ConnectOptions>>,
    queries: StdMutex<Vec<String>>,
    restored: StdMutex<Vec<String>>,
    interrupts: AtomicUsize,
    closes: AtomicUsize,
}

impl MockLog {
    pub fn connects(&self) -> Vec<ConnectOptions> {
        lock(&self.connects).clone()
    }

    pub fn queries(&self) -> Vec<String> {
        lock(&self.queries).clone()
    }

    pub fn restored_checkpoints(&self) -> Vec<String> {
        lock(&self.restored).clone()
    }

    pub fn interrupt_count(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct MockConnector {
    behavior: MockBehavior,
    log: Arc<MockLog>,
    connection_counter: Arc<AtomicU64>,
    word_delay: Duration,
    connect_delay: Duration,
    connect_failure: Option<String>,
    reported_session_id: Option<String>,
}

impl MockConnector {
    pub fn echo() -> Self {
        Self::with_behavior(MockBehavior::Echo)
    }

    pub fn scripted(turns: Vec<Vec<AgentEvent>>) -> Self {
        Self::with_behavior(MockBehavior::Scripted(Arc::new(StdMutex::new(
            turns.into_iter().collect(),
        ))))
        .with_word_delay(Duration::ZERO)
    }

    pub fn stalling() -> Self {
        Self::with_behavior(MockBehavior::Stall)
    }

    fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            log: Arc::new(MockLog::default()),
            connection_counter: Arc::new(AtomicU64::new(0)),
            word_delay: Duration::from_millis(MOCK_WORD_STREAM_DELAY_MS),
            connect_delay: Duration::ZERO,
            connect_failure: None,
            reported_session_id: None,
        }
    }

    pub fn with_word_delay(mut self, delay: Duration) -> Self {
        self.word_delay = delay;
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.connect_failure = Some(message.into());
        self
    }

    /// Report this id in every `init` event regardless of what was resumed.
    pub fn reporting_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.reported_session_id = Some(session_id.into());
        self
    }

    pub fn log(&self) -> Arc<MockLog> {
        self.log.clone()
    }
}

impl AgentConnector for MockConnector {
    fn connect(
        &self,
        options: ConnectOptions,
    ) -> BoxFuture<'_, Result<Arc<dyn AgentConnection>, ConnectionError>> {
        async move {
            if !self.connect_delay.is_zero() {
                tokio::time::sleep(self.connect_delay).await;
            }
            lock(&self.log.connects).push(options.clone());
            if let Some(message) = &self.connect_failure {
                return Err(ConnectionError::Connect(message.clone()));
            }

            let connection_id = self.connection_counter.fetch_add(1, Ordering::SeqCst) + 1;
            let session_id = self
                .reported_session_id
                .clone()
                .or(options.resume)
                .unwrap_or_else(|| format!("mock-session-{connection_id}"));
            tracing::debug!(connection_id, session_id = %session_id, "mock agent connected");

            let (events, receiver) = mpsc::channel(MOCK_EVENT_CHANNEL_SIZE);
            let connection = MockConnection {
                inner: Arc::new(MockInner {
                    connection_id,
                    session_id,
                    behavior: self.behavior.clone(),
                    log: self.log.clone(),
                    events,
                    turns: TurnQueue::new(receiver, DEFAULT_DRAIN_TIMEOUT),
                    turn_counter: AtomicU64::new(0),
                    current: StdMutex::new(None),
                    word_delay: self.word_delay,
                    closed: AtomicBool::new(false),
                }),
            };
            Ok(Arc::new(connection) as Arc<dyn AgentConnection>)
        }
        .boxed()
    }
}

#[derive(Debug)]
pub struct MockConnection {
    inner: Arc<MockInner>,
}

#[derive(Debug)]
struct MockInner {
    connection_id: u64,
    session_id: String,
    behavior: MockBehavior,
    log: Arc<MockLog>,
    events: mpsc::Sender<AgentEvent>,
    turns: TurnQueue,
    turn_counter: AtomicU64,
    current: StdMutex<Option<Arc<TurnCancel>>>,
    word_delay: Duration,
    closed: AtomicBool,
}

#[derive(Debug, Default)]
struct TurnCancel {
    interrupted: AtomicBool,
    notify: Notify,
}

impl TurnCancel {
    fn cancel(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn is_cancelled(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

impl AgentConnection for MockConnection {
    fn query<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<(), ConnectionError>> {
        async move {
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(ConnectionError::Closed);
            }
            self.inner.turns.begin_turn().await?;
            lock(&self.inner.log.queries).push(prompt.to_string());

            let turn = self.inner.turn_counter.fetch_add(1, Ordering::SeqCst) + 1;
            let cancel = Arc::new(TurnCancel::default());
            *lock(&self.inner.current) = Some(cancel.clone());
            tokio::spawn(emit_turn(
                self.inner.clone(),
                turn,
                prompt.to_string(),
                cancel,
            ));
            Ok(())
        }
        .boxed()
    }

    fn receive_response(&self) -> Result<EventStream, ConnectionError> {
        self.inner.turns.response_stream()
    }

    fn interrupt(&self) -> BoxFuture<'_, Result<(), ConnectionError>> {
        async move {
            self.inner.log.interrupts.fetch_add(1, Ordering::SeqCst);
            if let Some(cancel) = lock(&self.inner.current).as_ref() {
                cancel.cancel();
            }
            Ok(())
        }
        .boxed()
    }

    fn restore_checkpoint<'a>(
        &'a self,
        checkpoint_id: &'a str,
    ) -> BoxFuture<'a, Result<(), ConnectionError>> {
        async move {
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(ConnectionError::Closed);
            }
            lock(&self.inner.log.restored).push(checkpoint_id.to_string());
            Ok(())
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        async move {
            if self.inner.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            self.inner.log.closes.fetch_add(1, Ordering::SeqCst);
            if let Some(cancel) = lock(&self.inner.current).take() {
                cancel.cancel();
            }
        }
        .boxed()
    }
}

async fn emit_turn(inner: Arc<MockInner>, turn: u64, prompt: String, cancel: Arc<TurnCancel>) {
    let checkpoint = |kind: &str, index: usize| {
        format!(
            "{}-c{}-t{}-{}{}",
            inner.session_id, inner.connection_id, turn, kind, index
        )
    };

    let script = match &inner.behavior {
        MockBehavior::Echo => {
            let reply = format!("Echo: {prompt}");
            let mut events = vec![init(&inner), user(&inner, checkpoint("u", 0), &prompt)];
            let words: Vec<&str> = reply.split_inclusive(' ').collect();
            for (index, word) in words.iter().enumerate() {
                events.push(assistant(&inner, checkpoint("a", index), word));
            }
            events.push(result(&inner, "success", false, Some(reply.clone())));
            events
        }
        MockBehavior::Scripted(queue) => {
            let next = lock(queue).pop_front();
            next.unwrap_or_else(|| {
                tracing::warn!(turn, "mock agent: no scripted turn left");
                vec![result(
                    &inner,
                    "error_during_execution",
                    true,
                    Some("no scripted turn".to_string()),
                )]
            })
        }
        MockBehavior::Stall => {
            let events = vec![
                init(&inner),
                user(&inner, checkpoint("u", 0), &prompt),
                assistant(&inner, checkpoint("a", 0), "Working"),
            ];
            for event in events {
                if inner.events.send(event).await.is_err() {
                    return;
                }
            }
            while !cancel.is_cancelled() {
                cancel.notify.notified().await;
            }
            let _ = inner.events.send(interrupted_result(&inner)).await;
            return;
        }
    };

    for event in script {
        if cancel.is_cancelled() {
            let _ = inner.events.send(interrupted_result(&inner)).await;
            return;
        }
        let is_result = event.is_result();
        if inner.events.send(event).await.is_err() || is_result {
            return;
        }
        if !inner.word_delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(inner.word_delay) => {}
                _ = cancel.notify.notified() => {}
            }
        }
    }
}

fn init(inner: &MockInner) -> AgentEvent {
    AgentEvent::Init(InitEvent {
        session_id: inner.session_id.clone(),
        model: Some("mock".to_string()),
        cwd: None,
    })
}

fn user(inner: &MockInner, uuid: String, prompt: &str) -> AgentEvent {
    AgentEvent::User(UserEcho {
        uuid: Some(uuid),
        session_id: Some(inner.session_id.clone()),
        text: Some(prompt.to_string()),
    })
}

fn assistant(inner: &MockInner, uuid: String, text: &str) -> AgentEvent {
    AgentEvent::Assistant(AssistantMessage {
        uuid: Some(uuid),
        session_id: Some(inner.session_id.clone()),
        content: vec![ContentBlock::Text {
            text: text.to_string(),
        }],
    })
}

fn result(inner: &MockInner, subtype: &str, is_error: bool, text: Option<String>) -> AgentEvent {
    AgentEvent::Result(ResultEvent {
        session_id: Some(inner.session_id.clone()),
        subtype: subtype.to_string(),
        is_error,
        result: text,
    })
}

fn interrupted_result(inner: &MockInner) -> AgentEvent {
    result(inner, "error_during_execution", true, None)
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
