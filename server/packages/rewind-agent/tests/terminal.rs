use std::io::{self, Cursor, Read};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, FutureExt, StreamExt};
use rewind_agent::input::ThreadLines;
use rewind_agent::terminal::TerminalSession;
use rewind_agent_connection::events::{AssistantMessage, ContentBlock, ResultEvent, UserEcho};
use rewind_agent_connection::mock::MockConnector;
use rewind_agent_connection::{AgentEvent, ConnectOptions};
use rewind_agent_session::{Key, KeyStream};

fn no_terminal() -> io::Result<KeyStream> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "no terminal"))
}

fn esc_after(delay: Duration) -> io::Result<KeyStream> {
    Ok(stream::once(async move {
        tokio::time::sleep(delay).await;
        Ok(Key::Esc)
    })
    .chain(stream::pending::<io::Result<Key>>())
    .boxed())
}

struct Run {
    output: String,
    turns: usize,
    session_id: Option<String>,
}

async fn run_chat(connector: &MockConnector, input: &'static str) -> Run {
    run_chat_with_keys(connector, input, no_terminal).await
}

async fn run_chat_with_keys(
    connector: &MockConnector,
    input: &'static str,
    keys: fn() -> io::Result<KeyStream>,
) -> Run {
    let mut session = TerminalSession::new(
        scripted_input(input),
        Vec::<u8>::new(),
        Arc::new(connector.clone()),
    )
    .with_key_source(keys);
    tokio::time::timeout(Duration::from_secs(5), session.run())
        .await
        .expect("chat finished in time")
        .expect("chat succeeded");
    let turns = session.state().history.len();
    let session_id = session.state().session_id.clone();
    Run {
        output: String::from_utf8(session.into_output()).expect("utf8 output"),
        turns,
        session_id,
    }
}

fn scripted_input(input: &'static str) -> ThreadLines {
    ThreadLines::spawn(move || Cursor::new(input.as_bytes())).expect("input thread")
}

/// Serves its text, then blocks like a terminal nobody is typing into.
struct OpenInput {
    text: Cursor<&'static [u8]>,
    hold: std_mpsc::Receiver<()>,
}

impl Read for OpenInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.text.read(buf)?;
        if read == 0 {
            let _ = self.hold.recv();
        }
        Ok(read)
    }
}

fn echo() -> MockConnector {
    MockConnector::echo().with_word_delay(Duration::ZERO)
}

#[tokio::test]
async fn prints_assistant_text_and_says_bye() {
    let connector = echo();
    let run = run_chat(&connector, "hello\n/exit\n").await;

    assert!(run.output.starts_with("> "), "{}", run.output);
    assert!(run.output.contains("● Echo: \n\n● hello\n\n"), "{}", run.output);
    assert!(run.output.ends_with("Bye!\n"), "{}", run.output);
    assert_eq!(run.turns, 1);
    assert_eq!(run.session_id.as_deref(), Some("mock-session-1"));
    assert_eq!(connector.log().close_count(), 1);
}

#[tokio::test]
async fn end_of_input_exits_and_blank_lines_are_skipped() {
    let connector = echo();
    let run = run_chat(&connector, "\n   \nhi\n").await;

    assert_eq!(connector.log().queries(), vec!["hi".to_string()]);
    assert!(run.output.ends_with("> \nBye!\n"), "{}", run.output);
}

#[tokio::test]
async fn exit_command_is_case_insensitive() {
    let connector = echo();
    let run = run_chat(&connector, "/EXIT\nnever sent\n").await;

    assert!(connector.log().queries().is_empty());
    assert!(run.output.contains("Bye!"));
}

#[tokio::test]
async fn rewind_with_a_single_turn_has_nothing_to_offer() {
    let connector = echo();
    let run = run_chat(&connector, "only\n/rewind\n/exit\n").await;

    assert!(run.output.contains("No messages to rewind to."), "{}", run.output);
    assert!(connector.log().restored_checkpoints().is_empty());
    assert_eq!(connector.log().connects().len(), 1);
}

#[tokio::test]
async fn rewind_restores_files_and_resumes_before_the_chosen_prompt() {
    let connector = echo();
    let log = connector.log();
    let run = run_chat(&connector, "one\ntwo\nthree\n/rewind\n2\n/exit\n").await;

    assert!(run.output.contains("\n=== Rewind to: ===\n"), "{}", run.output);
    assert!(run.output.contains("  1. two\n  2. three\n  0. Cancel\nSelect: "));
    assert!(run.output.contains("[Restoring files...]"));
    assert!(run.output.contains("[Rewound to: three...]"));

    assert_eq!(
        log.restored_checkpoints(),
        vec!["mock-session-1-c1-t3-u0".to_string()]
    );
    assert_eq!(
        log.connects(),
        vec![
            ConnectOptions::new_session(),
            ConnectOptions::resume("mock-session-1").at_checkpoint("mock-session-1-c1-t2-a1"),
        ]
    );
    assert_eq!(run.turns, 3);
    assert_eq!(log.close_count(), 2);
}

#[tokio::test]
async fn turns_after_a_rewind_extend_the_truncated_history() {
    let connector = echo();
    let log = connector.log();
    let run = run_chat(&connector, "one\ntwo\nthree\n/rewind\n1\nfour\n/exit\n").await;

    assert!(run.output.contains("[Rewound to: two...]"));
    assert_eq!(
        log.restored_checkpoints(),
        vec!["mock-session-1-c1-t2-u0".to_string()]
    );
    assert_eq!(
        log.connects()[1],
        ConnectOptions::resume("mock-session-1").at_checkpoint("mock-session-1-c1-t1-a1")
    );
    assert_eq!(run.turns, 3);
    assert!(run.output.contains("● four"));
}

#[tokio::test]
async fn cancelled_or_invalid_selection_keeps_the_connection() {
    let connector = echo();
    let log = connector.log();
    let run = run_chat(&connector, "one\ntwo\n/rewind\n0\n/rewind\nabc\n/exit\n").await;

    assert!(log.restored_checkpoints().is_empty());
    assert_eq!(log.connects().len(), 1);
    assert_eq!(run.turns, 2);
}

#[tokio::test]
async fn escape_interrupts_the_response_without_recording_it() {
    let connector = MockConnector::stalling().with_word_delay(Duration::ZERO);
    let log = connector.log();
    let run = run_chat_with_keys(&connector, "long task\n/exit\n", || {
        esc_after(Duration::from_millis(50))
    })
    .await;

    assert!(run.output.contains("● Working"), "{}", run.output);
    assert!(run.output.contains("[Esc: Interrupting...]\n[interrupted]\n"));
    assert!(run.output.ends_with("Bye!\n"));
    assert_eq!(run.turns, 0);
    assert_eq!(log.interrupt_count(), 1);
}

#[tokio::test]
async fn connect_failure_ends_the_chat_with_an_error() {
    let connector = echo().failing("agent binary missing");
    let mut session =
        TerminalSession::new(scripted_input("hello\n"), Vec::<u8>::new(), Arc::new(connector))
            .with_key_source(no_terminal);

    let err = session.run().await.expect_err("connect fails");
    assert!(matches!(
        err,
        rewind_agent_error::SessionError::ConnectionUnavailable { .. }
    ));
}

#[test]
fn abort_at_prompt_ends_chat_while_input_is_still_open() {
    let (hold_tx, hold_rx) = std_mpsc::channel::<()>();
    let (done_tx, done_rx) = std_mpsc::channel();
    let connector = echo();

    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .expect("runtime");
        let input = ThreadLines::spawn(move || {
            io::BufReader::new(OpenInput {
                text: Cursor::new(b"hello\n".as_slice()),
                hold: hold_rx,
            })
        })
        .expect("input thread");
        let output = runtime.block_on(async move {
            let mut session = TerminalSession::new(input, Vec::<u8>::new(), Arc::new(connector))
                .with_key_source(no_terminal)
                .with_abort_signal(|| tokio::time::sleep(Duration::from_millis(300)).boxed());
            session.run().await.expect("chat");
            session.into_output()
        });
        drop(runtime);
        let _ = done_tx.send(output);
    });

    let output = done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("chat and runtime finish while input is still open");
    let output = String::from_utf8(output).expect("utf8 output");
    assert!(output.contains("● hello"), "{output}");
    assert!(output.ends_with("> \nBye!\n"), "{output}");
    drop(hold_tx);
}

fn user_echo(uuid: &str, text: &str) -> AgentEvent {
    AgentEvent::User(UserEcho {
        uuid: Some(uuid.to_string()),
        session_id: None,
        text: Some(text.to_string()),
    })
}

fn reply(uuid: &str, text: &str) -> AgentEvent {
    AgentEvent::Assistant(AssistantMessage {
        uuid: Some(uuid.to_string()),
        session_id: None,
        content: vec![ContentBlock::Text {
            text: text.to_string(),
        }],
    })
}

fn success() -> AgentEvent {
    AgentEvent::Result(ResultEvent {
        session_id: None,
        subtype: "success".to_string(),
        is_error: false,
        result: None,
    })
}

#[tokio::test]
async fn rewind_needs_a_known_session_id() {
    // The agent never sends `init`, so turns are recorded without a session.
    let connector = MockConnector::scripted(vec![
        vec![user_echo("u1", "one"), reply("a1", "first"), success()],
        vec![user_echo("u2", "two"), reply("a2", "second"), success()],
    ]);
    let log = connector.log();
    let run = run_chat(&connector, "one\ntwo\n/rewind\n/exit\n").await;

    assert_eq!(run.turns, 2);
    assert!(run.session_id.is_none());
    assert!(
        run.output.contains("error: session id unknown, cannot rewind"),
        "{}",
        run.output
    );
    assert!(!run.output.contains("[Rewound to:"));
    assert!(log.restored_checkpoints().is_empty());
    assert_eq!(log.connects(), vec![ConnectOptions::new_session()]);
}
