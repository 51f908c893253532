use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use crossterm::event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};

use crate::watcher::Key;

/// Key presses from the controlling terminal, held in cbreak mode for as long
/// as the stream lives.
///
/// Ctrl-C arrives as SIGINT while output processing is kept, so process
/// signals are merged in as [`Key::CtrlC`].
pub struct TerminalKeys {
    keys: BoxStream<'static, io::Result<Key>>,
    _mode: CbreakGuard,
}

impl TerminalKeys {
    pub fn open() -> io::Result<Self> {
        let mode = CbreakGuard::enable()?;
        let presses = EventStream::new().filter_map(|event| async move {
            match event {
                Ok(Event::Key(key)) => key_from_event(key).map(Ok),
                Ok(_) => None,
                Err(err) => Some(Err(err)),
            }
        });
        let interrupts = stream::unfold((), |()| async {
            let signal = tokio::signal::ctrl_c().await.map(|()| Key::CtrlC);
            Some((signal, ()))
        });

        Ok(Self {
            keys: stream::select(presses, interrupts).boxed(),
            _mode: mode,
        })
    }
}

impl std::fmt::Debug for TerminalKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalKeys").finish_non_exhaustive()
    }
}

impl Stream for TerminalKeys {
    type Item = io::Result<Key>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.keys.poll_next_unpin(cx)
    }
}

pub fn key_from_event(event: KeyEvent) -> Option<Key> {
    if event.kind == KeyEventKind::Release {
        return None;
    }
    let key = match event.code {
        KeyCode::Esc => Key::Esc,
        KeyCode::Char('c') | KeyCode::Char('C')
            if event.modifiers.contains(KeyModifiers::CONTROL) =>
        {
            Key::CtrlC
        }
        KeyCode::Char(ch) => Key::Char(ch),
        KeyCode::Enter => Key::Enter,
        _ => Key::Other,
    };
    Some(key)
}

/// Canonical mode and echo off, output processing kept. Restored on drop.
#[cfg(unix)]
struct CbreakGuard {
    fd: libc::c_int,
    original: libc::termios,
}

#[cfg(unix)]
impl CbreakGuard {
    fn enable() -> io::Result<Self> {
        let fd = libc::STDIN_FILENO;
        if unsafe { libc::isatty(fd) } != 1 {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "stdin is not a terminal",
            ));
        }
        let original = get_termios(fd)?;
        let mut cbreak = original;
        cbreak.c_lflag &= !(libc::ICANON | libc::ECHO);
        cbreak.c_cc[libc::VMIN] = 1;
        cbreak.c_cc[libc::VTIME] = 0;
        set_termios(fd, &cbreak)?;
        Ok(Self { fd, original })
    }
}

#[cfg(unix)]
impl Drop for CbreakGuard {
    fn drop(&mut self) {
        if let Err(err) = set_termios(self.fd, &self.original) {
            tracing::warn!(error = %err, "failed to restore terminal mode");
        }
    }
}

#[cfg(unix)]
fn get_termios(fd: libc::c_int) -> io::Result<libc::termios> {
    let mut termios = unsafe { std::mem::zeroed::<libc::termios>() };
    let result = unsafe { libc::tcgetattr(fd, &mut termios) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(termios)
}

#[cfg(unix)]
fn set_termios(fd: libc::c_int, termios: &libc::termios) -> io::Result<()> {
    let result = unsafe { libc::tcsetattr(fd, libc::TCSANOW, termios) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
struct CbreakGuard;

#[cfg(not(unix))]
impl CbreakGuard {
    fn enable() -> io::Result<Self> {
        crossterm::terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

#[cfg(not(unix))]
impl Drop for CbreakGuard {
    fn drop(&mut self) {
        if let Err(err) = crossterm::terminal::disable_raw_mode() {
            tracing::warn!(error = %err, "failed to restore terminal mode");
        }
    }
}
