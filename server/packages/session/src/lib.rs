//! Session control around a streaming agent connection: interrupting a
//! response in flight, rewinding to an earlier turn, and sharing persistent
//! connections between many clients.

pub mod history;
pub mod interrupt;
pub mod registry;
pub mod relay;
pub mod session;
pub mod tty;
pub mod watcher;

pub use history::{History, RewindPlan, RewindTarget, Turn};
pub use interrupt::{InterruptChannel, InterruptOwner, InterruptSignal, InterruptState};
pub use registry::{SessionInfo, SessionLease, SessionRegistry};
pub use relay::{run_turn, EventSink, TurnOutcome, TurnReport};
pub use session::{SessionBinding, SessionState};
pub use tty::TerminalKeys;
pub use watcher::{InterruptScope, Key, KeyStream, WatchOutcome};
