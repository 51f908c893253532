//! Terminal client and multi-client web backend for interruptible,
//! rewindable agent sessions.

pub mod cli;
pub mod input;
pub mod router;
pub mod terminal;
