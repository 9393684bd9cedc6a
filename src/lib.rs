//! ptyrelay - browser terminal to PTY relay
//!
//! Serves a single WebSocket endpoint. Each connection gets its own shell on
//! a pseudo-terminal, gated by an optional shared secret, a global session
//! cap and one-session-per-source replacement.

pub mod admission;
pub mod api;
pub mod config;
pub mod heartbeat;
pub mod pty;
pub mod sanitize;
pub mod session;
pub mod shutdown;
