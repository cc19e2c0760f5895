//! Per-room sandboxed language runtimes over WebSocket.
//!
//! Each connected room gets a [`session::RoomSession`] that drives one
//! [`runtime::LangRuntime`] at a time: an optional service with its private
//! network, an interactive REPL, and at most one running program. Processes
//! live behind the [`sandbox::ExecutionBackend`] seam, implemented for Docker.

pub mod config;
pub mod error;
pub mod http_server;
pub mod naming;
pub mod protocol;
pub mod runtime;
pub mod sandbox;
pub mod session;
pub mod state;
pub mod terminal;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
