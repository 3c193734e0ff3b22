//! Agent-side terminal hosting.
//!
//! Two interchangeable backends implement [`TerminalBackend`]:
//!
//! - [`PtyBackend`] spawns shells on native pseudo-terminals (`portable-pty`).
//! - [`SidecarBackend`] delegates to an external helper process speaking
//!   line-delimited JSON on stdio.
//!
//! [`TerminalManager`] picks one of them and enforces the agent's terminal
//! limit. All outcomes are reported as [`BackendEvent`]s on one sink.

pub mod backend;
pub mod manager;
pub mod pty;
pub mod sidecar;

pub use backend::{BackendEvent, CreateOptions, EventSink, TerminalBackend};
pub use manager::{BackendKind, TerminalManager};
pub use pty::PtyBackend;
pub use sidecar::{SidecarBackend, SidecarTimings};
