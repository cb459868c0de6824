//! fc-control: Control plane for a fleet of remote agent devices
//!
//! The daemon accepts agent connections over the `fc-protocol` transport,
//! tracks which devices are reachable, dispatches operator-issued and
//! scheduled commands, runs guarded shell sessions, and exposes all of it
//! to operator front-ends over a localhost IPC interface.

pub mod dispatch;
pub mod events;
pub mod ipc;
pub mod registry;
pub mod report;
pub mod scheduler;
pub mod security;
pub mod server;
pub mod shell;
pub mod state;
pub mod store;

pub use state::{Collaborators, ControlState};
