//! IPC server for operator clients
//!
//! Provides a localhost JSON-lines server that operator front-ends use to
//! drive the running control-plane daemon and receive its notifications.

mod server;

pub use server::IpcServer;
