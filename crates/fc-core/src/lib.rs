//! fc-core: Core abstractions and configuration for fleet-control
//!
//! This crate provides the shared identifiers, records, error taxonomy,
//! timer and ring-buffer primitives, collaborator traits and configuration
//! used by the control-plane daemon and its operator clients.

pub mod auth;
pub mod config;
pub mod error;
pub mod ipc;
pub mod records;
pub mod ring;
pub mod time;
pub mod timer;
pub mod traits;
pub mod types;

pub use error::FcError;
pub use ring::RingBuffer;
pub use timer::TimerHandle;
pub use types::{DeviceId, Severity, ShellSessionId, StatusFilter, Target, TaskId};
