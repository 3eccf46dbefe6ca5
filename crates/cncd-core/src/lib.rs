//! # cncd Core
//!
//! Core types, errors and the server event model for the cncd daemon.
//! Provides the fundamental abstractions shared by the communication,
//! settings and server crates.

pub mod error;
pub mod event;
pub mod types;

pub use error::{
    AuthError, Error, ProtocolError, Result, TransportError, ValidationError,
};
pub use event::ServerEvent;
pub use types::{ConnectionKind, ControllerKind, MachineState, Position};
