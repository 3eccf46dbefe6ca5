//! # cncd Communication
//!
//! Communication protocols and firmware implementations for the cncd
//! daemon. Supports serial and TCP connections and firmware-specific
//! implementations for Grbl, Smoothieware, TinyG/g2core and Marlin.
//!
//! The heart of the crate is the streaming state machine every controller
//! runs: a [`sender::Sender`] streams a loaded program under a
//! firmware-appropriate flow-control protocol, a [`feeder::Feeder`] injects
//! ad-hoc command lines, and a per-firmware line runner parses the
//! firmware's replies. The generic [`controller::Controller`] composes the
//! three and enforces protocol timing.

pub mod controller;
pub mod event_trigger;
pub mod feeder;
pub mod gcode;
pub mod runner;
pub mod sender;
pub mod transport;
pub mod workflow;

pub use controller::{
    spawn_controller, Controller, ControllerCommand, ControllerDeps, ControllerHandle,
    ControllerMsg, FileService, WriteSource,
};
pub use event_trigger::{EventTrigger, ShellSpawner};
pub use feeder::{Feeder, FeederOutput};
pub use gcode::ExpressionContext;
pub use sender::{Sender, SenderEventOut, SenderStatus, StreamingProtocol};
pub use transport::{
    list_ports, ConnectionOptions, MockTransport, SerialPortRecord, SerialTransport,
    TcpTransport, Transport, TransportEvent,
};
pub use workflow::{Workflow, WorkflowState};
