//! Server event model
//!
//! Every state change a client can observe is a [`ServerEvent`]. Controllers
//! publish them, the engine fans them out to subscribed sessions, and the
//! (external) socket layer serializes them under their wire names.
//!
//! Opaque firmware snapshots (settings, parser state, feeder/sender status)
//! travel as `serde_json::Value` so the event model stays firmware-agnostic.

use crate::types::ControllerKind;
use serde::Serialize;
use serde_json::Value;

/// A server-to-client event with its payload
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ServerEvent {
    /// First event of every session: what this daemon can drive
    Startup {
        /// Names of the available controller kinds.
        available_controllers: Vec<String>,
    },

    /// Controller kind bound to a connection
    ControllerType {
        /// Connection ident.
        ident: String,
        /// Firmware kind.
        kind: ControllerKind,
    },

    /// Last firmware settings snapshot
    ControllerSettings {
        /// Connection ident.
        ident: String,
        /// Opaque firmware-specific settings.
        settings: Value,
    },

    /// Last firmware state snapshot
    ControllerState {
        /// Connection ident.
        ident: String,
        /// Opaque firmware-specific state.
        state: Value,
    },

    /// A connection opened
    ConnectionOpen {
        /// Connection ident.
        ident: String,
        /// Connection options echoed back to the client.
        options: Value,
    },

    /// A connection closed
    ConnectionClose {
        /// Connection ident.
        ident: String,
    },

    /// Connection options changed while open
    ConnectionChange {
        /// Connection ident.
        ident: String,
        /// The updated options.
        options: Value,
    },

    /// A line the firmware sent, echoed to clients
    ConnectionRead {
        /// Connection ident.
        ident: String,
        /// The raw line.
        data: String,
    },

    /// A line or realtime byte written to the firmware
    ConnectionWrite {
        /// Connection ident.
        ident: String,
        /// The written data.
        data: String,
        /// Write source tag (client/feeder/sender/internal).
        source: String,
    },

    /// Transport-level failure
    ConnectionError {
        /// Connection ident.
        ident: String,
        /// Failure description.
        error: String,
    },

    /// Feeder queue status changed
    FeederStatus {
        /// Connection ident.
        ident: String,
        /// Snapshot of the feeder queue.
        status: Value,
    },

    /// Sender streaming status changed
    SenderStatus {
        /// Connection ident.
        ident: String,
        /// Snapshot of the sender counters.
        status: Value,
    },

    /// A program was loaded into the sender
    SenderLoad {
        /// Connection ident.
        ident: String,
        /// Program name.
        name: String,
        /// Program content.
        content: String,
    },

    /// The loaded program was discarded
    SenderUnload {
        /// Connection ident.
        ident: String,
    },

    /// Workflow state machine transitioned
    WorkflowState {
        /// Connection ident.
        ident: String,
        /// New workflow state name (idle/running/paused).
        state: String,
    },

    /// A triggered shell task started
    TaskStart {
        /// Task id.
        task_id: String,
    },

    /// A triggered shell task finished
    TaskFinish {
        /// Task id.
        task_id: String,
        /// Process exit code, when available.
        code: Option<i32>,
    },

    /// A triggered shell task failed to spawn or crashed
    TaskError {
        /// Task id.
        task_id: String,
        /// Failure description.
        error: String,
    },

    /// The daemon configuration changed on disk
    ConfigChange,

    /// Back-compat duplicate of [`ServerEvent::ControllerSettings`] under
    /// the firmware's own event name (`Grbl:settings`, ...)
    FirmwareSettings {
        /// Connection ident.
        ident: String,
        /// Firmware kind (names the event).
        kind: ControllerKind,
        /// Opaque firmware-specific settings.
        settings: Value,
    },

    /// Back-compat duplicate of [`ServerEvent::ControllerState`] under the
    /// firmware's own event name (`Grbl:state`, ...)
    FirmwareState {
        /// Connection ident.
        ident: String,
        /// Firmware kind (names the event).
        kind: ControllerKind,
        /// Opaque firmware-specific state.
        state: Value,
    },
}

impl ServerEvent {
    /// Wire name of this event
    pub fn name(&self) -> String {
        match self {
            Self::Startup { .. } => "startup".into(),
            Self::ControllerType { .. } => "controller:type".into(),
            Self::ControllerSettings { .. } => "controller:settings".into(),
            Self::ControllerState { .. } => "controller:state".into(),
            Self::ConnectionOpen { .. } => "connection:open".into(),
            Self::ConnectionClose { .. } => "connection:close".into(),
            Self::ConnectionChange { .. } => "connection:change".into(),
            Self::ConnectionRead { .. } => "connection:read".into(),
            Self::ConnectionWrite { .. } => "connection:write".into(),
            Self::ConnectionError { .. } => "connection:error".into(),
            Self::FeederStatus { .. } => "feeder:status".into(),
            Self::SenderStatus { .. } => "sender:status".into(),
            Self::SenderLoad { .. } => "sender:load".into(),
            Self::SenderUnload { .. } => "sender:unload".into(),
            Self::WorkflowState { .. } => "workflow:state".into(),
            Self::TaskStart { .. } => "task:start".into(),
            Self::TaskFinish { .. } => "task:finish".into(),
            Self::TaskError { .. } => "task:error".into(),
            Self::ConfigChange => "config:change".into(),
            Self::FirmwareSettings { kind, .. } => format!("{}:settings", kind),
            Self::FirmwareState { kind, .. } => format!("{}:state", kind),
        }
    }

    /// Ident of the connection this event belongs to, when scoped to one
    pub fn ident(&self) -> Option<&str> {
        match self {
            Self::ControllerType { ident, .. }
            | Self::ControllerSettings { ident, .. }
            | Self::ControllerState { ident, .. }
            | Self::ConnectionOpen { ident, .. }
            | Self::ConnectionClose { ident }
            | Self::ConnectionChange { ident, .. }
            | Self::ConnectionRead { ident, .. }
            | Self::ConnectionWrite { ident, .. }
            | Self::ConnectionError { ident, .. }
            | Self::FeederStatus { ident, .. }
            | Self::SenderStatus { ident, .. }
            | Self::SenderLoad { ident, .. }
            | Self::SenderUnload { ident }
            | Self::WorkflowState { ident, .. }
            | Self::FirmwareSettings { ident, .. }
            | Self::FirmwareState { ident, .. } => Some(ident),
            _ => None,
        }
    }
}
