//! Dialect capability set
//!
//! The four firmwares share one controller skeleton and differ only in the
//! capabilities collected here: line parsing, readiness handshake, realtime
//! byte set, streaming protocol, query strings and override encoding.

use crate::runner::RunnerEvent;
use crate::sender::StreamingProtocol;
use cncd_core::{ControllerKind, MachineState, Position};
use serde_json::Value;

/// One outgoing unit: either raw realtime bytes or an LF-terminated line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireCommand {
    /// Raw bytes, written as-is (realtime commands)
    Bytes(Vec<u8>),
    /// A line; the controller appends the terminator
    Line(String),
}

impl WireCommand {
    /// Convenience constructor for single realtime bytes
    pub fn byte(b: u8) -> Self {
        WireCommand::Bytes(vec![b])
    }

    /// Convenience constructor for lines
    pub fn line(l: impl Into<String>) -> Self {
        WireCommand::Line(l.into())
    }
}

/// One step of the readiness handshake run after the transport opens
#[derive(Debug, Clone)]
pub struct HandshakeStep {
    /// Delay before the write, relative to the previous step.
    pub delay_ms: u64,
    /// What to write.
    pub command: WireCommand,
}

/// Which override a client adjusts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideKind {
    /// Feed rate override
    Feed,
    /// Spindle speed override
    Spindle,
    /// Rapid traverse override
    Rapid,
}

/// Firmware-specific capability set plugged into the shared controller
pub trait Dialect: Send + 'static {
    /// Firmware kind
    fn kind(&self) -> ControllerKind;

    /// Flow-control strategy for the sender
    fn streaming_protocol(&self) -> StreamingProtocol;

    /// Parse one inbound line, updating the runner model
    fn parse_line(&mut self, line: &str) -> RunnerEvent;

    /// Normalized machine activity state
    fn machine_state(&self) -> MachineState;

    /// Machine is idle
    fn is_idle(&self) -> bool;

    /// Feed hold is active
    fn is_hold(&self) -> bool;

    /// Alarm lockout is active
    fn is_alarm(&self) -> bool;

    /// Last reported machine position
    fn machine_position(&self) -> Position;

    /// Last reported work position
    fn work_position(&self) -> Position;

    /// Opaque settings snapshot published to clients
    fn settings_snapshot(&self) -> Value;

    /// Opaque state snapshot published to clients
    fn state_snapshot(&self) -> Value;

    /// `data` is a realtime command the firmware processes out-of-band;
    /// `writeln` must not append a terminator to it
    fn is_realtime_command(&self, _data: &str) -> bool {
        false
    }

    /// Writes scheduled right after the transport opens
    fn open_sequence(&self) -> Vec<HandshakeStep> {
        Vec::new()
    }

    /// The event that flips `ready`
    fn is_ready_event(&self, ev: &RunnerEvent) -> bool;

    /// Delay between the ready event and the init writes
    fn init_delay_ms(&self) -> u64 {
        0
    }

    /// One-shot post-ready setup writes
    fn init_commands(&self) -> Vec<WireCommand> {
        Vec::new()
    }

    /// Extra dialect reaction to an inbound event (e.g. Marlin re-sends
    /// `M115` when the firmware restarts)
    fn react(&mut self, _ev: &RunnerEvent) -> Vec<WireCommand> {
        Vec::new()
    }

    /// Periodic status query
    fn status_query(&self) -> Option<WireCommand>;

    /// Throttled parser-state query, when the dialect has one
    fn parser_state_query(&self) -> Option<WireCommand> {
        None
    }

    /// Feed-hold realtime command
    fn pause_command(&self) -> Option<WireCommand> {
        None
    }

    /// Cycle-start realtime command
    fn resume_command(&self) -> Option<WireCommand> {
        None
    }

    /// Firmware reset (Grbl `0x18`, Marlin `M112`)
    fn reset_command(&self) -> WireCommand;

    /// Homing cycle command
    fn homing_command(&self) -> Option<WireCommand> {
        None
    }

    /// Alarm unlock command
    fn unlock_command(&self) -> Option<WireCommand> {
        None
    }

    /// Sleep command
    fn sleep_command(&self) -> Option<WireCommand> {
        None
    }

    /// Jog cancel command
    fn jog_cancel_command(&self) -> Option<WireCommand> {
        None
    }

    /// Encode an override adjustment; `delta == 0` means reset
    fn encode_override(&mut self, kind: OverrideKind, delta: i32) -> Vec<WireCommand>;

    /// Rewrite an outgoing line before it reaches the wire, updating
    /// controller-observable state as a side effect
    fn write_filter(&mut self, line: &str) -> String {
        line.to_string()
    }
}
