//! TinyG / g2core dialect
//!
//! JSON-framed queries, realtime `!`/`~`/`0x18`, and queue-report-driven
//! streaming: the sender's window is replenished by `{"qr": n}` planner
//! reports rather than `ok` counting, with a low-water mark of four free
//! slots kept in reserve.

use super::dialect::{Dialect, HandshakeStep, OverrideKind, WireCommand};
use crate::runner::{RunnerEvent, TinyGRunner};
use crate::sender::StreamingProtocol;
use cncd_core::{ControllerKind, MachineState, Position};
use serde_json::Value;

/// Free planner slots kept in reserve while streaming
pub const TINYG_QUEUE_LOW_WATER: u32 = 4;

/// TinyG/g2core capability set
#[derive(Debug, Default)]
pub struct TinyGDialect {
    runner: TinyGRunner,
}

impl TinyGDialect {
    /// Create a TinyG dialect
    pub fn new() -> Self {
        Self::default()
    }
}

impl Dialect for TinyGDialect {
    fn kind(&self) -> ControllerKind {
        ControllerKind::TinyG
    }

    fn streaming_protocol(&self) -> StreamingProtocol {
        StreamingProtocol::QueueReport {
            low_water: TINYG_QUEUE_LOW_WATER,
        }
    }

    fn parse_line(&mut self, line: &str) -> RunnerEvent {
        self.runner.parse(line)
    }

    fn machine_state(&self) -> MachineState {
        self.runner.machine_state()
    }

    fn is_idle(&self) -> bool {
        self.runner.is_idle()
    }

    fn is_hold(&self) -> bool {
        self.runner.is_hold()
    }

    fn is_alarm(&self) -> bool {
        self.runner.is_alarm()
    }

    fn machine_position(&self) -> Position {
        self.runner.machine_position()
    }

    fn work_position(&self) -> Position {
        self.runner.work_position()
    }

    fn settings_snapshot(&self) -> Value {
        self.runner.settings_snapshot()
    }

    fn state_snapshot(&self) -> Value {
        self.runner.state_snapshot()
    }

    fn is_realtime_command(&self, data: &str) -> bool {
        let bytes = data.as_bytes();
        bytes.len() == 1 && matches!(bytes[0], b'!' | b'~' | b'%' | 0x18)
    }

    fn open_sequence(&self) -> Vec<HandshakeStep> {
        // Strict JSON mode, terse responses, filtered queue/status reports,
        // then the system group to learn who we are talking to
        [
            r#"{"js":1}"#,
            r#"{"jv":4}"#,
            r#"{"qv":1}"#,
            r#"{"sv":1}"#,
            r#"{"si":250}"#,
            r#"{"sys":null}"#,
            r#"{"sr":null}"#,
        ]
        .iter()
        .map(|cmd| HandshakeStep {
            delay_ms: 50,
            command: WireCommand::line(*cmd),
        })
        .collect()
    }

    fn is_ready_event(&self, ev: &RunnerEvent) -> bool {
        matches!(ev, RunnerEvent::Startup { firmware, .. } if firmware == "TinyG")
    }

    fn status_query(&self) -> Option<WireCommand> {
        Some(WireCommand::line(r#"{"sr":null}"#))
    }

    fn pause_command(&self) -> Option<WireCommand> {
        Some(WireCommand::byte(b'!'))
    }

    fn resume_command(&self) -> Option<WireCommand> {
        Some(WireCommand::byte(b'~'))
    }

    fn reset_command(&self) -> WireCommand {
        WireCommand::byte(0x18)
    }

    fn homing_command(&self) -> Option<WireCommand> {
        Some(WireCommand::line("G28.2 X0 Y0 Z0"))
    }

    fn unlock_command(&self) -> Option<WireCommand> {
        Some(WireCommand::line(r#"{"clear":null}"#))
    }

    fn encode_override(&mut self, _kind: OverrideKind, _delta: i32) -> Vec<WireCommand> {
        // TinyG exposes no runtime override commands
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_mode_handshake() {
        let dialect = TinyGDialect::new();
        let steps = dialect.open_sequence();
        assert_eq!(steps[0].command, WireCommand::line(r#"{"js":1}"#));
        assert!(steps
            .iter()
            .any(|s| s.command == WireCommand::line(r#"{"sys":null}"#)));
    }

    #[test]
    fn queue_report_streaming() {
        let dialect = TinyGDialect::new();
        assert_eq!(
            dialect.streaming_protocol(),
            StreamingProtocol::QueueReport { low_water: 4 }
        );
    }

    #[test]
    fn overrides_are_noops() {
        let mut dialect = TinyGDialect::new();
        assert!(dialect.encode_override(OverrideKind::Feed, 10).is_empty());
    }
}
