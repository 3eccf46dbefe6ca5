//! Marlin dialect
//!
//! Strictly line-oriented send-response streaming: one line in flight, the
//! next goes out on `ok`. Readiness comes from the `M115` capability reply;
//! a later `start` banner (firmware restart) triggers another `M115`.

use super::dialect::{Dialect, HandshakeStep, OverrideKind, WireCommand};
use crate::runner::{MarlinRunner, RunnerEvent};
use crate::sender::StreamingProtocol;
use cncd_core::{ControllerKind, MachineState, Position};
use serde_json::Value;

/// Marlin capability set
#[derive(Debug)]
pub struct MarlinDialect {
    runner: MarlinRunner,
    feed_pct: i32,
    spindle_pct: i32,
}

impl MarlinDialect {
    /// Create a Marlin dialect
    pub fn new() -> Self {
        Self {
            runner: MarlinRunner::new(),
            feed_pct: 100,
            spindle_pct: 100,
        }
    }
}

impl Default for MarlinDialect {
    fn default() -> Self {
        Self::new()
    }
}

impl Dialect for MarlinDialect {
    fn kind(&self) -> ControllerKind {
        ControllerKind::Marlin
    }

    fn streaming_protocol(&self) -> StreamingProtocol {
        StreamingProtocol::SendResponse
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

    fn open_sequence(&self) -> Vec<HandshakeStep> {
        vec![HandshakeStep {
            delay_ms: 0,
            command: WireCommand::line("M115"),
        }]
    }

    fn is_ready_event(&self, ev: &RunnerEvent) -> bool {
        matches!(ev, RunnerEvent::Firmware { .. })
    }

    fn react(&mut self, ev: &RunnerEvent) -> Vec<WireCommand> {
        // A `start` banner means the firmware restarted; re-query M115.
        // Harmless when it races the open-sequence query (idempotent).
        if matches!(ev, RunnerEvent::Startup { firmware, .. } if firmware == "Marlin") {
            vec![WireCommand::line("M115")]
        } else {
            Vec::new()
        }
    }

    fn status_query(&self) -> Option<WireCommand> {
        Some(WireCommand::line("M114"))
    }

    fn parser_state_query(&self) -> Option<WireCommand> {
        Some(WireCommand::line("M105"))
    }

    fn reset_command(&self) -> WireCommand {
        WireCommand::line("M112")
    }

    fn homing_command(&self) -> Option<WireCommand> {
        Some(WireCommand::line("G28.2 X Y Z"))
    }

    fn encode_override(&mut self, kind: OverrideKind, delta: i32) -> Vec<WireCommand> {
        let (word, pct) = match kind {
            OverrideKind::Feed => ("M220", &mut self.feed_pct),
            OverrideKind::Spindle => ("M221", &mut self.spindle_pct),
            OverrideKind::Rapid => return Vec::new(),
        };

        *pct = if delta == 0 {
            100
        } else {
            (*pct + delta).clamp(10, 500)
        };
        vec![WireCommand::line(format!("{} S{}", word, *pct))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_sequence_queries_capabilities() {
        let dialect = MarlinDialect::new();
        let steps = dialect.open_sequence();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].command, WireCommand::line("M115"));
    }

    #[test]
    fn start_banner_requeries_m115() {
        let mut dialect = MarlinDialect::new();
        let ev = dialect.parse_line("start");
        assert_eq!(dialect.react(&ev), vec![WireCommand::line("M115")]);
    }

    #[test]
    fn overrides_clamp_to_marlin_range() {
        let mut dialect = MarlinDialect::new();
        for _ in 0..50 {
            dialect.encode_override(OverrideKind::Feed, 10);
        }
        assert_eq!(
            dialect.encode_override(OverrideKind::Feed, 10),
            vec![WireCommand::line("M220 S500")]
        );
        assert_eq!(
            dialect.encode_override(OverrideKind::Spindle, -10),
            vec![WireCommand::line("M221 S90")]
        );
    }

    #[test]
    fn no_realtime_bytes() {
        let dialect = MarlinDialect::new();
        assert!(!dialect.is_realtime_command("?"));
        assert!(dialect.pause_command().is_none());
    }
}
