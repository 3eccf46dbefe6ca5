//! Smoothieware dialect
//!
//! Character-counting streaming against a 127-byte window, Grbl-style
//! realtime bytes, and a delayed `version` handshake: Smoothieboards need
//! about a second after connect before they answer.

use super::dialect::{Dialect, HandshakeStep, OverrideKind, WireCommand};
use crate::runner::{RunnerEvent, SmoothieRunner};
use crate::sender::StreamingProtocol;
use cncd_core::{ControllerKind, MachineState, Position};
use serde_json::Value;

/// Smoothieware RX window in bytes
pub const SMOOTHIE_RX_BUFFER_SIZE: usize = 127;

/// Smoothieware capability set
#[derive(Debug)]
pub struct SmoothieDialect {
    runner: SmoothieRunner,
    feed_pct: i32,
    spindle_pct: i32,
}

impl SmoothieDialect {
    /// Create a Smoothieware dialect
    pub fn new() -> Self {
        Self {
            runner: SmoothieRunner::new(),
            feed_pct: 100,
            spindle_pct: 100,
        }
    }
}

impl Default for SmoothieDialect {
    fn default() -> Self {
        Self::new()
    }
}

impl Dialect for SmoothieDialect {
    fn kind(&self) -> ControllerKind {
        ControllerKind::Smoothie
    }

    fn streaming_protocol(&self) -> StreamingProtocol {
        StreamingProtocol::CharCounting {
            buffer_size: SMOOTHIE_RX_BUFFER_SIZE,
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
        bytes.len() == 1 && matches!(bytes[0], b'?' | b'!' | b'~' | 0x18)
    }

    fn open_sequence(&self) -> Vec<HandshakeStep> {
        // The board is not responsive right after connect
        vec![HandshakeStep {
            delay_ms: 1000,
            command: WireCommand::line("version"),
        }]
    }

    fn is_ready_event(&self, ev: &RunnerEvent) -> bool {
        matches!(ev, RunnerEvent::Startup { firmware, .. } if firmware == "Smoothie")
    }

    fn status_query(&self) -> Option<WireCommand> {
        Some(WireCommand::byte(b'?'))
    }

    fn parser_state_query(&self) -> Option<WireCommand> {
        Some(WireCommand::line("$G"))
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
        Some(WireCommand::line("$H"))
    }

    fn unlock_command(&self) -> Option<WireCommand> {
        Some(WireCommand::line("$X"))
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
            (*pct + delta).clamp(10, 200)
        };
        vec![WireCommand::line(format!("{} S{}", word, *pct))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_clamp_to_smoothie_range() {
        let mut dialect = SmoothieDialect::new();
        assert_eq!(
            dialect.encode_override(OverrideKind::Feed, 10),
            vec![WireCommand::line("M220 S110")]
        );
        for _ in 0..20 {
            dialect.encode_override(OverrideKind::Feed, 10);
        }
        assert_eq!(
            dialect.encode_override(OverrideKind::Feed, 10),
            vec![WireCommand::line("M220 S200")]
        );
        assert_eq!(
            dialect.encode_override(OverrideKind::Feed, 0),
            vec![WireCommand::line("M220 S100")]
        );
    }

    #[test]
    fn handshake_waits_before_version() {
        let dialect = SmoothieDialect::new();
        let steps = dialect.open_sequence();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].delay_ms, 1000);
        assert_eq!(steps[0].command, WireCommand::line("version"));
    }
}
