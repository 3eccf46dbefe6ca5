//! Grbl dialect
//!
//! Character-counting streaming against Grbl's 128-byte RX buffer, the
//! realtime byte set (`?`, `!`, `~`, `0x18`, override bytes), and the
//! banner-driven readiness handshake (`Grbl 1.1h [...]` → `$$` + `$G`).

use super::dialect::{Dialect, OverrideKind, WireCommand};
use crate::runner::{GrblRunner, RunnerEvent};
use crate::sender::StreamingProtocol;
use cncd_core::{ControllerKind, MachineState, Position};
use serde_json::Value;

/// Grbl RX buffer size in bytes
pub const GRBL_RX_BUFFER_SIZE: usize = 128;

/// Grbl capability set
#[derive(Debug, Default)]
pub struct GrblDialect {
    runner: GrblRunner,
}

impl GrblDialect {
    /// Create a Grbl dialect
    pub fn new() -> Self {
        Self::default()
    }
}

impl Dialect for GrblDialect {
    fn kind(&self) -> ControllerKind {
        ControllerKind::Grbl
    }

    fn streaming_protocol(&self) -> StreamingProtocol {
        StreamingProtocol::CharCounting {
            buffer_size: GRBL_RX_BUFFER_SIZE,
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
        if bytes.len() != 1 {
            return false;
        }
        matches!(
            bytes[0],
            b'?' | b'!' | b'~' | 0x18 | 0x85 | 0x90..=0x9D | 0xA0 | 0xA1
        )
    }

    fn is_ready_event(&self, ev: &RunnerEvent) -> bool {
        matches!(ev, RunnerEvent::Startup { firmware, .. } if firmware == "Grbl")
    }

    fn init_delay_ms(&self) -> u64 {
        50
    }

    fn init_commands(&self) -> Vec<WireCommand> {
        vec![WireCommand::line("$$"), WireCommand::line("$G")]
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

    fn sleep_command(&self) -> Option<WireCommand> {
        Some(WireCommand::line("$SLP"))
    }

    fn jog_cancel_command(&self) -> Option<WireCommand> {
        Some(WireCommand::byte(0x85))
    }

    fn encode_override(&mut self, kind: OverrideKind, delta: i32) -> Vec<WireCommand> {
        let byte = match kind {
            OverrideKind::Feed => match delta {
                0 => Some(0x90),
                10 => Some(0x91),
                -10 => Some(0x92),
                1 => Some(0x93),
                -1 => Some(0x94),
                _ => None,
            },
            OverrideKind::Spindle => match delta {
                0 => Some(0x99),
                10 => Some(0x9A),
                -10 => Some(0x9B),
                1 => Some(0x9C),
                -1 => Some(0x9D),
                _ => None,
            },
            // Rapid overrides are absolute levels
            OverrideKind::Rapid => match delta {
                0 | 100 => Some(0x95),
                50 => Some(0x96),
                25 => Some(0x97),
                _ => None,
            },
        };
        byte.map(|b| vec![WireCommand::byte(b)]).unwrap_or_default()
    }

    fn write_filter(&mut self, line: &str) -> String {
        // Reconcile report units with an outgoing $13 write
        if let Some(value) = line.trim().strip_prefix("$13=") {
            self.runner.set_report_inches(value.trim() == "1");
        }
        line.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_override_bytes() {
        let mut dialect = GrblDialect::new();
        assert_eq!(
            dialect.encode_override(OverrideKind::Feed, 10),
            vec![WireCommand::byte(0x91)]
        );
        assert_eq!(
            dialect.encode_override(OverrideKind::Feed, 0),
            vec![WireCommand::byte(0x90)]
        );
        assert!(dialect.encode_override(OverrideKind::Feed, 5).is_empty());
    }

    #[test]
    fn realtime_byte_set() {
        let dialect = GrblDialect::new();
        assert!(dialect.is_realtime_command("?"));
        assert!(dialect.is_realtime_command("!"));
        assert!(dialect.is_realtime_command("~"));
        assert!(dialect.is_realtime_command("\u{18}"));
        assert!(!dialect.is_realtime_command("$H"));
    }

    #[test]
    fn write_filter_tracks_report_units() {
        let mut dialect = GrblDialect::new();
        assert_eq!(dialect.write_filter("$13=1"), "$13=1");
        // the runner model now reports inches; a status parse confirms
        assert!(matches!(
            dialect.parse_line("$13=1"),
            RunnerEvent::Setting { .. }
        ));
    }
}
