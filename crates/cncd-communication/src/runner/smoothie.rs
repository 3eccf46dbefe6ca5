//! Smoothieware line runner
//!
//! Smoothieware speaks a Grbl-flavored status dialect (`<Idle|MPos:...>`)
//! with its own `version` reply and textual errors.

use super::RunnerEvent;
use cncd_core::{MachineState, Position};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Thin mutable model for a Smoothieware peer
#[derive(Debug, Default)]
pub struct SmoothieRunner {
    version: String,
    state_word: String,
    machine_state: MachineState,
    mpos: Position,
    wpos: Position,
    feed_rate: f64,
    modal: BTreeMap<String, String>,
    tool: u32,
}

impl SmoothieRunner {
    /// Create a runner with an empty model
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one line and update the model
    pub fn parse(&mut self, line: &str) -> RunnerEvent {
        let line = line.trim();

        if line.is_empty() {
            return RunnerEvent::Empty;
        }

        if line == "ok" || line == "OK" {
            return RunnerEvent::Ok;
        }

        if let Some(rest) = line
            .strip_prefix("error:")
            .or_else(|| line.strip_prefix("Error:"))
        {
            return RunnerEvent::Error {
                code: None,
                message: rest.trim().to_string(),
                raw: line.to_string(),
            };
        }

        if let Some(rest) = line.strip_prefix("ALARM:") {
            self.machine_state = MachineState::Alarm;
            return RunnerEvent::Alarm {
                code: rest.trim().parse().ok(),
                message: rest.trim().to_string(),
                raw: line.to_string(),
            };
        }

        if line.starts_with('<') && line.ends_with('>') {
            self.apply_status(&line[1..line.len() - 1]);
            return RunnerEvent::Status {
                state: self.machine_state,
                raw: line.to_string(),
            };
        }

        // `version` reply, e.g.
        // "Build version: edge-1b7d87a, Build date: ..., MCU: LPC1769, System Clock: 120MHz"
        if line.starts_with("Build version:") {
            let version = line
                .trim_start_matches("Build version:")
                .split(',')
                .next()
                .unwrap_or("")
                .trim()
                .to_string();
            self.version = version.clone();
            return RunnerEvent::Startup {
                firmware: "Smoothie".to_string(),
                version,
                raw: line.to_string(),
            };
        }

        // `$G`-style modal report: "[G0 G54 G17 G21 G90 G94 M0 M5 M9 T0 F4000.0000 S0.8000]"
        if line.starts_with('[') && line.ends_with(']') && line.contains("G9") {
            self.apply_parser_state(&line[1..line.len() - 1]);
            return RunnerEvent::ParserState {
                raw: line.to_string(),
            };
        }

        RunnerEvent::Other {
            raw: line.to_string(),
        }
    }

    fn apply_status(&mut self, body: &str) {
        let mut parts = body.split('|');

        if let Some(state) = parts.next() {
            self.state_word = state.trim().to_string();
            self.machine_state = MachineState::from_word(state.trim());
        }

        for part in parts {
            let part = part.trim();
            if let Some(pos) = part.strip_prefix("MPos:") {
                if let Some(p) = parse_position(pos) {
                    self.mpos = p;
                }
            } else if let Some(pos) = part.strip_prefix("WPos:") {
                if let Some(p) = parse_position(pos) {
                    self.wpos = p;
                }
            } else if let Some(f) = part.strip_prefix("F:") {
                if let Some(f) = f.split(',').next().and_then(|s| s.trim().parse().ok()) {
                    self.feed_rate = f;
                }
            }
        }
    }

    fn apply_parser_state(&mut self, body: &str) {
        for word in body.split_whitespace() {
            let group = match word {
                "G0" | "G1" | "G2" | "G3" => "motion",
                "G54" | "G55" | "G56" | "G57" | "G58" | "G59" => "wcs",
                "G17" | "G18" | "G19" => "plane",
                "G20" | "G21" => "units",
                "G90" | "G91" => "distance",
                "G93" | "G94" => "feedrate",
                "M0" | "M1" | "M2" | "M30" => "program",
                "M3" | "M4" | "M5" => "spindle",
                "M7" | "M8" | "M9" => "coolant",
                _ => {
                    if let Some(t) = word.strip_prefix('T') {
                        if let Ok(t) = t.parse() {
                            self.tool = t;
                        }
                    }
                    continue;
                }
            };
            self.modal.insert(group.to_string(), word.to_string());
        }
    }

    /// Machine is idle
    pub fn is_idle(&self) -> bool {
        self.machine_state == MachineState::Idle
    }

    /// Feed hold is active
    pub fn is_hold(&self) -> bool {
        self.machine_state == MachineState::Hold
    }

    /// Alarm lockout is active
    pub fn is_alarm(&self) -> bool {
        self.machine_state == MachineState::Alarm
    }

    /// Normalized machine activity state
    pub fn machine_state(&self) -> MachineState {
        self.machine_state
    }

    /// Last reported machine position
    pub fn machine_position(&self) -> Position {
        self.mpos
    }

    /// Last reported work position
    pub fn work_position(&self) -> Position {
        self.wpos
    }

    /// Opaque settings snapshot published to clients
    pub fn settings_snapshot(&self) -> Value {
        json!({ "version": self.version })
    }

    /// Opaque state snapshot published to clients
    pub fn state_snapshot(&self) -> Value {
        json!({
            "status": {
                "activeState": self.state_word,
                "mpos": self.mpos,
                "wpos": self.wpos,
                "feedrate": self.feed_rate,
            },
            "parserstate": {
                "modal": self.modal,
                "tool": self.tool,
            },
        })
    }
}

fn parse_position(text: &str) -> Option<Position> {
    let coords: Vec<f64> = text
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();

    if coords.len() < 3 {
        return None;
    }

    Some(Position::new(coords[0], coords[1], coords[2]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_reply_is_startup() {
        let mut runner = SmoothieRunner::new();
        let ev = runner.parse(
            "Build version: edge-1b7d87a, Build date: Apr 1 2021, MCU: LPC1769, System Clock: 120MHz",
        );
        assert!(matches!(ev, RunnerEvent::Startup { firmware, .. } if firmware == "Smoothie"));
    }

    #[test]
    fn status_report_updates_model() {
        let mut runner = SmoothieRunner::new();
        runner.parse("<Hold|MPos:1.0000,2.0000,3.0000|WPos:0.0000,0.0000,3.0000>");
        assert!(runner.is_hold());
        assert_eq!(runner.machine_position(), Position::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn textual_errors_have_no_code() {
        let mut runner = SmoothieRunner::new();
        match runner.parse("error: Unsupported command") {
            RunnerEvent::Error { code, message, .. } => {
                assert_eq!(code, None);
                assert_eq!(message, "Unsupported command");
            }
            other => panic!("Wrong event: {:?}", other),
        }
    }
}
