//! Grbl line runner
//!
//! Parses Grbl protocol replies: status reports, parser state, settings,
//! the startup banner, acknowledgments and error/alarm codes. Keeps a thin
//! model of the machine the controller's predicates read from.

use super::{grbl_codes, RunnerEvent};
use cncd_core::{MachineState, Position};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Thin mutable model fed by parsed status/parser-state reports
#[derive(Debug, Default)]
pub struct GrblRunner {
    version: String,
    state_word: String,
    machine_state: MachineState,
    mpos: Position,
    wpos: Position,
    wco: Option<Position>,
    planner_blocks: Option<u32>,
    rx_bytes: Option<u32>,
    feed_rate: f64,
    spindle_speed: f64,
    overrides: Option<(u16, u16, u16)>,
    settings: BTreeMap<String, String>,
    modal: BTreeMap<String, String>,
    tool: u32,
    report_inches: bool,
}

impl GrblRunner {
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

        if line == "ok" {
            return RunnerEvent::Ok;
        }

        if let Some(rest) = line.strip_prefix("error:") {
            return match rest.trim().parse::<u8>() {
                Ok(code) => RunnerEvent::Error {
                    code: Some(code),
                    message: grbl_codes::decode_error(code),
                    raw: line.to_string(),
                },
                // Grbl 0.9 reports textual errors
                Err(_) => RunnerEvent::Error {
                    code: None,
                    message: rest.trim().to_string(),
                    raw: line.to_string(),
                },
            };
        }

        if let Some(rest) = line.strip_prefix("ALARM:") {
            let code = rest.trim().parse::<u8>().ok();
            self.machine_state = MachineState::Alarm;
            let message = match code {
                Some(code) => grbl_codes::decode_alarm(code),
                None => rest.trim().to_string(),
            };
            return RunnerEvent::Alarm {
                code,
                message,
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

        if let Some(rest) = line.strip_prefix("[GC:") {
            self.apply_parser_state(rest.trim_end_matches(']'));
            return RunnerEvent::ParserState {
                raw: line.to_string(),
            };
        }

        if line.starts_with('$') && line.contains('=') {
            if let Some((name, value)) = line.split_once('=') {
                self.settings
                    .insert(name.to_string(), value.trim().to_string());
                if name == "$13" {
                    self.report_inches = value.trim() == "1";
                }
                return RunnerEvent::Setting {
                    name: name.to_string(),
                    value: value.trim().to_string(),
                };
            }
        }

        if let Some(rest) = line.strip_prefix("Grbl ") {
            let version = rest.split_whitespace().next().unwrap_or("").to_string();
            self.version = version.clone();
            return RunnerEvent::Startup {
                firmware: "Grbl".to_string(),
                version,
                raw: line.to_string(),
            };
        }

        RunnerEvent::Other {
            raw: line.to_string(),
        }
    }

    /// Apply one status report body (the text between `<` and `>`)
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
            } else if let Some(wco) = part.strip_prefix("WCO:") {
                self.wco = parse_position(wco);
            } else if let Some(buf) = part.strip_prefix("Bf:").or_else(|| part.strip_prefix("Buf:"))
            {
                let mut fields = buf.split(&[':', ','][..]);
                self.planner_blocks = fields.next().and_then(|s| s.trim().parse().ok());
                self.rx_bytes = fields.next().and_then(|s| s.trim().parse().ok());
            } else if let Some(fs) = part.strip_prefix("FS:") {
                let mut fields = fs.split(',');
                if let Some(f) = fields.next().and_then(|s| s.trim().parse().ok()) {
                    self.feed_rate = f;
                }
                if let Some(s) = fields.next().and_then(|s| s.trim().parse().ok()) {
                    self.spindle_speed = s;
                }
            } else if let Some(f) = part.strip_prefix("F:") {
                if let Ok(f) = f.trim().parse() {
                    self.feed_rate = f;
                }
            } else if let Some(ov) = part.strip_prefix("Ov:") {
                let fields: Vec<u16> = ov
                    .split(',')
                    .filter_map(|s| s.trim().parse().ok())
                    .collect();
                if fields.len() == 3 {
                    self.overrides = Some((fields[0], fields[1], fields[2]));
                }
            }
        }

        // Grbl 1.1 can be configured ($10) to report only MPos + WCO;
        // derive the missing space: WPos = MPos - WCO.
        if let Some(wco) = self.wco {
            self.wpos = Position::new(
                self.mpos.x - wco.x,
                self.mpos.y - wco.y,
                self.mpos.z - wco.z,
            );
        }
    }

    /// Apply a `[GC: ...]` parser-state body
    fn apply_parser_state(&mut self, body: &str) {
        for word in body.split_whitespace() {
            let group = match word {
                "G0" | "G1" | "G2" | "G3" | "G38.2" | "G38.3" | "G38.4" | "G38.5" | "G80" => {
                    "motion"
                }
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

    /// Currently selected tool
    pub fn tool(&self) -> u32 {
        self.tool
    }

    /// Active word for one modal group (`motion`, `wcs`, `units`, ...)
    pub fn modal_group(&self, group: &str) -> Option<&str> {
        self.modal.get(group).map(String::as_str)
    }

    /// Status reports are configured in inches (`$13=1`)
    pub fn report_inches(&self) -> bool {
        self.report_inches
    }

    /// Record an outgoing `$13=N` write so the model matches the firmware
    pub fn set_report_inches(&mut self, inches: bool) {
        self.report_inches = inches;
    }

    /// Opaque settings snapshot published to clients
    pub fn settings_snapshot(&self) -> Value {
        json!({
            "version": self.version,
            "settings": self.settings,
        })
    }

    /// Opaque state snapshot published to clients
    pub fn state_snapshot(&self) -> Value {
        json!({
            "status": {
                "activeState": self.state_word,
                "mpos": self.mpos,
                "wpos": self.wpos,
                "feedrate": self.feed_rate,
                "spindle": self.spindle_speed,
                "buf": {
                    "planner": self.planner_blocks,
                    "rx": self.rx_bytes,
                },
                "ov": self.overrides.map(|(f, r, s)| vec![f, r, s]),
            },
            "parserstate": {
                "modal": self.modal,
                "tool": self.tool,
            },
        })
    }
}

/// Parse `x,y,z[,a]` coordinates from a status field
fn parse_position(text: &str) -> Option<Position> {
    let coords: Vec<f64> = text
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();

    if coords.len() < 3 {
        return None;
    }

    let mut position = Position::new(coords[0], coords[1], coords[2]);
    position.a = coords.get(3).copied();
    Some(position)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_banner() {
        let mut runner = GrblRunner::new();
        let ev = runner.parse("Grbl 1.1h ['$' for help]");
        assert_eq!(
            ev,
            RunnerEvent::Startup {
                firmware: "Grbl".into(),
                version: "1.1h".into(),
                raw: "Grbl 1.1h ['$' for help]".into(),
            }
        );
    }

    #[test]
    fn parses_status_report() {
        let mut runner = GrblRunner::new();
        let ev = runner.parse("<Run|MPos:1.000,2.000,3.000|Bf:14,120|FS:500,8000|Ov:100,100,100>");
        assert!(matches!(
            ev,
            RunnerEvent::Status {
                state: MachineState::Run,
                ..
            }
        ));
        assert_eq!(runner.machine_position(), Position::new(1.0, 2.0, 3.0));
        assert!(!runner.is_idle());
    }

    #[test]
    fn derives_wpos_from_wco() {
        let mut runner = GrblRunner::new();
        runner.parse("<Idle|MPos:10.000,10.000,5.000|WCO:10.000,10.000,0.000>");
        assert_eq!(runner.work_position(), Position::new(0.0, 0.0, 5.0));
        assert!(runner.is_idle());
    }

    #[test]
    fn decodes_error_codes() {
        let mut runner = GrblRunner::new();
        match runner.parse("error:9") {
            RunnerEvent::Error { code, message, .. } => {
                assert_eq!(code, Some(9));
                assert!(message.contains("locked out"));
            }
            other => panic!("Wrong event: {:?}", other),
        }
    }

    #[test]
    fn tracks_parser_state() {
        let mut runner = GrblRunner::new();
        runner.parse("[GC:G1 G54 G17 G21 G90 G94 M5 M9 T2 F1000 S0]");
        assert_eq!(runner.modal_group("motion"), Some("G1"));
        assert_eq!(runner.modal_group("units"), Some("G21"));
        assert_eq!(runner.tool(), 2);
    }

    #[test]
    fn settings_update_report_units() {
        let mut runner = GrblRunner::new();
        runner.parse("$13=1");
        assert!(runner.report_inches());
        runner.parse("$13=0");
        assert!(!runner.report_inches());
    }

    #[test]
    fn alarm_flips_state_and_decodes() {
        let mut runner = GrblRunner::new();
        match runner.parse("ALARM:2") {
            RunnerEvent::Alarm { code, message, .. } => {
                assert_eq!(code, Some(2));
                assert!(message.contains("Soft limit"));
            }
            other => panic!("Wrong event: {:?}", other),
        }
        assert!(runner.is_alarm());
    }
}
