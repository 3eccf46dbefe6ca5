//! Marlin line runner
//!
//! Marlin is strictly line-oriented: `ok` acks (optionally carrying a
//! temperature report), `M115` capability replies, `M114` position replies,
//! `echo:` chatter and textual errors. There is no machine-state report.

use super::RunnerEvent;
use cncd_core::{MachineState, Position};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Per-heater temperature reading
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct HeaterReading {
    /// Current temperature (°C)
    pub deg: f64,
    /// Target temperature (°C)
    pub deg_target: f64,
}

/// Thin mutable model for a Marlin peer
#[derive(Debug, Default)]
pub struct MarlinRunner {
    firmware_name: String,
    protocol_version: String,
    machine_type: String,
    extruder_count: u32,
    uuid: String,
    position: Position,
    extruder_pos: f64,
    extruder: HeaterReading,
    heated_bed: Option<HeaterReading>,
}

impl MarlinRunner {
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

        if line == "start" {
            return RunnerEvent::Startup {
                firmware: "Marlin".to_string(),
                version: String::new(),
                raw: line.to_string(),
            };
        }

        if line.starts_with("FIRMWARE_NAME:") {
            self.apply_firmware(line);
            return RunnerEvent::Firmware {
                raw: line.to_string(),
            };
        }

        if line == "ok" {
            return RunnerEvent::Ok;
        }

        // `ok T:25.0 /0.0 B:24.1 /0.0 ...` — acknowledgment carrying temps
        if let Some(rest) = line.strip_prefix("ok ") {
            if rest.contains("T:") {
                self.apply_temperature(rest);
            }
            return RunnerEvent::Ok;
        }

        // Auto temperature report (M155) without an ack
        if line.starts_with("T:") {
            self.apply_temperature(line);
            return RunnerEvent::Temperature {
                raw: line.to_string(),
                ok: false,
            };
        }

        // `X:0.00 Y:0.00 Z:0.00 E:0.00 Count X:0 ...` — M114 reply
        if line.starts_with("X:") && line.contains("Y:") && line.contains("Z:") {
            self.apply_position(line);
            return RunnerEvent::Position {
                raw: line.to_string(),
            };
        }

        if let Some(rest) = line.strip_prefix("echo:") {
            return RunnerEvent::Echo {
                raw: rest.trim().to_string(),
            };
        }

        if let Some(rest) = line
            .strip_prefix("Error:")
            .or_else(|| line.strip_prefix("error:"))
        {
            return RunnerEvent::Error {
                code: None,
                message: rest.trim().to_string(),
                raw: line.to_string(),
            };
        }

        RunnerEvent::Other {
            raw: line.to_string(),
        }
    }

    /// Parse an `M115` capability reply
    fn apply_firmware(&mut self, line: &str) {
        // Keys are uppercase with ':' values, separated by spaces before the
        // next KEY: token, e.g.
        // FIRMWARE_NAME:Marlin 2.1.2 SOURCE_CODE_URL:... PROTOCOL_VERSION:1.0 ...
        let mut fields: BTreeMap<String, String> = BTreeMap::new();
        let mut current_key: Option<String> = None;
        let mut current_val = String::new();

        for token in line.split_whitespace() {
            let is_key = token
                .split_once(':')
                .map(|(k, _)| {
                    !k.is_empty()
                        && k.chars().all(|c| c.is_ascii_uppercase() || c == '_')
                })
                .unwrap_or(false);

            if is_key {
                if let Some(key) = current_key.take() {
                    fields.insert(key, current_val.trim().to_string());
                    current_val.clear();
                }
                let (key, val) = token.split_once(':').unwrap();
                current_key = Some(key.to_string());
                current_val.push_str(val);
            } else {
                current_val.push(' ');
                current_val.push_str(token);
            }
        }
        if let Some(key) = current_key {
            fields.insert(key, current_val.trim().to_string());
        }

        if let Some(v) = fields.get("FIRMWARE_NAME") {
            self.firmware_name = v.clone();
        }
        if let Some(v) = fields.get("PROTOCOL_VERSION") {
            self.protocol_version = v.clone();
        }
        if let Some(v) = fields.get("MACHINE_TYPE") {
            self.machine_type = v.clone();
        }
        if let Some(v) = fields.get("EXTRUDER_COUNT") {
            self.extruder_count = v.parse().unwrap_or(0);
        }
        if let Some(v) = fields.get("UUID") {
            self.uuid = v.clone();
        }
    }

    /// Parse `T:25.0 /0.0 B:24.1 /0.0 @:0 B@:0`
    fn apply_temperature(&mut self, text: &str) {
        let mut tokens = text.split_whitespace().peekable();
        while let Some(token) = tokens.next() {
            let (heater, deg) = match token.split_once(':') {
                Some((h, v)) => (h, v),
                None => continue,
            };
            let deg: f64 = match deg.parse() {
                Ok(d) => d,
                Err(_) => continue,
            };
            let target = tokens
                .peek()
                .and_then(|t| t.strip_prefix('/'))
                .and_then(|t| t.parse().ok());
            if target.is_some() {
                tokens.next();
            }
            let reading = HeaterReading {
                deg,
                deg_target: target.unwrap_or(0.0),
            };
            match heater {
                "T" | "T0" => self.extruder = reading,
                "B" => self.heated_bed = Some(reading),
                _ => {}
            }
        }
    }

    /// Parse an `M114` position reply
    fn apply_position(&mut self, line: &str) {
        // Ignore the stepper counts after "Count"
        let head = line.split("Count").next().unwrap_or(line);
        for token in head.split_whitespace() {
            if let Some((axis, value)) = token.split_once(':') {
                if let Ok(v) = value.parse::<f64>() {
                    match axis {
                        "X" => self.position.x = v,
                        "Y" => self.position.y = v,
                        "Z" => self.position.z = v,
                        "E" => self.extruder_pos = v,
                        _ => {}
                    }
                }
            }
        }
    }

    /// Marlin reports no machine activity state; treat it as always idle
    pub fn is_idle(&self) -> bool {
        true
    }

    /// Marlin has no feed-hold state
    pub fn is_hold(&self) -> bool {
        false
    }

    /// Marlin has no alarm state
    pub fn is_alarm(&self) -> bool {
        false
    }

    /// Normalized machine activity state
    pub fn machine_state(&self) -> MachineState {
        MachineState::Idle
    }

    /// Last reported position
    pub fn machine_position(&self) -> Position {
        self.position
    }

    /// Last reported position (Marlin has a single coordinate space)
    pub fn work_position(&self) -> Position {
        self.position
    }

    /// Capability reply has arrived
    pub fn has_firmware_info(&self) -> bool {
        !self.firmware_name.is_empty()
    }

    /// Opaque settings snapshot published to clients
    pub fn settings_snapshot(&self) -> Value {
        json!({
            "firmwareName": self.firmware_name,
            "protocolVersion": self.protocol_version,
            "machineType": self.machine_type,
            "extruderCount": self.extruder_count,
            "uuid": self.uuid,
        })
    }

    /// Opaque state snapshot published to clients
    pub fn state_snapshot(&self) -> Value {
        json!({
            "pos": {
                "x": self.position.x,
                "y": self.position.y,
                "z": self.position.z,
                "e": self.extruder_pos,
            },
            "heater": {
                "extruder": self.extruder,
                "heatedBed": self.heated_bed,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn firmware_reply_parses_fields() {
        let mut runner = MarlinRunner::new();
        let ev = runner.parse(
            "FIRMWARE_NAME:Marlin 2.1.2 (Aug 1 2023) SOURCE_CODE_URL:github.com/MarlinFirmware/Marlin PROTOCOL_VERSION:1.0 MACHINE_TYPE:Ender-3 EXTRUDER_COUNT:1 UUID:cede2a2f-41a2-4748-9b12-c55c62f367ff",
        );
        assert!(matches!(ev, RunnerEvent::Firmware { .. }));
        assert!(runner.has_firmware_info());
        let snapshot = runner.settings_snapshot();
        assert_eq!(snapshot["machineType"], "Ender-3");
        assert_eq!(snapshot["extruderCount"], 1);
        assert_eq!(snapshot["firmwareName"], "Marlin 2.1.2 (Aug 1 2023)");
    }

    #[test]
    fn ok_with_temperatures_still_acks() {
        let mut runner = MarlinRunner::new();
        let ev = runner.parse("ok T:210.0 /210.0 B:60.0 /60.0 @:127 B@:0");
        assert_eq!(ev, RunnerEvent::Ok);
        assert_eq!(
            runner.state_snapshot()["heater"]["extruder"]["deg"],
            210.0
        );
    }

    #[test]
    fn position_reply() {
        let mut runner = MarlinRunner::new();
        let ev = runner.parse("X:1.00 Y:2.00 Z:3.00 E:0.00 Count X:80 Y:160 Z:1200");
        assert!(matches!(ev, RunnerEvent::Position { .. }));
        assert_eq!(runner.machine_position(), Position::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn start_is_a_startup_event() {
        let mut runner = MarlinRunner::new();
        assert!(matches!(
            runner.parse("start"),
            RunnerEvent::Startup { firmware, .. } if firmware == "Marlin"
        ));
    }
}
