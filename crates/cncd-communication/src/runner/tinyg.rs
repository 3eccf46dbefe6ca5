//! TinyG / g2core line runner
//!
//! TinyG frames everything as single-line JSON. Replies carry a response
//! envelope `{"r": {...}, "f": [rev, status, ...]}` whose footer status acts
//! as the acknowledgment; asynchronous reports arrive as bare `{"sr": ...}`
//! status reports and `{"qr": ...}` planner queue reports. The queue reports
//! drive the sender's bounded-window streaming.

use super::RunnerEvent;
use cncd_core::{MachineState, Position};
use serde_json::{json, Value};

/// Thin mutable model for a TinyG/g2core peer
#[derive(Debug, Default)]
pub struct TinyGRunner {
    firmware_version: Option<f64>,
    state_word: String,
    machine_state: MachineState,
    mpos: Position,
    wpos: Position,
    feed_rate: f64,
    velocity: f64,
    queue_reports: u32,
    system: Value,
}

impl TinyGRunner {
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

        let json: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            // Text-mode chatter (header banner before JSON mode is set)
            Err(_) => {
                return RunnerEvent::Other {
                    raw: line.to_string(),
                }
            }
        };

        let obj = match json.as_object() {
            Some(o) => o,
            None => {
                return RunnerEvent::Other {
                    raw: line.to_string(),
                }
            }
        };

        // Planner queue report, the flow-control signal
        if let Some(qr) = obj.get("qr").and_then(Value::as_u64) {
            self.queue_reports = qr as u32;
            return RunnerEvent::QueueReport { qr: qr as u32 };
        }

        // Asynchronous status report
        if let Some(sr) = obj.get("sr") {
            self.apply_status_report(sr);
            return RunnerEvent::Status {
                state: self.machine_state,
                raw: line.to_string(),
            };
        }

        // Response envelope
        if let Some(r) = obj.get("r") {
            let status = obj
                .get("f")
                .and_then(Value::as_array)
                .and_then(|f| f.get(1))
                .and_then(Value::as_u64)
                .unwrap_or(0);

            if let Some(sr) = r.get("sr") {
                self.apply_status_report(sr);
            }

            if let Some(rx) = r.get("rx").and_then(Value::as_u64) {
                return RunnerEvent::RxBuffer { rx: rx as u32 };
            }

            if let Some(sys) = r.get("sys") {
                self.system = sys.clone();
                self.firmware_version = sys.get("fv").and_then(Value::as_f64);
                let version = self
                    .firmware_version
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                return RunnerEvent::Startup {
                    firmware: "TinyG".to_string(),
                    version,
                    raw: line.to_string(),
                };
            }

            return if status == 0 {
                RunnerEvent::Ok
            } else {
                RunnerEvent::Error {
                    code: u8::try_from(status).ok(),
                    message: format!("status code {}", status),
                    raw: line.to_string(),
                }
            };
        }

        if let Some(er) = obj.get("er") {
            return RunnerEvent::Error {
                code: er
                    .get("st")
                    .and_then(Value::as_u64)
                    .and_then(|c| u8::try_from(c).ok()),
                message: er
                    .get("msg")
                    .and_then(Value::as_str)
                    .unwrap_or("firmware exception")
                    .to_string(),
                raw: line.to_string(),
            };
        }

        RunnerEvent::Other {
            raw: line.to_string(),
        }
    }

    fn apply_status_report(&mut self, sr: &Value) {
        if let Some(stat) = sr.get("stat").and_then(Value::as_u64) {
            let (word, state) = match stat {
                0 => ("Init", MachineState::Unknown),
                1 => ("Ready", MachineState::Idle),
                2 => ("Alarm", MachineState::Alarm),
                3 => ("Stop", MachineState::Idle),
                4 => ("End", MachineState::Idle),
                5 => ("Run", MachineState::Run),
                6 => ("Hold", MachineState::Hold),
                7 => ("Probe", MachineState::Run),
                8 => ("Cycle", MachineState::Run),
                9 => ("Homing", MachineState::Home),
                10 => ("Jog", MachineState::Jog),
                _ => ("Unknown", MachineState::Unknown),
            };
            self.state_word = word.to_string();
            self.machine_state = state;
        }

        for (key, target) in [
            ("posx", 0usize),
            ("posy", 1),
            ("posz", 2),
        ] {
            if let Some(v) = sr.get(key).and_then(Value::as_f64) {
                match target {
                    0 => self.wpos.x = v,
                    1 => self.wpos.y = v,
                    _ => self.wpos.z = v,
                }
            }
        }

        for (key, target) in [
            ("mpox", 0usize),
            ("mpoy", 1),
            ("mpoz", 2),
        ] {
            if let Some(v) = sr.get(key).and_then(Value::as_f64) {
                match target {
                    0 => self.mpos.x = v,
                    1 => self.mpos.y = v,
                    _ => self.mpos.z = v,
                }
            }
        }

        if let Some(feed) = sr.get("feed").and_then(Value::as_f64) {
            self.feed_rate = feed;
        }
        if let Some(vel) = sr.get("vel").and_then(Value::as_f64) {
            self.velocity = vel;
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

    /// Last reported free planner slots
    pub fn queue_reports(&self) -> u32 {
        self.queue_reports
    }

    /// Opaque settings snapshot published to clients
    pub fn settings_snapshot(&self) -> Value {
        json!({
            "version": self.firmware_version,
            "sys": self.system,
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
                "velocity": self.velocity,
                "qr": self.queue_reports,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_report() {
        let mut runner = TinyGRunner::new();
        let ev = runner.parse(r#"{"qr":28,"qi":1,"qo":1}"#);
        assert_eq!(ev, RunnerEvent::QueueReport { qr: 28 });
        assert_eq!(runner.queue_reports(), 28);
    }

    #[test]
    fn response_footer_acks() {
        let mut runner = TinyGRunner::new();
        let ev = runner.parse(r#"{"r":{"gc":"G0X1"},"f":[1,0,6]}"#);
        assert_eq!(ev, RunnerEvent::Ok);

        let ev = runner.parse(r#"{"r":{"gc":"G0Q1"},"f":[1,40,6]}"#);
        assert!(matches!(ev, RunnerEvent::Error { code: Some(40), .. }));
    }

    #[test]
    fn status_report_maps_stat() {
        let mut runner = TinyGRunner::new();
        let ev = runner.parse(r#"{"sr":{"stat":5,"posx":1.5,"posy":0.0,"posz":-0.5,"vel":800}}"#);
        assert!(matches!(
            ev,
            RunnerEvent::Status {
                state: MachineState::Run,
                ..
            }
        ));
        assert_eq!(runner.work_position(), Position::new(1.5, 0.0, -0.5));
    }

    #[test]
    fn sys_reply_is_startup() {
        let mut runner = TinyGRunner::new();
        let ev = runner.parse(r#"{"r":{"sys":{"fb":440.2,"fv":0.97}},"f":[1,0,10]}"#);
        assert!(matches!(ev, RunnerEvent::Startup { firmware, .. } if firmware == "TinyG"));
    }

    #[test]
    fn text_mode_chatter_is_other() {
        let mut runner = TinyGRunner::new();
        assert!(matches!(
            runner.parse("SYSTEM READY"),
            RunnerEvent::Other { .. }
        ));
    }
}
