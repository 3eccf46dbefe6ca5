//! Firmware line runners
//!
//! A runner is a stateless line tokenizer plus a thin mutable model (last
//! settings, last modal state, last position). Incoming bytes accumulate
//! until LF, then one typed [`RunnerEvent`] is dispatched per line. The
//! surrounding controller never parses firmware text itself; it reacts to
//! these events only.

pub mod grbl;
pub mod grbl_codes;
pub mod marlin;
pub mod smoothie;
pub mod tinyg;

pub use grbl::GrblRunner;
pub use marlin::MarlinRunner;
pub use smoothie::SmoothieRunner;
pub use tinyg::TinyGRunner;

use cncd_core::MachineState;

/// Typed event produced for one inbound firmware line
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerEvent {
    /// `ok` acknowledgment
    Ok,
    /// `error:<code>` or textual error reply
    Error {
        /// Numeric code when the dialect reports one.
        code: Option<u8>,
        /// Decoded human-readable message.
        message: String,
        /// The raw line.
        raw: String,
    },
    /// `ALARM:<code>` reply
    Alarm {
        /// Numeric code when the dialect reports one.
        code: Option<u8>,
        /// Decoded human-readable message.
        message: String,
        /// The raw line.
        raw: String,
    },
    /// Periodic machine status report
    Status {
        /// Normalized machine activity state.
        state: MachineState,
        /// The raw line.
        raw: String,
    },
    /// Modal parser state report (`$G` reply and equivalents)
    ParserState {
        /// The raw line.
        raw: String,
    },
    /// One firmware setting (`$n=value` and equivalents)
    Setting {
        /// Setting name.
        name: String,
        /// Setting value.
        value: String,
    },
    /// Firmware banner / version reply marking readiness
    Startup {
        /// Firmware family name.
        firmware: String,
        /// Version string when present.
        version: String,
        /// The raw line.
        raw: String,
    },
    /// Capability reply (Marlin `M115`)
    Firmware {
        /// The raw line.
        raw: String,
    },
    /// Position reply (Marlin `M114`)
    Position {
        /// The raw line.
        raw: String,
    },
    /// Temperature report (Marlin)
    Temperature {
        /// The raw line.
        raw: String,
        /// The report carried an `ok` acknowledgment.
        ok: bool,
    },
    /// Planner queue report (TinyG `qr`)
    QueueReport {
        /// Free planner buffer slots.
        qr: u32,
    },
    /// Serial RX buffer report (TinyG `rx`)
    RxBuffer {
        /// Free RX buffer bytes.
        rx: u32,
    },
    /// Echoed line (Marlin `echo:`)
    Echo {
        /// The raw line.
        raw: String,
    },
    /// Anything the dialect does not classify
    Other {
        /// The raw line.
        raw: String,
    },
    /// Blank line; nothing to do
    Empty,
}

/// Accumulates raw bytes and splits them into complete lines
///
/// Input is split on LF; a trailing CR is removed so CRLF peers work
/// unchanged. Partial lines stay buffered until their terminator arrives.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: String,
}

impl LineBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Push bytes, returning every completed line
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(bytes));

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let mut line: String = self.buf.drain(..=pos).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }

    /// Drop any partial line
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_lf_and_crlf() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.push(b"ok\r\nerror:9\n"), vec!["ok", "error:9"]);
    }

    #[test]
    fn keeps_partial_lines() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"<Idle|MPos:0.0").is_empty());
        assert_eq!(buf.push(b",0.0,0.0>\n"), vec!["<Idle|MPos:0.0,0.0,0.0>"]);
    }
}
