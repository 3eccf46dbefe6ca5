//! Sender: program streamer
//!
//! Streams a loaded G-code program line-by-line under a firmware-appropriate
//! flow-control strategy:
//!
//! - [`StreamingProtocol::SendResponse`] (Marlin): one line in flight,
//!   `sent - received ∈ {0, 1}`.
//! - [`StreamingProtocol::CharCounting`] (Grbl, Smoothie): the total bytes
//!   of unacked lines never exceed the firmware's input buffer.
//! - [`StreamingProtocol::QueueReport`] (TinyG/g2core): a bounded window
//!   replenished by planner queue reports rather than `ok` counting.
//!
//! The sender never touches the wire itself; [`Sender::next`] returns the
//! lines the controller must write plus the signals (pause requests, holds)
//! it must act on.

use crate::gcode::{filter_line, strip_comment, ExpressionContext};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

/// Flow-control strategy descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamingProtocol {
    /// Send one line, wait for `ok`, send the next
    SendResponse,
    /// Keep outstanding bytes at or below the firmware's input buffer
    CharCounting {
        /// Firmware RX buffer size in bytes.
        buffer_size: usize,
    },
    /// Send while the planner reports free slots above a low-water mark
    QueueReport {
        /// Minimum free planner slots to keep in reserve.
        low_water: u32,
    },
}

/// Events produced while advancing the stream
#[derive(Debug, Clone, PartialEq)]
pub enum SenderEventOut {
    /// First line of a fresh run went out
    Start,
    /// A line must be written to the wire
    Data {
        /// The filtered line (no terminator).
        line: String,
    },
    /// The sender held itself (`%wait`)
    Hold {
        /// Hold reason payload.
        reason: Value,
    },
    /// A pause word asks the controller to pause the workflow
    PauseRequest {
        /// Pause reason payload (`{"data": "M6"}`, ...).
        reason: Value,
    },
}

/// Outcome of crediting one acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckOutcome {
    /// `received` advanced.
    pub advanced: bool,
    /// The whole program is now acked (`received == sent == total`).
    pub finished: bool,
}

/// Serializable status snapshot published as `sender:status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderStatus {
    /// Streaming protocol descriptor.
    pub sp: StreamingProtocol,
    /// A hold is active.
    pub hold: bool,
    /// Reason for the active hold, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hold_reason: Option<Value>,
    /// Loaded program name.
    pub name: Option<String>,
    /// Program size in bytes.
    pub size: usize,
    /// Number of streamable lines.
    pub total: usize,
    /// Lines handed to the transport so far.
    pub sent: usize,
    /// Lines acknowledged by the firmware so far.
    pub received: usize,
    /// Program expression context.
    pub context: ExpressionContext,
    /// Wall-clock ms when the program finished, 0 while running.
    pub finish_time: u64,
}

/// Program streamer
#[derive(Debug)]
pub struct Sender {
    protocol: StreamingProtocol,
    name: Option<String>,
    content: String,
    lines: Vec<String>,
    sent: usize,
    received: usize,
    /// Byte lengths (incl. terminator) of emitted-but-unacked lines.
    outstanding: VecDeque<usize>,
    data_length: usize,
    queue_free: u32,
    hold: bool,
    hold_reason: Option<Value>,
    context: ExpressionContext,
    started: bool,
    finish_time: u64,
}

impl Sender {
    /// Create a sender bound to a flow-control strategy
    pub fn new(protocol: StreamingProtocol) -> Self {
        Self {
            protocol,
            name: None,
            content: String::new(),
            lines: Vec::new(),
            sent: 0,
            received: 0,
            outstanding: VecDeque::new(),
            data_length: 0,
            queue_free: 0,
            hold: false,
            hold_reason: None,
            context: ExpressionContext::new(),
            started: false,
            finish_time: 0,
        }
    }

    /// Load a program
    ///
    /// A trailing `%wait` sentinel is appended so the terminal dwell
    /// triggers the post-program finish detector. Comment-only and blank
    /// lines are dropped up front.
    pub fn load(&mut self, name: impl Into<String>, content: &str, context: ExpressionContext) {
        let mut text = content.to_string();
        text.push_str("\n%wait ; Wait for the planner to empty");

        self.lines = text
            .lines()
            .map(|l| strip_comment(l).trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();

        self.name = Some(name.into());
        self.content = content.to_string();
        self.context = context;
        self.rewind();
    }

    /// Discard the loaded program
    pub fn unload(&mut self) {
        self.name = None;
        self.content.clear();
        self.lines.clear();
        self.context = ExpressionContext::new();
        self.rewind();
    }

    /// A program is loaded
    pub fn is_loaded(&self) -> bool {
        self.name.is_some()
    }

    /// Loaded program name
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Loaded program content
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Next unsent line, if any
    pub fn peek(&self) -> Option<&str> {
        self.lines.get(self.sent).map(String::as_str)
    }

    /// Lines handed out so far
    pub fn sent(&self) -> usize {
        self.sent
    }

    /// Lines acknowledged so far
    pub fn received(&self) -> usize {
        self.received
    }

    /// Number of streamable lines
    pub fn total(&self) -> usize {
        self.lines.len()
    }

    /// Outstanding unacked bytes (char-counting bookkeeping)
    pub fn data_length(&self) -> usize {
        self.data_length
    }

    /// Wall-clock ms when the program finished, 0 while running
    pub fn finish_time(&self) -> u64 {
        self.finish_time
    }

    /// A hold is active
    pub fn is_hold(&self) -> bool {
        self.hold
    }

    /// Block further emission
    pub fn hold(&mut self, reason: Option<Value>) {
        self.hold = true;
        self.hold_reason = reason;
    }

    /// Release a hold
    pub fn unhold(&mut self) {
        self.hold = false;
        self.hold_reason = None;
    }

    /// Reset counters for a fresh start; the program stays loaded
    pub fn rewind(&mut self) {
        self.sent = 0;
        self.received = 0;
        self.outstanding.clear();
        self.data_length = 0;
        self.hold = false;
        self.hold_reason = None;
        self.started = false;
        self.finish_time = 0;
    }

    /// Record a planner queue report (queue-report streaming only)
    pub fn update_queue_free(&mut self, qr: u32) {
        self.queue_free = qr;
    }

    fn window_allows(&self, line_len: usize) -> bool {
        match self.protocol {
            StreamingProtocol::SendResponse => self.sent == self.received,
            StreamingProtocol::CharCounting { buffer_size } => {
                self.data_length + line_len + 1 <= buffer_size
            }
            StreamingProtocol::QueueReport { low_water } => self.queue_free > low_water,
        }
    }

    fn mark_started(&mut self, out: &mut Vec<SenderEventOut>) {
        if !self.started {
            self.started = true;
            out.push(SenderEventOut::Start);
        }
    }

    /// Advance the stream as far as the flow-control window allows
    pub fn next(&mut self) -> Vec<SenderEventOut> {
        let mut out = Vec::new();

        while !self.hold && self.sent < self.lines.len() {
            let raw = self.lines[self.sent].clone();
            let filtered = filter_line(&raw, &mut self.context);

            if filtered.wait {
                let line = "G4 P0.5".to_string();
                if !self.window_allows(line.len()) {
                    break;
                }
                self.mark_started(&mut out);
                self.emit_line(&line);
                let reason = json!({ "data": "%wait" });
                self.hold = true;
                self.hold_reason = Some(reason.clone());
                out.push(SenderEventOut::Data { line });
                out.push(SenderEventOut::Hold { reason });
                break;
            }

            let line = match filtered.line {
                // Assignments and empty lines occupy no wire bytes: they
                // count as sent and acked in one step.
                None => {
                    self.mark_started(&mut out);
                    self.sent += 1;
                    self.received += 1;
                    self.check_finished();
                    continue;
                }
                Some(line) => line,
            };

            if !self.window_allows(line.len()) {
                break;
            }

            self.mark_started(&mut out);
            self.emit_line(&line);
            out.push(SenderEventOut::Data { line });

            if let Some(word) = filtered.pause {
                out.push(SenderEventOut::PauseRequest {
                    reason: json!({ "data": word }),
                });
                break;
            }
        }

        out
    }

    fn emit_line(&mut self, line: &str) {
        self.sent += 1;
        self.outstanding.push_back(line.len() + 1);
        self.data_length += line.len() + 1;
        if let StreamingProtocol::QueueReport { .. } = self.protocol {
            // Stay conservative between reports
            self.queue_free = self.queue_free.saturating_sub(1);
        }
    }

    /// Credit one acknowledgment
    ///
    /// An `ok` with `received == sent` must not advance past `sent`; that is
    /// an invariant violation which is logged and otherwise ignored.
    pub fn ack(&mut self) -> AckOutcome {
        if self.received >= self.sent {
            tracing::error!(
                "ack with received ({}) >= sent ({}) dropped",
                self.received,
                self.sent
            );
            return AckOutcome {
                advanced: false,
                finished: false,
            };
        }

        let len = self.outstanding.pop_front().unwrap_or(0);
        self.data_length = self.data_length.saturating_sub(len);
        self.received += 1;

        AckOutcome {
            advanced: true,
            finished: self.check_finished(),
        }
    }

    fn check_finished(&mut self) -> bool {
        let finished =
            !self.lines.is_empty() && self.received == self.sent && self.sent == self.lines.len();
        if finished && self.finish_time == 0 {
            self.finish_time = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
        }
        finished
    }

    /// Release condition for a `%wait` hold: everything sent is acked
    pub fn drained(&self) -> bool {
        self.received >= self.sent
    }

    /// Status snapshot published as `sender:status`
    pub fn status(&self) -> SenderStatus {
        SenderStatus {
            sp: self.protocol,
            hold: self.hold,
            hold_reason: self.hold_reason.clone(),
            name: self.name.clone(),
            size: self.content.len(),
            total: self.lines.len(),
            sent: self.sent,
            received: self.received,
            context: self.context.clone(),
            finish_time: self.finish_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_lines(out: &[SenderEventOut]) -> Vec<String> {
        out.iter()
            .filter_map(|e| match e {
                SenderEventOut::Data { line } => Some(line.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn load_appends_wait_sentinel() {
        let mut sender = Sender::new(StreamingProtocol::CharCounting { buffer_size: 128 });
        sender.load("job", "G0 X1\n; comment only\n\nG0 X2\n", ExpressionContext::new());
        // 2 non-empty lines + appended %wait
        assert_eq!(sender.total(), 3);
        assert_eq!(sender.peek(), Some("G0 X1"));
    }

    #[test]
    fn send_response_keeps_one_line_in_flight() {
        let mut sender = Sender::new(StreamingProtocol::SendResponse);
        sender.load("job", "G0 X1\nG0 X2\n", ExpressionContext::new());

        let out = sender.next();
        assert_eq!(data_lines(&out), vec!["G0 X1"]);
        assert_eq!(sender.sent() - sender.received(), 1);

        // No further data until the ack arrives
        assert!(data_lines(&sender.next()).is_empty());
        assert!(sender.ack().advanced);
        assert_eq!(data_lines(&sender.next()), vec!["G0 X2"]);
    }

    #[test]
    fn char_counting_respects_buffer_size() {
        // Each line "G0 X1" is 5 bytes + LF = 6; buffer of 13 fits two
        let mut sender = Sender::new(StreamingProtocol::CharCounting { buffer_size: 13 });
        sender.load("job", "G0 X1\nG0 X2\nG0 X3\n", ExpressionContext::new());

        let out = sender.next();
        assert_eq!(data_lines(&out), vec!["G0 X1", "G0 X2"]);
        assert_eq!(sender.data_length(), 12);

        // One ack frees room for the next line
        sender.ack();
        assert_eq!(data_lines(&sender.next()), vec!["G0 X3"]);
    }

    #[test]
    fn line_filling_the_buffer_exactly_is_sendable() {
        // 9-byte line + LF == buffer_size of 10
        let mut sender = Sender::new(StreamingProtocol::CharCounting { buffer_size: 10 });
        sender.load("job", "G1 X1 Y22\n", ExpressionContext::new());
        assert_eq!(data_lines(&sender.next()), vec!["G1 X1 Y22"]);

        // One byte larger must block until the buffer drains
        let mut sender = Sender::new(StreamingProtocol::CharCounting { buffer_size: 9 });
        sender.load("job", "G1 X1 Y22\n", ExpressionContext::new());
        assert!(data_lines(&sender.next()).is_empty());
    }

    #[test]
    fn queue_report_window() {
        let mut sender = Sender::new(StreamingProtocol::QueueReport { low_water: 4 });
        sender.load("job", "G0 X1\nG0 X2\nG0 X3\n", ExpressionContext::new());

        // No queue report yet: nothing moves
        assert!(data_lines(&sender.next()).is_empty());

        sender.update_queue_free(6);
        let out = sender.next();
        // 6 free → emit until the conservative local count reaches the mark
        assert_eq!(data_lines(&out), vec!["G0 X1", "G0 X2"]);

        // A fresh report reopens the window: the last line plus the
        // appended %wait dwell go out
        sender.update_queue_free(28);
        assert_eq!(data_lines(&sender.next()), vec!["G0 X3", "G4 P0.5"]);
    }

    #[test]
    fn ack_past_sent_is_rejected() {
        let mut sender = Sender::new(StreamingProtocol::SendResponse);
        sender.load("job", "G0 X1\n", ExpressionContext::new());
        sender.next();
        assert!(sender.ack().advanced);
        let outcome = sender.ack();
        assert!(!outcome.advanced);
        assert_eq!(sender.received(), sender.sent());
    }

    #[test]
    fn wait_sentinel_holds_until_drained() {
        let mut sender = Sender::new(StreamingProtocol::CharCounting { buffer_size: 128 });
        sender.load("job", "%wait\n", ExpressionContext::new());

        let out = sender.next();
        assert_eq!(data_lines(&out), vec!["G4 P0.5"]);
        assert!(sender.is_hold());
        assert!(!sender.drained());

        let outcome = sender.ack();
        assert!(sender.drained());
        // Program was a single (appended) dwell pair: the loaded "%wait"
        // plus the auto-appended sentinel
        assert!(!outcome.finished);
    }

    #[test]
    fn finish_time_set_when_fully_acked() {
        let mut sender = Sender::new(StreamingProtocol::CharCounting { buffer_size: 128 });
        sender.load("job", "G0 X1\n", ExpressionContext::new());

        // First pass: G0 X1 goes out, then the %wait dwell holds the sender
        let out = sender.next();
        assert_eq!(data_lines(&out), vec!["G0 X1"]);
        sender.ack();

        sender.unhold();
        let out = sender.next();
        assert_eq!(data_lines(&out), vec!["G4 P0.5"]);
        assert!(sender.is_hold());

        let outcome = sender.ack();
        assert!(outcome.finished);
        assert!(sender.finish_time() > 0);
        assert_eq!(sender.received(), sender.total());
    }

    #[test]
    fn pause_word_raises_request_and_stops_emission() {
        let mut sender = Sender::new(StreamingProtocol::CharCounting { buffer_size: 128 });
        sender.load("job", "G0 X1\nM6\nG0 X2\n", ExpressionContext::new());

        let out = sender.next();
        let lines = data_lines(&out);
        assert_eq!(lines, vec!["G0 X1", "(M6)"]);
        assert!(out
            .iter()
            .any(|e| matches!(e, SenderEventOut::PauseRequest { reason } if reason == &serde_json::json!({"data": "M6"}))));
    }

    #[test]
    fn ack_during_hold_advances_without_emitting() {
        let mut sender = Sender::new(StreamingProtocol::CharCounting { buffer_size: 128 });
        sender.load("job", "G0 X1\nG0 X2\n", ExpressionContext::new());
        sender.next();
        sender.hold(Some(json!({ "data": "M0" })));

        let before = sender.received();
        sender.ack();
        assert_eq!(sender.received(), before + 1);
        assert!(sender.next().is_empty());
    }

    #[test]
    fn rewind_resets_counters_but_keeps_program() {
        let mut sender = Sender::new(StreamingProtocol::CharCounting { buffer_size: 128 });
        sender.load("job", "G0 X1\n", ExpressionContext::new());
        sender.next();
        sender.ack();
        sender.rewind();

        assert_eq!(sender.sent(), 0);
        assert_eq!(sender.received(), 0);
        assert_eq!(sender.data_length(), 0);
        assert!(sender.is_loaded());
        assert_eq!(sender.peek(), Some("G0 X1"));
    }

    #[test]
    fn status_round_trips() {
        let mut sender = Sender::new(StreamingProtocol::CharCounting { buffer_size: 128 });
        let mut ctx = ExpressionContext::new();
        ctx.set("xmin", crate::gcode::CtxValue::Number(0.0));
        sender.load("job", "G0 X1\nG0 X2\n", ctx);
        sender.next();
        sender.ack();

        let status = sender.status();
        let value = serde_json::to_value(&status).unwrap();
        let back: SenderStatus = serde_json::from_value(value).unwrap();
        assert_eq!(back, status);
        assert_eq!(back.name.as_deref(), Some("job"));
        assert_eq!(back.total, 3);
        assert_eq!(back.sent, 3);
        assert_eq!(back.received, 1);
    }
}
