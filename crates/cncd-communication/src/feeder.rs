//! Feeder: ad-hoc command queue
//!
//! Queues one-off command lines (jogs, macros, console input) and emits them
//! one at a time. The controller calls [`Feeder::next`] when the firmware is
//! ready for another line; a hold raised by a pause word blocks further
//! emission until the operator releases it.

use crate::gcode::{filter_line, ExpressionContext};
use serde_json::{json, Value};
use std::collections::VecDeque;

/// One queued line with the context captured when it was queued
#[derive(Debug, Clone)]
pub struct FeederItem {
    /// The raw line.
    pub line: String,
    /// Expression context for `[expr]` substitution.
    pub context: ExpressionContext,
}

/// What one [`Feeder::next`] call produced
#[derive(Debug, Clone)]
pub struct FeederOutput {
    /// Line to put on the wire, if the item survived filtering.
    pub line: Option<String>,
    /// Context of the consumed item (assignments already applied).
    pub context: ExpressionContext,
    /// Hold raised while processing the item (`{"data": "M0"}`, ...).
    pub hold: Option<Value>,
}

/// Ad-hoc command queue with hold/resume
#[derive(Debug, Default)]
pub struct Feeder {
    queue: VecDeque<FeederItem>,
    hold: bool,
    hold_reason: Option<Value>,
}

impl Feeder {
    /// Create an empty feeder
    pub fn new() -> Self {
        Self::default()
    }

    /// Append lines to the queue
    pub fn feed(&mut self, lines: &[String], context: ExpressionContext) {
        for line in lines {
            self.queue.push_back(FeederItem {
                line: line.clone(),
                context: context.clone(),
            });
        }
    }

    /// Process the head item through the data filter
    ///
    /// Returns `None` when the queue is empty or a hold is active. An item
    /// that filters to nothing still consumes its slot; the caller is
    /// expected to poll again.
    pub fn next(&mut self) -> Option<FeederOutput> {
        if self.hold {
            return None;
        }
        let mut item = self.queue.pop_front()?;
        let filtered = filter_line(&item.line, &mut item.context);

        let mut hold = None;
        if let Some(word) = filtered.pause {
            let reason = json!({ "data": word });
            self.hold(reason.clone());
            hold = Some(reason);
        }

        let line = if filtered.wait {
            Some("G4 P0.5".to_string())
        } else {
            filtered.line
        };

        Some(FeederOutput {
            line,
            context: item.context,
            hold,
        })
    }

    /// Number of queued items
    pub fn size(&self) -> usize {
        self.queue.len()
    }

    /// There is at least one queued item
    pub fn peek(&self) -> bool {
        !self.queue.is_empty()
    }

    /// There is work and no hold blocking it
    pub fn is_pending(&self) -> bool {
        !self.queue.is_empty() && !self.hold
    }

    /// Drop all queued items and release any hold
    pub fn reset(&mut self) {
        self.queue.clear();
        self.hold = false;
        self.hold_reason = None;
    }

    /// Block further emission
    pub fn hold(&mut self, reason: Value) {
        self.hold = true;
        self.hold_reason = Some(reason);
    }

    /// Release a hold
    pub fn unhold(&mut self) {
        self.hold = false;
        self.hold_reason = None;
    }

    /// A hold is active
    pub fn is_hold(&self) -> bool {
        self.hold
    }

    /// Status snapshot published as `feeder:status`
    pub fn status(&self) -> Value {
        json!({
            "queue": self.queue.len(),
            "hold": self.hold,
            "holdReason": self.hold_reason,
            "pending": self.is_pending(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_one(feeder: &mut Feeder, line: &str) {
        feeder.feed(&[line.to_string()], ExpressionContext::new());
    }

    #[test]
    fn emits_in_fifo_order() {
        let mut feeder = Feeder::new();
        feed_one(&mut feeder, "G0 X1");
        feed_one(&mut feeder, "G0 X2");

        assert_eq!(feeder.next().unwrap().line.as_deref(), Some("G0 X1"));
        assert_eq!(feeder.next().unwrap().line.as_deref(), Some("G0 X2"));
        assert!(feeder.next().is_none());
    }

    #[test]
    fn pause_word_raises_hold_and_blocks_queue() {
        let mut feeder = Feeder::new();
        feed_one(&mut feeder, "M0");
        feed_one(&mut feeder, "G0 X1");

        let out = feeder.next().unwrap();
        assert_eq!(out.line.as_deref(), Some("M0"));
        assert_eq!(out.hold, Some(json!({ "data": "M0" })));
        assert!(feeder.is_hold());
        assert!(!feeder.is_pending());

        // Held: nothing comes out until the operator releases it
        assert!(feeder.next().is_none());
        feeder.unhold();
        assert_eq!(feeder.next().unwrap().line.as_deref(), Some("G0 X1"));
    }

    #[test]
    fn tool_change_wrapped_and_held() {
        let mut feeder = Feeder::new();
        feed_one(&mut feeder, "M6 T1");
        let out = feeder.next().unwrap();
        assert_eq!(out.line.as_deref(), Some("(M6) T1"));
        assert!(feeder.is_hold());
    }

    #[test]
    fn wait_sentinel_becomes_dwell() {
        let mut feeder = Feeder::new();
        feed_one(&mut feeder, "%wait");
        let out = feeder.next().unwrap();
        assert_eq!(out.line.as_deref(), Some("G4 P0.5"));
        assert!(!feeder.is_hold());
    }

    #[test]
    fn assignment_consumes_item_without_emission() {
        let mut feeder = Feeder::new();
        feed_one(&mut feeder, "%zsafe = 5");
        let out = feeder.next().unwrap();
        assert!(out.line.is_none());
        assert_eq!(feeder.size(), 0);
    }

    #[test]
    fn reset_releases_hold_and_clears_queue() {
        let mut feeder = Feeder::new();
        feed_one(&mut feeder, "M0");
        feed_one(&mut feeder, "G0 X1");
        feeder.next();
        feeder.reset();
        assert!(!feeder.is_hold());
        assert_eq!(feeder.size(), 0);
    }
}
