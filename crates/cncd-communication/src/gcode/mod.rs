//! G-code line filtering and expression substitution
//!
//! Both the feeder and the sender pass every line through [`filter_line`]
//! before it reaches the wire:
//!
//! - `; ...` comments are stripped
//! - `%name = expr` assigns into the expression context and emits nothing
//! - `%wait` is flagged so the caller can emit a dwell and/or hold
//! - `[expr]` spans are substituted against the context
//! - `M0`/`M1`/`M6` pause words are detected; `M6` is re-emitted inside
//!   parentheses so the firmware ignores it
//!
//! The filter itself is pure: it never performs I/O, and all state it
//! touches is the context it was handed.

pub mod expression;

pub use expression::{evaluate, CtxValue};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Variables exposed to inline expression substitution
///
/// Holds axis positions, modal words and user globals. A context travels
/// with each queued line so late-bound substitutions see the values captured
/// when the line was queued.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExpressionContext {
    vars: BTreeMap<String, CtxValue>,
}

impl ExpressionContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable
    pub fn set(&mut self, name: impl Into<String>, value: CtxValue) {
        self.vars.insert(name.into(), value);
    }

    /// Look up a variable
    pub fn get(&self, name: &str) -> Option<&CtxValue> {
        self.vars.get(name)
    }

    /// Merge another context over this one
    pub fn extend(&mut self, other: &ExpressionContext) {
        for (k, v) in &other.vars {
            self.vars.insert(k.clone(), v.clone());
        }
    }

    /// True when no variables are set
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// Result of passing one raw line through the data filter
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filtered {
    /// The line to put on the wire, if any
    pub line: Option<String>,
    /// Pause word found in the line (`M0`, `M1`, `M6`)
    pub pause: Option<String>,
    /// The line was the `%wait` sentinel
    pub wait: bool,
}

/// Strip a trailing `;` comment
pub fn strip_comment(line: &str) -> &str {
    match line.find(';') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

/// Substitute `[expr]` spans against the context
///
/// Spans that fail to evaluate are left untouched so the firmware's own
/// error reporting stays meaningful.
fn substitute(line: &str, ctx: &ExpressionContext) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;

    while let Some(start) = rest.find('[') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        match tail.find(']') {
            Some(end) => {
                let inner = &tail[1..end];
                match evaluate(inner, ctx) {
                    Ok(value) => out.push_str(&value.render()),
                    Err(err) => {
                        tracing::debug!("Expression '{}' not substituted: {}", inner, err);
                        out.push_str(&tail[..=end]);
                    }
                }
                rest = &tail[end + 1..];
            }
            None => {
                out.push_str(tail);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Locate a standalone pause word (`M0`, `M1`, `M6`) in a line
///
/// Returns the canonical word plus the byte range of the token so `M6` can
/// be rewritten in place.
fn find_pause_word(line: &str) -> Option<(&'static str, std::ops::Range<usize>)> {
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if (c == 'M' || c == 'm') && (i == 0 || !(bytes[i - 1] as char).is_ascii_alphanumeric()) {
            let mut j = i + 1;
            while j < bytes.len() && (bytes[j] as char).is_ascii_digit() {
                j += 1;
            }
            if j > i + 1 && (j == bytes.len() || !(bytes[j] as char).is_ascii_alphabetic()) {
                let word = match line[i + 1..j].parse::<u32>() {
                    Ok(0) => Some("M0"),
                    Ok(1) => Some("M1"),
                    Ok(6) => Some("M6"),
                    _ => None,
                };
                if let Some(word) = word {
                    return Some((word, i..j));
                }
            }
            i = j;
        } else {
            i += 1;
        }
    }
    None
}

/// Pass one raw line through the shared data filter
pub fn filter_line(raw: &str, ctx: &mut ExpressionContext) -> Filtered {
    let text = strip_comment(raw).trim();

    if text.is_empty() {
        return Filtered::default();
    }

    if text == "%wait" {
        return Filtered {
            line: None,
            pause: None,
            wait: true,
        };
    }

    if let Some(directive) = text.strip_prefix('%') {
        // `%name = expr` assignment; anything else after '%' is ignored
        if let Some((name, expr)) = directive.split_once('=') {
            let name = name.trim();
            match evaluate(expr.trim(), ctx) {
                Ok(value) => ctx.set(name, value),
                Err(err) => {
                    tracing::warn!("Assignment '%{}' failed: {}", directive.trim(), err)
                }
            }
        }
        return Filtered::default();
    }

    let mut line = substitute(text, ctx);
    let pause = find_pause_word(&line).map(|(word, range)| {
        if word == "M6" {
            line.replace_range(range, "(M6)");
        }
        word.to_string()
    });

    Filtered {
        line: Some(line),
        pause,
        wait: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_comments_and_blank_lines() {
        let mut ctx = ExpressionContext::new();
        assert_eq!(filter_line("; just a comment", &mut ctx), Filtered::default());
        assert_eq!(
            filter_line("G0 X1 ; rapid", &mut ctx).line.as_deref(),
            Some("G0 X1")
        );
    }

    #[test]
    fn wait_sentinel_flagged() {
        let mut ctx = ExpressionContext::new();
        let out = filter_line("%wait ; Wait for the planner to empty", &mut ctx);
        assert!(out.wait);
        assert!(out.line.is_none());
    }

    #[test]
    fn assignment_updates_context_without_emission() {
        let mut ctx = ExpressionContext::new();
        let out = filter_line("%zsafe = 3 + 2", &mut ctx);
        assert!(out.line.is_none());
        assert_eq!(ctx.get("zsafe"), Some(&CtxValue::Number(5.0)));
    }

    #[test]
    fn bracket_substitution() {
        let mut ctx = ExpressionContext::new();
        ctx.set("zsafe", CtxValue::Number(5.0));
        let out = filter_line("G0 Z[zsafe + 1]", &mut ctx);
        assert_eq!(out.line.as_deref(), Some("G0 Z6"));
    }

    #[test]
    fn unresolvable_expression_left_in_place() {
        let mut ctx = ExpressionContext::new();
        let out = filter_line("G0 Z[nope]", &mut ctx);
        assert_eq!(out.line.as_deref(), Some("G0 Z[nope]"));
    }

    #[test]
    fn pause_words_detected() {
        let mut ctx = ExpressionContext::new();
        let out = filter_line("M0", &mut ctx);
        assert_eq!(out.pause.as_deref(), Some("M0"));
        assert_eq!(out.line.as_deref(), Some("M0"));

        // M30 is not a pause word and M100 must not match M1/M0
        assert_eq!(filter_line("M30", &mut ctx).pause, None);
        assert_eq!(filter_line("M100", &mut ctx).pause, None);
    }

    #[test]
    fn tool_change_wrapped_in_parens() {
        let mut ctx = ExpressionContext::new();
        let out = filter_line("M6 T2", &mut ctx);
        assert_eq!(out.pause.as_deref(), Some("M6"));
        assert_eq!(out.line.as_deref(), Some("(M6) T2"));
    }
}
