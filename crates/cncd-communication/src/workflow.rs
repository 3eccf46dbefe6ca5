//! Workflow: program lifecycle state machine
//!
//! `Idle → Running` on start, `Running → Paused` on pause,
//! `Paused → Running` on resume, any state → `Idle` on stop. Side effects
//! (rewinding or holding the sender, resetting the feeder) are arranged by
//! the controller, not here.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Program execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowState {
    /// No program running
    #[default]
    Idle,
    /// Program streaming
    Running,
    /// Program paused by the operator or an inline sentinel
    Paused,
}

impl WorkflowState {
    /// Wire name of the state
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
        }
    }
}

/// The three-state program FSM
#[derive(Debug, Default)]
pub struct Workflow {
    state: WorkflowState,
    pause_reason: Option<Value>,
}

impl Workflow {
    /// Create an idle workflow
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state
    pub fn state(&self) -> WorkflowState {
        self.state
    }

    /// Reason recorded by the last pause
    pub fn pause_reason(&self) -> Option<&Value> {
        self.pause_reason.as_ref()
    }

    /// Enter `Running`; returns whether the state changed
    pub fn start(&mut self) -> bool {
        if self.state == WorkflowState::Running {
            return false;
        }
        self.state = WorkflowState::Running;
        self.pause_reason = None;
        true
    }

    /// Enter `Paused` from `Running`; returns whether the state changed
    pub fn pause(&mut self, reason: Option<Value>) -> bool {
        if self.state != WorkflowState::Running {
            return false;
        }
        self.state = WorkflowState::Paused;
        self.pause_reason = reason;
        true
    }

    /// Enter `Running` from `Paused`; returns whether the state changed
    pub fn resume(&mut self) -> bool {
        if self.state != WorkflowState::Paused {
            return false;
        }
        self.state = WorkflowState::Running;
        self.pause_reason = None;
        true
    }

    /// Enter `Idle` from any state; returns whether the state changed
    pub fn stop(&mut self) -> bool {
        if self.state == WorkflowState::Idle {
            return false;
        }
        self.state = WorkflowState::Idle;
        self.pause_reason = None;
        true
    }
}
