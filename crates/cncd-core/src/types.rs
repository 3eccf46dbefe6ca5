//! Shared data types for the cncd daemon

use serde::{Deserialize, Serialize};

/// Supported CNC controller firmwares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ControllerKind {
    /// Grbl (default, most common)
    #[default]
    Grbl,
    /// Smoothieware
    Smoothie,
    /// TinyG / g2core
    TinyG,
    /// Marlin
    Marlin,
}

impl ControllerKind {
    /// All controller kinds the daemon can drive
    pub const ALL: [ControllerKind; 4] = [
        ControllerKind::Grbl,
        ControllerKind::Smoothie,
        ControllerKind::TinyG,
        ControllerKind::Marlin,
    ];

    /// Parse a controller kind from its wire name (case-insensitive)
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "grbl" => Some(Self::Grbl),
            "smoothie" | "smoothieware" => Some(Self::Smoothie),
            "tinyg" | "g2core" => Some(Self::TinyG),
            "marlin" => Some(Self::Marlin),
            _ => None,
        }
    }
}

impl std::fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Grbl => write!(f, "Grbl"),
            Self::Smoothie => write!(f, "Smoothie"),
            Self::TinyG => write!(f, "TinyG"),
            Self::Marlin => write!(f, "Marlin"),
        }
    }
}

/// Kind of byte-level link to the firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    /// Serial/USB connection
    Serial,
    /// TCP/IP connection
    Tcp,
}

impl std::fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serial => write!(f, "serial"),
            Self::Tcp => write!(f, "tcp"),
        }
    }
}

/// Coarse machine activity state, normalized across firmwares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MachineState {
    /// State not yet reported
    #[default]
    Unknown,
    /// Ready for commands
    Idle,
    /// Executing motion
    Run,
    /// Feed hold active
    Hold,
    /// Jogging
    Jog,
    /// Alarm lockout
    Alarm,
    /// Safety door open
    Door,
    /// Check-mode (dry run)
    Check,
    /// Homing cycle
    Home,
    /// Sleep mode
    Sleep,
}

impl MachineState {
    /// Map a Grbl-style state word (`Idle`, `Run`, `Hold:0`, ...) to the
    /// normalized state.
    pub fn from_word(word: &str) -> Self {
        let head = word.split(':').next().unwrap_or(word);
        match head {
            "Idle" => Self::Idle,
            "Run" => Self::Run,
            "Hold" => Self::Hold,
            "Jog" => Self::Jog,
            "Alarm" => Self::Alarm,
            "Door" => Self::Door,
            "Check" => Self::Check,
            "Home" => Self::Home,
            "Sleep" => Self::Sleep,
            _ => Self::Unknown,
        }
    }
}

/// Machine or work position in machine units
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    /// X coordinate
    pub x: f64,
    /// Y coordinate
    pub y: f64,
    /// Z coordinate
    pub z: f64,
    /// A axis (4th axis), when reported
    #[serde(skip_serializing_if = "Option::is_none")]
    pub a: Option<f64>,
}

impl Position {
    /// Create a three-axis position
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z, a: None }
    }

    /// Create a four-axis position
    pub fn with_a(x: f64, y: f64, z: f64, a: f64) -> Self {
        Self {
            x,
            y,
            z,
            a: Some(a),
        }
    }
}
