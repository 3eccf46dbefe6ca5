//! Configuration and settings management for the cncd daemon
//!
//! Provides configuration file handling, validation, and the typed sections
//! the engine and controllers read at runtime.

use cncd_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Extra serial ports to offer alongside enumerated ones
    #[serde(default)]
    pub ports: Vec<ConfiguredPort>,
    /// Extra baud rates merged with the built-in defaults
    #[serde(default)]
    pub baud_rates: Vec<u32>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            ports: Vec::new(),
            baud_rates: vec![115200],
        }
    }
}

/// A user-configured serial port entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfiguredPort {
    /// Device path (e.g. `/dev/ttyUSB0`, `COM3`)
    pub path: String,
    /// Free-form manufacturer label shown to clients
    #[serde(default)]
    pub manufacturer: Option<String>,
}

/// A user record in the access list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    /// Stable user id carried in the bearer token
    pub id: String,
    /// Display name carried in the bearer token
    pub name: String,
    /// Disabled users are rejected at session admission
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Access settings: IP rules plus the user list
///
/// An empty user list leaves the daemon open to any verified token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessSettings {
    /// Allow patterns; empty means allow everything not denied
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    /// Deny patterns; checked before allow
    #[serde(default)]
    pub denied_ips: Vec<String>,
    /// Known users
    #[serde(default)]
    pub users: Vec<UserRecord>,
}

/// A named G-code macro
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacroRecord {
    /// Stable macro id clients pass to `macro:run` / `macro:load`
    pub id: String,
    /// Display name
    pub name: String,
    /// Macro body (G-code, may use `[expr]` substitution)
    pub content: String,
}

/// How a configured event reaction is dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionTrigger {
    /// Spawn the commands through the shell runner
    System,
    /// Feed the commands to the controller as G-code
    Gcode,
}

/// A user-configured reaction to a named event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventReaction {
    /// Event name (`sender:start`, `controller:ready`, ...)
    pub event: String,
    /// Dispatch kind
    pub trigger: ReactionTrigger,
    /// Commands to run; G-code reactions may hold multiple lines
    pub commands: String,
    /// Disabled reactions are skipped
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Watch-directory settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchDirSettings {
    /// Root directory programs are loaded from
    pub root: PathBuf,
}

impl Default for WatchDirSettings {
    fn default() -> Self {
        Self {
            root: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("watch"),
        }
    }
}

/// Controller preferences
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerPrefs {
    /// Keep streaming through firmware `error:` replies instead of pausing
    #[serde(default)]
    pub ignore_errors: bool,
}

/// Complete daemon configuration
///
/// Aggregates all settings sections and provides file I/O operations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings
    #[serde(default)]
    pub connection: ConnectionSettings,
    /// Access settings
    #[serde(default)]
    pub access: AccessSettings,
    /// Macro store
    #[serde(default)]
    pub macros: Vec<MacroRecord>,
    /// Event reactions
    #[serde(default)]
    pub events: Vec<EventReaction>,
    /// Watch directory
    #[serde(default)]
    pub watch_dir: WatchDirSettings,
    /// Controller preferences
    #[serde(default)]
    pub controller: ControllerPrefs,
}

impl Config {
    /// Create new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load config from file (JSON or TOML)
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::other(format!("Failed to read config file: {}", e)))?;

        let config: Self = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&content)
                .map_err(|e| Error::other(format!("Invalid JSON config: {}", e)))?
        } else if path.extension().is_some_and(|ext| ext == "toml") {
            toml::from_str(&content)
                .map_err(|e| Error::other(format!("Invalid TOML config: {}", e)))?
        } else {
            return Err(Error::other("Config file must be .json or .toml"));
        };

        config.validate()?;
        Ok(config)
    }

    /// Save config to file (JSON or TOML)
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        self.validate()?;

        let content = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::to_string_pretty(self)
                .map_err(|e| Error::other(format!("Failed to serialize config: {}", e)))?
        } else if path.extension().is_some_and(|ext| ext == "toml") {
            toml::to_string_pretty(self)
                .map_err(|e| Error::other(format!("Failed to serialize config: {}", e)))?
        } else {
            return Err(Error::other("Config file must be .json or .toml"));
        };

        std::fs::write(path, content)
            .map_err(|e| Error::other(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for rate in &self.connection.baud_rates {
            if *rate == 0 {
                return Err(Error::other("Baud rate must be > 0"));
            }
        }

        for port in &self.connection.ports {
            if port.path.is_empty() {
                return Err(Error::other("Configured port path must not be empty"));
            }
        }

        for m in &self.macros {
            if m.id.is_empty() {
                return Err(Error::other("Macro id must not be empty"));
            }
        }

        for r in &self.events {
            if r.event.is_empty() {
                return Err(Error::other("Event reaction must name an event"));
            }
        }

        Ok(())
    }

    /// Find a macro by id
    pub fn find_macro(&self, id: &str) -> Option<&MacroRecord> {
        self.macros.iter().find(|m| m.id == id)
    }

    /// Enabled reactions configured for an event name
    pub fn reactions_for(&self, event: &str) -> Vec<EventReaction> {
        self.events
            .iter()
            .filter(|r| r.enabled && r.event == event)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn zero_baud_rate_rejected() {
        let mut config = Config::default();
        config.connection.baud_rates.push(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn reactions_for_skips_disabled() {
        let mut config = Config::default();
        config.events.push(EventReaction {
            event: "sender:start".into(),
            trigger: ReactionTrigger::Gcode,
            commands: "M8".into(),
            enabled: true,
        });
        config.events.push(EventReaction {
            event: "sender:start".into(),
            trigger: ReactionTrigger::System,
            commands: "notify-send start".into(),
            enabled: false,
        });

        let hits = config.reactions_for("sender:start");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].commands, "M8");
    }

    #[test]
    fn find_macro_by_id() {
        let mut config = Config::default();
        config.macros.push(MacroRecord {
            id: "m1".into(),
            name: "Probe Z".into(),
            content: "G38.2 Z-10 F40".into(),
        });
        assert!(config.find_macro("m1").is_some());
        assert!(config.find_macro("m2").is_none());
    }
}
