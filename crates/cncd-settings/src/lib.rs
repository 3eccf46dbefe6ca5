//! # cncd Settings
//!
//! Configuration file handling for the cncd daemon. Supports JSON and TOML
//! files stored in platform-specific directories.
//!
//! Configuration is organized into logical sections:
//! - Connection settings (configured ports, extra baud rates)
//! - Access settings (IP allow/deny rules, user list)
//! - Macros (named G-code snippets)
//! - Event reactions (named events mapped to shell commands or G-code)
//! - Watch directory (root for loadable programs)
//! - Controller preferences (exception policy)

pub mod config;
pub mod persistence;

pub use config::{
    AccessSettings, Config, ConfiguredPort, ConnectionSettings, ControllerPrefs,
    EventReaction, MacroRecord, ReactionTrigger, UserRecord, WatchDirSettings,
};
pub use persistence::ConfigStore;
