//! # cncd
//!
//! A CNC control daemon that mediates between network clients and CNC
//! controller firmwares (Grbl, Smoothieware, TinyG/g2core, Marlin) over a
//! serial or TCP transport.
//!
//! ## Architecture
//!
//! cncd is organized as a workspace with multiple crates:
//!
//! 1. **cncd-core** - Core types, errors, server event model
//! 2. **cncd-settings** - Daemon configuration and persistence
//! 3. **cncd-communication** - Transports, firmware protocols, the
//!    feeder/sender streaming state machines, controllers
//! 4. **cncd-server** - Engine/router, sessions, auth, shell tasks
//! 5. **cncd** - Main binary that integrates all crates

pub use cncd_communication::{
    list_ports, spawn_controller, ConnectionOptions, ControllerCommand, ControllerHandle,
    SerialTransport, TcpTransport, Transport,
};
pub use cncd_core::{
    ConnectionKind, ControllerKind, Error, MachineState, Position, Result, ServerEvent,
};
pub use cncd_server::{Engine, SessionClaims, ShellRunner, WatchDir};
pub use cncd_settings::{Config, ConfigStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Initialize logging with the default configuration
///
/// Sets up structured logging with:
/// - Console output
/// - RUST_LOG environment variable support
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(true)
        .with_level(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    Ok(())
}
