//! # cncd Server
//!
//! The engine layer of the cncd daemon: a singleton multiplexer over all
//! controllers plus the services controllers borrow — the shell runner for
//! event triggers, the watch-directory file service, and session admission
//! (bearer claims, IP rules, user list).
//!
//! The socket layer itself (WebSocket/HTTP) is an external collaborator; it
//! hands verified claims to [`Engine::attach_session`] and forwards client
//! operations to the engine's methods.

pub mod auth;
pub mod engine;
pub mod shell;
pub mod watchdir;

pub use auth::SessionClaims;
pub use engine::{Engine, PortRecord, DEFAULT_BAUD_RATES};
pub use shell::ShellRunner;
pub use watchdir::WatchDir;
