//! Engine: the singleton multiplexer over all controllers
//!
//! Owns the global `ident → controller` registry (exactly one controller
//! per ident), admits client sessions, routes per-connection operations,
//! and fans engine-wide events (`task:*`, `config:change`, `startup`) out
//! to every session. Controllers remove themselves from the registry on
//! transport close through the teardown hook installed here; both mutation
//! paths serialize on the registry lock.

use crate::auth::{self, SessionClaims};
use crate::shell::ShellRunner;
use crate::watchdir::WatchDir;
use cncd_communication::{
    list_ports, spawn_controller, ConnectionOptions, ControllerCommand, ControllerDeps,
    ControllerHandle, SerialTransport, TcpTransport, Transport,
};
use cncd_core::{ControllerKind, Result, ServerEvent, ValidationError};
use cncd_settings::ConfigStore;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

/// Baud rates offered before user configuration is merged in
pub const DEFAULT_BAUD_RATES: [u32; 7] = [250000, 115200, 57600, 38400, 19200, 9600, 2400];

/// One entry of `getPorts()`
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PortRecord {
    /// Device path.
    pub path: String,
    /// Manufacturer label, when known.
    pub manufacturer: Option<String>,
    /// A controller is currently bound to this port.
    pub connected: bool,
}

struct Session {
    claims: SessionClaims,
    tx: UnboundedSender<ServerEvent>,
}

/// The engine
pub struct Engine {
    store: Arc<ConfigStore>,
    registry: Arc<RwLock<HashMap<String, ControllerHandle>>>,
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    shell: Arc<ShellRunner>,
    watch_dir: Arc<WatchDir>,
}

impl Engine {
    /// Create the engine and start its event pump
    pub fn new(store: Arc<ConfigStore>) -> Arc<Self> {
        let sessions: Arc<RwLock<HashMap<String, Session>>> = Arc::new(RwLock::new(HashMap::new()));

        // Engine-wide events (task lifecycle, config changes) go to every
        // session regardless of which connections it subscribed to
        let (events_tx, mut events_rx) = unbounded_channel::<ServerEvent>();
        let pump_sessions = sessions.clone();
        tokio::spawn(async move {
            while let Some(ev) = events_rx.recv().await {
                for session in pump_sessions.read().values() {
                    let _ = session.tx.send(ev.clone());
                }
            }
        });

        let config_tx = events_tx.clone();
        store.on_change(move || {
            let _ = config_tx.send(ServerEvent::ConfigChange);
        });

        let shell = Arc::new(ShellRunner::new(events_tx));
        let watch_dir = Arc::new(WatchDir::new(store.get().watch_dir.root.clone()));

        // Daemon-level `startup` reactions fire once, here; controller-scoped
        // events fire through each controller's own trigger
        for reaction in store.get().reactions_for("startup") {
            if reaction.trigger == cncd_settings::ReactionTrigger::System {
                shell.spawn_command(&reaction.commands);
            }
        }

        Arc::new(Self {
            store,
            registry: Arc::new(RwLock::new(HashMap::new())),
            sessions,
            shell,
            watch_dir,
        })
    }

    /// Admit a session; returns its id and event stream
    pub fn attach_session(
        &self,
        claims: SessionClaims,
        addr: IpAddr,
    ) -> Result<(String, UnboundedReceiver<ServerEvent>)> {
        auth::check_access(&self.store.get().access, &claims, addr)?;

        let id = Uuid::new_v4().to_string();
        let (tx, rx) = unbounded_channel();

        let _ = tx.send(ServerEvent::Startup {
            available_controllers: ControllerKind::ALL.iter().map(|k| k.to_string()).collect(),
        });

        tracing::info!("Session {} attached for {}", id, claims.name);
        self.sessions.write().insert(id.clone(), Session { claims, tx });
        Ok((id, rx))
    }

    /// Detach a session from every controller without closing any
    pub fn detach_session(&self, session_id: &str) {
        if self.sessions.write().remove(session_id).is_some() {
            for handle in self.registry.read().values() {
                let _ = handle.remove_socket(session_id);
            }
            tracing::info!("Session {} detached", session_id);
        }
    }

    /// Number of attached sessions
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Enumerated serial ports merged with configured ports and bound idents
    pub fn get_ports(&self) -> Vec<PortRecord> {
        let mut records: Vec<PortRecord> = Vec::new();

        if let Ok(ports) = list_ports() {
            for port in ports {
                records.push(PortRecord {
                    path: port.path,
                    manufacturer: port.manufacturer,
                    connected: false,
                });
            }
        }

        for configured in self.store.get().connection.ports {
            if !records.iter().any(|r| r.path == configured.path) {
                records.push(PortRecord {
                    path: configured.path,
                    manufacturer: configured.manufacturer,
                    connected: false,
                });
            }
        }

        let registry = self.registry.read();
        for record in &mut records {
            let prefix = format!("serial:{}@", record.path);
            record.connected = registry.keys().any(|ident| ident.starts_with(&prefix));
        }

        records
    }

    /// Default baud rates merged with the user's, dedup-sorted descending
    pub fn get_baud_rates(&self) -> Vec<u32> {
        let mut rates: Vec<u32> = DEFAULT_BAUD_RATES.to_vec();
        rates.extend(self.store.get().connection.baud_rates);
        rates.sort_unstable_by(|a, b| b.cmp(a));
        rates.dedup();
        rates
    }

    /// Idents currently bound to a controller
    pub fn bound_idents(&self) -> Vec<String> {
        self.registry.read().keys().cloned().collect()
    }

    /// Open (or join) a connection and subscribe the session to it
    pub async fn open(
        &self,
        session_id: &str,
        kind: ControllerKind,
        options: ConnectionOptions,
    ) -> Result<String> {
        let ident = options.ident();
        let session_tx = {
            let sessions = self.sessions.read();
            let session = sessions
                .get(session_id)
                .ok_or_else(|| ValidationError::InvalidOptions {
                    reason: format!("unknown session {}", session_id),
                })?;
            session.tx.clone()
        };

        let existing = self.registry.read().get(&ident).cloned();
        let handle = match existing {
            Some(handle) => handle,
            None => {
                let transport: Box<dyn Transport> = match &options {
                    ConnectionOptions::Serial { path, baud } => {
                        Box::new(SerialTransport::new(path.clone(), *baud))
                    }
                    ConnectionOptions::Tcp { host, port } => {
                        Box::new(TcpTransport::new(host.clone(), *port))
                    }
                };

                let registry = self.registry.clone();
                let deps = ControllerDeps {
                    store: self.store.clone(),
                    spawner: Some(self.shell.clone()),
                    files: Some(self.watch_dir.clone()),
                    on_teardown: Some(Arc::new(move |ident: &str| {
                        registry.write().remove(ident);
                    })),
                };

                let handle = spawn_controller(kind, transport, deps);
                self.registry.write().insert(ident.clone(), handle.clone());

                if let Err(e) = handle.open().await {
                    self.registry.write().remove(&ident);
                    return Err(e);
                }
                handle
            }
        };

        handle.add_socket(session_id, session_tx)?;
        Ok(ident)
    }

    fn handle_for(&self, ident: &str) -> Result<ControllerHandle> {
        self.registry
            .read()
            .get(ident)
            .cloned()
            .ok_or_else(|| {
                ValidationError::UnknownIdent {
                    ident: ident.to_string(),
                }
                .into()
            })
    }

    /// Close a connection; the controller removes itself from the registry
    pub async fn close(&self, ident: &str) -> Result<()> {
        self.handle_for(ident)?.close().await
    }

    /// Dispatch a command to a connection's controller
    pub async fn command(&self, ident: &str, cmd: ControllerCommand) -> Result<()> {
        self.handle_for(ident)?.command(cmd).await
    }

    /// Raw write to a connection
    pub fn write(&self, ident: &str, data: &str) -> Result<()> {
        self.handle_for(ident)?.write(data)
    }

    /// Line write to a connection
    pub fn writeln(&self, ident: &str, data: &str) -> Result<()> {
        self.handle_for(ident)?.writeln(data)
    }

    /// Close every controller (daemon shutdown)
    pub async fn shutdown(&self) {
        let handles: Vec<ControllerHandle> = self.registry.read().values().cloned().collect();
        for handle in handles {
            let _ = handle.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cncd_settings::{ConfiguredPort, UserRecord};

    fn engine() -> (Arc<Engine>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));
        (Engine::new(store), dir)
    }

    fn claims() -> SessionClaims {
        SessionClaims {
            id: "u1".into(),
            name: "operator".into(),
        }
    }

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[tokio::test]
    async fn baud_rates_merge_dedup_descending() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));
        store
            .update(|config| {
                config.connection.baud_rates = vec![115200, 500000];
            })
            .unwrap();
        let engine = Engine::new(store);

        let rates = engine.get_baud_rates();
        assert_eq!(
            rates,
            vec![500000, 250000, 115200, 57600, 38400, 19200, 9600, 2400]
        );
    }

    #[tokio::test]
    async fn session_gets_startup_event() {
        let (engine, _dir) = engine();
        let (id, mut rx) = engine.attach_session(claims(), localhost()).unwrap();

        match rx.try_recv().unwrap() {
            ServerEvent::Startup {
                available_controllers,
            } => {
                assert_eq!(
                    available_controllers,
                    vec!["Grbl", "Smoothie", "TinyG", "Marlin"]
                );
            }
            other => panic!("Wrong event: {:?}", other),
        }

        assert_eq!(engine.session_count(), 1);
        engine.detach_session(&id);
        assert_eq!(engine.session_count(), 0);
    }

    #[tokio::test]
    async fn disabled_user_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));
        store
            .update(|config| {
                config.access.users.push(UserRecord {
                    id: "u1".into(),
                    name: "operator".into(),
                    enabled: false,
                });
            })
            .unwrap();
        let engine = Engine::new(store);

        assert!(engine.attach_session(claims(), localhost()).is_err());
    }

    #[tokio::test]
    async fn denied_ip_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));
        store
            .update(|config| {
                config.access.denied_ips.push("127.*".into());
            })
            .unwrap();
        let engine = Engine::new(store);

        assert!(engine.attach_session(claims(), localhost()).is_err());
    }

    #[tokio::test]
    async fn configured_ports_are_offered() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));
        store
            .update(|config| {
                config.connection.ports.push(ConfiguredPort {
                    path: "/dev/ttyVIRT0".into(),
                    manufacturer: Some("virtual".into()),
                });
            })
            .unwrap();
        let engine = Engine::new(store);

        let ports = engine.get_ports();
        let virt = ports.iter().find(|p| p.path == "/dev/ttyVIRT0").unwrap();
        assert_eq!(virt.manufacturer.as_deref(), Some("virtual"));
        assert!(!virt.connected);
    }

    #[tokio::test]
    async fn open_failure_leaves_registry_clean() {
        let (engine, _dir) = engine();
        let (id, _rx) = engine.attach_session(claims(), localhost()).unwrap();

        let result = engine
            .open(
                &id,
                ControllerKind::Grbl,
                ConnectionOptions::Serial {
                    path: "/dev/ttyNOPE99".into(),
                    baud: 115200,
                },
            )
            .await;

        assert!(result.is_err());
        assert!(engine.bound_idents().is_empty());
    }

    #[tokio::test]
    async fn operations_on_unknown_ident_fail() {
        let (engine, _dir) = engine();
        assert!(engine.write("serial:/dev/ttyUSB0@115200", "?").is_err());
        assert!(engine
            .command(
                "serial:/dev/ttyUSB0@115200",
                ControllerCommand::SenderStart
            )
            .await
            .is_err());
        assert!(engine.close("serial:/dev/ttyUSB0@115200").await.is_err());
    }

    #[tokio::test]
    async fn config_change_reaches_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));
        let engine = Engine::new(store.clone());

        let (_id, mut rx) = engine.attach_session(claims(), localhost()).unwrap();
        let _ = rx.recv().await; // startup

        store.update(|_| {}).unwrap();

        // The pump task relays the change asynchronously
        let ev = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(ev, ServerEvent::ConfigChange));
    }
}
