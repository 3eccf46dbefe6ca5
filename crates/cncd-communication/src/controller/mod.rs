//! Controller: the shared streaming skeleton
//!
//! One controller owns one firmware link. Two writers contend for the
//! half-duplex channel — the [`Sender`](crate::sender::Sender) streaming a
//! loaded program and the [`Feeder`](crate::feeder::Feeder) injecting
//! ad-hoc lines — while the dialect's runner parses the firmware's replies.
//! All state mutation serializes through one message queue: client
//! commands, transport events and the 250 ms tick are drained by a single
//! task, so no lock is ever taken on the streaming counters.

pub mod dialect;
pub mod grbl;
pub mod marlin;
pub mod smoothie;
pub mod tinyg;

pub use dialect::{Dialect, HandshakeStep, OverrideKind, WireCommand};
pub use grbl::GrblDialect;
pub use marlin::MarlinDialect;
pub use smoothie::SmoothieDialect;
pub use tinyg::TinyGDialect;

use crate::event_trigger::{EventTrigger, ShellSpawner};
use crate::feeder::Feeder;
use crate::gcode::{CtxValue, ExpressionContext};
use crate::runner::{LineBuffer, RunnerEvent};
use crate::sender::{Sender, SenderEventOut};
use crate::transport::{Transport, TransportEvent};
use crate::workflow::{Workflow, WorkflowState};
use cncd_core::{ControllerKind, Error, Result, ServerEvent, ValidationError};
use cncd_settings::ConfigStore;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};

/// Status query backoff: a `?` is not re-issued for 5 s while unanswered
const STATUS_QUERY_TOLERANCE: Duration = Duration::from_secs(5);
/// Parser-state query backoff
const PARSER_QUERY_TOLERANCE: Duration = Duration::from_secs(10);
/// Minimum gap between parser-state queries
const PARSER_QUERY_INTERVAL: Duration = Duration::from_millis(500);
/// Controller housekeeping interval
const TICK_INTERVAL: Duration = Duration::from_millis(250);
/// Machine must sit idle this long after the final ack before auto-stop
const FINISH_IDLE_WINDOW: Duration = Duration::from_millis(500);
/// Wait between `!` and the `0x18` decision on a forced stop
const FORCE_STOP_WAIT: Duration = Duration::from_millis(500);

/// Reads program files for `watchdir:load`
pub trait FileService: Send + Sync {
    /// Read a program by name from the fixed watch root
    fn read_program(&self, name: &str) -> Result<String>;
}

/// Origin tag for an outgoing write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteSource {
    /// A connected client wrote directly
    Client,
    /// The feeder emitted the line
    Feeder,
    /// The sender emitted the line
    Sender,
    /// Controller-internal traffic (queries, handshake)
    Internal,
}

impl WriteSource {
    /// Wire name of the source
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Feeder => "feeder",
            Self::Sender => "sender",
            Self::Internal => "internal",
        }
    }
}

/// Operations dispatched through `command(name, ...)`
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerCommand {
    /// Append ad-hoc lines to the feeder
    Gcode {
        /// Lines to queue.
        lines: Vec<String>,
        /// Extra context merged over the machine context.
        context: Option<ExpressionContext>,
    },
    /// Load a program into the sender
    SenderLoad {
        /// Program name.
        name: String,
        /// Program content.
        content: String,
    },
    /// Discard the loaded program
    SenderUnload,
    /// Start (or restart) streaming the loaded program
    SenderStart,
    /// Stop streaming
    SenderStop {
        /// On Grbl: feed-hold first, then soft-reset if the hold engaged.
        force: bool,
    },
    /// Pause streaming
    SenderPause,
    /// Resume streaming
    SenderResume,
    /// Release a feeder hold (after M0/M1/M6)
    FeederStart,
    /// Drop all queued feeder lines
    FeederStop,
    /// Feed hold without touching the workflow
    Feedhold,
    /// Cycle start without touching the workflow
    Cyclestart,
    /// Run the firmware's homing cycle
    Homing,
    /// Put the controller to sleep
    Sleep,
    /// Clear an alarm lockout
    Unlock,
    /// Reset the firmware
    Reset,
    /// Adjust the feed override; 0 resets
    OverrideFeed {
        /// Signed delta in percent.
        delta: i32,
    },
    /// Adjust the spindle override; 0 resets
    OverrideSpindle {
        /// Signed delta in percent.
        delta: i32,
    },
    /// Adjust the rapid override level
    OverrideRapid {
        /// Level (100/50/25); 0 resets.
        delta: i32,
    },
    /// Pulse the laser for focusing
    Lasertest {
        /// Power in percent of `max_s`.
        power: f64,
        /// Pulse duration in milliseconds; 0 leaves the laser on.
        duration_ms: u64,
        /// Spindle value for 100% power.
        max_s: f64,
    },
    /// Queue a macro's content through the feeder
    MacroRun {
        /// Macro id.
        id: String,
    },
    /// Load a macro's content as a program
    MacroLoad {
        /// Macro id.
        id: String,
    },
    /// Load a program file from the watch directory
    WatchdirLoad {
        /// File name relative to the watch root.
        name: String,
    },
    /// Cancel an active jog motion
    JogCancel,
}

/// Messages the controller task drains
pub enum ControllerMsg {
    /// Open the transport and start the readiness handshake
    Open {
        /// Completion callback.
        done: oneshot::Sender<Result<()>>,
    },
    /// Close the transport and tear the controller down
    Close {
        /// Completion callback.
        done: Option<oneshot::Sender<Result<()>>>,
    },
    /// Dispatch a command
    Command {
        /// The command.
        cmd: ControllerCommand,
        /// Completion callback.
        done: Option<oneshot::Sender<Result<()>>>,
    },
    /// Raw write (client console)
    Write {
        /// Data to write verbatim.
        data: String,
    },
    /// Line write; appends LF unless the data is a realtime command
    Writeln {
        /// Data to write.
        data: String,
    },
    /// Attach a subscriber and replay the current state
    AddSubscriber {
        /// Session id.
        id: String,
        /// Event sink.
        tx: UnboundedSender<ServerEvent>,
    },
    /// Detach a subscriber
    RemoveSubscriber {
        /// Session id.
        id: String,
    },
    /// Inbound transport event
    Transport(TransportEvent),
    /// Scheduled handshake/init write
    Wire(WireCommand),
    /// Decide whether a forced stop escalates to a soft-reset
    ForceStopCheck,
}

/// External services the controller borrows from the server layer
#[derive(Clone)]
pub struct ControllerDeps {
    /// Configuration store (macros, event reactions, exception policy).
    pub store: Arc<ConfigStore>,
    /// Shell spawner for `system` event reactions.
    pub spawner: Option<Arc<dyn ShellSpawner>>,
    /// Watch-directory file service.
    pub files: Option<Arc<dyn FileService>>,
    /// Called with the ident when the controller tears itself down.
    pub on_teardown: Option<Arc<dyn Fn(&str) + Send + Sync>>,
}

#[derive(Debug, Default)]
struct QueryState {
    in_flight: bool,
    issued_at: Option<Instant>,
    last_query: Option<Instant>,
}

impl QueryState {
    fn clear(&mut self) {
        self.in_flight = false;
        self.issued_at = None;
    }
}

/// The per-connection controller
pub struct Controller<D: Dialect> {
    ident: String,
    dialect: D,
    transport: Box<dyn Transport>,
    deps: ControllerDeps,
    msg_tx: UnboundedSender<ControllerMsg>,

    line_buffer: LineBuffer,
    feeder: Feeder,
    sender: Sender,
    workflow: Workflow,
    event_trigger: EventTrigger,

    subscribers: HashMap<String, UnboundedSender<ServerEvent>>,

    ready: bool,
    initialized: bool,
    alive: bool,

    query_status: QueryState,
    query_parser: QueryState,
    reply_status_report: bool,
    reply_parser_state: bool,
    /// `ok` replies still owed to controller-internal line writes.
    internal_ok_debt: u32,
    last_write_source: WriteSource,
    finish_idle_since: Option<Instant>,

    last_feeder_status: Option<Value>,
    last_sender_status: Option<Value>,
    last_settings: Option<Value>,
    last_state: Option<Value>,
}

impl<D: Dialect> Controller<D> {
    /// Create a controller; `msg_tx` must feed the queue whose receiver is
    /// passed to [`Controller::run`]
    pub fn new(
        dialect: D,
        transport: Box<dyn Transport>,
        deps: ControllerDeps,
        msg_tx: UnboundedSender<ControllerMsg>,
    ) -> Self {
        let ident = transport.options().ident();
        let sender = Sender::new(dialect.streaming_protocol());
        let event_trigger = EventTrigger::new(deps.store.clone(), deps.spawner.clone());

        Self {
            ident,
            dialect,
            transport,
            deps,
            msg_tx,
            line_buffer: LineBuffer::new(),
            feeder: Feeder::new(),
            sender,
            workflow: Workflow::new(),
            event_trigger,
            subscribers: HashMap::new(),
            ready: false,
            initialized: false,
            alive: true,
            query_status: QueryState::default(),
            query_parser: QueryState::default(),
            reply_status_report: false,
            reply_parser_state: false,
            internal_ok_debt: 0,
            last_write_source: WriteSource::Internal,
            finish_idle_since: None,
            last_feeder_status: None,
            last_sender_status: None,
            last_settings: None,
            last_state: None,
        }
    }

    /// Connection ident
    pub fn ident(&self) -> &str {
        &self.ident
    }

    /// Firmware kind
    pub fn kind(&self) -> ControllerKind {
        self.dialect.kind()
    }

    /// Firmware banner/capability reply has arrived
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Current workflow state
    pub fn workflow_state(&self) -> WorkflowState {
        self.workflow.state()
    }

    /// Borrow the sender (tests and status inspection)
    pub fn sender(&self) -> &Sender {
        &self.sender
    }

    /// Borrow the feeder (tests and status inspection)
    pub fn feeder(&self) -> &Feeder {
        &self.feeder
    }

    /// Drive the controller until close
    pub async fn run(mut self, mut rx: UnboundedReceiver<ControllerMsg>) {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while self.alive {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle_msg(msg),
                    None => break,
                },
                _ = tick.tick() => self.tick(),
            }
        }
        tracing::debug!("Controller {} stopped", self.ident);
    }

    /// Process one queued message
    pub fn handle_msg(&mut self, msg: ControllerMsg) {
        match msg {
            ControllerMsg::Open { done } => {
                let result = self.open();
                let _ = done.send(result);
            }
            ControllerMsg::Close { done } => {
                self.close();
                if let Some(done) = done {
                    let _ = done.send(Ok(()));
                }
            }
            ControllerMsg::Command { cmd, done } => {
                let result = self.handle_command(cmd);
                if let Err(ref e) = result {
                    tracing::warn!("Command failed on {}: {}", self.ident, e);
                }
                if let Some(done) = done {
                    let _ = done.send(result);
                }
            }
            ControllerMsg::Write { data } => self.write(&data),
            ControllerMsg::Writeln { data } => self.writeln(&data),
            ControllerMsg::AddSubscriber { id, tx } => self.add_subscriber(id, tx),
            ControllerMsg::RemoveSubscriber { id } => {
                self.subscribers.remove(&id);
            }
            ControllerMsg::Transport(ev) => self.on_transport_event(ev),
            ControllerMsg::Wire(cmd) => self.write_wire(&cmd, WriteSource::Internal),
            ControllerMsg::ForceStopCheck => {
                if self.dialect.is_hold() {
                    let reset = self.dialect.reset_command();
                    self.write_wire(&reset, WriteSource::Internal);
                }
            }
        }
    }

    /// Open the transport and schedule the readiness handshake
    pub fn open(&mut self) -> Result<()> {
        if self.transport.is_open() {
            return Ok(());
        }

        let (tx, mut rx) = unbounded_channel::<TransportEvent>();
        self.transport.open(tx)?;

        // Funnel transport events into the single controller queue
        let msg_tx = self.msg_tx.clone();
        tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                if msg_tx.send(ControllerMsg::Transport(ev)).is_err() {
                    break;
                }
            }
        });

        tracing::info!("Connection opened: {}", self.ident);
        let options = serde_json::to_value(self.transport.options()).unwrap_or(Value::Null);
        self.emit(ServerEvent::ConnectionOpen {
            ident: self.ident.clone(),
            options,
        });
        self.fire_trigger("connection:open");

        self.schedule_steps(self.dialect.open_sequence());
        Ok(())
    }

    /// Close the transport and tear the controller down
    pub fn close(&mut self) {
        if !self.alive {
            return;
        }
        self.ready = false;
        self.alive = false;
        self.workflow.stop();
        let _ = self.transport.close();

        self.emit(ServerEvent::ConnectionClose {
            ident: self.ident.clone(),
        });
        self.fire_trigger("connection:close");
        tracing::info!("Connection closed: {}", self.ident);

        if let Some(cb) = self.deps.on_teardown.clone() {
            cb(&self.ident);
        }
    }

    fn schedule_steps(&mut self, steps: Vec<HandshakeStep>) {
        let mut immediate = Vec::new();
        let mut delayed = Vec::new();
        for step in steps {
            if step.delay_ms == 0 && delayed.is_empty() {
                immediate.push(step.command);
            } else {
                delayed.push(step);
            }
        }
        for cmd in immediate {
            self.write_wire(&cmd, WriteSource::Internal);
        }
        if !delayed.is_empty() {
            let msg_tx = self.msg_tx.clone();
            tokio::spawn(async move {
                for step in delayed {
                    tokio::time::sleep(Duration::from_millis(step.delay_ms)).await;
                    if msg_tx.send(ControllerMsg::Wire(step.command)).is_err() {
                        break;
                    }
                }
            });
        }
    }

    fn schedule_after(&self, delay: Duration, msg: ControllerMsg) {
        let msg_tx = self.msg_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = msg_tx.send(msg);
        });
    }

    /// Attach a subscriber and replay the connection's current state
    pub fn add_subscriber(&mut self, id: String, tx: UnboundedSender<ServerEvent>) {
        let ident = self.ident.clone();

        let _ = tx.send(ServerEvent::ControllerType {
            ident: ident.clone(),
            kind: self.dialect.kind(),
        });
        let options = serde_json::to_value(self.transport.options()).unwrap_or(Value::Null);
        let _ = tx.send(ServerEvent::ConnectionOpen {
            ident: ident.clone(),
            options,
        });
        let _ = tx.send(ServerEvent::ControllerSettings {
            ident: ident.clone(),
            settings: self.dialect.settings_snapshot(),
        });
        let _ = tx.send(ServerEvent::ControllerState {
            ident: ident.clone(),
            state: self.dialect.state_snapshot(),
        });
        let _ = tx.send(ServerEvent::FeederStatus {
            ident: ident.clone(),
            status: self.feeder.status(),
        });
        let _ = tx.send(ServerEvent::SenderStatus {
            ident: ident.clone(),
            status: serde_json::to_value(self.sender.status()).unwrap_or(Value::Null),
        });
        if let Some(name) = self.sender.name() {
            let _ = tx.send(ServerEvent::SenderLoad {
                ident: ident.clone(),
                name: name.to_string(),
                content: self.sender.content().to_string(),
            });
        }
        let _ = tx.send(ServerEvent::WorkflowState {
            ident,
            state: self.workflow.state().as_str().to_string(),
        });

        self.subscribers.insert(id, tx);
    }

    /// Number of attached subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn emit(&mut self, event: ServerEvent) {
        self.subscribers.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    fn fire_trigger(&mut self, event: &str) {
        let lines = self.event_trigger.trigger(event);
        if !lines.is_empty() {
            let context = self.base_context(None);
            self.feeder.feed(&lines, context);
            if self.workflow.state() != WorkflowState::Running {
                self.feeder_next();
            }
        }
    }

    /// Machine context exposed to `[expr]` substitution
    fn base_context(&self, extra: Option<&ExpressionContext>) -> ExpressionContext {
        let mut ctx = ExpressionContext::new();
        let mpos = self.dialect.machine_position();
        let wpos = self.dialect.work_position();
        ctx.set("mposx", CtxValue::Number(mpos.x));
        ctx.set("mposy", CtxValue::Number(mpos.y));
        ctx.set("mposz", CtxValue::Number(mpos.z));
        ctx.set("posx", CtxValue::Number(wpos.x));
        ctx.set("posy", CtxValue::Number(wpos.y));
        ctx.set("posz", CtxValue::Number(wpos.z));
        if let Some(extra) = extra {
            ctx.extend(extra);
        }
        ctx
    }

    // ---- writes ----------------------------------------------------------

    fn write_wire(&mut self, cmd: &WireCommand, source: WriteSource) {
        self.last_write_source = source;
        let result = match cmd {
            WireCommand::Bytes(bytes) => self.transport.write(bytes),
            WireCommand::Line(line) => {
                if source == WriteSource::Internal {
                    // Every internal line elicits one ack we must not echo
                    self.internal_ok_debt = self.internal_ok_debt.saturating_add(1);
                }
                let filtered = self.dialect.write_filter(line);
                self.transport.write(format!("{}\n", filtered).as_bytes())
            }
        };

        if let Err(e) = result {
            tracing::error!("Write failed on {}: {}", self.ident, e);
            if e.is_fatal() {
                self.on_transport_closed(Some(e.to_string()));
            }
        } else if source == WriteSource::Client {
            let data = match cmd {
                WireCommand::Bytes(bytes) => String::from_utf8_lossy(bytes).to_string(),
                WireCommand::Line(line) => line.clone(),
            };
            self.emit(ServerEvent::ConnectionWrite {
                ident: self.ident.clone(),
                data,
                source: source.as_str().to_string(),
            });
        }
    }

    /// Raw client write; `?` / `$G` flag the next report for echo
    pub fn write(&mut self, data: &str) {
        match data.trim() {
            "?" => self.reply_status_report = true,
            "$G" => self.reply_parser_state = true,
            _ => {}
        }
        self.write_wire(&WireCommand::Bytes(data.as_bytes().to_vec()), WriteSource::Client);
    }

    /// Client line write; appends LF unless `data` is a realtime command
    pub fn writeln(&mut self, data: &str) {
        match data.trim() {
            "?" => self.reply_status_report = true,
            "$G" => self.reply_parser_state = true,
            _ => {}
        }
        if self.dialect.is_realtime_command(data) {
            self.write_wire(&WireCommand::Bytes(data.as_bytes().to_vec()), WriteSource::Client);
        } else {
            self.write_wire(&WireCommand::line(data), WriteSource::Client);
        }
    }

    // ---- command dispatch ------------------------------------------------

    /// Dispatch one command
    pub fn handle_command(&mut self, cmd: ControllerCommand) -> Result<()> {
        match cmd {
            ControllerCommand::Gcode { lines, context } => {
                let ctx = self.base_context(context.as_ref());
                self.feeder.feed(&lines, ctx);
                if self.workflow.state() != WorkflowState::Running {
                    self.feeder_next();
                }
                Ok(())
            }
            ControllerCommand::SenderLoad { name, content } => self.sender_load(name, content),
            ControllerCommand::SenderUnload => {
                if self.workflow.stop() {
                    self.emit_workflow_state();
                }
                self.sender.unload();
                self.emit(ServerEvent::SenderUnload {
                    ident: self.ident.clone(),
                });
                self.fire_trigger("sender:unload");
                Ok(())
            }
            ControllerCommand::SenderStart => {
                if !self.sender.is_loaded() {
                    return Err(ValidationError::NoProgramLoaded.into());
                }
                self.fire_trigger("sender:start");
                self.sender.rewind();
                self.feeder.reset();
                if self.workflow.start() {
                    self.emit_workflow_state();
                }
                self.sender_next();
                Ok(())
            }
            ControllerCommand::SenderStop { force } => {
                self.fire_trigger("sender:stop");
                if self.workflow.stop() {
                    self.emit_workflow_state();
                }
                self.sender.rewind();
                self.finish_idle_since = None;
                if force {
                    if let Some(pause) = self.dialect.pause_command() {
                        self.write_wire(&pause, WriteSource::Internal);
                        self.schedule_after(FORCE_STOP_WAIT, ControllerMsg::ForceStopCheck);
                    }
                }
                Ok(())
            }
            ControllerCommand::SenderPause => {
                self.fire_trigger("sender:pause");
                if self.workflow.pause(None) {
                    self.sender.hold(None);
                    self.emit_workflow_state();
                }
                if let Some(pause) = self.dialect.pause_command() {
                    self.write_wire(&pause, WriteSource::Internal);
                }
                Ok(())
            }
            ControllerCommand::SenderResume => {
                self.fire_trigger("sender:resume");
                if let Some(resume) = self.dialect.resume_command() {
                    self.write_wire(&resume, WriteSource::Internal);
                }
                if self.workflow.resume() {
                    self.feeder.reset();
                    self.sender.unhold();
                    self.emit_workflow_state();
                    self.sender_next();
                }
                Ok(())
            }
            ControllerCommand::FeederStart => {
                self.feeder.unhold();
                self.feeder_next();
                Ok(())
            }
            ControllerCommand::FeederStop => {
                self.feeder.reset();
                Ok(())
            }
            ControllerCommand::Feedhold => {
                self.fire_trigger("feedhold");
                if let Some(pause) = self.dialect.pause_command() {
                    self.write_wire(&pause, WriteSource::Internal);
                }
                Ok(())
            }
            ControllerCommand::Cyclestart => {
                self.fire_trigger("cyclestart");
                if let Some(resume) = self.dialect.resume_command() {
                    self.write_wire(&resume, WriteSource::Internal);
                }
                Ok(())
            }
            ControllerCommand::Homing => {
                self.fire_trigger("homing");
                if let Some(cmd) = self.dialect.homing_command() {
                    self.write_wire(&cmd, WriteSource::Internal);
                }
                Ok(())
            }
            ControllerCommand::Sleep => {
                self.fire_trigger("sleep");
                if let Some(cmd) = self.dialect.sleep_command() {
                    self.write_wire(&cmd, WriteSource::Internal);
                }
                Ok(())
            }
            ControllerCommand::Unlock => {
                if let Some(cmd) = self.dialect.unlock_command() {
                    self.write_wire(&cmd, WriteSource::Internal);
                }
                Ok(())
            }
            ControllerCommand::Reset => {
                if self.workflow.stop() {
                    self.emit_workflow_state();
                }
                self.feeder.reset();
                self.sender.rewind();
                let cmd = self.dialect.reset_command();
                self.write_wire(&cmd, WriteSource::Internal);
                Ok(())
            }
            ControllerCommand::OverrideFeed { delta } => {
                self.write_override(OverrideKind::Feed, delta);
                Ok(())
            }
            ControllerCommand::OverrideSpindle { delta } => {
                self.write_override(OverrideKind::Spindle, delta);
                Ok(())
            }
            ControllerCommand::OverrideRapid { delta } => {
                self.write_override(OverrideKind::Rapid, delta);
                Ok(())
            }
            ControllerCommand::Lasertest {
                power,
                duration_ms,
                max_s,
            } => {
                let lines = lasertest_sequence(power, duration_ms, max_s);
                self.handle_command(ControllerCommand::Gcode {
                    lines,
                    context: None,
                })
            }
            ControllerCommand::MacroRun { id } => {
                let config = self.deps.store.get();
                let record = config
                    .find_macro(&id)
                    .ok_or(ValidationError::MacroNotFound { id: id.clone() })?;
                let lines: Vec<String> = record.content.lines().map(String::from).collect();
                self.fire_trigger("macro:run");
                self.handle_command(ControllerCommand::Gcode {
                    lines,
                    context: None,
                })
            }
            ControllerCommand::MacroLoad { id } => {
                let config = self.deps.store.get();
                let record = config
                    .find_macro(&id)
                    .ok_or(ValidationError::MacroNotFound { id: id.clone() })?
                    .clone();
                self.fire_trigger("macro:load");
                self.sender_load(record.name, record.content)
            }
            ControllerCommand::WatchdirLoad { name } => {
                let files = self
                    .deps
                    .files
                    .clone()
                    .ok_or_else(|| Error::other("No watch directory configured"))?;
                let content = files.read_program(&name)?;
                self.sender_load(name, content)
            }
            ControllerCommand::JogCancel => {
                if let Some(cmd) = self.dialect.jog_cancel_command() {
                    self.write_wire(&cmd, WriteSource::Internal);
                }
                Ok(())
            }
        }
    }

    fn sender_load(&mut self, name: String, content: String) -> Result<()> {
        if self.workflow.stop() {
            self.emit_workflow_state();
        }
        let context = self.base_context(None);
        self.sender.load(&name, &content, context);
        self.emit(ServerEvent::SenderLoad {
            ident: self.ident.clone(),
            name,
            content,
        });
        self.emit_sender_status();
        self.fire_trigger("sender:load");
        Ok(())
    }

    fn write_override(&mut self, kind: OverrideKind, delta: i32) {
        let commands = self.dialect.encode_override(kind, delta);
        for cmd in commands {
            self.write_wire(&cmd, WriteSource::Internal);
        }
    }

    // ---- feeder / sender driving ----------------------------------------

    fn feeder_next(&mut self) {
        if let Some(output) = self.feeder.next() {
            if let Some(line) = output.line {
                self.write_wire(&WireCommand::line(line), WriteSource::Feeder);
            }
            if output.hold.is_some() {
                self.emit_feeder_status();
            }
        }
    }

    fn sender_next(&mut self) {
        for ev in self.sender.next() {
            match ev {
                SenderEventOut::Start => {
                    tracing::debug!("Program started on {}", self.ident);
                }
                SenderEventOut::Data { line } => {
                    self.write_wire(&WireCommand::line(line), WriteSource::Sender);
                }
                SenderEventOut::Hold { reason } => {
                    tracing::debug!("Sender hold on {}: {}", self.ident, reason);
                }
                SenderEventOut::PauseRequest { reason } => {
                    if self.workflow.pause(Some(reason.clone())) {
                        self.sender.hold(Some(reason));
                        self.emit_workflow_state();
                    }
                }
            }
        }
    }

    // ---- inbound ---------------------------------------------------------

    /// React to a transport event
    pub fn on_transport_event(&mut self, ev: TransportEvent) {
        match ev {
            TransportEvent::Data(bytes) => {
                for line in self.line_buffer.push(&bytes) {
                    self.on_line(&line);
                }
            }
            TransportEvent::Error(error) => {
                self.emit(ServerEvent::ConnectionError {
                    ident: self.ident.clone(),
                    error,
                });
            }
            TransportEvent::Closed { error } => self.on_transport_closed(error),
        }
    }

    fn on_transport_closed(&mut self, error: Option<String>) {
        if let Some(error) = error {
            tracing::error!("Transport failed on {}: {}", self.ident, error);
            self.emit(ServerEvent::ConnectionError {
                ident: self.ident.clone(),
                error,
            });
        }
        // Mid-stream closure: halt silently, no rewind
        self.close();
    }

    /// React to one parsed firmware line
    pub fn on_line(&mut self, line: &str) {
        let event = self.dialect.parse_line(line);

        for cmd in self.dialect.react(&event) {
            self.write_wire(&cmd, WriteSource::Internal);
        }

        if !self.ready && self.dialect.is_ready_event(&event) {
            self.on_ready();
        }

        match event {
            RunnerEvent::Empty => {}
            RunnerEvent::Ok => self.on_ok(),
            RunnerEvent::Error { message, raw, .. } => self.on_error(&message, &raw),
            RunnerEvent::Alarm { message, raw, .. } => {
                tracing::warn!("Alarm on {}: {} ({})", self.ident, raw, message);
                self.emit(ServerEvent::ConnectionRead {
                    ident: self.ident.clone(),
                    data: format!("{} ({})", raw, message),
                });
            }
            RunnerEvent::Status { raw, .. } => {
                self.query_status.clear();
                if self.reply_status_report {
                    self.reply_status_report = false;
                    self.emit(ServerEvent::ConnectionRead {
                        ident: self.ident.clone(),
                        data: raw,
                    });
                }
            }
            RunnerEvent::ParserState { raw } => {
                self.query_parser.clear();
                if self.reply_parser_state {
                    self.reply_parser_state = false;
                    self.emit(ServerEvent::ConnectionRead {
                        ident: self.ident.clone(),
                        data: raw,
                    });
                }
            }
            RunnerEvent::QueueReport { qr } => {
                self.sender.update_queue_free(qr);
                if self.workflow.state() == WorkflowState::Running {
                    self.sender_next();
                }
            }
            RunnerEvent::RxBuffer { .. } => {}
            RunnerEvent::Setting { .. } => {}
            RunnerEvent::Startup { .. } | RunnerEvent::Firmware { .. } => {
                // TinyG answers in a single envelope; there is no trailing ok
                if self.dialect.kind() == ControllerKind::TinyG {
                    self.internal_ok_debt = self.internal_ok_debt.saturating_sub(1);
                }
            }
            RunnerEvent::Position { raw } => {
                // Echo position replies the operator (or a macro) asked for
                if matches!(
                    self.last_write_source,
                    WriteSource::Client | WriteSource::Feeder
                ) {
                    self.emit(ServerEvent::ConnectionRead {
                        ident: self.ident.clone(),
                        data: raw,
                    });
                }
            }
            RunnerEvent::Temperature { .. } => {}
            RunnerEvent::Echo { raw } | RunnerEvent::Other { raw } => {
                self.emit(ServerEvent::ConnectionRead {
                    ident: self.ident.clone(),
                    data: raw,
                });
            }
        }
    }

    fn on_ready(&mut self) {
        self.ready = true;
        tracing::info!("Controller ready: {}", self.ident);
        self.fire_trigger("controller:ready");

        if !self.initialized {
            self.initialized = true;
            let steps: Vec<HandshakeStep> = self
                .dialect
                .init_commands()
                .into_iter()
                .map(|command| HandshakeStep {
                    delay_ms: self.dialect.init_delay_ms(),
                    command,
                })
                .collect();
            self.schedule_steps(steps);
        }
    }

    fn on_ok(&mut self) {
        match self.workflow.state() {
            WorkflowState::Running => {
                if self.sender.is_hold() && self.sender.received() + 1 >= self.sender.sent() {
                    self.sender.unhold();
                }
                let outcome = self.sender.ack();
                if outcome.finished {
                    // The finish detector issues the actual sender:stop once
                    // the machine has drained its planner
                    self.emit_sender_status();
                }
                self.sender_next();
            }
            WorkflowState::Paused if self.sender.received() < self.sender.sent() => {
                // Drain outstanding acks; the hold prevents new data
                self.sender.ack();
                self.sender_next();
            }
            _ => {
                // Acks elicited by internal queries ($G, $$, M114, M105,
                // TinyG envelopes) are consumed silently
                if self.internal_ok_debt > 0 {
                    self.internal_ok_debt -= 1;
                    self.query_parser.clear();
                    self.query_status.clear();
                } else {
                    self.emit(ServerEvent::ConnectionRead {
                        ident: self.ident.clone(),
                        data: "ok".to_string(),
                    });
                }
                self.feeder_next();
            }
        }
    }

    fn on_error(&mut self, message: &str, raw: &str) {
        if self.workflow.state() == WorkflowState::Running {
            // The rejected line consumed a slot
            self.sender.ack();
            let ignore_errors = self.deps.store.get().controller.ignore_errors;
            if ignore_errors {
                tracing::warn!("Ignoring firmware error on {}: {}", self.ident, raw);
                self.sender_next();
            } else {
                let reason = json!({ "err": raw });
                if self.workflow.pause(Some(reason.clone())) {
                    self.sender.hold(Some(reason));
                    self.emit_workflow_state();
                }
            }
            self.emit(ServerEvent::ConnectionRead {
                ident: self.ident.clone(),
                data: format!("{} ({})", raw, message),
            });
        } else {
            self.emit(ServerEvent::ConnectionRead {
                ident: self.ident.clone(),
                data: raw.to_string(),
            });
            self.feeder_next();
        }
    }

    // ---- periodic work ---------------------------------------------------

    /// Housekeeping run every 250 ms
    pub fn tick(&mut self) {
        self.emit_feeder_status();
        self.emit_sender_status();
        self.publish_snapshots();

        if self.ready && self.transport.is_open() {
            self.query_status();
            self.query_parser_state();
        }

        self.finish_detector();
    }

    fn emit_feeder_status(&mut self) {
        let status = self.feeder.status();
        if self.last_feeder_status.as_ref() != Some(&status) {
            self.last_feeder_status = Some(status.clone());
            self.emit(ServerEvent::FeederStatus {
                ident: self.ident.clone(),
                status,
            });
        }
    }

    fn emit_sender_status(&mut self) {
        let status = serde_json::to_value(self.sender.status()).unwrap_or(Value::Null);
        if self.last_sender_status.as_ref() != Some(&status) {
            self.last_sender_status = Some(status.clone());
            self.emit(ServerEvent::SenderStatus {
                ident: self.ident.clone(),
                status,
            });
        }
    }

    fn emit_workflow_state(&mut self) {
        self.emit(ServerEvent::WorkflowState {
            ident: self.ident.clone(),
            state: self.workflow.state().as_str().to_string(),
        });
    }

    fn publish_snapshots(&mut self) {
        let settings = self.dialect.settings_snapshot();
        if self.last_settings.as_ref() != Some(&settings) {
            self.last_settings = Some(settings.clone());
            self.emit(ServerEvent::ControllerSettings {
                ident: self.ident.clone(),
                settings: settings.clone(),
            });
            self.emit(ServerEvent::FirmwareSettings {
                ident: self.ident.clone(),
                kind: self.dialect.kind(),
                settings,
            });
        }

        let state = self.dialect.state_snapshot();
        if self.last_state.as_ref() != Some(&state) {
            self.last_state = Some(state.clone());
            self.emit(ServerEvent::ControllerState {
                ident: self.ident.clone(),
                state: state.clone(),
            });
            self.emit(ServerEvent::FirmwareState {
                ident: self.ident.clone(),
                kind: self.dialect.kind(),
                state,
            });
        }
    }

    fn query_status(&mut self) {
        let Some(query) = self.dialect.status_query() else {
            return;
        };
        let now = Instant::now();

        if self.query_status.in_flight {
            // A lost report must not wedge the poll loop forever
            if self
                .query_status
                .issued_at
                .is_some_and(|t| now.duration_since(t) > STATUS_QUERY_TOLERANCE)
            {
                self.query_status.clear();
            }
            return;
        }

        self.query_status.in_flight = true;
        self.query_status.issued_at = Some(now);
        self.query_status.last_query = Some(now);
        self.write_wire(&query, WriteSource::Internal);
    }

    fn query_parser_state(&mut self) {
        let Some(query) = self.dialect.parser_state_query() else {
            return;
        };
        if self.workflow.state() != WorkflowState::Idle {
            return;
        }
        let now = Instant::now();

        if self.query_parser.in_flight {
            if self
                .query_parser
                .issued_at
                .is_some_and(|t| now.duration_since(t) > PARSER_QUERY_TOLERANCE)
            {
                self.query_parser.clear();
            }
            return;
        }

        if self
            .query_parser
            .last_query
            .is_some_and(|t| now.duration_since(t) < PARSER_QUERY_INTERVAL)
        {
            return;
        }

        self.query_parser.in_flight = true;
        self.query_parser.issued_at = Some(now);
        self.query_parser.last_query = Some(now);
        self.write_wire(&query, WriteSource::Internal);
    }

    fn finish_detector(&mut self) {
        if self.sender.finish_time() == 0 || self.workflow.state() == WorkflowState::Idle {
            self.finish_idle_since = None;
            return;
        }

        if self.dialect.is_idle() {
            let now = Instant::now();
            match self.finish_idle_since {
                None => self.finish_idle_since = Some(now),
                Some(since) if now.duration_since(since) > FINISH_IDLE_WINDOW => {
                    tracing::info!("Program finished on {}", self.ident);
                    self.finish_idle_since = None;
                    let _ = self.handle_command(ControllerCommand::SenderStop { force: false });
                }
                Some(_) => {}
            }
        } else {
            self.finish_idle_since = None;
        }
    }
}

/// Build the `M3 S<n>` / `G4 P<t>` / `M5` focus-test sequence
fn lasertest_sequence(power: f64, duration_ms: u64, max_s: f64) -> Vec<String> {
    if power <= 0.0 {
        return vec!["M5".to_string()];
    }
    let s = (power.clamp(0.0, 100.0) / 100.0 * max_s.max(0.0)).round() as u64;
    let mut lines = vec![format!("M3 S{}", s)];
    if duration_ms > 0 {
        lines.push(format!("G4 P{}", duration_ms as f64 / 1000.0));
        lines.push("M5".to_string());
    }
    lines
}

/// Cloneable handle to a running controller task
#[derive(Clone)]
pub struct ControllerHandle {
    ident: String,
    kind: ControllerKind,
    tx: UnboundedSender<ControllerMsg>,
}

impl ControllerHandle {
    /// Connection ident
    pub fn ident(&self) -> &str {
        &self.ident
    }

    /// Firmware kind
    pub fn kind(&self) -> ControllerKind {
        self.kind
    }

    fn send(&self, msg: ControllerMsg) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| Error::other("Controller is gone"))
    }

    /// Open the transport
    pub async fn open(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.send(ControllerMsg::Open { done })?;
        wait.await.map_err(|_| Error::other("Controller is gone"))?
    }

    /// Close the connection and stop the controller task
    pub async fn close(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.send(ControllerMsg::Close { done: Some(done) })?;
        wait.await.map_err(|_| Error::other("Controller is gone"))?
    }

    /// Dispatch a command and wait for its result
    pub async fn command(&self, cmd: ControllerCommand) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.send(ControllerMsg::Command {
            cmd,
            done: Some(done),
        })?;
        wait.await.map_err(|_| Error::other("Controller is gone"))?
    }

    /// Raw write
    pub fn write(&self, data: impl Into<String>) -> Result<()> {
        self.send(ControllerMsg::Write { data: data.into() })
    }

    /// Line write
    pub fn writeln(&self, data: impl Into<String>) -> Result<()> {
        self.send(ControllerMsg::Writeln { data: data.into() })
    }

    /// Attach a subscriber
    pub fn add_socket(&self, id: impl Into<String>, tx: UnboundedSender<ServerEvent>) -> Result<()> {
        self.send(ControllerMsg::AddSubscriber { id: id.into(), tx })
    }

    /// Detach a subscriber
    pub fn remove_socket(&self, id: impl Into<String>) -> Result<()> {
        self.send(ControllerMsg::RemoveSubscriber { id: id.into() })
    }
}

/// Spawn a controller task for a firmware kind
pub fn spawn_controller(
    kind: ControllerKind,
    transport: Box<dyn Transport>,
    deps: ControllerDeps,
) -> ControllerHandle {
    let (tx, rx) = unbounded_channel();

    let ident = transport.options().ident();
    match kind {
        ControllerKind::Grbl => {
            let controller = Controller::new(GrblDialect::new(), transport, deps, tx.clone());
            tokio::spawn(controller.run(rx));
        }
        ControllerKind::Smoothie => {
            let controller = Controller::new(SmoothieDialect::new(), transport, deps, tx.clone());
            tokio::spawn(controller.run(rx));
        }
        ControllerKind::TinyG => {
            let controller = Controller::new(TinyGDialect::new(), transport, deps, tx.clone());
            tokio::spawn(controller.run(rx));
        }
        ControllerKind::Marlin => {
            let controller = Controller::new(MarlinDialect::new(), transport, deps, tx.clone());
            tokio::spawn(controller.run(rx));
        }
    }

    ControllerHandle { ident, kind, tx }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lasertest_sequences() {
        assert_eq!(lasertest_sequence(0.0, 1000, 255.0), vec!["M5"]);
        assert_eq!(
            lasertest_sequence(100.0, 1000, 255.0),
            vec!["M3 S255", "G4 P1", "M5"]
        );
        assert_eq!(lasertest_sequence(50.0, 0, 1000.0), vec!["M3 S500"]);
        // Bounded and non-negative
        assert_eq!(
            lasertest_sequence(150.0, 0, 255.0),
            vec!["M3 S255"]
        );
        assert_eq!(lasertest_sequence(-5.0, 0, 255.0), vec!["M5"]);
    }
}
