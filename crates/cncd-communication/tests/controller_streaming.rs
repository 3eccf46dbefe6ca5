//! End-to-end controller scenarios against a mock transport
//!
//! Drives the controller synchronously (no task) so every assertion is
//! deterministic: inject firmware lines with `on_line`, inspect the wire
//! through the mock handle.

use cncd_communication::controller::{
    Controller, ControllerCommand, ControllerDeps, ControllerMsg, GrblDialect, MarlinDialect,
};
use cncd_communication::transport::{MockHandle, MockTransport};
use cncd_communication::workflow::WorkflowState;
use cncd_core::ServerEvent;
use cncd_settings::ConfigStore;
use tokio::sync::mpsc::UnboundedReceiver;

fn make_deps(dir: &tempfile::TempDir) -> ControllerDeps {
    ControllerDeps {
        store: ConfigStore::new(dir.path().join("config.json")),
        spawner: None,
        files: None,
        on_teardown: None,
    }
}

fn grbl_controller(
    dir: &tempfile::TempDir,
) -> (
    Controller<GrblDialect>,
    MockHandle,
    UnboundedReceiver<ControllerMsg>,
) {
    let (transport, handle) = MockTransport::new();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let controller = Controller::new(GrblDialect::new(), Box::new(transport), make_deps(dir), tx);
    (controller, handle, rx)
}

fn marlin_controller(
    dir: &tempfile::TempDir,
) -> (
    Controller<MarlinDialect>,
    MockHandle,
    UnboundedReceiver<ControllerMsg>,
) {
    let (transport, handle) = MockTransport::new();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let controller = Controller::new(
        MarlinDialect::new(),
        Box::new(transport),
        make_deps(dir),
        tx,
    );
    (controller, handle, rx)
}

#[tokio::test(start_paused = true)]
async fn grbl_streaming_happy_path() {
    let dir = tempfile::tempdir().unwrap();
    let (mut controller, mock, _rx) = grbl_controller(&dir);

    controller.open().unwrap();
    controller.on_line("Grbl 1.1h ['$' for help]");
    assert!(controller.is_ready());

    controller
        .handle_command(ControllerCommand::SenderLoad {
            name: "test.nc".into(),
            content: "G0 X1\nG0 X2\n".into(),
        })
        .unwrap();
    controller
        .handle_command(ControllerCommand::SenderStart)
        .unwrap();

    // Everything fits the 128-byte window: both moves plus the dwell the
    // appended %wait produced
    assert_eq!(mock.written(), vec!["G0 X1\n", "G0 X2\n", "G4 P0.5\n"]);
    assert_eq!(controller.workflow_state(), WorkflowState::Running);
    assert_eq!(controller.sender().sent(), 3);

    controller.on_line("ok");
    controller.on_line("ok");
    controller.on_line("ok");
    assert_eq!(controller.sender().received(), 3);
    assert_eq!(controller.sender().sent(), 3);
    assert!(controller.sender().finish_time() > 0);

    // Finish detector: machine idle for > 500 ms after the last ack
    controller.on_line("<Idle|MPos:2.000,0.000,0.000>");
    controller.tick();
    tokio::time::advance(std::time::Duration::from_millis(600)).await;
    controller.tick();

    assert_eq!(controller.workflow_state(), WorkflowState::Idle);
}

#[tokio::test]
async fn grbl_m6_pauses_and_resume_drains() {
    let dir = tempfile::tempdir().unwrap();
    let (mut controller, mock, _rx) = grbl_controller(&dir);

    controller.open().unwrap();
    controller.on_line("Grbl 1.1h ['$' for help]");
    controller
        .handle_command(ControllerCommand::SenderLoad {
            name: "test.nc".into(),
            content: "G0 X1\nM6\nG0 X2\n".into(),
        })
        .unwrap();
    controller
        .handle_command(ControllerCommand::SenderStart)
        .unwrap();

    // The tool change is emitted parenthesized, then the stream pauses
    assert_eq!(mock.written(), vec!["G0 X1\n", "(M6)\n"]);
    assert_eq!(controller.workflow_state(), WorkflowState::Paused);

    mock.clear();
    controller
        .handle_command(ControllerCommand::SenderResume)
        .unwrap();
    assert_eq!(controller.workflow_state(), WorkflowState::Running);
    // Cycle-start goes out as a realtime byte before the stream resumes
    assert_eq!(mock.written()[0], "~");

    // Acks for the two outstanding lines drain the remainder
    controller.on_line("ok");
    controller.on_line("ok");
    let written = mock.written();
    assert!(written.contains(&"G0 X2\n".to_string()));
    assert!(written.contains(&"G4 P0.5\n".to_string()));
}

#[tokio::test]
async fn marlin_readiness_handshake_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let (mut controller, mock, _rx) = marlin_controller(&dir);

    controller.open().unwrap();
    // M115 goes out immediately on open
    assert_eq!(mock.written(), vec!["M115\n"]);
    assert!(!controller.is_ready());

    controller.on_line("FIRMWARE_NAME:Marlin 2.1.2 PROTOCOL_VERSION:1.0 MACHINE_TYPE:Ender-3 EXTRUDER_COUNT:1 UUID:cede2a2f");
    assert!(controller.is_ready());

    // A later `start` banner (firmware restart) re-queries capabilities
    mock.clear();
    controller.on_line("start");
    assert_eq!(mock.written(), vec!["M115\n"]);
    assert!(controller.is_ready());
}

#[tokio::test]
async fn grbl_force_stop_escalates_only_from_hold() {
    let dir = tempfile::tempdir().unwrap();
    let (mut controller, mock, _rx) = grbl_controller(&dir);

    controller.open().unwrap();
    controller.on_line("Grbl 1.1h ['$' for help]");
    controller
        .handle_command(ControllerCommand::SenderLoad {
            name: "test.nc".into(),
            content: "G0 X100\n".into(),
        })
        .unwrap();
    controller
        .handle_command(ControllerCommand::SenderStart)
        .unwrap();
    controller.on_line("<Run|MPos:1.000,0.000,0.000>");

    mock.clear();
    controller
        .handle_command(ControllerCommand::SenderStop { force: true })
        .unwrap();
    assert_eq!(mock.written_bytes()[0], b"!");

    // Still running when the check fires: no reset
    controller.on_line("<Run|MPos:2.000,0.000,0.000>");
    controller.handle_msg(ControllerMsg::ForceStopCheck);
    assert_eq!(mock.written_bytes().len(), 1);

    // Hold engaged: the check escalates to a soft-reset
    controller.on_line("<Hold:0|MPos:2.000,0.000,0.000>");
    controller.handle_msg(ControllerMsg::ForceStopCheck);
    assert_eq!(mock.written_bytes().last().unwrap(), &vec![0x18]);
}

#[tokio::test]
async fn grbl_feed_override_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let (mut controller, mock, _rx) = grbl_controller(&dir);

    controller.open().unwrap();
    controller
        .handle_command(ControllerCommand::OverrideFeed { delta: 10 })
        .unwrap();
    assert_eq!(mock.written_bytes(), vec![vec![0x91]]);

    mock.clear();
    controller
        .handle_command(ControllerCommand::OverrideFeed { delta: 0 })
        .unwrap();
    assert_eq!(mock.written_bytes(), vec![vec![0x90]]);
}

#[tokio::test]
async fn subscriber_replay_order() {
    let dir = tempfile::tempdir().unwrap();
    let (mut controller, _mock, _rx) = grbl_controller(&dir);

    controller.open().unwrap();
    controller
        .handle_command(ControllerCommand::SenderLoad {
            name: "test.nc".into(),
            content: "G0 X1\n".into(),
        })
        .unwrap();

    let (tx, mut events) = tokio::sync::mpsc::unbounded_channel();
    controller.add_subscriber("session-1".into(), tx);

    let mut names = Vec::new();
    while let Ok(ev) = events.try_recv() {
        names.push(ev.name());
    }
    assert_eq!(
        names,
        vec![
            "controller:type",
            "connection:open",
            "controller:settings",
            "controller:state",
            "feeder:status",
            "sender:status",
            "sender:load",
            "workflow:state",
        ]
    );
}

#[tokio::test]
async fn operator_status_request_is_echoed_once() {
    let dir = tempfile::tempdir().unwrap();
    let (mut controller, _mock, _rx) = grbl_controller(&dir);

    controller.open().unwrap();
    controller.on_line("Grbl 1.1h ['$' for help]");

    let (tx, mut events) = tokio::sync::mpsc::unbounded_channel();
    controller.add_subscriber("session-1".into(), tx);
    while events.try_recv().is_ok() {}

    // Unsolicited reports are not echoed
    controller.on_line("<Idle|MPos:0.000,0.000,0.000>");
    assert!(events.try_recv().is_err());

    // A client `?` flags exactly the next report for echo
    controller.write("?");
    controller.on_line("<Idle|MPos:0.000,0.000,0.000>");
    let echoed = loop {
        match events.try_recv() {
            Ok(ServerEvent::ConnectionRead { data, .. }) => break data,
            Ok(_) => continue,
            Err(_) => panic!("status report was not echoed"),
        }
    };
    assert!(echoed.starts_with("<Idle"));

    controller.on_line("<Idle|MPos:0.000,0.000,0.000>");
    assert!(!matches!(
        events.try_recv(),
        Ok(ServerEvent::ConnectionRead { .. })
    ));
}

#[tokio::test]
async fn alarm_is_echoed_with_decoded_message() {
    let dir = tempfile::tempdir().unwrap();
    let (mut controller, _mock, _rx) = grbl_controller(&dir);

    controller.open().unwrap();
    controller.on_line("Grbl 1.1h ['$' for help]");

    let (tx, mut events) = tokio::sync::mpsc::unbounded_channel();
    controller.add_subscriber("session-1".into(), tx);
    while events.try_recv().is_ok() {}

    controller.on_line("ALARM:2");
    let echoed = loop {
        match events.try_recv() {
            Ok(ServerEvent::ConnectionRead { data, .. }) => break data,
            Ok(_) => continue,
            Err(_) => panic!("alarm was not echoed"),
        }
    };
    assert!(echoed.starts_with("ALARM:2"));
    assert!(echoed.contains("Soft limit"));
}

#[tokio::test]
async fn firmware_error_pauses_running_program() {
    let dir = tempfile::tempdir().unwrap();
    let (mut controller, _mock, _rx) = grbl_controller(&dir);

    controller.open().unwrap();
    controller.on_line("Grbl 1.1h ['$' for help]");
    controller
        .handle_command(ControllerCommand::SenderLoad {
            name: "test.nc".into(),
            content: "G0 X1\nG0 X2\n".into(),
        })
        .unwrap();
    controller
        .handle_command(ControllerCommand::SenderStart)
        .unwrap();

    controller.on_line("error:20");
    assert_eq!(controller.workflow_state(), WorkflowState::Paused);
    // The rejected line consumed its slot
    assert_eq!(controller.sender().received(), 1);
}

#[tokio::test]
async fn feeder_error_is_echoed_and_continues() {
    let dir = tempfile::tempdir().unwrap();
    let (mut controller, mock, _rx) = grbl_controller(&dir);

    controller.open().unwrap();
    controller.on_line("Grbl 1.1h ['$' for help]");
    controller
        .handle_command(ControllerCommand::Gcode {
            lines: vec!["G0 Q1".into(), "G0 X1".into()],
            context: None,
        })
        .unwrap();
    assert_eq!(mock.written().last().unwrap(), "G0 Q1\n");

    // The error routes to the feeder path and the queue keeps draining
    controller.on_line("error:20");
    assert_eq!(controller.workflow_state(), WorkflowState::Idle);
    assert_eq!(mock.written().last().unwrap(), "G0 X1\n");
}

#[tokio::test]
async fn sender_stop_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let (mut controller, _mock, _rx) = grbl_controller(&dir);

    controller.open().unwrap();
    controller.on_line("Grbl 1.1h ['$' for help]");
    controller
        .handle_command(ControllerCommand::SenderLoad {
            name: "test.nc".into(),
            content: "G0 X1\n".into(),
        })
        .unwrap();
    controller
        .handle_command(ControllerCommand::SenderStart)
        .unwrap();

    controller
        .handle_command(ControllerCommand::SenderStop { force: false })
        .unwrap();
    let state_after_first = (
        controller.workflow_state(),
        controller.sender().sent(),
        controller.sender().received(),
    );

    controller
        .handle_command(ControllerCommand::SenderStop { force: false })
        .unwrap();
    let state_after_second = (
        controller.workflow_state(),
        controller.sender().sent(),
        controller.sender().received(),
    );

    assert_eq!(state_after_first, state_after_second);
    assert_eq!(state_after_first.0, WorkflowState::Idle);
}

#[tokio::test]
async fn transport_hangup_halts_without_rewind() {
    let dir = tempfile::tempdir().unwrap();
    let (mut controller, mock, _rx) = grbl_controller(&dir);

    controller.open().unwrap();
    controller.on_line("Grbl 1.1h ['$' for help]");
    controller
        .handle_command(ControllerCommand::SenderLoad {
            name: "test.nc".into(),
            content: "G0 X1\nG0 X2\n".into(),
        })
        .unwrap();
    controller
        .handle_command(ControllerCommand::SenderStart)
        .unwrap();
    controller.on_line("ok");

    let sent_before = controller.sender().sent();
    let received_before = controller.sender().received();

    controller.on_transport_event(cncd_communication::transport::TransportEvent::Closed {
        error: Some("device disconnected".into()),
    });

    assert_eq!(controller.workflow_state(), WorkflowState::Idle);
    // Counters are not rewound automatically
    assert_eq!(controller.sender().sent(), sent_before);
    assert_eq!(controller.sender().received(), received_before);
    drop(mock);
}
