//! Mock transport for controller and integration tests
//!
//! Records every outgoing buffer and lets tests inject inbound bytes as if
//! the firmware had produced them.

use super::{ConnectionOptions, Transport, TransportEvent};
use cncd_core::{Result, TransportError};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;

/// Test handle paired with a [`MockTransport`]
#[derive(Clone, Default)]
pub struct MockHandle {
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    events: Arc<Mutex<Option<UnboundedSender<TransportEvent>>>>,
}

impl MockHandle {
    /// Everything written so far, as lossy UTF-8 strings
    pub fn written(&self) -> Vec<String> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .map(|w| String::from_utf8_lossy(w).to_string())
            .collect()
    }

    /// Everything written so far, raw
    pub fn written_bytes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    /// Forget recorded writes
    pub fn clear(&self) {
        self.writes.lock().unwrap().clear();
    }

    /// Inject inbound bytes from the fake firmware
    pub fn inject(&self, bytes: &[u8]) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.send(TransportEvent::Data(bytes.to_vec()));
        }
    }

    /// Simulate the peer hanging up
    pub fn hang_up(&self, error: Option<&str>) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.send(TransportEvent::Closed {
                error: error.map(String::from),
            });
        }
    }
}

/// In-memory transport that goes nowhere
pub struct MockTransport {
    options: ConnectionOptions,
    handle: MockHandle,
    open: bool,
}

impl MockTransport {
    /// Create a mock transport and its test handle
    pub fn new() -> (Self, MockHandle) {
        let handle = MockHandle::default();
        (
            Self {
                options: ConnectionOptions::Serial {
                    path: "/dev/null".into(),
                    baud: 115200,
                },
                handle: handle.clone(),
                open: false,
            },
            handle,
        )
    }
}

impl Transport for MockTransport {
    fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    fn open(&mut self, events: UnboundedSender<TransportEvent>) -> Result<()> {
        *self.handle.events.lock().unwrap() = Some(events);
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        *self.handle.events.lock().unwrap() = None;
        self.open = false;
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if !self.open {
            return Err(TransportError::NotOpen.into());
        }
        self.handle.writes.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
