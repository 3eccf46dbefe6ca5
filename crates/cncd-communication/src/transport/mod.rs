//! Byte-level transports
//!
//! A [`Transport`] is a duplex byte channel to the firmware: serial/USB or
//! TCP. Writes are synchronous best-effort (backpressure is handled by the
//! streaming protocol, not the OS buffer); reads are delivered as
//! [`TransportEvent`]s on a channel the controller drains. Each variant
//! derives the canonical connection ident clients pass back:
//! `serial:<path>@<baud>` or `tcp:<host>:<port>`.

pub mod mock;
pub mod serial;
pub mod tcp;

pub use mock::{MockHandle, MockTransport};
pub use serial::{list_ports, SerialPortRecord, SerialTransport};
pub use tcp::TcpTransport;

use cncd_core::{ConnectionKind, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

/// Options identifying one firmware link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ConnectionOptions {
    /// Serial/USB link
    Serial {
        /// Device path (`/dev/ttyUSB0`, `COM3`, ...).
        path: String,
        /// Baud rate.
        baud: u32,
    },
    /// TCP link
    Tcp {
        /// Host name or address.
        host: String,
        /// TCP port.
        port: u16,
    },
}

impl ConnectionOptions {
    /// Kind of link
    pub fn kind(&self) -> ConnectionKind {
        match self {
            Self::Serial { .. } => ConnectionKind::Serial,
            Self::Tcp { .. } => ConnectionKind::Tcp,
        }
    }

    /// Canonical ident derived deterministically from the options
    pub fn ident(&self) -> String {
        match self {
            Self::Serial { path, baud } => format!("serial:{}@{}", path, baud),
            Self::Tcp { host, port } => format!("tcp:{}:{}", host, port),
        }
    }
}

/// Events a transport delivers to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Bytes arrived from the firmware
    Data(Vec<u8>),
    /// The link closed (peer hangup or local close)
    Closed {
        /// Failure description when the close was not clean.
        error: Option<String>,
    },
    /// A read error that did not close the link
    Error(String),
}

/// A duplex byte channel to the firmware
pub trait Transport: Send {
    /// Options this transport was built from
    fn options(&self) -> &ConnectionOptions;

    /// Open the link; inbound bytes flow to `events` until close
    fn open(&mut self, events: UnboundedSender<TransportEvent>) -> Result<()>;

    /// Close the link
    fn close(&mut self) -> Result<()>;

    /// Write bytes to the wire
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// The link is open
    fn is_open(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ident_derivation() {
        let serial = ConnectionOptions::Serial {
            path: "/dev/ttyUSB0".into(),
            baud: 115200,
        };
        assert_eq!(serial.ident(), "serial:/dev/ttyUSB0@115200");
        assert_eq!(serial.kind(), ConnectionKind::Serial);

        let tcp = ConnectionOptions::Tcp {
            host: "octopi.local".into(),
            port: 23,
        };
        assert_eq!(tcp.ident(), "tcp:octopi.local:23");
        assert_eq!(tcp.kind(), ConnectionKind::Tcp);
    }
}
