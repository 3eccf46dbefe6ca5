//! Serial port transport
//!
//! Low-level serial port operations for direct hardware connection to CNC
//! controllers via USB or RS-232. A background reader thread pushes inbound
//! bytes onto the owner's event channel; writes go straight to the port.

use super::{ConnectionOptions, Transport, TransportEvent};
use cncd_core::{Error, Result, TransportError};
use std::io::Read;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// Information about an available serial port
#[derive(Debug, Clone, serde::Serialize)]
pub struct SerialPortRecord {
    /// Port name (e.g. `/dev/ttyUSB0`, `COM3`)
    pub path: String,
    /// Manufacturer name if available
    pub manufacturer: Option<String>,
}

/// List available serial ports on the system
///
/// Filters ports to the patterns CNC controllers enumerate as:
/// - Windows: `COM*`
/// - Linux: `/dev/ttyUSB*`, `/dev/ttyACM*`
/// - macOS: `/dev/cu.usbserial-*`, `/dev/cu.usbmodem*`
pub fn list_ports() -> Result<Vec<SerialPortRecord>> {
    match serialport::available_ports() {
        Ok(ports) => Ok(ports
            .iter()
            .filter(|port| is_cnc_port(&port.port_name))
            .map(|port| SerialPortRecord {
                path: port.port_name.clone(),
                manufacturer: match &port.port_type {
                    serialport::SerialPortType::UsbPort(usb) => usb.manufacturer.clone(),
                    _ => None,
                },
            })
            .collect()),
        Err(e) => {
            tracing::error!("Failed to enumerate serial ports: {}", e);
            Err(Error::other(format!("Failed to enumerate ports: {}", e)))
        }
    }
}

fn is_cnc_port(port_name: &str) -> bool {
    if port_name.starts_with("COM") && port_name[3..].chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    if port_name.starts_with("/dev/ttyUSB") || port_name.starts_with("/dev/ttyACM") {
        return true;
    }
    if port_name.starts_with("/dev/cu.usbserial-") || port_name.starts_with("/dev/cu.usbmodem") {
        return true;
    }
    false
}

type SharedPort = Arc<Mutex<Box<dyn serialport::SerialPort>>>;

/// Serial transport backed by the `serialport` crate
pub struct SerialTransport {
    options: ConnectionOptions,
    port: Option<SharedPort>,
    stop: Arc<AtomicBool>,
    reader: Option<std::thread::JoinHandle<()>>,
}

impl SerialTransport {
    /// Create a transport for a device path and baud rate
    pub fn new(path: impl Into<String>, baud: u32) -> Self {
        Self {
            options: ConnectionOptions::Serial {
                path: path.into(),
                baud,
            },
            port: None,
            stop: Arc::new(AtomicBool::new(false)),
            reader: None,
        }
    }
}

impl Transport for SerialTransport {
    fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    fn open(&mut self, events: UnboundedSender<TransportEvent>) -> Result<()> {
        let (path, baud) = match &self.options {
            ConnectionOptions::Serial { path, baud } => (path.clone(), *baud),
            _ => unreachable!("serial transport built from serial options"),
        };

        let port = serialport::new(&path, baud)
            // Short timeout so the reader thread can notice the stop flag
            .timeout(Duration::from_millis(50))
            .open()
            .map_err(|e| TransportError::OpenFailed {
                ident: self.options.ident(),
                reason: e.to_string(),
            })?;

        let port: SharedPort = Arc::new(Mutex::new(port));
        let reader_port = port.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let reader_stop = stop.clone();

        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 512];
            loop {
                if reader_stop.load(Ordering::Relaxed) {
                    break;
                }
                let read = {
                    let mut port = match reader_port.lock() {
                        Ok(p) => p,
                        Err(_) => break,
                    };
                    port.read(&mut buf)
                };
                match read {
                    Ok(0) => {}
                    Ok(n) => {
                        if events.send(TransportEvent::Data(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        let _ = events.send(TransportEvent::Closed {
                            error: Some(e.to_string()),
                        });
                        break;
                    }
                }
            }
        });

        self.port = Some(port);
        self.stop = stop;
        self.reader = Some(handle);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        self.port = None;
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let port = self.port.as_ref().ok_or(TransportError::NotOpen)?;
        let mut port = port
            .lock()
            .map_err(|_| TransportError::WriteFailed {
                reason: "port lock poisoned".into(),
            })?;
        port.write_all(bytes).map_err(|e| TransportError::WriteFailed {
            reason: e.to_string(),
        })?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cnc_port_patterns() {
        assert!(is_cnc_port("/dev/ttyUSB0"));
        assert!(is_cnc_port("/dev/ttyACM1"));
        assert!(is_cnc_port("COM3"));
        assert!(is_cnc_port("/dev/cu.usbmodem14101"));
        assert!(!is_cnc_port("/dev/ttyS0"));
        assert!(!is_cnc_port("COMX"));
    }

    #[test]
    fn write_before_open_fails() {
        let mut transport = SerialTransport::new("/dev/ttyUSB99", 115200);
        assert!(transport.write(b"?").is_err());
        assert!(!transport.is_open());
    }
}
