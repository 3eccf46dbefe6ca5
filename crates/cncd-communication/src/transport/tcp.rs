//! TCP transport
//!
//! Connects to firmwares exposed over the network (Smoothieboards on
//! Ethernet, serial-to-TCP bridges). Mirrors the serial transport's
//! reader-thread shape so both variants share one synchronous write seam.

use super::{ConnectionOptions, Transport, TransportEvent};
use cncd_core::{Result, TransportError};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// TCP transport over a `host:port` peer
pub struct TcpTransport {
    options: ConnectionOptions,
    stream: Option<TcpStream>,
    stop: Arc<AtomicBool>,
    reader: Option<std::thread::JoinHandle<()>>,
}

impl TcpTransport {
    /// Create a transport for a host and port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            options: ConnectionOptions::Tcp {
                host: host.into(),
                port,
            },
            stream: None,
            stop: Arc::new(AtomicBool::new(false)),
            reader: None,
        }
    }
}

impl Transport for TcpTransport {
    fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    fn open(&mut self, events: UnboundedSender<TransportEvent>) -> Result<()> {
        let (host, port) = match &self.options {
            ConnectionOptions::Tcp { host, port } => (host.clone(), *port),
            _ => unreachable!("tcp transport built from tcp options"),
        };

        let open_failed = |reason: String| TransportError::OpenFailed {
            ident: self.options.ident(),
            reason,
        };

        let addr = std::net::ToSocketAddrs::to_socket_addrs(&(host.as_str(), port))
            .map_err(|e| open_failed(e.to_string()))?
            .next()
            .ok_or_else(|| open_failed("address did not resolve".into()))?;

        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|e| open_failed(e.to_string()))?;
        stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .map_err(|e| open_failed(e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| open_failed(e.to_string()))?;

        let mut reader_stream = stream
            .try_clone()
            .map_err(|e| open_failed(e.to_string()))?;
        let stop = Arc::new(AtomicBool::new(false));
        let reader_stop = stop.clone();

        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                if reader_stop.load(Ordering::Relaxed) {
                    break;
                }
                match reader_stream.read(&mut buf) {
                    Ok(0) => {
                        let _ = events.send(TransportEvent::Closed { error: None });
                        break;
                    }
                    Ok(n) => {
                        if events.send(TransportEvent::Data(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut
                            || e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        let _ = events.send(TransportEvent::Closed {
                            error: Some(e.to_string()),
                        });
                        break;
                    }
                }
            }
        });

        self.stream = Some(stream);
        self.stop = stop;
        self.reader = Some(handle);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
        stream
            .write_all(bytes)
            .map_err(|e| TransportError::WriteFailed {
                reason: e.to_string(),
            })?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[tokio::test]
    async fn round_trip_against_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut buf = [0u8; 16];
            let n = socket.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"M115\n");
            socket.write_all(b"ok\n").unwrap();
        });

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut transport = TcpTransport::new(addr.ip().to_string(), addr.port());
        transport.open(tx).unwrap();
        transport.write(b"M115\n").unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event, TransportEvent::Data(b"ok\n".to_vec()));

        transport.close().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn connect_failure_is_open_failed() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        // Port 1 on localhost is almost certainly closed
        let mut transport = TcpTransport::new("127.0.0.1", 1);
        assert!(transport.open(tx).is_err());
        assert!(!transport.is_open());
    }
}
