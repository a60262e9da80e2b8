//! Encrypted socket to the receiver control port.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::debug;

use crate::config::CastConfig;
use crate::error::TransportError;
use crate::protocol::ReceiverTarget;

/// Longest a single read holds the stream lock, so senders are not starved.
const READ_SLICE: Duration = Duration::from_millis(50);
const WRITE_TIMEOUT: Duration = Duration::from_millis(1500);
const READ_BUFFER_LEN: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Data(Vec<u8>),
    TimedOut,
}

/// Byte transport under the control protocol.
///
/// `close` must be callable from any thread and must unblock a concurrent
/// `receive_with_timeout`.
pub trait Transport: Send + Sync {
    fn send(&self, frame: &[u8]) -> Result<(), TransportError>;
    fn receive_with_timeout(&self, timeout: Duration) -> Result<Received, TransportError>;
    fn close(&self);
}

pub struct TlsTransport {
    stream: Mutex<native_tls::TlsStream<TcpStream>>,
    /// Second handle on the socket used only to shut it down.
    socket: TcpStream,
    closed: AtomicBool,
    peer: SocketAddr,
}

impl TlsTransport {
    pub fn connect(target: &ReceiverTarget, config: &CastConfig) -> Result<Self, TransportError> {
        let peer = SocketAddr::new(target.address, target.port);
        let connect_err = |source| TransportError::Connect {
            address: peer.to_string(),
            source,
        };
        let tcp = TcpStream::connect_timeout(&peer, config.connect_timeout()).map_err(connect_err)?;
        tcp.set_nodelay(true).map_err(connect_err)?;
        tcp.set_read_timeout(Some(config.connect_timeout()))
            .map_err(connect_err)?;
        tcp.set_write_timeout(Some(WRITE_TIMEOUT))
            .map_err(connect_err)?;
        let socket = tcp.try_clone().map_err(connect_err)?;

        let handshake_err = |reason: String| TransportError::Handshake {
            address: peer.to_string(),
            reason,
        };
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .danger_accept_invalid_hostnames(config.accept_invalid_certs)
            .build()
            .map_err(|err| handshake_err(err.to_string()))?;
        let host = if target.host.is_empty() {
            target.address.to_string()
        } else {
            target.host.clone()
        };
        let stream = match connector.connect(&host, tcp) {
            Ok(stream) => stream,
            Err(native_tls::HandshakeError::Failure(err)) => {
                return Err(handshake_err(err.to_string()))
            }
            Err(native_tls::HandshakeError::WouldBlock(_)) => {
                return Err(handshake_err("handshake timed out".to_string()))
            }
        };
        stream
            .get_ref()
            .set_read_timeout(Some(READ_SLICE))
            .map_err(connect_err)?;
        debug!("TlsTransport: connected to {}", peer);

        Ok(Self {
            stream: Mutex::new(stream),
            socket,
            closed: AtomicBool::new(false),
            peer,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Transport for TlsTransport {
    fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut stream = match self.stream.lock() {
            Ok(stream) => stream,
            Err(poisoned) => poisoned.into_inner(),
        };
        stream.write_all(frame).map_err(TransportError::Send)?;
        stream.flush().map_err(TransportError::Send)
    }

    fn receive_with_timeout(&self, timeout: Duration) -> Result<Received, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut buffer = [0u8; READ_BUFFER_LEN];
        loop {
            if self.is_closed() {
                return Err(TransportError::Closed);
            }
            let slice = deadline
                .saturating_duration_since(Instant::now())
                .min(READ_SLICE);
            if slice.is_zero() {
                return Ok(Received::TimedOut);
            }
            let result = {
                let mut stream = match self.stream.lock() {
                    Ok(stream) => stream,
                    Err(poisoned) => poisoned.into_inner(),
                };
                stream
                    .get_ref()
                    .set_read_timeout(Some(slice.max(Duration::from_millis(1))))
                    .map_err(TransportError::Receive)?;
                stream.read(&mut buffer)
            };
            match result {
                Ok(0) => return Err(TransportError::Closed),
                Ok(read) => return Ok(Received::Data(buffer[..read].to_vec())),
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                }
                Err(_) if self.is_closed() => return Err(TransportError::Closed),
                Err(err) => return Err(TransportError::Receive(err)),
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.socket.shutdown(Shutdown::Both) {
            debug!("TlsTransport: shutdown of {} failed: {}", self.peer, err);
        }
    }
}
