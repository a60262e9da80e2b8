//! Error taxonomy for the cast control plane.
//!
//! Transport failures always end the connection, protocol failures only drop
//! the offending frame, and local-call errors are returned to the caller.

use std::io;

use thiserror::Error;

/// Socket-level failures. Any of these moves the connection to `ConnectionDead`.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("tls handshake with {address} failed: {reason}")]
    Handshake { address: String, reason: String },
    #[error("failed to send frame: {0}")]
    Send(#[source] io::Error),
    #[error("failed to receive: {0}")]
    Receive(#[source] io::Error),
    #[error("transport closed")]
    Closed,
    #[error("failed to start receive thread: {0}")]
    Worker(#[source] io::Error),
}

/// Framing or payload problems. The message is dropped, the stream stays usable.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("declared payload of {declared} bytes exceeds the {max} byte limit")]
    Oversized { declared: usize, max: usize },
    #[error("message of {0} bytes cannot be framed")]
    TooLarge(usize),
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("frame field is not valid utf-8")]
    InvalidUtf8,
    #[error("unknown channel '{0}'")]
    UnknownChannel(String),
    #[error("'{message_type}' on {namespace} is missing required field '{field}'")]
    MissingField {
        namespace: &'static str,
        message_type: String,
        field: &'static str,
    },
    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected payload type on {0}")]
    UnexpectedPayloadType(&'static str),
}

/// Problems loading or writing the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no configuration directory is available on this platform")]
    NoConfigDir,
    #[error("failed to access {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Failures of the local media server the receiver pulls from.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("failed to start stream server: {0}")]
    Bind(#[source] io::Error),
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("bad request: {0}")]
    BadRequest(&'static str),
    #[error("no local address routes to {0}")]
    NoRoute(std::net::IpAddr),
}

impl StreamError {
    pub(crate) fn io(context: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| StreamError::Io { context, source }
    }
}

/// Umbrella error surfaced by the control facade.
#[derive(Debug, Error)]
pub enum CastError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("receiver rejected authentication: {0}")]
    Auth(String),
    #[error("receiver failed to launch the application: {0}")]
    ApplicationLaunch(String),
    #[error("receiver stopped answering heartbeats")]
    Liveness,
    #[error("not connected to a receiver")]
    NotConnected,
    #[error("no media session is active")]
    NoMediaSession,
    #[error("media load is still outstanding")]
    LoadPending,
}

pub type Result<T, E = CastError> = std::result::Result<T, E>;
