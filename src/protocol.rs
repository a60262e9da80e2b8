//! Types shared between the control plane and its collaborators.
//!
//! Receivers are described by [`ReceiverTarget`]; everything the controller
//! reports back is published as a [`CastEvent`] on its broadcast bus.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use crate::cast::{ConnectionState, ReceiverPlaybackState};

/// Default TLS control port of cast receivers.
pub const DEFAULT_RECEIVER_PORT: u16 = 8009;

/// What the receiver can render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverCapabilities {
    pub video: bool,
    pub audio: bool,
}

impl Default for ReceiverCapabilities {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }
}

impl ReceiverCapabilities {
    /// Decodes the `ca` bitmask advertised in the receiver's TXT record.
    pub fn from_bitmask(bits: u32) -> Self {
        Self {
            video: bits & 0x01 != 0,
            audio: bits & 0x04 != 0,
        }
    }

    pub fn is_audio_only(self) -> bool {
        self.audio && !self.video
    }
}

/// A resolved receiver. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverTarget {
    /// Stable receiver id when known, otherwise derived from the address.
    pub id: String,
    pub name: String,
    pub model: String,
    /// Host name used for the TLS handshake.
    pub host: String,
    pub address: IpAddr,
    pub port: u16,
    pub capabilities: ReceiverCapabilities,
}

impl ReceiverTarget {
    /// Target for a known address, with unknown name and full capabilities.
    pub fn from_address(address: IpAddr, port: u16) -> Self {
        Self {
            id: format!("{address}:{port}"),
            name: address.to_string(),
            model: String::new(),
            host: address.to_string(),
            address,
            port,
            capabilities: ReceiverCapabilities::default(),
        }
    }
}

impl fmt::Display for ReceiverTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' ({}:{})", self.name, self.address, self.port)
    }
}

/// Notifications published by the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum CastEvent {
    ConnectionStateChanged(ConnectionState),
    ReceiverStateChanged(ReceiverPlaybackState),
    VolumeChanged { level: f32, muted: bool },
    SeekCompleted { target: Duration },
    /// The receiver went idle with a reason (finished, error, cancelled...).
    PlaybackFinished { reason: Option<String> },
    /// The receiver refused the media; the play intent was dropped.
    LoadFailed { reason: String },
    /// The application failed to launch and no attempts remain.
    LaunchFailed { reason: String },
    /// A non-fatal failure, e.g. rejected authentication or launch.
    Failure(String),
}
