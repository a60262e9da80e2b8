//! Cast v2 control plane: framing, channels, state machines and the facade.

pub mod codec;
pub mod connection;
pub mod controller;
pub mod heartbeat;
pub mod messages;
pub mod router;
pub mod session;
pub mod state;
pub mod transport;

pub use connection::ConnectionState;
pub use controller::CastController;
pub use messages::{MediaInfo, StreamType};
pub use session::{CommandStatus, LocalIntent, MediaSessionId, ReceiverPlaybackState};
pub use state::Volume;
pub use transport::{Received, TlsTransport, Transport};
