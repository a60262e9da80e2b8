//! Control client for network cast receivers.
//!
//! [`cast::CastController`] drives one receiver over the Cast v2 control
//! channel while keeping a local playback timeline in step with the
//! receiver's reports. [`discovery`] finds receivers on the LAN and
//! [`stream_server`] serves the media bytes they pull.

pub mod cast;
pub mod config;
pub mod discovery;
pub mod error;
pub mod protocol;
pub mod stream_server;
