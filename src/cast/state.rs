//! The single mutable state shared between the facade and the receive loop.

use std::time::{Duration, Instant};

use log::{debug, info};

use crate::cast::codec::CastMessage;
use crate::cast::connection::{ConnectionMachine, ConnectionState};
use crate::cast::messages::{MediaInfo, MessageBuilder, RECEIVER_ID};
use crate::cast::session::{
    Command, CommandStatus, LocalIntent, PendingSeek, PlaybackSession, ReceiverPlaybackState,
};
use crate::config::CastConfig;
use crate::error::CastError;
use crate::protocol::ReceiverTarget;

/// Receiver volume as last reported or requested.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Volume {
    pub level: f32,
    pub muted: bool,
}

impl Default for Volume {
    fn default() -> Self {
        Self {
            level: 1.0,
            muted: false,
        }
    }
}

/// Everything the control plane mutates, guarded by one mutex in the facade.
#[derive(Debug, Clone)]
pub struct CastState {
    pub(crate) connection: ConnectionMachine,
    pub(crate) playback: PlaybackSession,
    builder: MessageBuilder,
    media: Option<MediaInfo>,
    target: Option<ReceiverTarget>,
    volume: Option<Volume>,
    launch_retries: u8,
    /// Cleared after an app loss; the next prepare/play intent relaunches.
    launch_on_status: bool,
}

impl CastState {
    pub fn new(config: &CastConfig) -> Self {
        Self {
            connection: ConnectionMachine::default(),
            playback: PlaybackSession::default(),
            builder: MessageBuilder::new(config.sender_id.clone(), config.app_id.clone()),
            media: None,
            target: None,
            volume: None,
            launch_retries: config.launch_retries,
            launch_on_status: true,
        }
    }

    /// Rebuilds connection and playback state for `target`.
    ///
    /// The media description and seek generations survive.
    pub fn reset(&mut self, target: Option<ReceiverTarget>) {
        self.connection.reset();
        self.playback.reset();
        self.target = target;
        self.volume = None;
        self.launch_on_status = true;
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn receiver_state(&self) -> ReceiverPlaybackState {
        self.playback.receiver_state()
    }

    pub fn builder(&self) -> &MessageBuilder {
        &self.builder
    }

    pub fn target(&self) -> Option<&ReceiverTarget> {
        self.target.as_ref()
    }

    pub fn media(&self) -> Option<&MediaInfo> {
        self.media.as_ref()
    }

    pub fn set_media(&mut self, media: MediaInfo) {
        self.media = Some(media);
    }

    pub fn volume(&self) -> Option<Volume> {
        self.volume
    }

    /// Stores a receiver-reported volume, returning it when it changed.
    pub(crate) fn observe_volume(&mut self, level: Option<f32>, muted: Option<bool>) -> Option<Volume> {
        let current = self.volume.unwrap_or_default();
        let next = Volume {
            level: level.unwrap_or(current.level),
            muted: muted.unwrap_or(current.muted),
        };
        if self.volume == Some(next) {
            return None;
        }
        self.volume = Some(next);
        Some(next)
    }

    pub(crate) fn launch_on_status(&self) -> bool {
        self.launch_on_status
    }

    pub(crate) fn set_launch_on_status(&mut self, enabled: bool) {
        self.launch_on_status = enabled;
    }

    /// LAUNCH request if the launch budget allows one now.
    pub(crate) fn try_launch(&mut self) -> Option<CastMessage> {
        if !self.connection.should_launch(self.launch_retries) {
            return None;
        }
        info!(
            "CastState: launching receiver application {}",
            self.builder.app_id()
        );
        self.connection.launch_sent();
        Some(self.builder.launch())
    }

    /// No launch is in flight and none may be sent for this authentication.
    pub(crate) fn launch_exhausted(&self) -> bool {
        self.connection.launch_exhausted(self.launch_retries)
    }

    /// Translates the current intent into at most one outbound request.
    pub fn dispatch_intent(&mut self) -> Option<CastMessage> {
        match self.connection.state() {
            ConnectionState::Authenticated => {
                if matches!(
                    self.playback.intent(),
                    Some(LocalIntent::Prepare) | Some(LocalIntent::Play)
                ) {
                    self.launch_on_status = true;
                    return self.try_launch();
                }
                None
            }
            ConnectionState::AppStarted => self.dispatch_media_command(),
            _ => None,
        }
    }

    fn dispatch_media_command(&mut self) -> Option<CastMessage> {
        let app = self.connection.app()?;
        let transport_id = app.transport_id().to_string();
        let media_session = app
            .media_session()
            .filter(|_| self.playback.receiver_state() != ReceiverPlaybackState::Idle);
        let command = self.playback.next_command(media_session.is_some())?;
        let (message, request_id) = match (command, media_session) {
            (Command::Load { autoplay }, _) => {
                let Some(media) = self.media.as_ref() else {
                    debug!("CastState: no media description set, LOAD deferred");
                    return None;
                };
                self.builder.load(&transport_id, media, autoplay)
            }
            (Command::Play, Some(media_session)) => self.builder.play(&transport_id, media_session),
            (Command::Pause, Some(media_session)) => {
                self.builder.pause(&transport_id, media_session)
            }
            (Command::Play | Command::Pause, None) => return None,
        };
        debug!("CastState: sending {:?} (request {})", command, request_id);
        self.playback.command_sent(command, request_id);
        Some(message)
    }

    /// Records a local intent. Returns false when there is no live connection.
    pub fn on_intent(&mut self, intent: LocalIntent) -> (bool, Vec<CastMessage>) {
        let state = self.connection.state();
        if matches!(
            state,
            ConnectionState::Disconnected | ConnectionState::ConnectionDead
        ) {
            debug!("CastState: ignoring {:?} while {}", intent, state);
            return (false, Vec::new());
        }
        self.playback.set_intent(intent);
        (true, self.dispatch_intent().into_iter().collect())
    }

    /// Registers a seek and builds its SEEK request.
    pub fn begin_seek(
        &mut self,
        now: Instant,
        local_target: Duration,
        forward_offset: Duration,
    ) -> Result<(PendingSeek, CastMessage), CastError> {
        if self.connection.state().is_dead() {
            return Err(CastError::NotConnected);
        }
        let Some((transport_id, media_session)) = self.connection.app().and_then(|app| {
            app.media_session()
                .map(|media| (app.transport_id().to_string(), media))
        }) else {
            return Err(CastError::NoMediaSession);
        };
        if self.playback.status() == CommandStatus::LoadSent {
            return Err(CastError::LoadPending);
        }
        let pending = self
            .playback
            .clock_mut()
            .begin_seek(now, local_target, forward_offset);
        let (message, request_id) = self
            .builder
            .seek(&transport_id, media_session, pending.target);
        self.playback.seek_sent(request_id);
        debug!(
            "CastState: seek #{} to local {:?} (receiver {:?})",
            pending.generation, local_target, pending.target
        );
        Ok((pending, message))
    }

    /// Farewell messages for an orderly disconnect.
    pub fn goodbye_messages(&self, stop_app: bool) -> Vec<CastMessage> {
        let mut messages = Vec::new();
        if let Some(app) = self.connection.app() {
            messages.push(self.builder.close(app.transport_id()));
            if stop_app {
                if let Some(session_id) = app.session_id() {
                    messages.push(self.builder.stop_app(session_id));
                }
            }
        }
        if matches!(
            self.connection.state(),
            ConnectionState::Authenticated | ConnectionState::AppStarted
        ) {
            messages.push(self.builder.close(RECEIVER_ID));
        }
        messages
    }

    /// Moves to `ConnectionDead` and abandons everything in flight.
    pub fn mark_dead(&mut self, now: Instant) -> bool {
        if !self.connection.dead() {
            return false;
        }
        self.playback.end_media(now);
        true
    }
}
