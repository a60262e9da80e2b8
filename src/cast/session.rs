//! Command tracking, receiver playback state and clock synchronization.
//!
//! The receiver's media timeline only advances on its own schedule, so the
//! local engine reads time through [`PlaybackClock`], which interpolates
//! between status reports and maps receiver time back onto local media time
//! after a seek.

use std::fmt;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::cast::messages::{wire_precision, MediaStatusEntry};

/// Receiver-assigned handle for one loaded media item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MediaSessionId(pub i64);

impl fmt::Display for MediaSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A launched receiver application and the media item it currently holds.
///
/// The media handle lives inside the application session, so a media session
/// can never exist without a transport id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppSession {
    transport_id: String,
    session_id: Option<String>,
    media: Option<MediaSessionId>,
}

impl AppSession {
    pub fn new(transport_id: impl Into<String>, session_id: Option<String>) -> Self {
        Self {
            transport_id: transport_id.into(),
            session_id,
            media: None,
        }
    }

    pub fn transport_id(&self) -> &str {
        &self.transport_id
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn media_session(&self) -> Option<MediaSessionId> {
        self.media
    }

    pub fn set_media_session(&mut self, media: MediaSessionId) {
        self.media = Some(media);
    }

    pub fn clear_media_session(&mut self) {
        self.media = None;
    }
}

/// Local playback intent pushed by the owning engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalIntent {
    Prepare,
    Play,
    Pause,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandStatus {
    #[default]
    None,
    LoadSent,
    PlaybackSent,
    SeekSent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReceiverPlaybackState {
    #[default]
    Idle,
    Playing,
    Buffering,
    Paused,
}

impl ReceiverPlaybackState {
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "IDLE" => Some(Self::Idle),
            "PLAYING" => Some(Self::Playing),
            "BUFFERING" => Some(Self::Buffering),
            "PAUSED" => Some(Self::Paused),
            _ => None,
        }
    }
}

/// Media command chosen for the current intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Load { autoplay: bool },
    Play,
    Pause,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SeekAnchor {
    local: Duration,
    remote: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingSeek {
    pub generation: u64,
    pub target: Duration,
}

/// Receiver time interpolation plus the local/remote seek mapping.
#[derive(Debug, Clone, Default)]
pub struct PlaybackClock {
    /// Set while the receiver is playing.
    local_epoch: Option<Instant>,
    /// Receiver time at `local_epoch`, or the frozen time when not playing.
    remote_offset: Duration,
    anchor: Option<SeekAnchor>,
    pending_seek: Option<PendingSeek>,
    seek_generation: u64,
    completed_generation: u64,
}

impl PlaybackClock {
    /// Clears timing but keeps seek generations monotonic across resets.
    pub fn reset(&mut self) {
        *self = Self {
            seek_generation: self.seek_generation,
            completed_generation: self.completed_generation,
            ..Self::default()
        };
    }

    pub fn receiver_time(&self, now: Instant) -> Duration {
        let running = self
            .local_epoch
            .map(|epoch| now.saturating_duration_since(epoch))
            .unwrap_or_default();
        self.remote_offset.saturating_add(running)
    }

    /// Receiver time mapped onto the local media timeline.
    pub fn playback_time(&self, now: Instant) -> Duration {
        let remote = self.receiver_time(now);
        match self.anchor {
            Some(anchor) => anchor
                .local
                .saturating_add(remote.saturating_sub(anchor.remote)),
            None => remote,
        }
    }

    pub fn is_running(&self) -> bool {
        self.local_epoch.is_some()
    }

    fn start(&mut self, now: Instant, reported: Duration) {
        self.local_epoch = Some(now);
        self.remote_offset = reported;
    }

    fn freeze(&mut self, now: Instant, reported: Duration) {
        match self.local_epoch.take() {
            Some(epoch) => {
                self.remote_offset = self
                    .remote_offset
                    .saturating_add(now.saturating_duration_since(epoch))
            }
            None => self.remote_offset = reported,
        }
    }

    pub fn pending_seek(&self) -> Option<PendingSeek> {
        self.pending_seek
    }

    pub fn completed_generation(&self) -> u64 {
        self.completed_generation
    }

    /// Registers a seek resuming local playback at `local_target`.
    ///
    /// Any seek still pending is replaced; its waiter observes the new
    /// generation and gives up.
    pub fn begin_seek(
        &mut self,
        now: Instant,
        local_target: Duration,
        forward_offset: Duration,
    ) -> PendingSeek {
        // Held at wire precision; an exact echo of the sent time completes it.
        let target = wire_precision(self.receiver_time(now).saturating_add(forward_offset));
        self.seek_generation += 1;
        let pending = PendingSeek {
            generation: self.seek_generation,
            target,
        };
        self.anchor = Some(SeekAnchor {
            local: local_target,
            remote: target,
        });
        self.pending_seek = Some(pending);
        pending
    }

    /// Re-anchors the local timeline without asking the receiver to move.
    pub fn force_seek(&mut self, now: Instant, local_target: Duration) {
        self.anchor = Some(SeekAnchor {
            local: local_target,
            remote: self.receiver_time(now),
        });
    }

    pub fn cancel_seek(&mut self) -> bool {
        self.pending_seek.take().is_some()
    }

    /// Completes the pending seek once `reported` reaches its target.
    fn observe_report(&mut self, reported: Duration) -> Option<PendingSeek> {
        let pending = self.pending_seek?;
        if reported < pending.target {
            return None;
        }
        self.pending_seek = None;
        self.completed_generation = pending.generation;
        Some(pending)
    }
}

/// What a media status report changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusOutcome {
    pub ignored: bool,
    pub adopted_media: Option<MediaSessionId>,
    pub state_changed: Option<ReceiverPlaybackState>,
    pub seek_completed: Option<Duration>,
    pub finished: Option<Option<String>>,
    pub command_settled: bool,
}

/// Outstanding-command bookkeeping and receiver-driven playback state.
#[derive(Debug, Clone, Default)]
pub struct PlaybackSession {
    status: CommandStatus,
    outstanding_request: Option<u64>,
    requested_pause: Option<bool>,
    intent: Option<LocalIntent>,
    receiver_state: ReceiverPlaybackState,
    clock: PlaybackClock,
    supported_media_commands: u64,
    duration: Option<Duration>,
}

impl PlaybackSession {
    pub fn reset(&mut self) {
        let mut clock = std::mem::take(&mut self.clock);
        clock.reset();
        *self = Self {
            clock,
            ..Self::default()
        };
    }

    pub fn status(&self) -> CommandStatus {
        self.status
    }

    pub fn receiver_state(&self) -> ReceiverPlaybackState {
        self.receiver_state
    }

    pub fn intent(&self) -> Option<LocalIntent> {
        self.intent
    }

    pub fn set_intent(&mut self, intent: LocalIntent) {
        self.intent = Some(intent);
    }

    pub fn clock(&self) -> &PlaybackClock {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut PlaybackClock {
        &mut self.clock
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn supported_media_commands(&self) -> u64 {
        self.supported_media_commands
    }

    pub fn outstanding_request(&self) -> Option<u64> {
        self.outstanding_request
    }

    fn can_issue_playback(&self, pause: bool) -> bool {
        match self.status {
            CommandStatus::None => true,
            CommandStatus::PlaybackSent => self.requested_pause != Some(pause),
            CommandStatus::LoadSent | CommandStatus::SeekSent => false,
        }
    }

    /// Chooses the media command the current intent calls for, if any.
    pub fn next_command(&self, has_media: bool) -> Option<Command> {
        let receiver = self.receiver_state;
        match self.intent? {
            LocalIntent::End => None,
            LocalIntent::Prepare => (!has_media && self.status == CommandStatus::None)
                .then_some(Command::Load { autoplay: true }),
            LocalIntent::Play => {
                if has_media {
                    (receiver == ReceiverPlaybackState::Paused && self.can_issue_playback(false))
                        .then_some(Command::Play)
                } else {
                    (self.status == CommandStatus::None).then_some(Command::Load { autoplay: true })
                }
            }
            LocalIntent::Pause => {
                if has_media {
                    (matches!(
                        receiver,
                        ReceiverPlaybackState::Playing | ReceiverPlaybackState::Buffering
                    ) && self.can_issue_playback(true))
                    .then_some(Command::Pause)
                } else {
                    (self.status == CommandStatus::None)
                        .then_some(Command::Load { autoplay: false })
                }
            }
        }
    }

    pub fn command_sent(&mut self, command: Command, request_id: u64) {
        self.outstanding_request = Some(request_id);
        match command {
            Command::Load { .. } => {
                self.status = CommandStatus::LoadSent;
                self.requested_pause = None;
            }
            Command::Play => {
                self.status = CommandStatus::PlaybackSent;
                self.requested_pause = Some(false);
            }
            Command::Pause => {
                self.status = CommandStatus::PlaybackSent;
                self.requested_pause = Some(true);
            }
        }
    }

    pub fn seek_sent(&mut self, request_id: u64) {
        self.status = CommandStatus::SeekSent;
        self.outstanding_request = Some(request_id);
        self.requested_pause = None;
    }

    fn settle(&mut self) {
        self.status = CommandStatus::None;
        self.outstanding_request = None;
        self.requested_pause = None;
    }

    /// Fails the outstanding command if `request_id` belongs to it.
    ///
    /// Returns the status that was outstanding. A failed LOAD also drops the
    /// intent so it is not retried in a loop.
    pub fn reject(&mut self, request_id: u64) -> Option<CommandStatus> {
        if request_id == 0 || self.outstanding_request != Some(request_id) {
            return None;
        }
        let status = self.status;
        match status {
            CommandStatus::LoadSent => self.intent = None,
            CommandStatus::SeekSent => {
                self.clock.cancel_seek();
            }
            CommandStatus::PlaybackSent | CommandStatus::None => {}
        }
        self.settle();
        Some(status)
    }

    /// Drops everything tied to the media item, e.g. when the app went away.
    pub fn end_media(&mut self, now: Instant) {
        self.clock.freeze(now, Duration::ZERO);
        self.clock.cancel_seek();
        self.receiver_state = ReceiverPlaybackState::Idle;
        self.settle();
    }

    /// Applies the receiver's report for the current media item.
    pub fn apply_status(
        &mut self,
        entry: &MediaStatusEntry,
        request_id: u64,
        held: Option<MediaSessionId>,
        now: Instant,
    ) -> StatusOutcome {
        let mut outcome = StatusOutcome::default();
        if entry.player_state == ReceiverPlaybackState::Buffering && entry.current_time.is_zero() {
            debug!("PlaybackSession: ignoring BUFFERING report at time zero");
            outcome.ignored = true;
            return outcome;
        }

        if held != Some(entry.media_session_id) {
            if let Some(held) = held {
                warn!(
                    "PlaybackSession: media session mismatch (held {}, receiver {}); adopting receiver value",
                    held, entry.media_session_id
                );
            }
            outcome.adopted_media = Some(entry.media_session_id);
        }

        let previous = self.receiver_state;
        if entry.player_state != previous {
            match entry.player_state {
                ReceiverPlaybackState::Playing => self.clock.start(now, entry.current_time),
                _ => self.clock.freeze(now, entry.current_time),
            }
            self.receiver_state = entry.player_state;
            outcome.state_changed = Some(entry.player_state);
        }
        self.supported_media_commands = entry.supported_media_commands;
        if entry.duration.is_some() {
            self.duration = entry.duration;
        }

        if let Some(completed) = self.clock.observe_report(entry.current_time) {
            if self.status == CommandStatus::SeekSent {
                self.settle();
            }
            if self.receiver_state == ReceiverPlaybackState::Playing {
                self.clock.start(now, entry.current_time);
            }
            outcome.seek_completed = Some(completed.target);
        }

        if entry.player_state == ReceiverPlaybackState::Idle && entry.idle_reason.is_some() {
            outcome.finished = Some(entry.idle_reason.clone());
            self.clock.cancel_seek();
            self.intent = None;
            if self.status != CommandStatus::None {
                self.settle();
                outcome.command_settled = true;
            }
        }

        let correlated = request_id != 0 && self.outstanding_request == Some(request_id);
        let settled_by_state = match self.status {
            CommandStatus::LoadSent => true,
            CommandStatus::PlaybackSent => match self.requested_pause {
                Some(true) => self.receiver_state == ReceiverPlaybackState::Paused,
                Some(false) => self.receiver_state == ReceiverPlaybackState::Playing,
                None => false,
            },
            CommandStatus::SeekSent | CommandStatus::None => false,
        };
        if self.status != CommandStatus::SeekSent
            && self.status != CommandStatus::None
            && (correlated || settled_by_state)
        {
            self.settle();
            outcome.command_settled = true;
        }
        outcome
    }
}
