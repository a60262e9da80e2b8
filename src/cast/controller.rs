//! Facade used by the local playback engine.
//!
//! [`CastController`] owns the shared state, the two condition variables and
//! the background receive thread. Callers never hold the state lock while
//! events are published or frames are written.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::sync::broadcast;

use crate::cast::codec::{self, CastMessage, FrameDecoder};
use crate::cast::connection::ConnectionState;
use crate::cast::heartbeat::{HeartbeatAction, HeartbeatMonitor};
use crate::cast::messages::MediaInfo;
use crate::cast::router::{self, RouteOutcome};
use crate::cast::session::{LocalIntent, ReceiverPlaybackState};
use crate::cast::state::{CastState, Volume};
use crate::cast::transport::{Received, TlsTransport, Transport};
use crate::config::CastConfig;
use crate::error::{CastError, TransportError};
use crate::protocol::{CastEvent, ReceiverTarget};

const RECEIVE_THREAD_NAME: &str = "castctl-recv";
const EVENT_BUS_CAPACITY: usize = 256;

struct Shared {
    config: CastConfig,
    state: Mutex<CastState>,
    /// Connection or receiver state changed.
    state_changed: Condvar,
    /// A seek completed, was superseded or can no longer complete.
    seek_progress: Condvar,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    events: broadcast::Sender<CastEvent>,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, CastState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transport_slot(&self) -> MutexGuard<'_, Option<Arc<dyn Transport>>> {
        self.transport.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport_slot().clone()
    }

    fn is_dead(&self) -> bool {
        self.lock_state().connection_state().is_dead()
    }

    /// Runs `apply` under the state lock, then wakes waiters, publishes
    /// events and sends frames with the lock released.
    fn update<R>(&self, apply: impl FnOnce(&mut CastState, &mut RouteOutcome) -> R) -> R {
        let mut outcome = RouteOutcome::default();
        let result = {
            let mut state = self.lock_state();
            let before = state.connection_state();
            let result = apply(&mut state, &mut outcome);
            let after = state.connection_state();
            if before != after {
                outcome
                    .events
                    .push(CastEvent::ConnectionStateChanged(after));
                outcome.wake_state = true;
                if after.is_dead() {
                    outcome.wake_seek = true;
                }
            }
            result
        };
        self.publish(outcome);
        result
    }

    fn publish(&self, outcome: RouteOutcome) {
        if outcome.wake_state {
            self.state_changed.notify_all();
        }
        if outcome.wake_seek {
            self.seek_progress.notify_all();
        }
        for event in outcome.events {
            let _ = self.events.send(event);
        }
        if outcome.outbound.is_empty() {
            return;
        }
        if let Err(err) = self.send_messages(&outcome.outbound) {
            self.fail(format!("send to receiver failed: {err}"));
        }
    }

    fn send_messages(&self, messages: &[CastMessage]) -> Result<(), TransportError> {
        let Some(transport) = self.current_transport() else {
            debug!(
                "CastController: no transport, dropping {} outbound message(s)",
                messages.len()
            );
            return Ok(());
        };
        for message in messages {
            let frame = match codec::encode(message) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(
                        "CastController: cannot encode message for {}: {}",
                        message.namespace, err
                    );
                    continue;
                }
            };
            transport.send(&frame)?;
        }
        Ok(())
    }

    /// Declares the connection dead and closes the transport.
    fn fail(&self, reason: String) {
        error!("CastController: {}", reason);
        self.update(|state, outcome| {
            if state.connection_state() != ConnectionState::Disconnected
                && state.mark_dead(Instant::now())
            {
                outcome.events.push(CastEvent::Failure(reason));
            }
        });
        if let Some(transport) = self.current_transport() {
            transport.close();
        }
    }
}

/// Control facade for one receiver connection at a time.
pub struct CastController {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CastController {
    pub fn new(config: CastConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let state = CastState::new(&config);
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(state),
                state_changed: Condvar::new(),
                seek_progress: Condvar::new(),
                transport: Mutex::new(None),
                events,
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CastConfig {
        &self.shared.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CastEvent> {
        self.shared.events.subscribe()
    }

    /// Opens a TLS connection to `target` and starts the handshake.
    ///
    /// Returns once the auth challenge is on the wire; use
    /// [`wait_until_ready`](Self::wait_until_ready) to block until the
    /// receiver application is running.
    pub fn connect(&self, target: ReceiverTarget) -> Result<(), CastError> {
        self.disconnect();
        info!("CastController: connecting to {}", target);
        self.shared
            .update(|state, _| state.reset(Some(target.clone())));
        match TlsTransport::connect(&target, &self.shared.config) {
            Ok(transport) => self.start(Arc::new(transport)),
            Err(err) => {
                warn!("CastController: connection to {} failed: {}", target, err);
                self.shared.update(|state, outcome| {
                    if state.mark_dead(Instant::now()) {
                        outcome.events.push(CastEvent::Failure(err.to_string()));
                    }
                });
                Err(err.into())
            }
        }
    }

    /// Like [`connect`](Self::connect) over an already established transport.
    pub fn connect_with_transport(
        &self,
        target: ReceiverTarget,
        transport: Arc<dyn Transport>,
    ) -> Result<(), CastError> {
        self.disconnect();
        info!("CastController: attaching transport for {}", target);
        self.shared.update(|state, _| state.reset(Some(target)));
        self.start(transport)
    }

    fn start(&self, transport: Arc<dyn Transport>) -> Result<(), CastError> {
        *self.shared.transport_slot() = Some(Arc::clone(&transport));
        let challenge = self.shared.update(|state, _| {
            state.connection.tls_connected();
            state.builder().auth_challenge()
        });
        if let Err(err) = self.shared.send_messages(&[challenge]) {
            self.shared
                .fail(format!("sending auth challenge failed: {err}"));
            return Err(err.into());
        }

        let shared = Arc::clone(&self.shared);
        let worker = thread::Builder::new()
            .name(RECEIVE_THREAD_NAME.to_string())
            .spawn(move || receive_loop(shared, transport));
        match worker {
            Ok(handle) => {
                *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                Ok(())
            }
            Err(err) => {
                let err = TransportError::Worker(err);
                self.shared.fail(err.to_string());
                Err(err.into())
            }
        }
    }

    /// Leaves the receiver politely, stops the receive thread and resets
    /// to `Disconnected`. Blocked callers are woken first.
    pub fn disconnect(&self) {
        let transport = self.shared.current_transport();
        let goodbye = {
            let state = self.shared.lock_state();
            if transport.is_none() && state.connection_state() == ConnectionState::Disconnected {
                return;
            }
            state.goodbye_messages(self.shared.config.stop_app_on_disconnect)
        };
        if transport.is_some() && !goodbye.is_empty() {
            if let Err(err) = self.shared.send_messages(&goodbye) {
                debug!("CastController: goodbye not delivered: {}", err);
            }
        }

        self.shared.update(|state, _| {
            state.mark_dead(Instant::now());
        });
        if let Some(transport) = self.shared.transport_slot().take() {
            transport.close();
        }
        self.join_worker();
        self.shared.update(|state, _| {
            let target = state.target().cloned();
            state.reset(target);
        });
        info!("CastController: disconnected");
    }

    fn join_worker(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!("CastController: receive thread panicked");
        }
    }

    /// Supplies the media the receiver should load.
    pub fn set_media(&self, media: MediaInfo) {
        self.shared.update(|state, _| state.set_media(media));
    }

    /// Records a local playback intent and sends whatever it calls for.
    ///
    /// Returns false when there is no live connection.
    pub fn on_local_state_changed(&self, intent: LocalIntent) -> bool {
        self.shared.update(|state, outcome| {
            let (accepted, outbound) = state.on_intent(intent);
            outcome.outbound.extend(outbound);
            accepted
        })
    }

    /// Asks the receiver to resume at `local_target` and blocks until it
    /// reports having moved there.
    ///
    /// Returns false without media, when the connection dies, or when a
    /// newer seek supersedes this one.
    pub fn seek_to(&self, local_target: Duration) -> bool {
        let offset = self.shared.config.seek_forward_offset();
        let pending = self.shared.update(|state, outcome| {
            match state.begin_seek(Instant::now(), local_target, offset) {
                Ok((pending, message)) => {
                    outcome.outbound.push(message);
                    outcome.wake_seek = true;
                    Some(pending)
                }
                Err(err) => {
                    debug!("CastController: seek to {:?} refused: {}", local_target, err);
                    None
                }
            }
        });
        let Some(pending) = pending else {
            return false;
        };

        let mut state = self.shared.lock_state();
        loop {
            let clock = state.playback.clock();
            if clock.completed_generation() == pending.generation {
                return true;
            }
            if state.connection_state().is_dead() {
                debug!("CastController: seek #{} abandoned, connection dead", pending.generation);
                return false;
            }
            if clock.pending_seek().map(|seek| seek.generation) != Some(pending.generation) {
                debug!("CastController: seek #{} superseded", pending.generation);
                return false;
            }
            state = self
                .shared
                .seek_progress
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Re-anchors local time at `local_target` without a receiver round trip.
    pub fn force_seek(&self, local_target: Duration) {
        self.shared.update(|state, _| {
            state
                .playback
                .clock_mut()
                .force_seek(Instant::now(), local_target)
        });
    }

    /// Local media time derived from the receiver's clock.
    pub fn playback_time(&self) -> Duration {
        self.shared
            .lock_state()
            .playback
            .clock()
            .playback_time(Instant::now())
    }

    /// Fraction of `duration` played, in `0.0..=1.0`.
    pub fn playback_position(&self, duration: Duration) -> f64 {
        if duration.is_zero() {
            return 0.0;
        }
        (self.playback_time().as_secs_f64() / duration.as_secs_f64()).clamp(0.0, 1.0)
    }

    /// Media duration as reported by the receiver.
    pub fn receiver_duration(&self) -> Option<Duration> {
        self.shared.lock_state().playback.duration()
    }

    pub fn set_volume(&self, level: f32) -> bool {
        self.shared.update(|state, outcome| {
            if !receiver_reachable(state.connection_state()) {
                return false;
            }
            outcome.outbound.push(state.builder().set_volume(level));
            true
        })
    }

    pub fn set_mute(&self, muted: bool) -> bool {
        self.shared.update(|state, outcome| {
            if !receiver_reachable(state.connection_state()) {
                return false;
            }
            outcome.outbound.push(state.builder().set_muted(muted));
            true
        })
    }

    pub fn volume(&self) -> Option<Volume> {
        self.shared.lock_state().volume()
    }

    pub fn connection_status(&self) -> ConnectionState {
        self.shared.lock_state().connection_state()
    }

    pub fn receiver_state(&self) -> ReceiverPlaybackState {
        self.shared.lock_state().receiver_state()
    }

    /// Blocks until the application is running or the connection is gone.
    ///
    /// Returns the state observed when waiting stopped, which is the
    /// intermediate state if `timeout` elapsed first.
    pub fn wait_until_ready(&self, timeout: Option<Duration>) -> ConnectionState {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.shared.lock_state();
        loop {
            let current = state.connection_state();
            if matches!(
                current,
                ConnectionState::AppStarted
                    | ConnectionState::ConnectionDead
                    | ConnectionState::Disconnected
            ) {
                return current;
            }
            state = match deadline {
                None => self
                    .shared
                    .state_changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return current;
                    }
                    match self.shared.state_changed.wait_timeout(state, remaining) {
                        Ok((state, _)) => state,
                        Err(poisoned) => poisoned.into_inner().0,
                    }
                }
            };
        }
    }
}

impl Drop for CastController {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn receiver_reachable(state: ConnectionState) -> bool {
    matches!(
        state,
        ConnectionState::Authenticated | ConnectionState::AppStarted
    )
}

fn receive_loop(shared: Arc<Shared>, transport: Arc<dyn Transport>) {
    debug!("CastController: receive loop started");
    let mut monitor = HeartbeatMonitor::new(&shared.config);
    let mut decoder = FrameDecoder::new(shared.config.max_payload_bytes);
    while !shared.is_dead() {
        match transport.receive_with_timeout(monitor.wait_budget()) {
            Ok(Received::Data(bytes)) => {
                monitor.on_traffic();
                decoder.feed(&bytes);
                while let Some(frame) = decoder.next_frame() {
                    match frame {
                        Ok(message) => shared.update(|state, outcome| {
                            *outcome = router::route(state, &message, Instant::now());
                        }),
                        Err(err) => warn!("CastController: dropping frame: {}", err),
                    }
                }
            }
            Ok(Received::TimedOut) => match monitor.on_timeout() {
                HeartbeatAction::SendProbe => {
                    debug!(
                        "CastController: receiver quiet, probing ({} retries left)",
                        monitor.retries_left()
                    );
                    shared.update(|state, outcome| {
                        outcome.outbound.push(state.builder().ping());
                        outcome.outbound.push(state.builder().receiver_status());
                    });
                }
                HeartbeatAction::Dead => {
                    shared.fail(CastError::Liveness.to_string());
                    break;
                }
            },
            Err(TransportError::Closed) if shared.is_dead() => break,
            Err(err) => {
                shared.fail(format!("receive failed: {err}"));
                break;
            }
        }
    }
    transport.close();
    debug!("CastController: receive loop finished");
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::Sender;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use serde_json::Value;
    use tokio::sync::broadcast;

    use super::CastController;
    use crate::cast::codec::{CastMessage, Payload};
    use crate::cast::connection::ConnectionState;
    use crate::cast::messages::{MediaInfo, Namespace, RECEIVER_ID};
    use crate::cast::session::{LocalIntent, ReceiverPlaybackState};
    use crate::cast::transport::memory::{frame, MemoryTransport};
    use crate::config::CastConfig;
    use crate::protocol::{CastEvent, ReceiverTarget};

    const WAIT: Duration = Duration::from_secs(3);

    struct Harness {
        controller: Arc<CastController>,
        transport: Arc<MemoryTransport>,
        receiver: Sender<Vec<u8>>,
        events: broadcast::Receiver<CastEvent>,
    }

    impl Harness {
        fn connect(config: CastConfig) -> Self {
            let controller = Arc::new(CastController::new(config));
            let events = controller.subscribe();
            let (transport, receiver) = MemoryTransport::new();
            let transport = Arc::new(transport);
            let target = ReceiverTarget::from_address("127.0.0.1".parse().expect("ip"), 8009);
            controller
                .connect_with_transport(target, transport.clone())
                .expect("connect should succeed");
            Self {
                controller,
                transport,
                receiver,
                events,
            }
        }

        fn inject(&self, namespace: Namespace, source: &str, payload: &str) {
            let message = CastMessage {
                namespace: namespace.as_str().to_string(),
                source_id: source.to_string(),
                destination_id: "sender-castctl".to_string(),
                payload: Payload::Text(payload.to_string()),
            };
            self.receiver.send(frame(&message)).expect("receive loop alive");
        }

        fn authenticate(&self) {
            let message = CastMessage {
                namespace: Namespace::DeviceAuth.as_str().to_string(),
                source_id: RECEIVER_ID.to_string(),
                destination_id: "sender-castctl".to_string(),
                payload: Payload::Binary(vec![0x12, 0x00]),
            };
            self.receiver.send(frame(&message)).expect("receive loop alive");
            self.wait_for_state(ConnectionState::Authenticated);
        }

        fn start_app(&self) {
            self.authenticate();
            self.inject(
                Namespace::Receiver,
                RECEIVER_ID,
                r#"{"type":"RECEIVER_STATUS","requestId":1,"status":{"applications":[
                    {"appId":"CC1AD845","transportId":"T1","sessionId":"S1"}]}}"#,
            );
            assert_eq!(
                self.controller.wait_until_ready(Some(WAIT)),
                ConnectionState::AppStarted
            );
        }

        fn media_status(&self, request_id: u64, state: &str, seconds: f64) {
            self.inject(
                Namespace::Media,
                "T1",
                &format!(
                    r#"{{"type":"MEDIA_STATUS","requestId":{request_id},"status":[{{"mediaSessionId":1,"playerState":"{state}","currentTime":{seconds}}}]}}"#
                ),
            );
        }

        /// Starts the app, loads media and reports it playing at 10 s.
        fn start_playing(&self) {
            self.start_app();
            self.controller.set_media(MediaInfo {
                content_url: "http://10.0.0.2:8000/cast/a".to_string(),
                mime_type: "audio/mpeg".to_string(),
                ..MediaInfo::default()
            });
            assert!(self.controller.on_local_state_changed(LocalIntent::Play));
            let load = self.wait_sent("LOAD", 1).remove(0);
            self.media_status(request_id(&load), "PLAYING", 10.0);
            let deadline = Instant::now() + WAIT;
            while self.controller.playback_time() < Duration::from_secs(10) {
                assert!(Instant::now() < deadline, "media status not applied");
                thread::sleep(Duration::from_millis(5));
            }
        }

        fn wait_for_state(&self, expected: ConnectionState) {
            let deadline = Instant::now() + WAIT;
            while self.controller.connection_status() != expected {
                assert!(
                    Instant::now() < deadline,
                    "timed out waiting for {expected}, still {}",
                    self.controller.connection_status()
                );
                thread::sleep(Duration::from_millis(5));
            }
        }

        fn wait_sent(&self, kind: &str, count: usize) -> Vec<CastMessage> {
            let sent = self
                .transport
                .wait_for_sent(WAIT, count, |message| message_type(message) == kind);
            assert!(sent.len() >= count, "expected {count} {kind}, got {}", sent.len());
            sent
        }

        fn connection_events(&mut self) -> Vec<ConnectionState> {
            let mut states = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                if let CastEvent::ConnectionStateChanged(state) = event {
                    states.push(state);
                }
            }
            states
        }
    }

    fn json(message: &CastMessage) -> Option<Value> {
        message
            .payload
            .as_text()
            .and_then(|text| serde_json::from_str(text).ok())
    }

    fn message_type(message: &CastMessage) -> String {
        json(message)
            .and_then(|value| value["type"].as_str().map(ToString::to_string))
            .unwrap_or_default()
    }

    fn request_id(message: &CastMessage) -> u64 {
        json(message)
            .and_then(|value| value["requestId"].as_u64())
            .expect("request id")
    }

    fn spawn_seek(controller: &Arc<CastController>, seconds: u64) -> thread::JoinHandle<bool> {
        let controller = Arc::clone(controller);
        thread::spawn(move || controller.seek_to(Duration::from_secs(seconds)))
    }

    fn fast_heartbeat() -> CastConfig {
        CastConfig {
            ping_wait_ms: 150,
            pong_wait_ms: 50,
            pong_retries: 2,
            ..CastConfig::default()
        }
    }

    #[test]
    fn test_connect_reaches_authenticated() {
        let mut harness = Harness::connect(CastConfig::default());
        let challenge = harness.transport.sent().remove(0);
        assert_eq!(challenge.namespace, Namespace::DeviceAuth.as_str());
        assert!(matches!(challenge.payload, Payload::Binary(_)));

        harness.authenticate();
        assert_eq!(
            harness.connection_events(),
            vec![ConnectionState::TlsConnected, ConnectionState::Authenticated]
        );
    }

    #[test]
    fn test_listed_application_starts_and_connects_transport() {
        let harness = Harness::connect(CastConfig::default());
        harness.start_app();
        let connects = harness.wait_sent("CONNECT", 2);
        assert!(connects.iter().any(|message| message.destination_id == "T1"));
    }

    #[test]
    fn test_prepare_sends_exactly_one_load() {
        let harness = Harness::connect(CastConfig::default());
        harness.start_app();
        let status_query = harness
            .transport
            .wait_for_sent(WAIT, 1, |message| {
                message.namespace == Namespace::Media.as_str() && message_type(message) == "GET_STATUS"
            })
            .remove(0);
        harness.controller.set_media(MediaInfo::default());

        assert!(harness.controller.on_local_state_changed(LocalIntent::Prepare));
        assert!(harness.controller.on_local_state_changed(LocalIntent::Prepare));
        let loads = harness.wait_sent("LOAD", 1);
        thread::sleep(Duration::from_millis(50));
        let loads_after: Vec<_> = harness
            .transport
            .sent()
            .into_iter()
            .filter(|message| message_type(message) == "LOAD")
            .collect();
        assert_eq!(loads_after.len(), 1);
        assert!(request_id(&loads[0]) > request_id(&status_query));
    }

    #[test]
    fn test_seek_blocks_until_receiver_reaches_target() {
        let harness = Harness::connect(CastConfig::default());
        harness.start_playing();

        let waiter = spawn_seek(&harness.controller, 5);
        let seek = harness.wait_sent("SEEK", 1).remove(0);
        let target = json(&seek)
            .and_then(|value| value["currentTime"].as_f64())
            .expect("seek time");
        assert!(target > 10.0);

        harness.media_status(0, "PLAYING", 10.2);
        thread::sleep(Duration::from_millis(100));
        assert!(!waiter.is_finished());

        harness.media_status(0, "PLAYING", target + 0.5);
        assert!(waiter.join().expect("seek thread"));
        let played = harness.controller.playback_time();
        assert!(played >= Duration::from_secs(5) && played < Duration::from_secs(6));
    }

    #[test]
    fn test_seek_completes_when_receiver_reports_exact_sent_time() {
        let harness = Harness::connect(CastConfig::default());
        harness.start_playing();
        thread::sleep(Duration::from_millis(3));

        let waiter = spawn_seek(&harness.controller, 5);
        let seek = harness.wait_sent("SEEK", 1).remove(0);
        let target = json(&seek)
            .and_then(|value| value["currentTime"].as_f64())
            .expect("seek time");

        harness.media_status(0, "BUFFERING", target);
        harness.media_status(0, "PLAYING", target);
        let deadline = Instant::now() + WAIT;
        while !waiter.is_finished() {
            assert!(Instant::now() < deadline, "seek to {target} never completed");
            thread::sleep(Duration::from_millis(5));
        }
        assert!(waiter.join().expect("seek thread"));
    }

    #[test]
    fn test_out_of_range_media_time_is_dropped_and_loop_survives() {
        let harness = Harness::connect(CastConfig::default());
        harness.start_playing();
        harness.media_status(0, "PAUSED", 1e20);
        harness.inject(Namespace::Connection, RECEIVER_ID, r#"{"type":"CLOSE"}"#);
        harness.wait_for_state(ConnectionState::ConnectionDead);
        assert_eq!(
            harness.controller.receiver_state(),
            ReceiverPlaybackState::Playing
        );
    }

    #[test]
    fn test_newer_seek_supersedes_older_waiter() {
        let harness = Harness::connect(CastConfig::default());
        harness.start_playing();

        let first = spawn_seek(&harness.controller, 5);
        harness.wait_sent("SEEK", 1);
        let second = spawn_seek(&harness.controller, 30);
        let seeks = harness.wait_sent("SEEK", 2);

        assert!(!first.join().expect("first seek thread"));
        let target = json(&seeks[1])
            .and_then(|value| value["currentTime"].as_f64())
            .expect("seek time");
        harness.media_status(0, "PLAYING", target + 0.5);
        assert!(second.join().expect("second seek thread"));
    }

    #[test]
    fn test_seek_without_media_returns_false() {
        let harness = Harness::connect(CastConfig::default());
        harness.start_app();
        assert!(!harness.controller.seek_to(Duration::from_secs(5)));
    }

    #[test]
    fn test_disconnect_wakes_seek_waiter_and_says_goodbye() {
        let mut harness = Harness::connect(CastConfig::default());
        harness.start_playing();
        let waiter = spawn_seek(&harness.controller, 5);
        harness.wait_sent("SEEK", 1);

        harness.controller.disconnect();
        assert!(!waiter.join().expect("seek thread"));
        assert!(harness.transport.is_closed());
        assert_eq!(
            harness.controller.connection_status(),
            ConnectionState::Disconnected
        );

        let goodbye: Vec<(String, String)> = harness
            .transport
            .sent()
            .iter()
            .filter(|message| matches!(message_type(message).as_str(), "CLOSE" | "STOP"))
            .map(|message| (message.destination_id.clone(), message_type(message)))
            .collect();
        assert_eq!(
            goodbye,
            vec![
                ("T1".to_string(), "CLOSE".to_string()),
                (RECEIVER_ID.to_string(), "STOP".to_string()),
                (RECEIVER_ID.to_string(), "CLOSE".to_string()),
            ]
        );
        let states = harness.connection_events();
        assert_eq!(
            &states[states.len() - 2..],
            &[ConnectionState::ConnectionDead, ConnectionState::Disconnected]
        );
    }

    #[test]
    fn test_silent_receiver_is_probed_then_declared_dead() {
        let harness = Harness::connect(fast_heartbeat());
        harness.authenticate();

        let pings = harness.wait_sent("PING", 1);
        assert_eq!(pings[0].destination_id, RECEIVER_ID);
        assert_eq!(
            harness.controller.wait_until_ready(Some(WAIT)),
            ConnectionState::ConnectionDead
        );
        let probes = harness
            .transport
            .sent()
            .iter()
            .filter(|message| message_type(message) == "PING")
            .count();
        assert_eq!(probes, 2);
        let sent = harness.transport.sent();
        for (index, _) in sent
            .iter()
            .enumerate()
            .filter(|(_, message)| message_type(message) == "PING")
        {
            let query = sent.get(index + 1).expect("status query follows probe");
            assert_eq!(query.namespace, Namespace::Receiver.as_str());
            assert_eq!(query.destination_id, RECEIVER_ID);
            assert_eq!(message_type(query), "GET_STATUS");
        }
        assert!(harness.transport.is_closed());
    }

    #[test]
    fn test_traffic_keeps_connection_alive() {
        let harness = Harness::connect(fast_heartbeat());
        harness.authenticate();
        for _ in 0..6 {
            thread::sleep(Duration::from_millis(60));
            harness.inject(Namespace::Heartbeat, RECEIVER_ID, r#"{"type":"PING"}"#);
        }
        assert_eq!(
            harness.controller.connection_status(),
            ConnectionState::Authenticated
        );
        assert!(!harness.wait_sent("PONG", 6).is_empty());
    }

    #[test]
    fn test_receiver_close_marks_connection_dead() {
        let harness = Harness::connect(CastConfig::default());
        harness.start_app();
        harness.inject(Namespace::Connection, RECEIVER_ID, r#"{"type":"CLOSE"}"#);
        harness.wait_for_state(ConnectionState::ConnectionDead);
        assert!(!harness.controller.on_local_state_changed(LocalIntent::Play));
        assert!(!harness.controller.set_volume(0.5));
    }

    #[test]
    fn test_volume_and_mute_require_receiver_connection() {
        let harness = Harness::connect(CastConfig::default());
        assert!(!harness.controller.set_mute(true));
        harness.authenticate();
        assert!(harness.controller.set_volume(0.3));
        assert!(harness.controller.set_mute(true));
        assert_eq!(harness.wait_sent("SET_VOLUME", 2).len(), 2);
    }

    #[test]
    fn test_wait_until_ready_times_out_in_intermediate_state() {
        let harness = Harness::connect(CastConfig::default());
        assert_eq!(
            harness
                .controller
                .wait_until_ready(Some(Duration::from_millis(50))),
            ConnectionState::TlsConnected
        );
    }

    #[test]
    fn test_playback_position_is_fraction_of_duration() {
        let harness = Harness::connect(CastConfig::default());
        harness.start_playing();
        let position = harness.controller.playback_position(Duration::from_secs(40));
        assert!((0.25..0.3).contains(&position));
        assert_eq!(harness.controller.playback_position(Duration::ZERO), 0.0);
    }
}
