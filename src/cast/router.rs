//! Dispatches one inbound message to the state machines that own its channel.

use std::time::Instant;

use log::{debug, info, warn};

use crate::cast::codec::CastMessage;
use crate::cast::connection::ConnectionState;
use crate::cast::messages::{
    parse_inbound, AuthReply, ConnectionReply, Heartbeat, Inbound, MediaReply, MediaStatusReport,
    ReceiverReply, ReceiverStatus, RECEIVER_ID,
};
use crate::cast::session::{AppSession, CommandStatus};
use crate::cast::state::CastState;
use crate::error::{CastError, ProtocolError};
use crate::protocol::CastEvent;

/// Side effects of routing one message, applied by the caller after the
/// state lock is released.
#[derive(Debug, Default)]
pub struct RouteOutcome {
    pub outbound: Vec<CastMessage>,
    pub events: Vec<CastEvent>,
    /// Connection or receiver state changed.
    pub wake_state: bool,
    /// A seek completed, was cancelled or can no longer complete.
    pub wake_seek: bool,
}

pub fn route(state: &mut CastState, message: &CastMessage, now: Instant) -> RouteOutcome {
    let mut outcome = RouteOutcome::default();
    let inbound = match parse_inbound(message) {
        Ok(inbound) => inbound,
        Err(ProtocolError::UnknownChannel(namespace)) => {
            debug!("Router: dropping message on unhandled channel {}", namespace);
            return outcome;
        }
        Err(err) => {
            warn!(
                "Router: dropping malformed message from {} on {}: {}",
                message.source_id, message.namespace, err
            );
            return outcome;
        }
    };

    match inbound {
        Inbound::Auth(reply) => route_auth(state, reply, &mut outcome),
        Inbound::Heartbeat(Heartbeat::Ping) => outcome.outbound.push(state.builder().pong()),
        Inbound::Heartbeat(Heartbeat::Pong) => {}
        Inbound::Receiver(reply) => route_receiver(state, reply, now, &mut outcome),
        Inbound::Media(reply) => route_media(state, message, reply, now, &mut outcome),
        Inbound::Connection(ConnectionReply::Close) => {
            warn!(
                "Router: receiver closed the virtual connection from {}",
                message.source_id
            );
            if state.mark_dead(now) {
                outcome.wake_state = true;
                outcome.wake_seek = true;
            }
        }
        Inbound::Connection(ConnectionReply::Connect) => {
            debug!("Router: peer connect from {}", message.source_id);
        }
    }
    outcome
}

fn route_auth(state: &mut CastState, reply: AuthReply, outcome: &mut RouteOutcome) {
    if state.connection_state() != ConnectionState::TlsConnected {
        debug!(
            "Router: ignoring auth reply while {}",
            state.connection_state()
        );
        return;
    }
    match reply {
        AuthReply::Accepted => {
            state.connection.authenticated();
            info!("Router: device authentication accepted");
            outcome.outbound.push(state.builder().connect(RECEIVER_ID));
            outcome.outbound.push(state.builder().receiver_status());
        }
        AuthReply::Rejected { error_type } => {
            let err = CastError::Auth(format!("error type {error_type}"));
            warn!("Router: {}", err);
            outcome.events.push(CastEvent::Failure(err.to_string()));
        }
    }
}

fn route_receiver(
    state: &mut CastState,
    reply: ReceiverReply,
    now: Instant,
    outcome: &mut RouteOutcome,
) {
    match reply {
        ReceiverReply::Status(status) => {
            if let Some(volume) = status.volume {
                if let Some(changed) = state.observe_volume(volume.level, volume.muted) {
                    outcome.events.push(CastEvent::VolumeChanged {
                        level: changed.level,
                        muted: changed.muted,
                    });
                }
            }
            apply_receiver_status(state, &status, now, outcome);
        }
        ReceiverReply::LaunchError { request_id, reason } => {
            let err = CastError::ApplicationLaunch(reason.unwrap_or_else(|| "unknown".to_string()));
            warn!("Router: launch request {}: {}", request_id, err);
            if state.connection_state() != ConnectionState::Authenticated {
                return;
            }
            state.connection.launch_failed();
            if state.launch_exhausted() {
                outcome.events.push(CastEvent::LaunchFailed {
                    reason: err.to_string(),
                });
            } else {
                outcome.events.push(CastEvent::Failure(err.to_string()));
            }
            outcome.outbound.push(state.builder().receiver_status());
        }
        ReceiverReply::Other(message_type) => {
            debug!("Router: unhandled receiver message {}", message_type);
        }
    }
}

fn apply_receiver_status(
    state: &mut CastState,
    status: &ReceiverStatus,
    now: Instant,
    outcome: &mut RouteOutcome,
) {
    let app_id = state.builder().app_id().to_string();
    let listed = status
        .application(&app_id)
        .and_then(|app| app.transport_id.clone().map(|id| (id, app.session_id.clone())));

    if state.connection_state() == ConnectionState::AppStarted {
        let current = state
            .connection
            .app()
            .map(|app| app.transport_id().to_string());
        if listed.as_ref().map(|(id, _)| id) == current.as_ref() {
            return;
        }
        if let Some(lost) = state.connection.app_lost() {
            info!(
                "Router: application on transport {} went away",
                lost.transport_id()
            );
            outcome.outbound.push(state.builder().close(lost.transport_id()));
        }
        state.playback.end_media(now);
        state.set_launch_on_status(false);
        outcome.wake_seek = true;
        outcome.wake_state = true;
    }

    if state.connection_state() != ConnectionState::Authenticated {
        return;
    }
    match listed {
        Some((transport_id, session_id)) => {
            if state
                .connection
                .app_started(AppSession::new(transport_id.clone(), session_id))
            {
                info!("Router: application {} ready on {}", app_id, transport_id);
                outcome.outbound.push(state.builder().connect(&transport_id));
                outcome
                    .outbound
                    .push(state.builder().media_status(&transport_id, None));
                outcome.outbound.extend(state.dispatch_intent());
                outcome.wake_state = true;
            }
        }
        None if state.launch_on_status() => {
            if let Some(launch) = state.try_launch() {
                outcome.outbound.push(launch);
            }
        }
        None => debug!("Router: application absent, waiting for a local intent"),
    }
}

fn route_media(
    state: &mut CastState,
    message: &CastMessage,
    reply: MediaReply,
    now: Instant,
    outcome: &mut RouteOutcome,
) {
    let Some(transport_id) = state
        .connection
        .app()
        .map(|app| app.transport_id().to_string())
    else {
        debug!("Router: media message without a running application");
        return;
    };
    if message.source_id != transport_id && message.source_id != "*" {
        debug!(
            "Router: media message from stale transport {}",
            message.source_id
        );
        return;
    }

    match reply {
        MediaReply::Status(report) => apply_media_status(state, report, now, outcome),
        MediaReply::LoadFailed { request_id } => {
            reject(state, request_id, "media load failed".to_string(), outcome)
        }
        MediaReply::LoadCancelled { request_id } => {
            reject(state, request_id, "media load cancelled".to_string(), outcome)
        }
        MediaReply::InvalidRequest { request_id, reason } => reject(
            state,
            request_id,
            format!(
                "invalid media request: {}",
                reason.as_deref().unwrap_or("unknown")
            ),
            outcome,
        ),
        MediaReply::Other(message_type) => {
            debug!("Router: unhandled media message {}", message_type);
        }
    }
}

fn reject(state: &mut CastState, request_id: u64, reason: String, outcome: &mut RouteOutcome) {
    warn!("Router: request {} rejected: {}", request_id, reason);
    let rejected = state.playback.reject(request_id);
    outcome.events.push(match rejected {
        Some(CommandStatus::LoadSent) => CastEvent::LoadFailed { reason },
        _ => CastEvent::Failure(reason),
    });
    match rejected {
        Some(CommandStatus::SeekSent) => outcome.wake_seek = true,
        Some(_) => {}
        None => return,
    }
    outcome.outbound.extend(state.dispatch_intent());
}

fn apply_media_status(
    state: &mut CastState,
    report: MediaStatusReport,
    now: Instant,
    outcome: &mut RouteOutcome,
) {
    let held = state.connection.app().and_then(AppSession::media_session);
    let Some(entry) = report.entry else {
        if held.is_some() {
            info!("Router: receiver reports no media, dropping media session");
            if let Some(app) = state.connection.app_mut() {
                app.clear_media_session();
            }
            state.playback.end_media(now);
            outcome.wake_seek = true;
            outcome.wake_state = true;
            outcome.outbound.extend(state.dispatch_intent());
        } else if let Some(rejected) = state.playback.reject(report.request_id) {
            debug!("Router: request {} answered without media", report.request_id);
            if rejected == CommandStatus::LoadSent {
                outcome.events.push(CastEvent::LoadFailed {
                    reason: "receiver reported no media".to_string(),
                });
            }
            outcome.outbound.extend(state.dispatch_intent());
        }
        return;
    };

    let status = state
        .playback
        .apply_status(&entry, report.request_id, held, now);
    if status.ignored {
        return;
    }
    if let Some(media_session) = status.adopted_media {
        if let Some(app) = state.connection.app_mut() {
            app.set_media_session(media_session);
        }
    }
    if let Some(receiver_state) = status.state_changed {
        debug!("Router: receiver is now {:?}", receiver_state);
        outcome
            .events
            .push(CastEvent::ReceiverStateChanged(receiver_state));
        outcome.wake_state = true;
    }
    if let Some(target) = status.seek_completed {
        outcome.events.push(CastEvent::SeekCompleted { target });
        outcome.wake_seek = true;
    }
    if let Some(reason) = status.finished {
        info!(
            "Router: playback finished ({})",
            reason.as_deref().unwrap_or("no reason")
        );
        if let Some(app) = state.connection.app_mut() {
            app.clear_media_session();
        }
        outcome.events.push(CastEvent::PlaybackFinished { reason });
        outcome.wake_seek = true;
    }
    if status.command_settled || status.state_changed.is_some() {
        outcome.outbound.extend(state.dispatch_intent());
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use serde_json::Value;

    use super::route;
    use crate::cast::codec::{CastMessage, Payload};
    use crate::cast::connection::ConnectionState;
    use crate::cast::messages::{MediaInfo, Namespace, RECEIVER_ID};
    use crate::cast::session::{CommandStatus, LocalIntent, MediaSessionId, ReceiverPlaybackState};
    use crate::cast::state::CastState;
    use crate::config::CastConfig;
    use crate::protocol::CastEvent;

    fn message(namespace: Namespace, source: &str, payload: &str) -> CastMessage {
        CastMessage {
            namespace: namespace.as_str().to_string(),
            source_id: source.to_string(),
            destination_id: "sender-castctl".to_string(),
            payload: Payload::Text(payload.to_string()),
        }
    }

    fn auth_ok() -> CastMessage {
        CastMessage {
            namespace: Namespace::DeviceAuth.as_str().to_string(),
            source_id: RECEIVER_ID.to_string(),
            destination_id: "sender-castctl".to_string(),
            payload: Payload::Binary(vec![0x12, 0x00]),
        }
    }

    fn receiver_status(apps: &str) -> CastMessage {
        message(
            Namespace::Receiver,
            RECEIVER_ID,
            &format!(r#"{{"type":"RECEIVER_STATUS","requestId":0,"status":{{"applications":[{apps}]}}}}"#),
        )
    }

    fn default_app() -> &'static str {
        r#"{"appId":"CC1AD845","transportId":"T1","sessionId":"S1"}"#
    }

    fn media_status(request_id: u64, state: &str, current_time: f64) -> CastMessage {
        message(
            Namespace::Media,
            "T1",
            &format!(
                r#"{{"type":"MEDIA_STATUS","requestId":{request_id},"status":[{{"mediaSessionId":1,"playerState":"{state}","currentTime":{current_time}}}]}}"#
            ),
        )
    }

    fn kinds(messages: &[CastMessage]) -> Vec<String> {
        messages
            .iter()
            .map(|message| match &message.payload {
                Payload::Text(text) => {
                    let value: Value = serde_json::from_str(text).expect("payload should be json");
                    value["type"].as_str().unwrap_or_default().to_string()
                }
                Payload::Binary(_) => "BINARY".to_string(),
            })
            .collect()
    }

    fn request_id(message: &CastMessage) -> u64 {
        let value: Value = serde_json::from_str(message.payload.as_text().expect("text payload"))
            .expect("payload should be json");
        value["requestId"].as_u64().expect("request id")
    }

    fn tls_state() -> CastState {
        let mut state = CastState::new(&CastConfig::default());
        state.set_media(MediaInfo {
            content_url: "http://10.0.0.2:8000/cast/a".to_string(),
            mime_type: "audio/mpeg".to_string(),
            ..MediaInfo::default()
        });
        state.connection.tls_connected();
        state
    }

    fn started_state() -> CastState {
        let mut state = tls_state();
        let now = Instant::now();
        route(&mut state, &auth_ok(), now);
        route(&mut state, &receiver_status(default_app()), now);
        assert_eq!(state.connection_state(), ConnectionState::AppStarted);
        state
    }

    #[test]
    fn test_auth_success_connects_and_queries_receiver() {
        let mut state = tls_state();
        let outcome = route(&mut state, &auth_ok(), Instant::now());
        assert_eq!(state.connection_state(), ConnectionState::Authenticated);
        assert_eq!(kinds(&outcome.outbound), vec!["CONNECT", "GET_STATUS"]);
        assert!(outcome
            .outbound
            .iter()
            .all(|message| message.destination_id == RECEIVER_ID));
    }

    #[test]
    fn test_auth_error_keeps_connection_without_progress() {
        let mut state = tls_state();
        let mut reply = auth_ok();
        reply.payload = Payload::Binary(vec![0x1a, 0x02, 0x08, 0x02]);
        let outcome = route(&mut state, &reply, Instant::now());
        assert_eq!(state.connection_state(), ConnectionState::TlsConnected);
        assert!(outcome.outbound.is_empty());
        assert!(matches!(outcome.events.as_slice(), [CastEvent::Failure(_)]));
    }

    #[test]
    fn test_missing_app_triggers_single_launch() {
        let mut state = tls_state();
        let now = Instant::now();
        route(&mut state, &auth_ok(), now);
        let outcome = route(&mut state, &receiver_status(""), now);
        assert_eq!(kinds(&outcome.outbound), vec!["LAUNCH"]);
        let outcome = route(&mut state, &receiver_status(""), now);
        assert!(outcome.outbound.is_empty());
    }

    #[test]
    fn test_launch_error_rearms_launch() {
        let mut state = tls_state();
        let now = Instant::now();
        route(&mut state, &auth_ok(), now);
        route(&mut state, &receiver_status(""), now);
        let error = message(
            Namespace::Receiver,
            RECEIVER_ID,
            r#"{"type":"LAUNCH_ERROR","requestId":5,"reason":"NOT_FOUND"}"#,
        );
        let outcome = route(&mut state, &error, now);
        assert_eq!(state.connection_state(), ConnectionState::Authenticated);
        assert_eq!(kinds(&outcome.outbound), vec!["GET_STATUS"]);
        let outcome = route(&mut state, &receiver_status(""), now);
        assert_eq!(kinds(&outcome.outbound), vec!["LAUNCH"]);
    }

    #[test]
    fn test_last_launch_error_is_reported_as_launch_failure() {
        let mut state = tls_state();
        let now = Instant::now();
        route(&mut state, &auth_ok(), now);
        let error = message(
            Namespace::Receiver,
            RECEIVER_ID,
            r#"{"type":"LAUNCH_ERROR","requestId":5,"reason":"NOT_FOUND"}"#,
        );
        let attempts = CastConfig::default().launch_retries;
        let mut events = Vec::new();
        for attempt in 1..=attempts {
            let outcome = route(&mut state, &receiver_status(""), now);
            assert_eq!(kinds(&outcome.outbound), vec!["LAUNCH"]);
            events = route(&mut state, &error, now).events;
            if attempt < attempts {
                assert!(matches!(events.as_slice(), [CastEvent::Failure(_)]));
            }
        }
        assert!(matches!(events.as_slice(), [CastEvent::LaunchFailed { .. }]));
        assert!(route(&mut state, &receiver_status(""), now).outbound.is_empty());
    }

    #[test]
    fn test_listed_app_starts_session_and_loads_pending_intent() {
        let mut state = tls_state();
        let now = Instant::now();
        route(&mut state, &auth_ok(), now);
        state.on_intent(LocalIntent::Prepare);
        let outcome = route(&mut state, &receiver_status(default_app()), now);
        assert_eq!(state.connection_state(), ConnectionState::AppStarted);
        assert_eq!(
            kinds(&outcome.outbound),
            vec!["CONNECT", "GET_STATUS", "LOAD"]
        );
        assert!(outcome.outbound.iter().all(|message| message.destination_id == "T1"));
        assert_eq!(state.playback.status(), CommandStatus::LoadSent);
    }

    #[test]
    fn test_app_disappearing_returns_to_authenticated() {
        let mut state = started_state();
        let outcome = route(&mut state, &receiver_status(""), Instant::now());
        assert_eq!(state.connection_state(), ConnectionState::Authenticated);
        assert_eq!(kinds(&outcome.outbound), vec!["CLOSE"]);
        assert_eq!(outcome.outbound[0].destination_id, "T1");
        assert!(state.connection.app().is_none());
    }

    #[test]
    fn test_load_settles_on_media_status_and_records_session() {
        let mut state = started_state();
        let (_, sent) = state.on_intent(LocalIntent::Play);
        let load_id = request_id(&sent[0]);
        let outcome = route(&mut state, &media_status(load_id, "PLAYING", 0.5), Instant::now());
        assert_eq!(state.playback.status(), CommandStatus::None);
        assert_eq!(
            state.connection.app().and_then(|app| app.media_session()),
            Some(MediaSessionId(1))
        );
        assert_eq!(
            outcome.events,
            vec![CastEvent::ReceiverStateChanged(ReceiverPlaybackState::Playing)]
        );
    }

    #[test]
    fn test_pause_during_load_is_pipelined() {
        let mut state = started_state();
        let (_, sent) = state.on_intent(LocalIntent::Play);
        let load_id = request_id(&sent[0]);
        let (_, sent) = state.on_intent(LocalIntent::Pause);
        assert!(sent.is_empty());

        let outcome = route(&mut state, &media_status(load_id, "PLAYING", 0.5), Instant::now());
        assert_eq!(kinds(&outcome.outbound), vec!["PAUSE"]);
        assert_eq!(state.playback.status(), CommandStatus::PlaybackSent);
    }

    #[test]
    fn test_load_failed_clears_outstanding_command() {
        let mut state = started_state();
        let (_, sent) = state.on_intent(LocalIntent::Prepare);
        let load_id = request_id(&sent[0]);
        let failed = message(
            Namespace::Media,
            "T1",
            &format!(r#"{{"type":"LOAD_FAILED","requestId":{load_id}}}"#),
        );
        let outcome = route(&mut state, &failed, Instant::now());
        assert_eq!(state.playback.status(), CommandStatus::None);
        assert!(outcome.outbound.is_empty());
        assert!(matches!(outcome.events.as_slice(), [CastEvent::LoadFailed { .. }]));
    }

    #[test]
    fn test_buffering_at_zero_changes_nothing() {
        let mut state = started_state();
        let now = Instant::now();
        route(&mut state, &media_status(0, "PLAYING", 8.0), now);
        let outcome = route(&mut state, &media_status(0, "BUFFERING", 0.0), now);
        assert!(outcome.events.is_empty());
        assert_eq!(state.receiver_state(), ReceiverPlaybackState::Playing);
    }

    #[test]
    fn test_idle_with_reason_publishes_finish() {
        let mut state = started_state();
        let now = Instant::now();
        route(&mut state, &media_status(0, "PLAYING", 8.0), now);
        let finished = message(
            Namespace::Media,
            "T1",
            r#"{"type":"MEDIA_STATUS","status":[{"mediaSessionId":1,"playerState":"IDLE","idleReason":"FINISHED","currentTime":0}]}"#,
        );
        let outcome = route(&mut state, &finished, now);
        assert!(outcome.events.contains(&CastEvent::PlaybackFinished {
            reason: Some("FINISHED".to_string())
        }));
        assert!(state
            .connection
            .app()
            .and_then(|app| app.media_session())
            .is_none());
    }

    #[test]
    fn test_seek_completion_wakes_waiters() {
        let mut state = started_state();
        let now = Instant::now();
        route(&mut state, &media_status(0, "PLAYING", 10.0), now);
        let (pending, _) = state
            .begin_seek(now, Duration::from_secs(42), Duration::from_secs(1))
            .expect("seek should be accepted");
        let outcome = route(&mut state, &media_status(0, "PLAYING", 11.2), now);
        assert!(outcome.wake_seek);
        assert_eq!(
            state.playback.clock().completed_generation(),
            pending.generation
        );
        assert!(outcome
            .events
            .contains(&CastEvent::SeekCompleted { target: pending.target }));
    }

    #[test]
    fn test_ping_is_answered_with_pong() {
        let mut state = started_state();
        let ping = message(Namespace::Heartbeat, RECEIVER_ID, r#"{"type":"PING"}"#);
        let outcome = route(&mut state, &ping, Instant::now());
        assert_eq!(kinds(&outcome.outbound), vec!["PONG"]);
    }

    #[test]
    fn test_receiver_close_kills_connection() {
        let mut state = started_state();
        let close = message(Namespace::Connection, RECEIVER_ID, r#"{"type":"CLOSE"}"#);
        let outcome = route(&mut state, &close, Instant::now());
        assert_eq!(state.connection_state(), ConnectionState::ConnectionDead);
        assert!(outcome.wake_state && outcome.wake_seek);
    }

    #[test]
    fn test_malformed_and_unknown_messages_are_dropped() {
        let mut state = started_state();
        let now = Instant::now();
        let broken = message(Namespace::Media, "T1", r#"{"type":"MEDIA_STATUS","status":[{"mediaSessionId":1}]}"#);
        let outcome = route(&mut state, &broken, now);
        assert!(outcome.outbound.is_empty() && outcome.events.is_empty());

        let mut unknown = message(Namespace::Media, "T1", "{}");
        unknown.namespace = "urn:x-cast:com.example.custom".to_string();
        let outcome = route(&mut state, &unknown, now);
        assert!(outcome.outbound.is_empty() && outcome.events.is_empty());
        assert_eq!(state.connection_state(), ConnectionState::AppStarted);
    }

    #[test]
    fn test_volume_report_is_published() {
        let mut state = started_state();
        let status = message(
            Namespace::Receiver,
            RECEIVER_ID,
            &format!(
                r#"{{"type":"RECEIVER_STATUS","status":{{"applications":[{}],"volume":{{"level":0.25,"muted":true}}}}}}"#,
                default_app()
            ),
        );
        let outcome = route(&mut state, &status, Instant::now());
        assert_eq!(
            outcome.events,
            vec![CastEvent::VolumeChanged {
                level: 0.25,
                muted: true
            }]
        );
    }
}
