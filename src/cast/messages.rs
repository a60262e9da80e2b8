//! Outbound request builders and typed parsing of inbound channel payloads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::cast::codec::{self, CastMessage, Payload};
use crate::cast::session::{MediaSessionId, ReceiverPlaybackState};
use crate::error::ProtocolError;

/// Platform endpoint every sender talks to before an app is running.
pub const RECEIVER_ID: &str = "receiver-0";

/// Logical sub-protocols multiplexed over one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    DeviceAuth,
    Heartbeat,
    Receiver,
    Media,
    Connection,
}

impl Namespace {
    pub const ALL: [Namespace; 5] = [
        Namespace::DeviceAuth,
        Namespace::Heartbeat,
        Namespace::Receiver,
        Namespace::Media,
        Namespace::Connection,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::DeviceAuth => "urn:x-cast:com.google.cast.tp.deviceauth",
            Namespace::Heartbeat => "urn:x-cast:com.google.cast.tp.heartbeat",
            Namespace::Receiver => "urn:x-cast:com.google.cast.receiver",
            Namespace::Media => "urn:x-cast:com.google.cast.media",
            Namespace::Connection => "urn:x-cast:com.google.cast.tp.connection",
        }
    }

    pub fn from_urn(urn: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|namespace| namespace.as_str() == urn)
    }

    fn index(self) -> usize {
        self as usize
    }
}

static REQUEST_COUNTERS: [AtomicU64; 5] = [
    AtomicU64::new(1),
    AtomicU64::new(1),
    AtomicU64::new(1),
    AtomicU64::new(1),
    AtomicU64::new(1),
];

/// Allocates the next correlation id for `namespace`.
///
/// Counters are process-wide so ids are never reused across reconnects.
pub fn next_request_id(namespace: Namespace) -> u64 {
    REQUEST_COUNTERS[namespace.index()].fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamType {
    #[default]
    Buffered,
    Live,
}

impl StreamType {
    fn as_str(self) -> &'static str {
        match self {
            StreamType::Buffered => "BUFFERED",
            StreamType::Live => "LIVE",
        }
    }
}

/// What the receiver should pull, as supplied by the serving collaborator.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MediaInfo {
    /// URL the receiver fetches; sent as `contentId`.
    pub content_url: String,
    pub mime_type: String,
    pub title: Option<String>,
    pub artwork_url: Option<String>,
    pub stream_type: StreamType,
}

/// Builds outbound requests stamped with this client's sender id.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    sender_id: String,
    app_id: String,
}

impl MessageBuilder {
    pub fn new(sender_id: impl Into<String>, app_id: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            app_id: app_id.into(),
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    fn text(&self, namespace: Namespace, destination_id: &str, payload: Value) -> CastMessage {
        CastMessage {
            namespace: namespace.as_str().to_string(),
            source_id: self.sender_id.clone(),
            destination_id: destination_id.to_string(),
            payload: Payload::Text(payload.to_string()),
        }
    }

    /// Empty `DeviceAuthMessage { challenge: {} }`.
    pub fn auth_challenge(&self) -> CastMessage {
        let mut challenge = Vec::new();
        codec::write_bytes_field(&mut challenge, AUTH_FIELD_CHALLENGE, &[]);
        CastMessage {
            namespace: Namespace::DeviceAuth.as_str().to_string(),
            source_id: self.sender_id.clone(),
            destination_id: RECEIVER_ID.to_string(),
            payload: Payload::Binary(challenge),
        }
    }

    pub fn connect(&self, destination_id: &str) -> CastMessage {
        self.text(
            Namespace::Connection,
            destination_id,
            json!({"type":"CONNECT","origin":{}}),
        )
    }

    pub fn close(&self, destination_id: &str) -> CastMessage {
        self.text(Namespace::Connection, destination_id, json!({"type":"CLOSE"}))
    }

    pub fn ping(&self) -> CastMessage {
        self.text(Namespace::Heartbeat, RECEIVER_ID, json!({"type":"PING"}))
    }

    pub fn pong(&self) -> CastMessage {
        self.text(Namespace::Heartbeat, RECEIVER_ID, json!({"type":"PONG"}))
    }

    pub fn receiver_status(&self) -> CastMessage {
        let request_id = next_request_id(Namespace::Receiver);
        self.text(
            Namespace::Receiver,
            RECEIVER_ID,
            json!({"type":"GET_STATUS","requestId":request_id}),
        )
    }

    pub fn launch(&self) -> CastMessage {
        let request_id = next_request_id(Namespace::Receiver);
        self.text(
            Namespace::Receiver,
            RECEIVER_ID,
            json!({"type":"LAUNCH","appId":self.app_id,"requestId":request_id}),
        )
    }

    pub fn stop_app(&self, session_id: &str) -> CastMessage {
        let request_id = next_request_id(Namespace::Receiver);
        self.text(
            Namespace::Receiver,
            RECEIVER_ID,
            json!({"type":"STOP","requestId":request_id,"sessionId":session_id}),
        )
    }

    pub fn set_volume(&self, level: f32) -> CastMessage {
        let request_id = next_request_id(Namespace::Receiver);
        self.text(
            Namespace::Receiver,
            RECEIVER_ID,
            json!({
                "type":"SET_VOLUME",
                "requestId":request_id,
                "volume":{"level":level.clamp(0.0, 1.0)}
            }),
        )
    }

    pub fn set_muted(&self, muted: bool) -> CastMessage {
        let request_id = next_request_id(Namespace::Receiver);
        self.text(
            Namespace::Receiver,
            RECEIVER_ID,
            json!({
                "type":"SET_VOLUME",
                "requestId":request_id,
                "volume":{"muted":muted}
            }),
        )
    }

    /// Returns the request together with its correlation id.
    pub fn load(&self, transport_id: &str, media: &MediaInfo, autoplay: bool) -> (CastMessage, u64) {
        let request_id = next_request_id(Namespace::Media);
        let mut metadata = json!({"metadataType":0});
        if let Some(title) = &media.title {
            metadata["title"] = json!(title);
        }
        if let Some(artwork_url) = &media.artwork_url {
            metadata["images"] = json!([{"url":artwork_url}]);
        }
        let payload = json!({
            "type":"LOAD",
            "requestId":request_id,
            "autoplay":autoplay,
            "currentTime":0,
            "media":{
                "contentId":media.content_url,
                "streamType":media.stream_type.as_str(),
                "contentType":media.mime_type,
                "metadata":metadata
            }
        });
        (self.text(Namespace::Media, transport_id, payload), request_id)
    }

    pub fn play(&self, transport_id: &str, media_session: MediaSessionId) -> (CastMessage, u64) {
        self.media_command(transport_id, "PLAY", media_session)
    }

    pub fn pause(&self, transport_id: &str, media_session: MediaSessionId) -> (CastMessage, u64) {
        self.media_command(transport_id, "PAUSE", media_session)
    }

    pub fn seek(
        &self,
        transport_id: &str,
        media_session: MediaSessionId,
        position: Duration,
    ) -> (CastMessage, u64) {
        let request_id = next_request_id(Namespace::Media);
        let payload = json!({
            "type":"SEEK",
            "requestId":request_id,
            "mediaSessionId":media_session.0,
            "currentTime":format_seconds(position),
            "resumeState":"PLAYBACK_START"
        });
        (self.text(Namespace::Media, transport_id, payload), request_id)
    }

    pub fn media_status(
        &self,
        transport_id: &str,
        media_session: Option<MediaSessionId>,
    ) -> CastMessage {
        let request_id = next_request_id(Namespace::Media);
        let mut payload = json!({"type":"GET_STATUS","requestId":request_id});
        if let Some(media_session) = media_session {
            payload["mediaSessionId"] = json!(media_session.0);
        }
        self.text(Namespace::Media, transport_id, payload)
    }

    fn media_command(
        &self,
        transport_id: &str,
        command: &str,
        media_session: MediaSessionId,
    ) -> (CastMessage, u64) {
        let request_id = next_request_id(Namespace::Media);
        let payload = json!({
            "type":command,
            "requestId":request_id,
            "mediaSessionId":media_session.0
        });
        (self.text(Namespace::Media, transport_id, payload), request_id)
    }
}

/// Largest millisecond count an `f64` holds exactly.
const MAX_WIRE_MILLIS: f64 = (1u64 << 53) as f64;

/// Drops sub-millisecond precision the wire cannot carry.
pub(crate) fn wire_precision(position: Duration) -> Duration {
    Duration::from_millis(u64::try_from(position.as_millis()).unwrap_or(u64::MAX))
}

/// Seconds with millisecond precision, as the receiver expects.
fn format_seconds(position: Duration) -> f64 {
    (wire_precision(position).as_millis() as f64) / 1000.0
}

const AUTH_FIELD_CHALLENGE: u32 = 1;
const AUTH_FIELD_RESPONSE: u32 = 2;
const AUTH_FIELD_ERROR: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthReply {
    Accepted,
    Rejected { error_type: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heartbeat {
    Ping,
    Pong,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationInfo {
    pub app_id: String,
    pub transport_id: Option<String>,
    pub session_id: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VolumeInfo {
    pub level: Option<f32>,
    pub muted: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReceiverStatus {
    pub request_id: u64,
    pub applications: Vec<ApplicationInfo>,
    pub volume: Option<VolumeInfo>,
}

impl ReceiverStatus {
    pub fn application(&self, app_id: &str) -> Option<&ApplicationInfo> {
        self.applications.iter().find(|app| app.app_id == app_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReceiverReply {
    Status(ReceiverStatus),
    LaunchError {
        request_id: u64,
        reason: Option<String>,
    },
    Other(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaStatusEntry {
    pub media_session_id: MediaSessionId,
    pub player_state: ReceiverPlaybackState,
    pub current_time: Duration,
    pub idle_reason: Option<String>,
    pub supported_media_commands: u64,
    pub duration: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaStatusReport {
    pub request_id: u64,
    /// Empty when the receiver has no media loaded.
    pub entry: Option<MediaStatusEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MediaReply {
    Status(MediaStatusReport),
    LoadFailed { request_id: u64 },
    LoadCancelled { request_id: u64 },
    InvalidRequest { request_id: u64, reason: Option<String> },
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionReply {
    Connect,
    Close,
}

/// An inbound message, validated and sorted by channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Auth(AuthReply),
    Heartbeat(Heartbeat),
    Receiver(ReceiverReply),
    Media(MediaReply),
    Connection(ConnectionReply),
}

/// Parses `message` into its channel's typed form.
pub fn parse_inbound(message: &CastMessage) -> Result<Inbound, ProtocolError> {
    let namespace = Namespace::from_urn(&message.namespace)
        .ok_or_else(|| ProtocolError::UnknownChannel(message.namespace.clone()))?;
    if namespace == Namespace::DeviceAuth {
        let bytes = message
            .payload
            .as_binary()
            .ok_or(ProtocolError::UnexpectedPayloadType(namespace.as_str()))?;
        return parse_auth(bytes).map(Inbound::Auth);
    }

    let text = message
        .payload
        .as_text()
        .ok_or(ProtocolError::UnexpectedPayloadType(namespace.as_str()))?;
    let value: Value = serde_json::from_str(text)?;
    let message_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::MissingField {
            namespace: namespace.as_str(),
            message_type: String::new(),
            field: "type",
        })?
        .to_string();

    match namespace {
        Namespace::Heartbeat => match message_type.as_str() {
            "PING" => Ok(Inbound::Heartbeat(Heartbeat::Ping)),
            "PONG" => Ok(Inbound::Heartbeat(Heartbeat::Pong)),
            _ => Err(ProtocolError::Malformed("unknown heartbeat type")),
        },
        Namespace::Connection => match message_type.as_str() {
            "CONNECT" => Ok(Inbound::Connection(ConnectionReply::Connect)),
            "CLOSE" => Ok(Inbound::Connection(ConnectionReply::Close)),
            _ => Err(ProtocolError::Malformed("unknown connection type")),
        },
        Namespace::Receiver => parse_receiver(value, message_type).map(Inbound::Receiver),
        Namespace::Media => parse_media(value, message_type).map(Inbound::Media),
        Namespace::DeviceAuth => Err(ProtocolError::UnexpectedPayloadType(namespace.as_str())),
    }
}

fn parse_auth(bytes: &[u8]) -> Result<AuthReply, ProtocolError> {
    let mut cursor = 0usize;
    let mut accepted = false;
    while cursor < bytes.len() {
        let key = codec::read_varint(bytes, &mut cursor)
            .ok_or(ProtocolError::Malformed("auth field key"))?;
        if key & 0x07 != 2 {
            return Err(ProtocolError::Malformed("unexpected auth wire type"));
        }
        let field = codec::read_length_delimited(bytes, &mut cursor)?;
        match (key >> 3) as u32 {
            AUTH_FIELD_ERROR => {
                return Ok(AuthReply::Rejected {
                    error_type: parse_auth_error_type(field),
                })
            }
            AUTH_FIELD_RESPONSE => accepted = true,
            _ => {}
        }
    }
    if accepted {
        Ok(AuthReply::Accepted)
    } else {
        Err(ProtocolError::Malformed("auth message has neither response nor error"))
    }
}

fn parse_auth_error_type(bytes: &[u8]) -> u64 {
    let mut cursor = 0usize;
    while let Some(key) = codec::read_varint(bytes, &mut cursor) {
        if key == 1 << 3 {
            return codec::read_varint(bytes, &mut cursor).unwrap_or_default();
        }
        if key & 0x07 != 0 || codec::read_varint(bytes, &mut cursor).is_none() {
            break;
        }
    }
    0
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceiverStatus {
    #[serde(default)]
    applications: Vec<RawApplication>,
    volume: Option<RawVolume>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawApplication {
    app_id: Option<String>,
    transport_id: Option<String>,
    session_id: Option<String>,
    display_name: Option<String>,
}

#[derive(Deserialize)]
struct RawVolume {
    level: Option<f32>,
    muted: Option<bool>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMediaStatus {
    media_session_id: Option<i64>,
    player_state: Option<String>,
    current_time: Option<f64>,
    idle_reason: Option<String>,
    #[serde(default)]
    supported_media_commands: u64,
    media: Option<RawMedia>,
}

#[derive(Deserialize)]
struct RawMedia {
    duration: Option<f64>,
}

fn request_id(value: &Value) -> u64 {
    value.get("requestId").and_then(Value::as_u64).unwrap_or(0)
}

fn reason(value: &Value) -> Option<String> {
    value
        .get("reason")
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

/// Receiver seconds, rounded to the millisecond precision used on the wire.
fn seconds(value: f64) -> Result<Duration, ProtocolError> {
    if !value.is_finite() || value <= 0.0 {
        return Ok(Duration::ZERO);
    }
    let millis = (value * 1000.0).round();
    if millis >= MAX_WIRE_MILLIS {
        return Err(ProtocolError::Malformed("time value out of range"));
    }
    Ok(Duration::from_millis(millis as u64))
}

fn parse_receiver(value: Value, message_type: String) -> Result<ReceiverReply, ProtocolError> {
    match message_type.as_str() {
        "RECEIVER_STATUS" => {
            let status = value
                .get("status")
                .cloned()
                .ok_or_else(|| ProtocolError::MissingField {
                    namespace: Namespace::Receiver.as_str(),
                    message_type: message_type.clone(),
                    field: "status",
                })?;
            let raw: RawReceiverStatus = serde_json::from_value(status)?;
            let mut applications = Vec::with_capacity(raw.applications.len());
            for app in raw.applications {
                let app_id = app.app_id.ok_or_else(|| ProtocolError::MissingField {
                    namespace: Namespace::Receiver.as_str(),
                    message_type: message_type.clone(),
                    field: "appId",
                })?;
                applications.push(ApplicationInfo {
                    app_id,
                    transport_id: app.transport_id.filter(|id| !id.is_empty()),
                    session_id: app.session_id.filter(|id| !id.is_empty()),
                    display_name: app.display_name,
                });
            }
            Ok(ReceiverReply::Status(ReceiverStatus {
                request_id: request_id(&value),
                applications,
                volume: raw.volume.map(|volume| VolumeInfo {
                    level: volume.level,
                    muted: volume.muted,
                }),
            }))
        }
        "LAUNCH_ERROR" => Ok(ReceiverReply::LaunchError {
            request_id: request_id(&value),
            reason: reason(&value),
        }),
        _ => Ok(ReceiverReply::Other(message_type.clone())),
    }
}

fn parse_media(value: Value, message_type: String) -> Result<MediaReply, ProtocolError> {
    let request_id = request_id(&value);
    match message_type.as_str() {
        "MEDIA_STATUS" => {
            let missing = |field: &'static str| ProtocolError::MissingField {
                namespace: Namespace::Media.as_str(),
                message_type: message_type.clone(),
                field,
            };
            let entries = value
                .get("status")
                .and_then(Value::as_array)
                .ok_or_else(|| missing("status"))?;
            let Some(first) = entries.first() else {
                return Ok(MediaReply::Status(MediaStatusReport {
                    request_id,
                    entry: None,
                }));
            };
            let raw: RawMediaStatus = serde_json::from_value(first.clone())?;
            let media_session_id = raw
                .media_session_id
                .ok_or_else(|| missing("mediaSessionId"))?;
            let player_state = raw
                .player_state
                .as_deref()
                .ok_or_else(|| missing("playerState"))?;
            let player_state = ReceiverPlaybackState::from_wire(player_state)
                .ok_or(ProtocolError::Malformed("unknown player state"))?;
            Ok(MediaReply::Status(MediaStatusReport {
                request_id,
                entry: Some(MediaStatusEntry {
                    media_session_id: MediaSessionId(media_session_id),
                    player_state,
                    current_time: seconds(raw.current_time.unwrap_or(0.0))?,
                    idle_reason: raw.idle_reason,
                    supported_media_commands: raw.supported_media_commands,
                    duration: raw
                        .media
                        .and_then(|media| media.duration)
                        .map(seconds)
                        .transpose()?,
                }),
            }))
        }
        "LOAD_FAILED" => Ok(MediaReply::LoadFailed { request_id }),
        "LOAD_CANCELLED" => Ok(MediaReply::LoadCancelled { request_id }),
        "INVALID_REQUEST" => Ok(MediaReply::InvalidRequest {
            request_id,
            reason: reason(&value),
        }),
        _ => Ok(MediaReply::Other(message_type.clone())),
    }
}
