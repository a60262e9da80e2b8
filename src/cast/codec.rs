//! Length-prefixed framing for cast channel messages.
//!
//! Each frame is a 4-byte big-endian length followed by a protobuf-encoded
//! `CastMessage`. Only the handful of fields the control plane uses are
//! written; unknown fields are skipped when decoding.

use crate::error::ProtocolError;

/// Largest payload accepted by receivers.
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024;

const HEADER_LEN: usize = 4;

const FIELD_PROTOCOL_VERSION: u32 = 1;
const FIELD_SOURCE_ID: u32 = 2;
const FIELD_DESTINATION_ID: u32 = 3;
const FIELD_NAMESPACE: u32 = 4;
const FIELD_PAYLOAD_TYPE: u32 = 5;
const FIELD_PAYLOAD_UTF8: u32 = 6;
const FIELD_PAYLOAD_BINARY: u32 = 7;

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LENGTH_DELIMITED: u8 = 2;
const WIRE_FIXED32: u8 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            Payload::Binary(_) => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Payload::Text(_) => None,
            Payload::Binary(bytes) => Some(bytes),
        }
    }
}

/// One message on the multiplexed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CastMessage {
    pub namespace: String,
    pub source_id: String,
    pub destination_id: String,
    pub payload: Payload,
}

/// Serializes `message` into a complete frame, header included.
pub fn encode(message: &CastMessage) -> Result<Vec<u8>, ProtocolError> {
    let mut body = Vec::with_capacity(64 + message.namespace.len());
    write_varint_field(&mut body, FIELD_PROTOCOL_VERSION, 0); // CASTV2_1_0
    write_bytes_field(&mut body, FIELD_SOURCE_ID, message.source_id.as_bytes());
    write_bytes_field(
        &mut body,
        FIELD_DESTINATION_ID,
        message.destination_id.as_bytes(),
    );
    write_bytes_field(&mut body, FIELD_NAMESPACE, message.namespace.as_bytes());
    match &message.payload {
        Payload::Text(text) => {
            write_varint_field(&mut body, FIELD_PAYLOAD_TYPE, 0);
            write_bytes_field(&mut body, FIELD_PAYLOAD_UTF8, text.as_bytes());
        }
        Payload::Binary(bytes) => {
            write_varint_field(&mut body, FIELD_PAYLOAD_TYPE, 1);
            write_bytes_field(&mut body, FIELD_PAYLOAD_BINARY, bytes);
        }
    }

    let len = u32::try_from(body.len()).map_err(|_| ProtocolError::TooLarge(body.len()))?;
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decodes a frame body (without the length header).
pub fn decode_body(bytes: &[u8]) -> Result<CastMessage, ProtocolError> {
    let mut cursor = 0usize;
    let mut source_id = String::new();
    let mut destination_id = String::new();
    let mut namespace = String::new();
    let mut payload_type = 0u64;
    let mut payload_utf8: Option<String> = None;
    let mut payload_binary: Option<Vec<u8>> = None;

    while cursor < bytes.len() {
        let key = read_varint(bytes, &mut cursor).ok_or(ProtocolError::Malformed("field key"))?;
        let field_number = (key >> 3) as u32;
        let wire_type = (key & 0x07) as u8;
        match wire_type {
            WIRE_VARINT => {
                let value = read_varint(bytes, &mut cursor)
                    .ok_or(ProtocolError::Malformed("varint field"))?;
                if field_number == FIELD_PAYLOAD_TYPE {
                    payload_type = value;
                }
            }
            WIRE_LENGTH_DELIMITED => {
                let field = read_length_delimited(bytes, &mut cursor)?;
                match field_number {
                    FIELD_SOURCE_ID => source_id = utf8(field)?,
                    FIELD_DESTINATION_ID => destination_id = utf8(field)?,
                    FIELD_NAMESPACE => namespace = utf8(field)?,
                    FIELD_PAYLOAD_UTF8 => payload_utf8 = Some(utf8(field)?),
                    FIELD_PAYLOAD_BINARY => payload_binary = Some(field.to_vec()),
                    _ => {}
                }
            }
            WIRE_FIXED64 => skip(bytes, &mut cursor, 8)?,
            WIRE_FIXED32 => skip(bytes, &mut cursor, 4)?,
            _ => return Err(ProtocolError::Malformed("unsupported wire type")),
        }
    }

    let payload = match payload_type {
        0 => Payload::Text(payload_utf8.unwrap_or_default()),
        1 => Payload::Binary(payload_binary.unwrap_or_default()),
        _ => return Err(ProtocolError::Malformed("unknown payload type")),
    };
    Ok(CastMessage {
        namespace,
        source_id,
        destination_id,
        payload,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Header,
    Body(usize),
    Discard(usize),
}

/// Incremental frame decoder fed with whatever the socket returned.
///
/// Bytes are buffered until a full header and then a full body are available,
/// so a frame split across any number of reads decodes the same as one read
/// in a single chunk.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    state: DecodeState,
    max_payload: usize,
    pending_oversize: Option<usize>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self {
            buffer: Vec::new(),
            state: DecodeState::Header,
            max_payload,
            pending_oversize: None,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes received but not yet consumed by a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the next complete frame, or `None` when more input is needed.
    pub fn next_frame(&mut self) -> Option<Result<CastMessage, ProtocolError>> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if self.buffer.len() < HEADER_LEN {
                        return None;
                    }
                    let mut header = [0u8; HEADER_LEN];
                    header.copy_from_slice(&self.buffer[..HEADER_LEN]);
                    self.buffer.drain(..HEADER_LEN);
                    let declared = u32::from_be_bytes(header) as usize;
                    if declared > self.max_payload {
                        self.pending_oversize = Some(declared);
                        self.state = DecodeState::Discard(declared);
                    } else {
                        self.state = DecodeState::Body(declared);
                    }
                }
                DecodeState::Body(len) => {
                    if self.buffer.len() < len {
                        return None;
                    }
                    let body: Vec<u8> = self.buffer.drain(..len).collect();
                    self.state = DecodeState::Header;
                    return Some(decode_body(&body));
                }
                DecodeState::Discard(remaining) => {
                    let dropped = remaining.min(self.buffer.len());
                    self.buffer.drain(..dropped);
                    let remaining = remaining - dropped;
                    if remaining > 0 {
                        self.state = DecodeState::Discard(remaining);
                        return None;
                    }
                    self.state = DecodeState::Header;
                    if let Some(declared) = self.pending_oversize.take() {
                        return Some(Err(ProtocolError::Oversized {
                            declared,
                            max: self.max_payload,
                        }));
                    }
                }
            }
        }
    }
}

fn utf8(bytes: &[u8]) -> Result<String, ProtocolError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
}

fn skip(bytes: &[u8], cursor: &mut usize, len: usize) -> Result<(), ProtocolError> {
    if *cursor + len > bytes.len() {
        return Err(ProtocolError::Malformed("fixed-width field out of bounds"));
    }
    *cursor += len;
    Ok(())
}

/// Reads a length-delimited protobuf field and advances `cursor` past it.
pub(crate) fn read_length_delimited<'a>(
    bytes: &'a [u8],
    cursor: &mut usize,
) -> Result<&'a [u8], ProtocolError> {
    let len =
        read_varint(bytes, cursor).ok_or(ProtocolError::Malformed("field length"))? as usize;
    let end = cursor
        .checked_add(len)
        .filter(|end| *end <= bytes.len())
        .ok_or(ProtocolError::Malformed("field out of bounds"))?;
    let field = &bytes[*cursor..end];
    *cursor = end;
    Ok(field)
}

pub(crate) fn write_varint_field(out: &mut Vec<u8>, field_number: u32, value: u64) {
    let key = u64::from(field_number) << 3;
    write_varint(out, key);
    write_varint(out, value);
}

pub(crate) fn write_bytes_field(out: &mut Vec<u8>, field_number: u32, value: &[u8]) {
    let key = (u64::from(field_number) << 3) | u64::from(WIRE_LENGTH_DELIMITED);
    write_varint(out, key);
    write_varint(out, value.len() as u64);
    out.extend_from_slice(value);
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

pub(crate) fn read_varint(bytes: &[u8], cursor: &mut usize) -> Option<u64> {
    let mut shift = 0u32;
    let mut value = 0u64;
    while *cursor < bytes.len() && shift <= 63 {
        let byte = bytes[*cursor];
        *cursor += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
    }
    None
}
