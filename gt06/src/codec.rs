use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;

/// GT06 frame layout:
///
/// ```text
/// [0x78 0x78] [length:u16 BE] [type:u8] [payload: length-1 bytes] [checksum:u8] [0x0d 0x0a]
/// ```
///
/// `length` covers the type byte and the payload. The checksum is the XOR of
/// everything from the length field up to (not including) the checksum byte.
pub const SYNC_BYTE: u8 = 0x78;
pub const END_BYTE_1: u8 = 0x0d;
pub const END_BYTE_2: u8 = 0x0a;

pub const MESSAGE_TYPE_LOGIN: u8 = 0x01;
pub const MESSAGE_TYPE_GPS: u8 = 0x12;
pub const MESSAGE_TYPE_HEARTBEAT: u8 = 0x13;

// sync(2) + length(2) + type(1) + checksum(1) + end(2)
const MIN_FRAME_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Login,
    Gps,
    Heartbeat,
    Unknown,
}

impl PacketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketKind::Login => "login",
            PacketKind::Gps => "gps",
            PacketKind::Heartbeat => "heartbeat",
            PacketKind::Unknown => "unknown",
        }
    }

    fn from_message_type(message_type: u8) -> Self {
        match message_type {
            MESSAGE_TYPE_LOGIN => PacketKind::Login,
            MESSAGE_TYPE_GPS => PacketKind::Gps,
            MESSAGE_TYPE_HEARTBEAT => PacketKind::Heartbeat,
            _ => PacketKind::Unknown,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),
    #[error("invalid sync bytes: {0:02x} {1:02x}")]
    BadSync(u8, u8),
    #[error("incomplete packet: expected {expected} bytes, got {got}")]
    Incomplete { expected: usize, got: usize },
    #[error("invalid end bytes: {0:02x} {1:02x}")]
    BadTerminator(u8, u8),
    #[error("checksum mismatch: expected {expected:02x}, got {got:02x}")]
    ChecksumMismatch { expected: u8, got: u8 },
}

impl FrameError {
    pub fn label(&self) -> &'static str {
        match self {
            FrameError::TooShort(_) => "too_short",
            FrameError::BadSync(_, _) => "bad_sync",
            FrameError::Incomplete { .. } => "incomplete",
            FrameError::BadTerminator(_, _) => "bad_terminator",
            FrameError::ChecksumMismatch { .. } => "checksum_mismatch",
        }
    }
}

/// Fields decoded from a packet body, best effort. Anything the payload does
/// not carry, or carries in a form we cannot decode, stays `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GpsData {
    pub imei: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub speed: Option<f64>,
}

/// A decoded frame. Decoding never fails: malformed input comes back with
/// `valid == false` and an [`FrameError`] explaining why. A checksum mismatch
/// still classifies the packet kind so that diagnostics can tell what the
/// device was trying to send.
#[derive(Debug, Clone)]
pub struct Gt06Packet {
    pub kind: PacketKind,
    pub message_type: u8,
    pub length: u16,
    pub payload: Vec<u8>,
    pub checksum: u8,
    pub valid: bool,
    pub error: Option<FrameError>,
    pub data: Option<GpsData>,
}

impl Gt06Packet {
    fn invalid(length: u16, error: FrameError) -> Self {
        Self {
            kind: PacketKind::Unknown,
            message_type: 0,
            length,
            payload: Vec::new(),
            checksum: 0,
            valid: false,
            error: Some(error),
            data: None,
        }
    }
}

pub fn decode(buffer: &[u8]) -> Gt06Packet {
    if buffer.len() < MIN_FRAME_LEN {
        return Gt06Packet::invalid(0, FrameError::TooShort(buffer.len()));
    }
    if buffer[0] != SYNC_BYTE || buffer[1] != SYNC_BYTE {
        return Gt06Packet::invalid(0, FrameError::BadSync(buffer[0], buffer[1]));
    }

    let length = u16::from_be_bytes([buffer[2], buffer[3]]);
    let body_len = length as usize;

    // Trailing bytes beyond the declared frame are tolerated.
    let expected = 2 + 2 + body_len + 1 + 2;
    if buffer.len() < expected {
        return Gt06Packet::invalid(
            length,
            FrameError::Incomplete {
                expected,
                got: buffer.len(),
            },
        );
    }

    let end_offset = 2 + 2 + body_len + 1;
    if buffer[end_offset] != END_BYTE_1 || buffer[end_offset + 1] != END_BYTE_2 {
        return Gt06Packet::invalid(
            length,
            FrameError::BadTerminator(buffer[end_offset], buffer[end_offset + 1]),
        );
    }

    let message_type = buffer[4];
    let payload = if body_len > 0 {
        buffer[5..4 + body_len].to_vec()
    } else {
        Vec::new()
    };

    let checksum_offset = 4 + body_len;
    let checksum = buffer[checksum_offset];
    let computed = xor_checksum(&buffer[2..checksum_offset]);
    let kind = PacketKind::from_message_type(message_type);

    if checksum != computed {
        return Gt06Packet {
            kind,
            message_type,
            length,
            payload,
            checksum,
            valid: false,
            error: Some(FrameError::ChecksumMismatch {
                expected: computed,
                got: checksum,
            }),
            data: None,
        };
    }

    let data = match kind {
        PacketKind::Login | PacketKind::Heartbeat => Some(GpsData {
            imei: decode_imei(&payload),
            ..GpsData::default()
        }),
        PacketKind::Gps => Some(decode_gps_payload(&payload)),
        PacketKind::Unknown => None,
    };

    Gt06Packet {
        kind,
        message_type,
        length,
        payload,
        checksum,
        valid: true,
        error: None,
        data,
    }
}

/// Build a response frame that mirrors the inbound layout, echoing the given
/// message type. Devices expect this for login and heartbeat.
pub fn build_ack(message_type: u8, payload: &[u8]) -> Vec<u8> {
    let length = 1 + payload.len();
    let mut frame = Vec::with_capacity(2 + 2 + length + 1 + 2);
    frame.extend_from_slice(&[SYNC_BYTE, SYNC_BYTE]);
    frame.extend_from_slice(&(length as u16).to_be_bytes());
    frame.push(message_type);
    frame.extend_from_slice(payload);
    let checksum = xor_checksum(&frame[2..]);
    frame.push(checksum);
    frame.extend_from_slice(&[END_BYTE_1, END_BYTE_2]);
    frame
}

fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, byte| acc ^ byte)
}

/// Decode a BCD digit string, trimming leading zeros. Returns `None` if any
/// nibble is not a decimal digit, so binary payload bytes are never mistaken
/// for an identity.
pub fn bcd_to_string(bytes: &[u8]) -> Option<String> {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &byte in bytes {
        let hi = (byte & 0xf0) >> 4;
        let lo = byte & 0x0f;
        if hi > 9 || lo > 9 {
            return None;
        }
        out.push(char::from(b'0' + hi));
        out.push(char::from(b'0' + lo));
    }
    Some(out.trim_start_matches('0').to_owned())
}

/// IMEI from the first 8 payload bytes, accepted only if it yields at least
/// 10 digits.
fn decode_imei(payload: &[u8]) -> Option<String> {
    if payload.len() < 8 {
        return None;
    }
    let imei = bcd_to_string(&payload[..8])?;
    (imei.len() >= 10).then_some(imei)
}

/// Best-effort decode of the common GT06 location body:
///
/// ```text
/// [0]      status/alarm (ignored)
/// [1..5]   latitude,  i32 BE, degrees * 1e6
/// [5..9]   longitude, i32 BE, degrees * 1e6
/// [9]      speed, km/h
/// [-6..]   timestamp, BCD YY MM DD hh mm ss (UTC, year 2000-based)
/// ```
fn decode_gps_payload(payload: &[u8]) -> GpsData {
    let mut data = GpsData::default();

    if payload.len() >= 10 {
        let lat_raw = i32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]);
        let lon_raw = i32::from_be_bytes([payload[5], payload[6], payload[7], payload[8]]);
        data.latitude = Some(f64::from(lat_raw) / 1e6);
        data.longitude = Some(f64::from(lon_raw) / 1e6);
        data.speed = Some(f64::from(payload[9]));
    }

    if payload.len() >= 6 {
        data.timestamp = parse_bcd_timestamp(&payload[payload.len() - 6..]);
    }

    // Some device variants embed the IMEI in location frames too.
    if payload.len() >= 14 {
        data.imei = decode_imei(payload);
    }

    data
}

fn parse_bcd_timestamp(bytes: &[u8]) -> Option<DateTime<Utc>> {
    if bytes.len() != 6 {
        return None;
    }
    let to_num = |byte: u8| u32::from(((byte & 0xf0) >> 4) * 10 + (byte & 0x0f));
    let year = 2000 + to_num(bytes[0]) as i32;
    Utc.with_ymd_and_hms(
        year,
        to_num(bytes[1]),
        to_num(bytes[2]),
        to_num(bytes[3]),
        to_num(bytes[4]),
        to_num(bytes[5]),
    )
    .single()
}
