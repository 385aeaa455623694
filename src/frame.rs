//! HTTP/2 frame codec boundary
//!
//! The relay never interprets frame payloads; the fuzzer's bytes flow
//! through verbatim. What it does need is the thin codec surface used by the
//! handshake and the relay loop: parse a 9-byte frame header, introspect
//! type/flags/length, and construct the handful of control frames the proxy
//! itself emits (SETTINGS, SETTINGS ack, WINDOW_UPDATE). HPACK and payload
//! field layouts are deliberately out of scope.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::{RelayError, Result};

/// Fixed connection-preface octets every HTTP/2 client opens with
/// (RFC 9113 Section 3.4). Must match bit-for-bit.
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Size of the fixed frame header (RFC 9113 Section 4.1)
pub const FRAME_HEADER_LEN: usize = 9;

/// HTTP/2 frame types (RFC 9113 Section 6)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    RstStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    GoAway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

impl FrameType {
    /// Unknown types stay `None`; the relay forwards them opaquely.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(FrameType::Data),
            0x1 => Some(FrameType::Headers),
            0x2 => Some(FrameType::Priority),
            0x3 => Some(FrameType::RstStream),
            0x4 => Some(FrameType::Settings),
            0x5 => Some(FrameType::PushPromise),
            0x6 => Some(FrameType::Ping),
            0x7 => Some(FrameType::GoAway),
            0x8 => Some(FrameType::WindowUpdate),
            0x9 => Some(FrameType::Continuation),
            _ => None,
        }
    }
}

/// Frame flag bits (RFC 9113 Section 6)
pub mod flags {
    /// END_STREAM on DATA/HEADERS; the same bit is ACK on SETTINGS and PING
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
}

/// SETTINGS parameter identifiers (RFC 9113 Section 6.5.2)
pub mod settings {
    pub const HEADER_TABLE_SIZE: u16 = 0x1;
    pub const ENABLE_PUSH: u16 = 0x2;
    pub const INITIAL_WINDOW_SIZE: u16 = 0x4;
    pub const MAX_FRAME_SIZE: u16 = 0x5;
}

/// The four fixed SETTINGS values advertised on every handshake. Interop
/// with the fuzzer corpus depends on these exact values, in this order.
pub const HANDSHAKE_SETTINGS: [(u16, u32); 4] = [
    (settings::ENABLE_PUSH, 0),
    (settings::INITIAL_WINDOW_SIZE, (1 << 31) - 1),
    (settings::HEADER_TABLE_SIZE, (1 << 16) - 1),
    (settings::MAX_FRAME_SIZE, (1 << 24) - 1),
];

/// WINDOW_UPDATE increment sent after every relayed DATA frame
pub const WINDOW_INCREMENT: u32 = (1 << 31) - 1;

/// Parsed 9-byte frame header. The raw type byte is kept so frames with
/// unknown types can still be introspected and forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: usize,
    pub kind: u8,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    /// Parse the fixed header:
    ///
    /// ```text
    /// +-----------------------------------------------+
    /// |                 Length (24)                   |
    /// +---------------+---------------+---------------+
    /// |   Type (8)    |   Flags (8)   |
    /// +-+-------------+---------------+-------------------------------+
    /// |R|                 Stream Identifier (31)                      |
    /// +=+=============================================================+
    /// ```
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < FRAME_HEADER_LEN {
            return Err(RelayError::Frame(format!(
                "truncated frame header: {} of {} bytes",
                data.len(),
                FRAME_HEADER_LEN
            )));
        }

        let length = ((data[0] as usize) << 16) | ((data[1] as usize) << 8) | (data[2] as usize);
        let kind = data[3];
        let flags = data[4];
        // Reserved bit masked off
        let stream_id = ((data[5] as u32 & 0x7F) << 24)
            | ((data[6] as u32) << 16)
            | ((data[7] as u32) << 8)
            | (data[8] as u32);

        Ok(Self {
            length,
            kind,
            flags,
            stream_id,
        })
    }

    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::from_u8(self.kind)
    }

    pub fn is_type(&self, ty: FrameType) -> bool {
        self.kind == ty as u8
    }

    /// SETTINGS frame with the ACK flag set, the handshake's filter target
    pub fn is_settings_ack(&self) -> bool {
        self.is_type(FrameType::Settings) && self.flags & flags::ACK != 0
    }

    /// END_STREAM is only defined for frame types that carry it; the same
    /// bit on SETTINGS or PING means ACK and must not end a relay loop.
    pub fn has_end_stream(&self) -> bool {
        matches!(
            self.frame_type(),
            Some(FrameType::Data) | Some(FrameType::Headers) | Some(FrameType::Continuation)
        ) && self.flags & flags::END_STREAM != 0
    }
}

/// One frame as read off the wire: parsed header plus the raw serialized
/// bytes (header included), ready to append to a relayed response.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub header: FrameHeader,
    pub bytes: Vec<u8>,
}

impl RawFrame {
    pub fn payload(&self) -> &[u8] {
        &self.bytes[FRAME_HEADER_LEN..]
    }
}

/// Serialize a frame header + payload into wire bytes
pub fn encode_frame(kind: u8, frame_flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
    let len = payload.len();
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + len);
    out.push(((len >> 16) & 0xFF) as u8);
    out.push(((len >> 8) & 0xFF) as u8);
    out.push((len & 0xFF) as u8);
    out.push(kind);
    out.push(frame_flags);
    out.extend_from_slice(&(stream_id & 0x7FFF_FFFF).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// SETTINGS frame carrying the four fixed handshake parameters
pub fn encode_handshake_settings() -> Vec<u8> {
    let mut payload = Vec::with_capacity(HANDSHAKE_SETTINGS.len() * 6);
    for (id, value) in HANDSHAKE_SETTINGS {
        payload.extend_from_slice(&id.to_be_bytes());
        payload.extend_from_slice(&value.to_be_bytes());
    }
    encode_frame(FrameType::Settings as u8, 0, 0, &payload)
}

/// Empty SETTINGS frame with only the ACK flag
pub fn encode_settings_ack() -> Vec<u8> {
    encode_frame(FrameType::Settings as u8, flags::ACK, 0, &[])
}

/// Connection-level WINDOW_UPDATE with the fixed increment
pub fn encode_window_update() -> Vec<u8> {
    encode_frame(
        FrameType::WindowUpdate as u8,
        0,
        0,
        &WINDOW_INCREMENT.to_be_bytes(),
    )
}

/// Read exactly one frame (header + payload) from the channel, each read
/// bounded by `dur`. Expiry or EOF mid-frame is an error: the relay treats
/// an absent or unparseable frame as a session-local I/O failure, never as
/// something to skip.
pub async fn read_frame<S>(io: &mut S, dur: Duration) -> Result<RawFrame>
where
    S: AsyncRead + Unpin,
{
    let mut bytes = vec![0u8; FRAME_HEADER_LEN];
    timeout(dur, io.read_exact(&mut bytes))
        .await
        .map_err(|_| RelayError::Timeout(dur))??;

    let header = FrameHeader::parse(&bytes)?;

    bytes.resize(FRAME_HEADER_LEN + header.length, 0);
    timeout(dur, io.read_exact(&mut bytes[FRAME_HEADER_LEN..]))
        .await
        .map_err(|_| RelayError::Timeout(dur))??;

    Ok(RawFrame { header, bytes })
}

/// Write raw bytes to the channel, bounded by `dur`
pub async fn write_all<S>(io: &mut S, data: &[u8], dur: Duration) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    timeout(dur, io.write_all(data))
        .await
        .map_err(|_| RelayError::Timeout(dur))??;
    Ok(())
}
