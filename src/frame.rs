use crate::error::{Result, YamuxError};
use bitflags::bitflags;
use bytes::Bytes;

/// Fixed protocol version carried in every header.
pub const PROTOCOL_VERSION: u8 = 0;

/// Size of the fixed frame header in bytes.
///
/// - version: u8
/// - type: u8
/// - flags: u16 (big endian)
/// - stream_id: u32 (big endian)
/// - length: i32 (big endian)
pub const HEADER_SIZE: usize = 12;

/// Window every stream starts with before any update is exchanged.
pub const INITIAL_WINDOW_SIZE: u32 = 256 * 1024;

/// Stream id reserved for session-level frames (ping, go-away).
pub const SESSION_STREAM_ID: u32 = 0;

/// GoAway code for a normal shutdown.
pub const GO_AWAY_NORMAL: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Data,
    WindowUpdate,
    Ping,
    GoAway,
}

impl FrameType {
    pub const DATA: u8 = 0x0;
    pub const WINDOW_UPDATE: u8 = 0x1;
    pub const PING: u8 = 0x2;
    pub const GO_AWAY: u8 = 0x3;

    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            Self::DATA => Ok(FrameType::Data),
            Self::WINDOW_UPDATE => Ok(FrameType::WindowUpdate),
            Self::PING => Ok(FrameType::Ping),
            Self::GO_AWAY => Ok(FrameType::GoAway),
            _ => Err(YamuxError::InvalidFrameType(byte)),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            FrameType::Data => Self::DATA,
            FrameType::WindowUpdate => Self::WINDOW_UPDATE,
            FrameType::Ping => Self::PING,
            FrameType::GoAway => Self::GO_AWAY,
        }
    }

    /// Only data frames are followed by a payload on the wire.
    pub fn carries_payload(self) -> bool {
        matches!(self, FrameType::Data)
    }
}

bitflags! {
    /// Header flags. A stream accumulates these per direction and derives its
    /// state from the union.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Flags: u16 {
        /// Opens a stream, or marks a ping request.
        const SYN = 0x1;
        /// Acknowledges a stream open, or marks a ping response.
        const ACK = 0x2;
        /// Half-closes the sender's direction.
        const FIN = 0x4;
        /// Aborts the stream.
        const RST = 0x8;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub frame_type: FrameType,
    pub flags: Flags,
    pub stream_id: u32,
    /// Payload size for data frames, credit delta for window updates, nonce
    /// for pings and error code for go-away.
    pub length: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub data: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType, flags: Flags, stream_id: u32, length: i32) -> Self {
        Self {
            header: FrameHeader {
                version: PROTOCOL_VERSION,
                frame_type,
                flags,
                stream_id,
                length,
            },
            data: Bytes::new(),
        }
    }

    pub fn data(stream_id: u32, flags: Flags, data: Bytes) -> Self {
        let length = i32::try_from(data.len()).unwrap_or(i32::MAX);
        Self {
            header: FrameHeader {
                version: PROTOCOL_VERSION,
                frame_type: FrameType::Data,
                flags,
                stream_id,
                length,
            },
            data,
        }
    }

    pub fn window_update(stream_id: u32, flags: Flags, delta: i32) -> Self {
        Self::new(FrameType::WindowUpdate, flags, stream_id, delta)
    }

    pub fn ping(stream_id: u32, nonce: u32) -> Self {
        Self::new(FrameType::Ping, Flags::SYN, stream_id, nonce as i32)
    }

    pub fn pong(stream_id: u32, nonce: i32) -> Self {
        Self::new(FrameType::Ping, Flags::ACK, stream_id, nonce)
    }

    pub fn go_away(code: i32) -> Self {
        Self::new(FrameType::GoAway, Flags::empty(), SESSION_STREAM_ID, code)
    }

    pub fn frame_type(&self) -> FrameType {
        self.header.frame_type
    }

    pub fn flags(&self) -> Flags {
        self.header.flags
    }

    pub fn stream_id(&self) -> u32 {
        self.header.stream_id
    }

    pub fn length(&self) -> i32 {
        self.header.length
    }

    /// Number of bytes this frame occupies on the wire.
    pub fn total_size(&self) -> usize {
        if self.header.frame_type.carries_payload() {
            HEADER_SIZE + self.data.len()
        } else {
            HEADER_SIZE
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.header.version != PROTOCOL_VERSION {
            return Err(YamuxError::InvalidVersion(self.header.version));
        }

        if self.header.frame_type.carries_payload() {
            // The header length is authoritative on the wire, so it has to
            // describe the payload exactly.
            if self.header.length < 0 || self.header.length as usize != self.data.len() {
                return Err(YamuxError::InvalidFrame);
            }
        } else if !self.data.is_empty() {
            return Err(YamuxError::InvalidFrame);
        }

        Ok(())
    }
}
