use crate::frame::FrameHeader;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Convenient type alias for `Result<T, YamuxError>`.
pub type Result<T> = std::result::Result<T, YamuxError>;

/// Error types for the yamux library.
///
/// `YamuxError` covers everything from transport I/O failures and framing
/// violations down to per-stream and per-ping failures. It is `Clone` so that a
/// single close or reset cause can be recorded once and handed to every
/// observer that asks for it.
#[derive(Debug, Clone, Error)]
pub enum YamuxError {
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    #[error("Invalid frame version {0}")]
    InvalidVersion(u8),

    #[error("Invalid frame type {0}")]
    InvalidFrameType(u8),

    #[error("Invalid frame format")]
    InvalidFrame,

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Unexpected EOF")]
    UnexpectedEof { header: Option<FrameHeader> },

    #[error("Session closed")]
    SessionClosed,

    #[error("Session reset by peer")]
    GoAway,

    #[error("Stream closed")]
    StreamClosed,

    #[error("Stream closed by peer")]
    StreamClosedByPeer,

    #[error("Stream reset")]
    StreamReset,

    #[error("Stream reset by peer")]
    StreamResetByPeer,

    #[error("Receive window exceeded")]
    ReceiveWindowExceeded,

    #[error("Invalid accept stream id {0}")]
    InvalidStreamId(u32),

    #[error("Stream ids exhausted - session should be restarted")]
    StreamIdsExhausted,

    #[error("Accept backlog full, refused stream {0}")]
    AcceptBacklogFull(u32),

    #[error("Ping timeout")]
    PingTimeout,

    #[error("Invalid ping response")]
    InvalidPingResponse,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<io::Error> for YamuxError {
    fn from(err: io::Error) -> Self {
        YamuxError::Io(Arc::new(err))
    }
}

impl From<YamuxError> for io::Error {
    fn from(err: YamuxError) -> Self {
        let kind = match &err {
            YamuxError::Io(e) => e.kind(),
            YamuxError::StreamReset
            | YamuxError::StreamResetByPeer
            | YamuxError::ReceiveWindowExceeded
            | YamuxError::GoAway => io::ErrorKind::ConnectionReset,
            YamuxError::StreamClosed
            | YamuxError::StreamClosedByPeer
            | YamuxError::SessionClosed => io::ErrorKind::BrokenPipe,
            YamuxError::UnexpectedEof { .. } => io::ErrorKind::UnexpectedEof,
            YamuxError::PingTimeout => io::ErrorKind::TimedOut,
            YamuxError::Config(_) => io::ErrorKind::InvalidInput,
            YamuxError::InvalidVersion(_)
            | YamuxError::InvalidFrameType(_)
            | YamuxError::InvalidFrame
            | YamuxError::FrameTooLarge { .. }
            | YamuxError::InvalidStreamId(_)
            | YamuxError::StreamIdsExhausted
            | YamuxError::AcceptBacklogFull(_)
            | YamuxError::InvalidPingResponse => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, err)
    }
}

impl YamuxError {
    /// Framing violations that leave the transport unusable.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            YamuxError::InvalidVersion(_)
                | YamuxError::InvalidFrameType(_)
                | YamuxError::InvalidFrame
                | YamuxError::FrameTooLarge { .. }
        )
    }

    pub fn is_recoverable(&self) -> bool {
        match self {
            YamuxError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ),
            YamuxError::PingTimeout
            | YamuxError::InvalidPingResponse
            | YamuxError::InvalidStreamId(_)
            | YamuxError::AcceptBacklogFull(_) => true,
            YamuxError::StreamClosed
            | YamuxError::StreamClosedByPeer
            | YamuxError::StreamReset
            | YamuxError::StreamResetByPeer
            | YamuxError::ReceiveWindowExceeded => true,
            YamuxError::InvalidVersion(_)
            | YamuxError::InvalidFrameType(_)
            | YamuxError::InvalidFrame
            | YamuxError::FrameTooLarge { .. }
            | YamuxError::UnexpectedEof { .. }
            | YamuxError::SessionClosed
            | YamuxError::GoAway
            | YamuxError::StreamIdsExhausted
            | YamuxError::Config(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_error_display() {
        let err = YamuxError::InvalidVersion(2);
        assert_eq!(err.to_string(), "Invalid frame version 2");

        let err = YamuxError::FrameTooLarge {
            size: 1024,
            max: 512,
        };
        assert_eq!(err.to_string(), "Frame too large: 1024 bytes (max: 512)");

        assert_eq!(YamuxError::GoAway.to_string(), "Session reset by peer");
        assert_eq!(
            YamuxError::StreamResetByPeer.to_string(),
            "Stream reset by peer"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::UnexpectedEof, "Connection lost");
        let yamux_err: YamuxError = io_err.into();

        match &yamux_err {
            YamuxError::Io(e) => assert_eq!(e.kind(), ErrorKind::UnexpectedEof),
            _ => panic!("Expected YamuxError::Io"),
        }

        // Clones share the same underlying I/O error
        let cloned = yamux_err.clone();
        assert_eq!(cloned.to_string(), yamux_err.to_string());
    }

    #[test]
    fn test_into_io_error_kinds() {
        let err: IoError = YamuxError::StreamResetByPeer.into();
        assert_eq!(err.kind(), ErrorKind::ConnectionReset);

        let err: IoError = YamuxError::StreamClosed.into();
        assert_eq!(err.kind(), ErrorKind::BrokenPipe);

        let err: IoError = YamuxError::UnexpectedEof { header: None }.into();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);

        let err: IoError = YamuxError::InvalidVersion(9).into();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        let inner = err.into_inner().unwrap();
        assert_eq!(inner.to_string(), "Invalid frame version 9");
    }

    #[test]
    fn test_protocol_error_classification() {
        assert!(YamuxError::InvalidVersion(1).is_protocol_error());
        assert!(YamuxError::InvalidFrameType(7).is_protocol_error());
        assert!(!YamuxError::UnexpectedEof { header: None }.is_protocol_error());
        assert!(!YamuxError::PingTimeout.is_protocol_error());
    }

    #[test]
    fn test_is_recoverable() {
        let would_block = YamuxError::from(IoError::new(ErrorKind::WouldBlock, ""));
        assert!(would_block.is_recoverable());

        assert!(YamuxError::PingTimeout.is_recoverable());
        assert!(YamuxError::ReceiveWindowExceeded.is_recoverable());
        assert!(YamuxError::InvalidStreamId(2).is_recoverable());

        assert!(!YamuxError::SessionClosed.is_recoverable());
        assert!(!YamuxError::GoAway.is_recoverable());
        assert!(!YamuxError::InvalidVersion(2).is_recoverable());
        assert!(!YamuxError::Config("Invalid".to_string()).is_recoverable());

        let other_io_err = YamuxError::from(IoError::new(ErrorKind::UnexpectedEof, ""));
        assert!(!other_io_err.is_recoverable());
    }
}
