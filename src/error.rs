use thiserror::Error;

/// HTTP/2 error codes (RFC 7540 Section 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    pub fn from_u32(v: u32) -> Self {
        match v {
            0x0 => Self::NoError,
            0x1 => Self::ProtocolError,
            0x2 => Self::InternalError,
            0x3 => Self::FlowControlError,
            0x4 => Self::SettingsTimeout,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSizeError,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::CompressionError,
            0xa => Self::ConnectError,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            _ => Self::InternalError,
        }
    }

    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Errors produced by the session engine.
///
/// Cloneable so a single connection failure can fan out to every open
/// stream and every queued completion callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Connection-level protocol fault; carried in the GO_AWAY we send.
    #[error("{code:?}/{reason}")]
    Protocol { code: ErrorCode, reason: String },
    /// Stream-level fault; carried in a RST_STREAM on that stream.
    #[error("stream {id} error: {code:?}")]
    Stream { id: u32, code: ErrorCode },
    /// Frame decoding error (truncated, invalid payload, bad size).
    #[error("frame error: {0}")]
    Frame(String),
    /// The transport closed without a GO_AWAY, or the session terminated.
    #[error("closed channel")]
    ClosedChannel,
    /// The idle timeout expired while the close sequence was in flight.
    #[error("idle timeout {0} ms")]
    IdleTimeout(u64),
    /// The session reached an invalid state for the requested operation.
    #[error("{0}")]
    InvalidState(String),
    /// The caller passed an argument the operation rejects.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Transport write failure.
    #[error("I/O error: {0}")]
    Io(String),
}

impl SessionError {
    /// Builds the failure delivered to streams and listeners for a
    /// protocol-level fault.
    pub(crate) fn protocol(code: ErrorCode, reason: &str) -> Self {
        Self::Protocol {
            code,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_round_trip() {
        for code in 0..=0xd {
            assert_eq!(ErrorCode::from_u32(code).code(), code);
        }
    }

    #[test]
    fn unknown_error_code_maps_to_internal() {
        assert_eq!(ErrorCode::from_u32(0xff), ErrorCode::InternalError);
    }

    #[test]
    fn protocol_error_display() {
        let e = SessionError::protocol(ErrorCode::ProtocolError, "duplicate_stream");
        assert_eq!(e.to_string(), "ProtocolError/duplicate_stream");
    }
}
