//! SETTINGS identifiers, range rules, and local endpoint configuration.

use crate::error::{ErrorCode, SessionError};

/// Size of the HPACK dynamic table the sender will use for encoding.
pub const HEADER_TABLE_SIZE: u16 = 0x1;
/// Whether the sender is willing to receive PUSH_PROMISE frames.
pub const ENABLE_PUSH: u16 = 0x2;
/// How many streams the sender lets its peer keep open at once.
pub const MAX_CONCURRENT_STREAMS: u16 = 0x3;
/// Send window the sender grants to every newly opened stream.
pub const INITIAL_WINDOW_SIZE: u16 = 0x4;
/// Largest frame payload the sender is willing to receive.
pub const MAX_FRAME_SIZE: u16 = 0x5;
/// Advisory cap on the uncompressed size of a header list.
pub const MAX_HEADER_LIST_SIZE: u16 = 0x6;

/// Local endpoint settings, used to build the initial SETTINGS frame.
#[derive(Debug, Clone)]
pub struct Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: 65_535,
            max_frame_size: 16_384,
            max_header_list_size: None,
        }
    }
}

impl Settings {
    /// The `(id, value)` pairs this configuration advertises.
    pub fn to_pairs(&self) -> Vec<(u16, u32)> {
        let mut pairs = vec![
            (HEADER_TABLE_SIZE, self.header_table_size),
            (ENABLE_PUSH, u32::from(self.enable_push)),
        ];
        if let Some(v) = self.max_concurrent_streams {
            pairs.push((MAX_CONCURRENT_STREAMS, v));
        }
        pairs.push((INITIAL_WINDOW_SIZE, self.initial_window_size));
        pairs.push((MAX_FRAME_SIZE, self.max_frame_size));
        if let Some(v) = self.max_header_list_size {
            pairs.push((MAX_HEADER_LIST_SIZE, v));
        }
        pairs
    }
}

/// Decode a SETTINGS payload into ordered `(id, value)` pairs.
///
/// Unknown identifiers are kept (the session ignores them); recognized
/// identifiers are range-checked.
pub fn decode_payload(buf: &[u8]) -> Result<Vec<(u16, u32)>, SessionError> {
    if !buf.len().is_multiple_of(6) {
        return Err(SessionError::Frame("SETTINGS length".to_string()));
    }
    let mut pairs = Vec::with_capacity(buf.len() / 6);
    for chunk in buf.chunks_exact(6) {
        let id = u16::from_be_bytes([chunk[0], chunk[1]]);
        let value = u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]);
        check_range(id, value)?;
        pairs.push((id, value));
    }
    Ok(pairs)
}

/// RFC 7540 Section 6.5.2 bounds for the identifiers that have them: the
/// push flag is a boolean, the stream window fits 31 bits, and the frame
/// size stays within `[2^14, 2^24 - 1]`.
fn check_range(id: u16, value: u32) -> Result<(), SessionError> {
    match id {
        MAX_FRAME_SIZE if !(16_384..=16_777_215).contains(&value) => Err(
            SessionError::protocol(ErrorCode::ProtocolError, "invalid_max_frame_size"),
        ),
        INITIAL_WINDOW_SIZE if value > 0x7fff_ffff => Err(SessionError::protocol(
            ErrorCode::FlowControlError,
            "invalid_initial_window_size",
        )),
        ENABLE_PUSH if value > 1 => Err(SessionError::protocol(
            ErrorCode::ProtocolError,
            "invalid_enable_push",
        )),
        _ => Ok(()),
    }
}
