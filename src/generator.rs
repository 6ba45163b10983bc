//! Outbound frame generation.
//!
//! The generator turns typed frames into wire bytes against the flusher's
//! write buffer. Its knobs track the peer's SETTINGS: DATA emission is
//! capped at the peer's MAX_FRAME_SIZE, and header blocks larger than the
//! peer's MAX_HEADER_LIST_SIZE are refused before they poison the HPACK
//! state. HEADER_TABLE_SIZE is held for the header codec that produces the
//! opaque blocks.

use std::sync::atomic::{AtomicU32, Ordering};

use bytes::BytesMut;

use crate::error::SessionError;
use crate::frame::{DataFrame, Frame};

pub struct Generator {
    header_table_size: AtomicU32,
    max_frame_size: AtomicU32,
    /// 0 means unlimited.
    max_header_list_size: AtomicU32,
}

impl Generator {
    pub fn new() -> Self {
        Self {
            header_table_size: AtomicU32::new(4096),
            max_frame_size: AtomicU32::new(16_384),
            max_header_list_size: AtomicU32::new(0),
        }
    }

    pub fn set_header_table_size(&self, size: u32) {
        self.header_table_size.store(size, Ordering::Release);
    }

    pub fn header_table_size(&self) -> u32 {
        self.header_table_size.load(Ordering::Acquire)
    }

    pub fn set_max_frame_size(&self, size: u32) {
        self.max_frame_size.store(size, Ordering::Release);
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size.load(Ordering::Acquire)
    }

    pub fn set_max_header_list_size(&self, size: u32) {
        self.max_header_list_size.store(size, Ordering::Release);
    }

    pub fn max_header_list_size(&self) -> u32 {
        self.max_header_list_size.load(Ordering::Acquire)
    }

    /// Generate one control (non-DATA) frame. Returns the frame bytes
    /// appended to `buf`. Synthetic frames generate nothing.
    pub fn control(&self, buf: &mut BytesMut, frame: &Frame) -> Result<usize, SessionError> {
        match frame {
            Frame::Headers(headers) => {
                let limit = self.max_header_list_size();
                if limit > 0 && headers.block.len() > limit as usize {
                    return Err(SessionError::Frame(format!(
                        "header block {} exceeds peer limit {}",
                        headers.block.len(),
                        limit
                    )));
                }
                Ok(headers.encode(buf))
            }
            Frame::Priority(priority) => Ok(priority.encode(buf)),
            Frame::Reset(reset) => Ok(reset.encode(buf)),
            Frame::Settings(settings) => Ok(settings.encode(buf)),
            Frame::PushPromise(push) => {
                let limit = self.max_header_list_size();
                if limit > 0 && push.block.len() > limit as usize {
                    return Err(SessionError::Frame(format!(
                        "header block {} exceeds peer limit {}",
                        push.block.len(),
                        limit
                    )));
                }
                Ok(push.encode(buf))
            }
            Frame::Ping(ping) => Ok(ping.encode(buf)),
            Frame::GoAway(go_away) => Ok(go_away.encode(buf)),
            Frame::WindowUpdate(window_update) => Ok(window_update.encode(buf)),
            Frame::Disconnect | Frame::Failure(_) => Ok(0),
            Frame::Data(_) => Err(SessionError::InvalidArgument(
                "DATA frames go through data()",
            )),
        }
    }

    /// Generate one DATA frame carrying up to `len` bytes of `frame`'s
    /// payload starting at `offset`, capped at the peer's max frame size.
    /// Returns `(frame_bytes, data_bytes)`.
    pub fn data(
        &self,
        buf: &mut BytesMut,
        frame: &DataFrame,
        offset: usize,
        len: usize,
    ) -> (usize, usize) {
        let capped = len.min(self.max_frame_size() as usize);
        let frame_bytes = frame.encode_slice(buf, offset, capped);
        (frame_bytes, capped)
    }
}

impl Default for Generator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{self, PingFrame};
    use bytes::Bytes;

    #[test]
    fn data_capped_at_max_frame_size() {
        let generator = Generator::new();
        generator.set_max_frame_size(16_384);
        let frame = DataFrame::new(1, Bytes::from(vec![0u8; 40_000]), true);
        let mut buf = BytesMut::new();
        let (frame_bytes, data_bytes) = generator.data(&mut buf, &frame, 0, 40_000);
        assert_eq!(data_bytes, 16_384);
        assert_eq!(frame_bytes, 16_384 + frame::FRAME_HEADER_LEN);
        // Partial emission withholds END_STREAM.
        let header = frame::decode_frame_header(&buf).unwrap();
        assert_eq!(header.flags, 0);
    }

    #[test]
    fn control_rejects_data() {
        let generator = Generator::new();
        let mut buf = BytesMut::new();
        let frame = Frame::Data(DataFrame::new(1, Bytes::new(), false));
        assert!(generator.control(&mut buf, &frame).is_err());
    }

    #[test]
    fn synthetic_frames_generate_nothing() {
        let generator = Generator::new();
        let mut buf = BytesMut::new();
        assert_eq!(generator.control(&mut buf, &Frame::Disconnect).unwrap(), 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn control_emits_ping() {
        let generator = Generator::new();
        let mut buf = BytesMut::new();
        let n = generator
            .control(&mut buf, &Frame::Ping(PingFrame::new([0; 8])))
            .unwrap();
        assert_eq!(n, buf.len());
        assert_eq!(n, frame::FRAME_HEADER_LEN + 8);
    }

    #[test]
    fn oversized_header_block_refused() {
        let generator = Generator::new();
        generator.set_max_header_list_size(16);
        let mut buf = BytesMut::new();
        let frame = Frame::Headers(crate::frame::HeadersFrame::new(
            1,
            Bytes::from(vec![0u8; 32]),
            false,
        ));
        assert!(generator.control(&mut buf, &frame).is_err());
    }
}
