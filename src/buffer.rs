//! the inbound ring buffer: a contiguous staging area frames are parsed out
//! of, implemented on top of [`bytes::BytesMut`]'s split/advance machinery
//! rather than a literal circular index, since `BytesMut` already gives us
//! "compact when the tail runs low on room" for free via `reserve`.

use std::io::{self, Read};

use bytes::{Bytes, BytesMut};

use crate::frame::{try_parse_frame, FrameDecodeError, FrameHeader};

const MIN_READ_CHUNK: usize = 4096;

/// the connection's inbound staging buffer
pub struct RingBuffer {
    data: BytesMut,
}

impl RingBuffer {
    pub fn new() -> Self {
        Self {
            data: BytesMut::with_capacity(MIN_READ_CHUNK),
        }
    }

    /// bytes currently buffered but not yet consumed
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// prime the buffer with bytes already read from the wire (e.g. ones
    /// read past the handshake's `\r\n\r\n` terminator)
    pub fn seed(&mut self, bytes: BytesMut) {
        self.data.unsplit(bytes);
    }

    /// read once from `reader` into spare capacity at the tail
    ///
    /// grows the buffer to have room for at least one more maximum-size
    /// frame. returns the number of bytes read (0 means EOF).
    pub fn read_from<R: Read>(&mut self, reader: &mut R, max_frame_size: usize) -> io::Result<usize> {
        let want = (max_frame_size + 14)
            .saturating_sub(self.data.len())
            .max(MIN_READ_CHUNK);
        let filled = self.data.len();
        self.data.resize(filled + want, 0);
        match reader.read(&mut self.data[filled..filled + want]) {
            Ok(n) => {
                self.data.truncate(filled + n);
                Ok(n)
            }
            Err(e) => {
                self.data.truncate(filled);
                Err(e)
            }
        }
    }

    /// attempt to decode one frame header from the buffered bytes, without
    /// consuming anything
    pub fn try_parse(&self, max_frame_size: usize) -> Result<Option<FrameHeader>, FrameDecodeError> {
        try_parse_frame(&self.data, max_frame_size)
    }

    /// remove a fully-parsed frame from the front of the buffer and return
    /// its payload as a zero-copy [`Bytes`] view (no bytes are copied: the
    /// returned handle shares the buffer's allocation via refcounting)
    ///
    /// server frames are never masked (enforced by [`try_parse_frame`]), so
    /// the returned bytes are already in their final, usable form.
    pub fn take_payload(&mut self, header: &FrameHeader) -> Bytes {
        let frame = self.data.split_to(header.frame_len);
        frame.freeze().slice(header.payload_offset..header.frame_len)
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}
