//! wire-level frame header bit layout, decode/encode, and masking.

use bytes::{BufMut, BytesMut};

use crate::errors::ProtocolError;

/// the interpretation of a frame's "payload data" (RFC 6455 §5.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// continuation of a fragmented message
    Continue,
    /// a text data frame
    Text,
    /// a binary data frame
    Binary,
    /// a close control frame
    Close,
    /// a ping control frame
    Ping,
    /// a pong control frame
    Pong,
}

impl OpCode {
    /// get the wire value of this opcode
    pub fn as_u8(&self) -> u8 {
        match self {
            OpCode::Continue => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    /// is this a control opcode (payload <= 125 bytes, never fragmented)?
    pub fn is_control(&self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    pub(crate) fn from_u8(val: u8) -> Result<Self, ProtocolError> {
        match val {
            0x0 => Ok(OpCode::Continue),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(ProtocolError::InvalidOpcode(other)),
        }
    }
}

/// a decoded frame header, plus the byte range of its (still masked) payload
/// within the slice it was parsed from
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// FIN bit: is this the final frame of a message?
    pub fin: bool,
    /// opcode this frame carries
    pub opcode: OpCode,
    /// payload length in bytes, as declared by the header
    pub payload_len: u64,
    /// total bytes this frame occupies (header + payload) in the source slice
    pub frame_len: usize,
    /// offset of the payload within the source slice
    pub payload_offset: usize,
}

/// outcome of attempting to decode a frame header, distinguishing a
/// configured-size violation (not itself a wire-protocol violation) from a
/// genuine [`ProtocolError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDecodeError {
    /// the frame violates RFC 6455 framing rules
    Protocol(ProtocolError),
    /// the declared payload length exceeds the configured maximum
    TooLarge {
        /// length the peer declared in the frame header
        declared: u64,
        /// the configured maximum
        max: u64,
    },
}

impl From<ProtocolError> for FrameDecodeError {
    fn from(e: ProtocolError) -> Self {
        FrameDecodeError::Protocol(e)
    }
}

/// attempt to parse one frame header from the front of `src`
///
/// returns `Ok(None)` when `src` does not yet hold a complete header plus
/// payload (the caller should read more bytes and retry); never mutates or
/// consumes `src` itself; advancing past a parsed frame is the caller's job.
/// the MASK bit is rejected outright (server frames must be unmasked), so a
/// successfully parsed header's payload is ready to use as-is.
pub fn try_parse_frame(
    src: &[u8],
    max_frame_size: usize,
) -> Result<Option<FrameHeader>, FrameDecodeError> {
    if src.len() < 2 {
        return Ok(None);
    }

    let b0 = src[0];
    let b1 = src[1];

    let fin = b0 & 0x80 != 0;
    let rsv = b0 & 0x70;
    if rsv != 0 {
        return Err(ProtocolError::ReservedBitSet.into());
    }
    let opcode = OpCode::from_u8(b0 & 0x0f)?;

    let masked = b1 & 0x80 != 0;
    if masked {
        return Err(ProtocolError::MaskedServerFrame.into());
    }

    let len_field = b1 & 0x7f;
    let (payload_len, len_bytes): (u64, usize) = match len_field {
        0..=125 => (len_field as u64, 0),
        126 => {
            if src.len() < 4 {
                return Ok(None);
            }
            (u16::from_be_bytes([src[2], src[3]]) as u64, 2)
        }
        127 => {
            if src.len() < 10 {
                return Ok(None);
            }
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&src[2..10]);
            let len = u64::from_be_bytes(buf);
            if len & (1 << 63) != 0 {
                return Err(ProtocolError::InvalidLength.into());
            }
            (len, 8)
        }
        _ => unreachable!("7-bit field"),
    };

    if opcode.is_control() {
        if !fin {
            return Err(ProtocolError::FragmentedControlFrame.into());
        }
        if payload_len > 125 {
            return Err(ProtocolError::ControlFrameTooBig(payload_len as usize).into());
        }
    }

    if payload_len > max_frame_size as u64 {
        return Err(FrameDecodeError::TooLarge {
            declared: payload_len,
            max: max_frame_size as u64,
        });
    }

    let payload_offset = 2 + len_bytes;
    let frame_len = payload_offset + payload_len as usize;
    if src.len() < frame_len {
        return Ok(None);
    }

    Ok(Some(FrameHeader {
        fin,
        opcode,
        payload_len,
        frame_len,
        payload_offset,
    }))
}

/// encode one client-to-server frame: FIN=1, the given opcode, a fresh mask
/// key, and the masked payload. writes directly into `dst`.
pub fn encode_frame(dst: &mut BytesMut, opcode: OpCode, payload: &[u8], mask: [u8; 4]) {
    let len = payload.len();

    dst.put_u8(0x80 | opcode.as_u8());

    if len <= 125 {
        dst.put_u8(0x80 | len as u8);
    } else if len <= u16::MAX as usize {
        dst.put_u8(0x80 | 126);
        dst.put_u16(len as u16);
    } else {
        dst.put_u8(0x80 | 127);
        dst.put_u64(len as u64);
    }

    dst.extend_from_slice(&mask);

    let start = dst.len();
    dst.extend_from_slice(payload);
    apply_mask(&mut dst[start..], mask);
}

/// XOR each byte of `data` in place with `mask[i % 4]`
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}
