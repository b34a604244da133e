use thiserror::Error;

/// top level error returned by every [`crate::Connection`] operation
#[derive(Debug, Error)]
pub enum WsError {
    /// uri scheme/host malformed, or a configuration value out of range
    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    /// underlying socket error (connect, read, write, unexpected EOF)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// handshake did not complete before the configured timeout
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// handshake response could not be parsed, or exceeded the header size guard
    #[error("malformed handshake response: {0}")]
    HandshakeMalformed(String),

    /// server responded with a non-101 status
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// `Sec-WebSocket-Accept` did not match the expected hash of our nonce
    #[error("handshake accept-key mismatch")]
    HandshakeAcceptMismatch,

    /// wire-level protocol violation, see [`ProtocolError`]
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// declared frame payload length exceeds the configured max frame size
    #[error("frame too large: declared {declared} bytes, max is {max}")]
    FrameTooLarge {
        /// length the peer declared in the frame header
        declared: u64,
        /// the configured maximum
        max: u64,
    },

    /// `recv` was called while a previously returned payload is still pinned
    #[error("recv called while a payload is still pinned; call release_payload first")]
    PinOutstanding,

    /// a non-blocking send could not be enqueued without blocking
    #[error("operation would block")]
    WouldBlock,

    /// the peer went away (EOF, or the transport dropped) without a CLOSE handshake
    #[error("connection closed abnormally")]
    ConnectionClosedAbnormally,

    /// the CLOSE handshake completed; further operations are rejected
    #[error("connection already closed")]
    ConnectionClosedNormally,

    /// an operation was attempted while the connection was not `Open`
    #[error("connection is not open")]
    NotOpen,
}

/// errors raised while decoding a frame from bytes, or validating its contents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// a frame arrived from the server with the MASK bit set
    #[error("server frame must not be masked")]
    MaskedServerFrame,

    /// one of RSV1/RSV2/RSV3 was set; no extension negotiates them
    #[error("reserved bit set with no extension negotiated")]
    ReservedBitSet,

    /// opcode outside `{0x0,0x1,0x2,0x8,0x9,0xA}`
    #[error("invalid opcode {0:#x}")]
    InvalidOpcode(u8),

    /// an 8-byte extended length field had its high bit set
    #[error("invalid frame length encoding")]
    InvalidLength,

    /// a control frame (opcode >= 0x8) had FIN=0
    #[error("control frame must not be fragmented")]
    FragmentedControlFrame,

    /// a control frame payload exceeded 125 bytes
    #[error("control frame payload too large: {0} bytes")]
    ControlFrameTooBig(usize),

    /// a CONTINUATION frame arrived with no fragmented message in progress
    #[error("continuation frame with no fragmented message in progress")]
    MissingInitialFragment,

    /// a TEXT/BINARY frame arrived while a fragmented message was in progress
    #[error("data frame received while a fragmented message is in progress")]
    FragmentInProgress,

    /// a TEXT message (or fragment sequence) was not valid UTF-8
    #[error("invalid utf-8 in text message")]
    InvalidUtf8,

    /// a CLOSE frame's body was a single byte (neither empty nor >= 2 bytes)
    #[error("invalid close frame payload length")]
    InvalidClosePayload,

    /// a CLOSE frame carried a status code outside the permitted ranges
    #[error("invalid close code {0}")]
    InvalidCloseCode(u16),
}

impl ProtocolError {
    /// the CLOSE status code this protocol violation should be reported with
    pub fn close_code(&self) -> u16 {
        match self {
            ProtocolError::InvalidUtf8 => 1007,
            _ => 1002,
        }
    }
}
