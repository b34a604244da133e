//! the receive state machine and the public connection façade.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use rand::RngCore;
use tracing::{debug, trace, warn};

use crate::buffer::RingBuffer;
use crate::config::Config;
use crate::errors::{ProtocolError, WsError};
use crate::frame::{encode_frame, FrameDecodeError, FrameHeader, OpCode};
use crate::protocol::perform_handshake;
use crate::uri::WsUri;
use crate::utf8::{self, Utf8Validator};

const MAX_CLOSE_REASON_BYTES: usize = 123;

/// lifecycle state of a [`Connection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// handshake in progress
    Connecting,
    /// handshake complete, frames may be sent and received
    Open,
    /// we sent CLOSE, awaiting the peer's
    ClosingLocal,
    /// the peer sent CLOSE, we must echo
    ClosingRemote,
    /// the close handshake completed, or the transport dropped
    Closed,
}

/// the caller-visible shape of one surfaced data frame or fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// an initial or complete TEXT message
    Text,
    /// an initial or complete BINARY message
    Binary,
    /// a non-initial fragment of a message already in progress
    Continuation,
    /// a CLOSE control frame
    Close,
}

/// one message fragment delivered by [`Connection::recv`]
///
/// `payload` is a zero-copy [`Bytes`] view into the connection's inbound
/// ring buffer. Receiving a `Frame` pins the connection: no further `recv`
/// may complete until [`Connection::release_payload`] is called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// what kind of frame this is
    pub frame_type: FrameType,
    /// whether this is the last fragment of its message (FIN bit)
    pub is_final: bool,
    /// the frame's payload, a zero-copy view into the inbound ring buffer
    pub payload: Bytes,
}

struct Reassembly {
    utf8: Option<Utf8Validator>,
}

/// the byte-stream abstraction `Connection` is generic over
///
/// implemented here for [`std::net::TcpStream`]; a caller wiring this core
/// over a different transport (a Unix socket, an in-memory pipe for tests)
/// implements it directly.
pub trait Transport: Read + Write + AsRawFd {
    /// bound how long the next `read` may block; `None` blocks indefinitely
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
    /// shut down both halves of the transport
    fn shutdown(&self) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

fn is_valid_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
}

/// a single-connection, non-blocking-transport WebSocket client core
pub struct Connection<S> {
    socket: S,
    status: Status,
    inbound: RingBuffer,
    outbound_scratch: BytesMut,
    config: Config,
    reassembly: Option<Reassembly>,
    pinned: bool,
    closed_reported: bool,
}

impl Connection<TcpStream> {
    /// connect to a `ws://host[:port]/path` target over plain TCP and run
    /// the opening handshake
    pub fn connect(uri: &str, config: Config) -> Result<Self, WsError> {
        let parsed = WsUri::parse(uri)?;
        debug!(host = %parsed.host, port = parsed.port, "connecting");
        let socket = TcpStream::connect((parsed.host.as_str(), parsed.port))?;
        socket.set_nodelay(true).ok();
        Self::handshake(socket, &parsed, config)
    }
}

impl<S: Transport> Connection<S> {
    /// run the opening handshake over an already-connected transport
    pub fn handshake(mut socket: S, uri: &WsUri, config: Config) -> Result<Self, WsError> {
        let outcome = match perform_handshake(&mut socket, uri, &config) {
            Ok(outcome) => outcome,
            Err(err) => {
                let _ = socket.shutdown();
                return Err(err);
            }
        };

        let mut inbound = RingBuffer::new();
        inbound.seed(outcome.trailing);
        debug!("handshake complete, connection open");

        Ok(Self {
            socket,
            status: Status::Open,
            inbound,
            outbound_scratch: BytesMut::new(),
            config,
            reassembly: None,
            pinned: false,
            closed_reported: false,
        })
    }

    /// current lifecycle state
    pub fn status(&self) -> Status {
        self.status
    }

    /// the underlying descriptor, for external readiness polling
    pub fn fileno(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// send a TEXT message (FIN=1) while `Open`
    pub fn send_text(&mut self, text: &str) -> Result<(), WsError> {
        self.require_open()?;
        self.send_data(OpCode::Text, text.as_bytes())
    }

    /// send a BINARY message (FIN=1) while `Open`
    pub fn send_binary(&mut self, data: &[u8]) -> Result<(), WsError> {
        self.require_open()?;
        self.send_data(OpCode::Binary, data)
    }

    /// receive the next data frame or fragment
    ///
    /// `timeout_ms`: `None` blocks indefinitely; `Some(0)` performs a single
    /// non-blocking poll; `Some(n)` waits up to `n` milliseconds. Returns
    /// `Ok(None)` on timeout with no frame available (not an error).
    pub fn recv(&mut self, timeout_ms: Option<u64>) -> Result<Option<Frame>, WsError> {
        if self.pinned {
            return Err(WsError::PinOutstanding);
        }
        if self.status == Status::Closed {
            return Err(if self.closed_reported {
                WsError::NotOpen
            } else {
                self.closed_reported = true;
                WsError::ConnectionClosedNormally
            });
        }

        let deadline = timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));

        loop {
            if let Some(frame) = self.drain_one()? {
                return Ok(Some(frame));
            }
            if self.status == Status::Closed {
                return Ok(None);
            }

            let read_timeout = match deadline {
                None => None,
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        // still attempt one poll so `Some(0)` behaves as a
                        // single non-blocking read rather than a no-op
                        Some(Duration::from_micros(1))
                    } else {
                        Some(d - now)
                    }
                }
            };
            self.socket.set_read_timeout(read_timeout)?;

            match self.inbound.read_from(&mut self.socket, self.config.max_frame_size) {
                Ok(0) => {
                    let was_closing =
                        matches!(self.status, Status::ClosingLocal | Status::ClosingRemote);
                    self.status = Status::Closed;
                    self.closed_reported = true;
                    if was_closing {
                        debug!("socket closed after close handshake");
                        return Ok(None);
                    }
                    warn!("peer went away without a close frame");
                    return Err(WsError::ConnectionClosedAbnormally);
                }
                Ok(n) => trace!(bytes = n, "read from socket"),
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    if let Some(d) = deadline {
                        if Instant::now() >= d {
                            return Ok(None);
                        }
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// release the pin taken by the last [`Connection::recv`]; a no-op if
    /// no pin is outstanding
    pub fn release_payload(&mut self) {
        self.pinned = false;
    }

    /// send a CLOSE frame with the given status code and optional reason
    /// (UTF-8, at most 123 bytes), transitioning `Open -> ClosingLocal`
    pub fn send_close(&mut self, code: u16, reason: &str) -> Result<(), WsError> {
        self.require_open()?;
        if reason.len() > MAX_CLOSE_REASON_BYTES {
            return Err(WsError::ConfigInvalid(format!(
                "close reason is {} bytes, max is {MAX_CLOSE_REASON_BYTES}",
                reason.len()
            )));
        }
        self.send_close_internal(code, Some(reason))?;
        self.status = Status::ClosingLocal;
        Ok(())
    }

    /// best-effort CLOSE (code 1000) if still `Open`, then socket shutdown;
    /// idempotent, and safe to call while a payload is pinned
    ///
    /// `Bytes` payloads handed out by `recv` are independently refcounted
    /// views, not raw borrows of the connection, so an outstanding pin is
    /// simply cleared rather than invalidated in place.
    pub fn close(&mut self) {
        if self.status == Status::Open {
            let _ = self.send_close_internal(1000, None);
        }
        let _ = self.socket.shutdown();
        self.status = Status::Closed;
        self.pinned = false;
        self.reassembly = None;
        debug!("connection closed");
    }

    fn require_open(&self) -> Result<(), WsError> {
        match self.status {
            Status::Open => Ok(()),
            _ => Err(WsError::NotOpen),
        }
    }

    fn send_data(&mut self, opcode: OpCode, payload: &[u8]) -> Result<(), WsError> {
        let mut frame = BytesMut::with_capacity(payload.len() + 14);
        let mask = self.fresh_mask();
        encode_frame(&mut frame, opcode, payload, mask);
        self.write_all_or_would_block(&frame)
    }

    fn send_control(&mut self, opcode: OpCode, payload: &[u8]) -> Result<(), WsError> {
        self.outbound_scratch.clear();
        let mask = self.fresh_mask();
        encode_frame(&mut self.outbound_scratch, opcode, payload, mask);
        let scratch = std::mem::take(&mut self.outbound_scratch);
        let result = self.write_all_or_would_block(&scratch);
        self.outbound_scratch = scratch;
        result
    }

    fn send_close_internal(&mut self, code: u16, reason: Option<&str>) -> Result<(), WsError> {
        let mut body = Vec::with_capacity(2 + reason.map(str::len).unwrap_or(0));
        body.extend_from_slice(&code.to_be_bytes());
        if let Some(reason) = reason {
            body.extend_from_slice(reason.as_bytes());
        }
        self.send_control(OpCode::Close, &body)
    }

    fn write_all_or_would_block(&mut self, bytes: &[u8]) -> Result<(), WsError> {
        match self.socket.write_all(bytes) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(WsError::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }

    fn fresh_mask(&self) -> [u8; 4] {
        let mut mask = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut mask);
        mask
    }

    /// pull and process frames already buffered until a caller-visible frame
    /// is ready, or the buffer runs dry; control frames are handled and
    /// replied to inline, never surfaced
    fn drain_one(&mut self) -> Result<Option<Frame>, WsError> {
        loop {
            let header = match self.inbound.try_parse(self.config.max_frame_size) {
                Ok(Some(header)) => header,
                Ok(None) => return Ok(None),
                Err(FrameDecodeError::TooLarge { declared, max }) => {
                    return Err(self.fail_frame_too_large(declared, max));
                }
                Err(FrameDecodeError::Protocol(err)) => return Err(self.fail_protocol(err)),
            };

            match header.opcode {
                OpCode::Ping => {
                    let payload = self.inbound.take_payload(&header);
                    trace!(len = payload.len(), "ping received, queuing pong");
                    self.send_control(OpCode::Pong, &payload)?;
                }
                OpCode::Pong => {
                    let _ = self.inbound.take_payload(&header);
                }
                OpCode::Close => {
                    let payload = self.inbound.take_payload(&header);
                    return Ok(Some(self.handle_close(payload)?));
                }
                OpCode::Continue => return Ok(Some(self.handle_continuation(&header)?)),
                OpCode::Text | OpCode::Binary => return Ok(Some(self.handle_data_start(&header)?)),
            }
        }
    }

    fn handle_data_start(&mut self, header: &FrameHeader) -> Result<Frame, WsError> {
        if self.reassembly.is_some() {
            return Err(self.fail_protocol(ProtocolError::FragmentInProgress));
        }

        let payload = self.inbound.take_payload(header);
        let frame_type = if header.opcode == OpCode::Text {
            FrameType::Text
        } else {
            FrameType::Binary
        };

        if header.fin {
            if frame_type == FrameType::Text && utf8::validate_complete(&payload).is_err() {
                return Err(self.fail_protocol(ProtocolError::InvalidUtf8));
            }
            self.pinned = true;
            return Ok(Frame { frame_type, is_final: true, payload });
        }

        let mut utf8 = None;
        if frame_type == FrameType::Text {
            let mut validator = Utf8Validator::new();
            if validator.push(&payload).is_err() {
                return Err(self.fail_protocol(ProtocolError::InvalidUtf8));
            }
            utf8 = Some(validator);
        }
        self.reassembly = Some(Reassembly { utf8 });
        self.pinned = true;
        Ok(Frame { frame_type, is_final: false, payload })
    }

    fn handle_continuation(&mut self, header: &FrameHeader) -> Result<Frame, WsError> {
        let payload = self.inbound.take_payload(header);

        if self.reassembly.is_none() {
            return Err(self.fail_protocol(ProtocolError::MissingInitialFragment));
        }

        let push_ok = self
            .reassembly
            .as_mut()
            .and_then(|r| r.utf8.as_mut())
            .map(|v| v.push(&payload).is_ok())
            .unwrap_or(true);
        if !push_ok {
            return Err(self.fail_protocol(ProtocolError::InvalidUtf8));
        }

        let is_final = header.fin;
        if is_final {
            let finish_ok = self
                .reassembly
                .as_ref()
                .and_then(|r| r.utf8.as_ref())
                .map(|v| v.finish().is_ok())
                .unwrap_or(true);
            if !finish_ok {
                return Err(self.fail_protocol(ProtocolError::InvalidUtf8));
            }
            self.reassembly = None;
        }

        self.pinned = true;
        Ok(Frame {
            frame_type: FrameType::Continuation,
            is_final,
            payload,
        })
    }

    fn handle_close(&mut self, payload: Bytes) -> Result<Frame, WsError> {
        if !payload.is_empty() && payload.len() < 2 {
            return Err(self.fail_protocol(ProtocolError::InvalidClosePayload));
        }

        let mut echo_code = 1000u16;
        if payload.len() >= 2 {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !is_valid_close_code(code) {
                return Err(self.fail_protocol(ProtocolError::InvalidCloseCode(code)));
            }
            if utf8::validate_complete(&payload[2..]).is_err() {
                return Err(self.fail_protocol(ProtocolError::InvalidUtf8));
            }
            echo_code = code;
        }

        if self.status == Status::ClosingLocal {
            self.status = Status::Closed;
            debug!("close handshake complete");
        } else {
            self.status = Status::ClosingRemote;
            self.send_control(OpCode::Close, &echo_code.to_be_bytes())?;
            debug!(code = echo_code, "echoed close");
        }

        self.pinned = true;
        Ok(Frame {
            frame_type: FrameType::Close,
            is_final: true,
            payload,
        })
    }

    fn fail_protocol(&mut self, err: ProtocolError) -> WsError {
        warn!(%err, "protocol violation, closing connection");
        let code = err.close_code();
        let _ = self.send_close_internal(code, None);
        self.status = Status::Closed;
        WsError::Protocol(err)
    }

    fn fail_frame_too_large(&mut self, declared: u64, max: u64) -> WsError {
        warn!(declared, max, "frame exceeds configured maximum, closing connection");
        let _ = self.send_close_internal(1009, None);
        self.status = Status::Closed;
        WsError::FrameTooLarge { declared, max }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_frame;
    use std::collections::VecDeque;

    struct MockTransport {
        inbound: VecDeque<u8>,
        outbound: Vec<u8>,
    }

    impl MockTransport {
        fn new(inbound: Vec<u8>) -> Self {
            Self {
                inbound: inbound.into(),
                outbound: Vec::new(),
            }
        }
    }

    impl Read for MockTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.inbound.is_empty() {
                return Ok(0);
            }
            let n = buf.len().min(self.inbound.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.inbound.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for MockTransport {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.outbound.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl AsRawFd for MockTransport {
        fn as_raw_fd(&self) -> RawFd {
            -1
        }
    }

    impl Transport for MockTransport {
        fn set_read_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
            Ok(())
        }
        fn shutdown(&self) -> io::Result<()> {
            Ok(())
        }
    }

    fn open_connection(inbound: Vec<u8>) -> Connection<MockTransport> {
        Connection {
            socket: MockTransport::new(inbound),
            status: Status::Open,
            inbound: RingBuffer::new(),
            outbound_scratch: BytesMut::new(),
            config: Config::default(),
            reassembly: None,
            pinned: false,
            closed_reported: false,
        }
    }

    #[test]
    fn delivers_a_single_final_text_frame_and_pins() {
        let mut wire = BytesMut::new();
        encode_frame(&mut wire, OpCode::Text, b"hello-sync-42", [1, 2, 3, 4]);
        let mut conn = open_connection(wire.to_vec());

        let frame = conn.recv(Some(0)).unwrap().unwrap();
        assert_eq!(frame.frame_type, FrameType::Text);
        assert!(frame.is_final);
        assert_eq!(&frame.payload[..], b"hello-sync-42");

        assert!(matches!(conn.recv(Some(0)), Err(WsError::PinOutstanding)));
        conn.release_payload();
        assert_eq!(conn.recv(Some(0)).unwrap(), None);
    }

    #[test]
    fn fragmented_message_is_delivered_as_two_frames() {
        let mut wire = BytesMut::new();
        let mut first = BytesMut::new();
        crate::frame::encode_frame(&mut first, OpCode::Text, b"foo", [9, 9, 9, 9]);
        first[0] &= 0x7f; // clear FIN: non-final fragment
        wire.extend_from_slice(&first);

        let mut second = BytesMut::new();
        crate::frame::encode_frame(&mut second, OpCode::Continue, b"bar", [1, 1, 1, 1]);
        wire.extend_from_slice(&second);

        let mut conn = open_connection(wire.to_vec());

        let a = conn.recv(Some(0)).unwrap().unwrap();
        assert_eq!(a.frame_type, FrameType::Text);
        assert!(!a.is_final);
        assert_eq!(&a.payload[..], b"foo");
        conn.release_payload();

        let b = conn.recv(Some(0)).unwrap().unwrap();
        assert_eq!(b.frame_type, FrameType::Continuation);
        assert!(b.is_final);
        assert_eq!(&b.payload[..], b"bar");
    }

    #[test]
    fn ping_triggers_pong_and_is_not_surfaced() {
        let mut wire = BytesMut::new();
        encode_frame(&mut wire, OpCode::Ping, b"abc", [1, 2, 3, 4]);
        encode_frame(&mut wire, OpCode::Text, b"after-ping", [5, 6, 7, 8]);
        let mut conn = open_connection(wire.to_vec());

        let frame = conn.recv(Some(0)).unwrap().unwrap();
        assert_eq!(frame.frame_type, FrameType::Text);
        assert_eq!(&frame.payload[..], b"after-ping");

        // outgoing frames are masked (client role), so decode the opcode and
        // mask bit directly rather than through `try_parse_frame` (which
        // rejects masked frames, since it only ever sees server traffic)
        let sent = &conn.socket.outbound;
        assert_eq!(sent[0] & 0x0f, OpCode::Pong.as_u8());
        assert_ne!(sent[1] & 0x80, 0, "outgoing frames must be masked");
    }

    #[test]
    fn continuation_without_initial_fragment_is_a_protocol_error() {
        let mut wire = BytesMut::new();
        encode_frame(&mut wire, OpCode::Continue, b"orphan", [1, 2, 3, 4]);
        let mut conn = open_connection(wire.to_vec());

        let err = conn.recv(Some(0)).unwrap_err();
        assert!(matches!(
            err,
            WsError::Protocol(ProtocolError::MissingInitialFragment)
        ));
        assert_eq!(conn.status(), Status::Closed);
    }

    #[test]
    fn oversize_declared_frame_is_rejected_before_buffering() {
        let mut wire = BytesMut::new();
        encode_frame(&mut wire, OpCode::Binary, &vec![0u8; 4096], [1, 2, 3, 4]);
        let mut conn = open_connection(wire.to_vec());
        conn.config.max_frame_size = 1024;

        let err = conn.recv(Some(0)).unwrap_err();
        assert!(matches!(
            err,
            WsError::FrameTooLarge {
                declared: 4096,
                max: 1024
            }
        ));
    }

    #[test]
    fn eof_without_close_is_abnormal() {
        let mut conn = open_connection(Vec::new());
        let err = conn.recv(Some(0)).unwrap_err();
        assert!(matches!(err, WsError::ConnectionClosedAbnormally));
        assert_eq!(conn.status(), Status::Closed);
    }

    #[test]
    fn send_text_rejected_once_not_open() {
        let mut conn = open_connection(Vec::new());
        conn.status = Status::Closed;
        assert!(matches!(conn.send_text("hi"), Err(WsError::NotOpen)));
    }
}
