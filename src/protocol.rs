//! client-side opening handshake: request encoding and response validation.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64_ENGINE;
use base64::Engine as _;
use bytes::BytesMut;
use rand::RngCore;
use sha1::{Digest, Sha1};

use crate::config::Config;
use crate::connection::Transport;
use crate::errors::WsError;
use crate::uri::WsUri;

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const MAX_HANDSHAKE_HEADER_BYTES: usize = 8 * 1024;
const READ_CHUNK: usize = 512;

/// everything the connection façade needs once the handshake has succeeded
pub(crate) struct HandshakeOutcome {
    /// bytes already read from the socket past the `\r\n\r\n` terminator:
    /// the first bytes of the frame stream, and must not be discarded
    pub trailing: BytesMut,
}

fn generate_key() -> String {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    BASE64_ENGINE.encode(nonce)
}

fn accept_hash(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(GUID.as_bytes());
    BASE64_ENGINE.encode(hasher.finalize())
}

fn build_request(uri: &WsUri, key: &str, config: &Config) -> String {
    let mut req = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n",
        path = uri.path_and_query,
        host = uri.host_header(),
        key = key,
    );
    if let Some(ua) = &config.user_agent {
        req.push_str(&format!("User-Agent: {ua}\r\n"));
    }
    if let Some(origin) = &config.origin {
        req.push_str(&format!("Origin: {origin}\r\n"));
    }
    if let Some(protocol) = &config.subprotocol {
        req.push_str(&format!("Sec-WebSocket-Protocol: {protocol}\r\n"));
    }
    req.push_str("\r\n");
    req
}

fn find_header_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

fn header_contains_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

/// run the full client handshake over an already-connected transport
///
/// bounds every read against `config.handshake_timeout_ms`: a peer that
/// accepts the TCP connection and then sends nothing must not be able to
/// hang this call forever.
pub(crate) fn perform_handshake<S: Transport>(
    stream: &mut S,
    uri: &WsUri,
    config: &Config,
) -> Result<HandshakeOutcome, WsError> {
    let key = generate_key();
    let request = build_request(uri, &key, config);
    stream.write_all(request.as_bytes())?;

    let deadline = Instant::now() + Duration::from_millis(config.handshake_timeout_ms);
    let mut buf = BytesMut::with_capacity(1024);
    let mut chunk = [0u8; READ_CHUNK];

    let header_end = loop {
        if let Some(end) = find_header_terminator(&buf) {
            break end;
        }
        if buf.len() > MAX_HANDSHAKE_HEADER_BYTES {
            return Err(WsError::HandshakeMalformed(
                "response header exceeded maximum size".into(),
            ));
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(WsError::HandshakeTimeout);
        }
        stream.set_read_timeout(Some(deadline - now))?;
        let n = match stream.read(&mut chunk) {
            Ok(n) => n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Err(WsError::HandshakeTimeout);
            }
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            return Err(WsError::HandshakeMalformed(
                "connection closed before handshake completed".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let trailing = buf.split_off(header_end);

    let mut header_storage = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut header_storage);
    response
        .parse(&buf)
        .map_err(|e| WsError::HandshakeMalformed(e.to_string()))?;

    if response.version != Some(1) {
        return Err(WsError::HandshakeMalformed("expected HTTP/1.1".into()));
    }
    let code = response
        .code
        .ok_or_else(|| WsError::HandshakeMalformed("missing status code".into()))?;
    let reason = response.reason.unwrap_or_default();
    if code != 101 || !reason.eq_ignore_ascii_case("Switching Protocols") {
        return Err(WsError::HandshakeRejected(format!("{code} {reason}")));
    }

    let headers: HashMap<String, String> = response
        .headers
        .iter()
        .map(|h| {
            (
                h.name.to_ascii_lowercase(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect();

    match headers.get("upgrade") {
        Some(v) if v.eq_ignore_ascii_case("websocket") => {}
        _ => return Err(WsError::HandshakeMalformed("missing Upgrade: websocket".into())),
    }

    match headers.get("connection") {
        Some(v) if header_contains_token(v, "upgrade") => {}
        _ => return Err(WsError::HandshakeMalformed("missing Connection: Upgrade".into())),
    }

    let accept = headers
        .get("sec-websocket-accept")
        .ok_or_else(|| WsError::HandshakeMalformed("missing Sec-WebSocket-Accept".into()))?;
    if accept != &accept_hash(&key) {
        return Err(WsError::HandshakeAcceptMismatch);
    }

    if let Some(requested) = &config.subprotocol {
        if let Some(got) = headers.get("sec-websocket-protocol") {
            if got != requested {
                return Err(WsError::HandshakeRejected(format!(
                    "server selected unrequested subprotocol `{got}`"
                )));
            }
        }
    }

    Ok(HandshakeOutcome { trailing })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::os::unix::io::{AsRawFd, RawFd};

    struct MockStream {
        read_buf: Cursor<Vec<u8>>,
        written: Vec<u8>,
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.read_buf.read(buf)
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl AsRawFd for MockStream {
        fn as_raw_fd(&self) -> RawFd {
            -1
        }
    }

    impl Transport for MockStream {
        fn set_read_timeout(&self, _timeout: Option<Duration>) -> std::io::Result<()> {
            Ok(())
        }
        fn shutdown(&self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn accept_hash_matches_known_vector() {
        // RFC 6455 §1.3 worked example
        assert_eq!(
            accept_hash("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn request_line_uses_path_and_default_host() {
        let uri = WsUri::parse("ws://example.com/chat").unwrap();
        let req = build_request(&uri, "x", &Config::default());
        assert!(req.starts_with("GET /chat HTTP/1.1\r\n"));
        assert!(req.contains("Host: example.com\r\n"));
    }

    #[test]
    fn successful_handshake_retains_trailing_bytes() {
        // perform_handshake generates a fresh nonce per call, so a full
        // end-to-end pass can't use a fixed canned accept value here; the
        // accept-hash math itself is covered by `accept_hash_matches_known_vector`.
        // this exercises the header/trailing-byte split perform_handshake
        // relies on, against a response carrying an extra byte past `\r\n\r\n`
        // (the first byte of the frame stream).
        let response =
            b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\nX";
        let mut buf = BytesMut::new();
        buf.extend_from_slice(response);
        let end = find_header_terminator(&buf).unwrap();
        let trailing = buf.split_off(end);
        assert_eq!(&trailing[..], b"X");
    }

    #[test]
    fn rejects_non_101_status() {
        let mut mock = MockStream {
            read_buf: Cursor::new(b"HTTP/1.1 404 Not Found\r\n\r\n".to_vec()),
            written: Vec::new(),
        };
        let uri = WsUri::parse("ws://example.com/").unwrap();
        let err = perform_handshake(&mut mock, &uri, &Config::default()).unwrap_err();
        assert!(matches!(err, WsError::HandshakeRejected(_)));
        assert!(mock.written.starts_with(b"GET / HTTP/1.1\r\n"));
    }

    #[test]
    fn header_token_matching_is_comma_separated_and_case_insensitive() {
        assert!(header_contains_token("keep-alive, Upgrade", "upgrade"));
        assert!(!header_contains_token("keep-alive", "upgrade"));
    }

    struct StallStream {
        written: Vec<u8>,
    }

    impl Read for StallStream {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::WouldBlock.into())
        }
    }

    impl Write for StallStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl AsRawFd for StallStream {
        fn as_raw_fd(&self) -> RawFd {
            -1
        }
    }

    impl Transport for StallStream {
        fn set_read_timeout(&self, _timeout: Option<Duration>) -> std::io::Result<()> {
            Ok(())
        }
        fn shutdown(&self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn unresponsive_peer_times_out_instead_of_hanging() {
        // a server that accepts the TCP connection and then never writes a
        // byte must not hang `perform_handshake` forever: a socket read
        // timeout expiring (WouldBlock/TimedOut) has to surface as
        // `HandshakeTimeout`, not be retried or bubbled up as a bare io error.
        let mut mock = StallStream { written: Vec::new() };
        let uri = WsUri::parse("ws://example.com/").unwrap();
        let config = Config {
            handshake_timeout_ms: 5,
            ..Config::default()
        };
        let err = perform_handshake(&mut mock, &uri, &config).unwrap_err();
        assert!(matches!(err, WsError::HandshakeTimeout));
    }
}
