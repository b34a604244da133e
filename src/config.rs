/// options supplied at connect time; immutable once the connection is open
///
/// mirrors the keyword arguments accepted by the reference implementation's
/// `WebSocket.connect` (handshake timeout, max frame size, subprotocol,
/// origin, user agent).
#[derive(Debug, Clone)]
pub struct Config {
    /// upper bound, in milliseconds, on the opening handshake
    pub handshake_timeout_ms: u64,
    /// upper bound, in bytes, on a single frame's declared payload length
    pub max_frame_size: usize,
    /// `Sec-WebSocket-Protocol` requested during the handshake, if any
    pub subprotocol: Option<String>,
    /// `Origin` header sent during the handshake, if any
    pub origin: Option<String>,
    /// `User-Agent` header sent during the handshake, if any
    pub user_agent: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 5_000,
            max_frame_size: 16 * 1024 * 1024,
            subprotocol: None,
            origin: None,
            user_agent: None,
        }
    }
}
