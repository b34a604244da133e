//! a low-overhead, zero-copy client WebSocket core.
//!
//! this crate implements the client side of RFC 6455: the opening
//! handshake, the frame codec, and a receive state machine that exposes
//! message payloads as zero-copy [`bytes::Bytes`] views into an internal
//! ring buffer rather than allocating and copying per message. it speaks
//! plain (non-TLS) WebSocket over any [`connection::Transport`]; TLS
//! termination, multiplexing, and a server role are left to callers that
//! layer them on top.
//!
//! the [`Connection`] type is the whole public surface: [`Connection::connect`]
//! performs the handshake over a fresh [`std::net::TcpStream`], and the
//! resulting connection sends and receives frames with
//! [`Connection::send_text`]/[`Connection::send_binary`]/[`Connection::recv`].
//! a payload returned by `recv` pins the connection until
//! [`Connection::release_payload`] is called; see the module docs on
//! [`connection`] for the full lifecycle.

#![warn(missing_docs)]

/// connection-level configuration
pub mod config;
/// the receive state machine and public connection façade
pub mod connection;
/// structured error types
pub mod errors;
/// wire-level frame header decode/encode and masking
pub mod frame;
/// client opening handshake: request encoding and response validation
pub mod protocol;
/// the inbound ring buffer frames are parsed out of
mod buffer;
/// incremental UTF-8 validation across message fragments
mod utf8;
/// `ws://` URI parsing
pub mod uri;

pub use config::Config;
pub use connection::{Connection, Frame, FrameType, Status, Transport};
pub use errors::{ProtocolError, WsError};
pub use frame::OpCode;
pub use uri::WsUri;
