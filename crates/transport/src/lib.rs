#![deny(unsafe_code)]

//! The libsync transport layer.
//!
//! [`Net`] wraps one TCP connection with the big-endian primitives every
//! protocol structure is built from. [`NetMsg`] sits on top and multiplexes
//! any number of request/response conversations over that single
//! connection, streaming large bodies directly between the socket and
//! caller-supplied readers/writers.
//!
//! A transport failure is terminal for the connection: every blocked caller
//! is woken with an error and the multiplexer refuses further work. Nothing
//! is retried at this layer.

mod net;
mod netmsg;

pub use net::{Net, NetAcceptor, NetConnector};
pub use netmsg::{Handle, NetMsg, Reply};

use std::io;

use thiserror::Error;

/// Transport-layer failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection is closed; no further reads or writes are possible.
    #[error("connection closed")]
    Closed,

    /// An operating system I/O failure on the socket.
    #[error("transport i/o failure: {0}")]
    Io(#[from] io::Error),

    /// The peer violated the framing rules.
    #[error(transparent)]
    Protocol(#[from] protocol::ProtocolError),

    /// `host:port` produced no usable addresses.
    #[error("could not resolve {host}:{port}")]
    Resolve {
        /// Hostname as configured.
        host: String,
        /// Port as configured.
        port: u16,
    },

    /// Every resolved candidate refused the connection.
    #[error("no reachable address for {host}:{port}: {last}")]
    Connect {
        /// Hostname as configured.
        host: String,
        /// Port as configured.
        port: u16,
        /// Error from the last candidate tried.
        last: io::Error,
    },

    /// A reply or payload was directed at a conversation that is not open.
    #[error("conversation {id} is not active")]
    UnknownConversation {
        /// The offending conversation id.
        id: u64,
    },

    /// A streamed body's reader ran dry before its declared length.
    #[error("payload source ended {remaining} bytes early")]
    ShortSource {
        /// Bytes still owed when the source returned end-of-file.
        remaining: u64,
    },

    /// A received payload could not be written into its sink.
    #[error("payload sink failed: {0}")]
    Sink(io::Error),
}
