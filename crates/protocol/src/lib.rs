#![deny(unsafe_code)]

//! Wire encodings for the libsync synchronization protocol.
//!
//! Everything on the wire and in the persistent metadata files is big-endian
//! with no padding. This crate is pure encoding/decoding: the framed socket
//! wrapper and the message multiplexer that move these bytes live in the
//! `transport` crate, and the command semantics (who replies what, when) live
//! in the `client` and `daemon` crates.
//!
//! The layers, bottom up:
//!
//! - [`wire`]: fixed-width integer cursors over byte slices and growable
//!   buffers.
//! - [`frame`]: the multiplexer frame header carried in front of every
//!   message body.
//! - [`handshake`]: the credentialed handshake exchanged before the
//!   multiplexer starts.
//! - [`command`]: the request/response command bodies (META, PUSH, PULL,
//!   DEL, QUIT) and the server-initiated change broadcast.

pub mod command;
pub mod frame;
pub mod handshake;
pub mod wire;

use thiserror::Error;

/// Decoding failures shared by every layer of the protocol.
///
/// A `ProtocolError` on a live connection is fatal to that connection: the
/// peer has sent bytes we cannot interpret, so no further frame boundary can
/// be trusted.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The input ended before the announced structure was complete.
    #[error("input truncated: needed {needed} more bytes")]
    Truncated {
        /// Bytes missing from the input.
        needed: usize,
    },

    /// A length or count field describes more data than the input holds.
    #[error("impossible length field: {field} = {value}")]
    BadLength {
        /// Name of the offending field.
        field: &'static str,
        /// The value that could not be satisfied.
        value: u64,
    },

    /// The first byte of a command body is not a known opcode.
    #[error("unknown command opcode {0:#04x}")]
    UnknownOpcode(u8),

    /// A status byte carried a value outside the defined set.
    #[error("unexpected status byte {0:#04x}")]
    BadStatus(u8),

    /// A path field did not decode as UTF-8.
    #[error("path is not valid UTF-8")]
    BadPath,

    /// The frame header initiator flag was neither 0 nor 1.
    #[error("invalid frame initiator flag {0:#04x}")]
    BadInitiator(u8),
}
