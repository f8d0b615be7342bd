//! The multiplexer frame header.
//!
//! Every message body travels inside one frame:
//!
//! ```text
//! u8  initiator   0 = conversation originated by the frame's sender
//! u64 message_id  assigned monotonically by the originator
//! u64 body_len
//! bytes body[body_len]
//! ```
//!
//! The initiator flag is written from the sender's point of view and flipped
//! on receipt, so each endpoint can keep two independent id spaces (its own
//! conversations and the peer's) without coordinating id assignment.

use crate::{ProtocolError, wire};

/// Which endpoint opened the conversation a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Initiator {
    /// The endpoint sending (or, after the receive-side flip, holding) the
    /// frame opened this conversation.
    Local,
    /// The other endpoint opened it.
    Peer,
}

impl Initiator {
    /// The opposite perspective, applied when a frame crosses the wire.
    #[must_use]
    pub fn flip(self) -> Self {
        match self {
            Self::Local => Self::Peer,
            Self::Peer => Self::Local,
        }
    }
}

/// Encoded size of a frame header.
pub const HEADER_LEN: usize = 17;

/// A decoded frame header; the body follows it on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Who opened the conversation, from the perspective of the endpoint
    /// holding this value.
    pub initiator: Initiator,
    /// Conversation id within the initiator's id space.
    pub id: u64,
    /// Exact length of the body that follows.
    pub body_len: u64,
}

impl FrameHeader {
    /// Encodes the header for transmission.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = Vec::with_capacity(HEADER_LEN);
        wire::put_u8(
            &mut out,
            match self.initiator {
                Initiator::Local => 0,
                Initiator::Peer => 1,
            },
        );
        wire::put_u64(&mut out, self.id);
        wire::put_u64(&mut out, self.body_len);
        let mut fixed = [0u8; HEADER_LEN];
        fixed.copy_from_slice(&out);
        fixed
    }

    /// Decodes a received header, flipping the initiator flag into the
    /// receiver's perspective.
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self, ProtocolError> {
        let mut r = wire::ByteReader::new(buf);
        let initiator = match r.u8()? {
            0 => Initiator::Peer,
            1 => Initiator::Local,
            other => return Err(ProtocolError::BadInitiator(other)),
        };
        Ok(Self {
            initiator,
            id: r.u64()?,
            body_len: r.u64()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_flag_id_len() {
        let h = FrameHeader {
            initiator: Initiator::Local,
            id: 7,
            body_len: 300,
        };
        let enc = h.encode();
        assert_eq!(enc[0], 0);
        assert_eq!(enc[1..9], 7u64.to_be_bytes());
        assert_eq!(enc[9..17], 300u64.to_be_bytes());
    }

    #[test]
    fn decode_flips_perspective() {
        let sent = FrameHeader {
            initiator: Initiator::Local,
            id: 42,
            body_len: 0,
        };
        let got = FrameHeader::decode(&sent.encode()).unwrap();
        assert_eq!(got.initiator, Initiator::Peer);
        assert_eq!(got.id, 42);

        let reply = FrameHeader {
            initiator: Initiator::Peer,
            id: 42,
            body_len: 1,
        };
        let got = FrameHeader::decode(&reply.encode()).unwrap();
        assert_eq!(got.initiator, Initiator::Local);
    }

    #[test]
    fn decode_rejects_unknown_flag() {
        let mut raw = FrameHeader {
            initiator: Initiator::Local,
            id: 1,
            body_len: 1,
        }
        .encode();
        raw[0] = 9;
        assert!(matches!(
            FrameHeader::decode(&raw),
            Err(ProtocolError::BadInitiator(9))
        ));
    }
}
