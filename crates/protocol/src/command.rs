//! Command bodies carried over the multiplexer.
//!
//! The first byte of every client-initiated body is an opcode; the rest is
//! the opcode-specific request. Server-initiated bodies are change
//! broadcasts ([`Broadcast`]) and carry no opcode. File payloads travel as
//! bare follow-up frames on the same conversation and never pass through
//! these encoders.

use crate::{ProtocolError, wire};

/// Ends the session.
pub const OP_QUIT: u8 = 0x00;
/// Requests the serialized catalog.
pub const OP_META: u8 = 0x01;
/// Announces an upload; the payload follows on the same conversation.
pub const OP_PUSH: u8 = 0x02;
/// Requests a download; the payload follows on the same conversation.
pub const OP_PULL: u8 = 0x03;
/// Announces a deletion.
pub const OP_DEL: u8 = 0x04;

/// Status byte: operation accepted.
pub const STATUS_OK: u8 = 0;
/// Status byte: push rejected because the server holds a newer record.
pub const STATUS_STALE: u8 = 1;

/// A decoded client request, as seen by the server dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Session teardown.
    Quit,
    /// Catalog fetch.
    Meta,
    /// Upload announcement.
    Push {
        /// Modification stamp the client will assign to the file.
        modified: u64,
        /// Catalog path of the file.
        path: String,
    },
    /// Download request.
    Pull {
        /// Catalog path of the file.
        path: String,
    },
    /// Deletion announcement.
    Del {
        /// Modification stamp of the deletion.
        modified: u64,
        /// Catalog path of the file.
        path: String,
    },
}

impl Request {
    /// Parses a complete command body. Trailing bytes after the encoded
    /// request are a protocol violation.
    pub fn parse(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = wire::ByteReader::new(body);
        let req = match r.u8()? {
            OP_QUIT => Self::Quit,
            OP_META => Self::Meta,
            OP_PUSH => {
                let modified = r.u64()?;
                let len = r.u32()? as usize;
                Self::Push {
                    modified,
                    path: r.str(len)?.to_owned(),
                }
            }
            OP_PULL => {
                let len = r.u32()? as usize;
                Self::Pull {
                    path: r.str(len)?.to_owned(),
                }
            }
            OP_DEL => {
                let modified = r.u64()?;
                let len = r.u32()? as usize;
                Self::Del {
                    modified,
                    path: r.str(len)?.to_owned(),
                }
            }
            other => return Err(ProtocolError::UnknownOpcode(other)),
        };
        if !r.is_empty() {
            return Err(ProtocolError::BadLength {
                field: "request body",
                value: body.len() as u64,
            });
        }
        Ok(req)
    }

    /// Encodes the request into a command body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Self::Quit => wire::put_u8(&mut out, OP_QUIT),
            Self::Meta => wire::put_u8(&mut out, OP_META),
            Self::Push { modified, path } => {
                wire::put_u8(&mut out, OP_PUSH);
                wire::put_u64(&mut out, *modified);
                wire::put_u32(&mut out, path.len() as u32);
                out.extend_from_slice(path.as_bytes());
            }
            Self::Pull { path } => {
                wire::put_u8(&mut out, OP_PULL);
                wire::put_u32(&mut out, path.len() as u32);
                out.extend_from_slice(path.as_bytes());
            }
            Self::Del { modified, path } => {
                wire::put_u8(&mut out, OP_DEL);
                wire::put_u64(&mut out, *modified);
                wire::put_u32(&mut out, path.len() as u32);
                out.extend_from_slice(path.as_bytes());
            }
        }
        out
    }
}

/// A server-initiated change notification fanned out to peer sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broadcast {
    /// Catalog path of the changed file.
    pub path: String,
    /// Modification stamp after the change.
    pub modified: u64,
    /// True when the change was a deletion.
    pub deleted: bool,
}

impl Broadcast {
    /// Encodes the broadcast body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        wire::put_u32(&mut out, self.path.len() as u32);
        out.extend_from_slice(self.path.as_bytes());
        wire::put_u64(&mut out, self.modified);
        wire::put_u8(&mut out, u8::from(self.deleted));
        out
    }

    /// Parses a broadcast body.
    pub fn parse(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = wire::ByteReader::new(body);
        let len = r.u32()? as usize;
        let path = r.str(len)?.to_owned();
        let modified = r.u64()?;
        let deleted = match r.u8()? {
            0 => false,
            1 => true,
            other => return Err(ProtocolError::BadStatus(other)),
        };
        Ok(Self {
            path,
            modified,
            deleted,
        })
    }
}

/// Single-byte status body, used for acks and the stale-push reply.
#[must_use]
pub fn status_body(status: u8) -> Vec<u8> {
    vec![status]
}

/// Reads a status byte from a reply body.
pub fn parse_status(body: &[u8]) -> Result<u8, ProtocolError> {
    wire::ByteReader::new(body).u8()
}

/// Reply to an accepted PULL: status followed by the file's stamp.
#[must_use]
pub fn pull_reply(modified: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    wire::put_u8(&mut out, STATUS_OK);
    wire::put_u64(&mut out, modified);
    out
}

/// Parses the PULL reply into `(status, modified)`.
pub fn parse_pull_reply(body: &[u8]) -> Result<(u8, u64), ProtocolError> {
    let mut r = wire::ByteReader::new(body);
    let status = r.u8()?;
    if status != STATUS_OK {
        return Ok((status, 0));
    }
    Ok((status, r.u64()?))
}
