//! Byte-for-byte conformance of the public wire encodings.
//!
//! These pin the exact octets so that an accidental field reorder or width
//! change shows up as a test diff, not as a peer that cannot talk to us.

use protocol::command::{
    Broadcast, OP_DEL, OP_META, OP_PULL, OP_PUSH, OP_QUIT, Request, STATUS_OK, STATUS_STALE,
    parse_pull_reply, parse_status, pull_reply, status_body,
};
use protocol::frame::{FrameHeader, HEADER_LEN, Initiator};
use protocol::handshake::{self, AuthCommand};
use protocol::wire::ByteReader;

#[test]
fn opcodes_are_stable() {
    assert_eq!(OP_QUIT, 0x00);
    assert_eq!(OP_META, 0x01);
    assert_eq!(OP_PUSH, 0x02);
    assert_eq!(OP_PULL, 0x03);
    assert_eq!(OP_DEL, 0x04);
}

#[test]
fn handshake_codes_are_stable() {
    assert_eq!(handshake::VERSION, 0);
    assert_eq!(AuthCommand::Login.code(), 0);
    assert_eq!(AuthCommand::Register.code(), 1);
    assert_eq!(handshake::RESULT_OK, 0);
    assert_eq!(handshake::RESULT_INVALID, 1);
    assert_eq!(handshake::RESULT_REG_CLOSED, 2);
}

#[test]
fn frame_header_is_seventeen_bytes() {
    let header = FrameHeader {
        initiator: Initiator::Local,
        id: 0x0102_0304_0506_0708,
        body_len: 0x1122_3344_5566_7788,
    };
    let raw = header.encode();
    assert_eq!(raw.len(), HEADER_LEN);
    assert_eq!(
        raw,
        [
            0x00, // initiated by the sender
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, // id
            0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, // body length
        ]
    );
}

#[test]
fn push_request_layout() {
    let body = Request::Push {
        modified: 150,
        path: "/b".into(),
    }
    .encode();
    let mut expect = vec![OP_PUSH];
    expect.extend_from_slice(&150u64.to_be_bytes());
    expect.extend_from_slice(&2u32.to_be_bytes());
    expect.extend_from_slice(b"/b");
    assert_eq!(body, expect);
}

#[test]
fn pull_request_layout() {
    let body = Request::Pull {
        path: "/a.txt".into(),
    }
    .encode();
    let mut expect = vec![OP_PULL];
    expect.extend_from_slice(&6u32.to_be_bytes());
    expect.extend_from_slice(b"/a.txt");
    assert_eq!(body, expect);
}

#[test]
fn del_request_layout() {
    let body = Request::Del {
        modified: 42,
        path: "/d".into(),
    }
    .encode();
    let mut expect = vec![OP_DEL];
    expect.extend_from_slice(&42u64.to_be_bytes());
    expect.extend_from_slice(&2u32.to_be_bytes());
    expect.extend_from_slice(b"/d");
    assert_eq!(body, expect);
}

#[test]
fn broadcast_layout() {
    let body = Broadcast {
        path: "/c".into(),
        modified: 500,
        deleted: false,
    }
    .encode();
    let mut expect = Vec::new();
    expect.extend_from_slice(&2u32.to_be_bytes());
    expect.extend_from_slice(b"/c");
    expect.extend_from_slice(&500u64.to_be_bytes());
    expect.push(0);
    assert_eq!(body, expect);
}

#[test]
fn status_and_pull_replies() {
    assert_eq!(status_body(STATUS_OK), [0]);
    assert_eq!(status_body(STATUS_STALE), [1]);
    assert_eq!(parse_status(&[1, 99, 99]).unwrap(), 1);

    let reply = pull_reply(100);
    assert_eq!(reply.len(), 9);
    assert_eq!(reply[0], STATUS_OK);
    assert_eq!(reply[1..], 100u64.to_be_bytes());
    assert_eq!(parse_pull_reply(&reply).unwrap(), (STATUS_OK, 100));
}

#[test]
fn quit_and_meta_are_single_opcodes() {
    assert_eq!(Request::Quit.encode(), [OP_QUIT]);
    assert_eq!(Request::Meta.encode(), [OP_META]);
}

#[test]
fn every_integer_field_is_big_endian() {
    // One decode through the generic reader confirms the byte order end
    // to end rather than per helper.
    let body = Request::Del {
        modified: 1,
        path: "/x".into(),
    }
    .encode();
    let mut r = ByteReader::new(&body);
    assert_eq!(r.u8().unwrap(), OP_DEL);
    assert_eq!(r.u64().unwrap(), 1);
    assert_eq!(r.u32().unwrap(), 2);
    assert_eq!(r.str(2).unwrap(), "/x");
    assert!(r.is_empty());
}

#[test]
fn empty_body_is_rejected() {
    assert!(Request::parse(&[]).is_err());
    assert!(Broadcast::parse(&[]).is_err());
    assert!(parse_status(&[]).is_err());
}
