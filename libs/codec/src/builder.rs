//! Frame encoding
//!
//! Builds the complete wire image of a frame in a single buffer so the
//! transport can hand it to one `write_all` call.

use crate::constants::*;
use crate::frame::{RequestFrame, ResponseFrame};
use bytes::{BufMut, Bytes, BytesMut};

/// Encode a request frame
pub fn encode_request(frame: &RequestFrame) -> Bytes {
    let total = REQUEST_HEADER_SIZE + frame.payload.len();
    let mut buf = BytesMut::with_capacity(total);

    buf.put_u32((total - LENGTH_FIELD_SIZE) as u32);
    buf.put_u8(TYPE_TAG_REQUEST);
    buf.put_u32(frame.module);
    buf.put_u32(frame.cmd);
    put_session_id(&mut buf, &frame.session_id);
    buf.put_slice(&frame.payload);

    debug_assert_eq!(buf.len(), total);
    buf.freeze()
}

/// Encode a response frame
pub fn encode_response(frame: &ResponseFrame) -> Bytes {
    let total = RESPONSE_HEADER_SIZE + frame.payload.len();
    let mut buf = BytesMut::with_capacity(total);

    buf.put_u32((total - LENGTH_FIELD_SIZE) as u32);
    buf.put_u8(TYPE_TAG_RESPONSE);
    buf.put_u32(frame.module);
    buf.put_u32(frame.cmd);
    put_session_id(&mut buf, &frame.session_id);
    buf.put_u32(frame.code);
    buf.put_slice(&frame.payload);

    debug_assert_eq!(buf.len(), total);
    buf.freeze()
}

/// Write exactly SESSION_ID_SIZE bytes: truncate long ids, space-pad short ones
fn put_session_id(buf: &mut BytesMut, session_id: &str) {
    let raw = session_id.as_bytes();
    let used = raw.len().min(SESSION_ID_SIZE);
    buf.put_slice(&raw[..used]);
    buf.put_bytes(SESSION_ID_PAD, SESSION_ID_SIZE - used);
}

impl RequestFrame {
    pub fn encode(&self) -> Bytes {
        encode_request(self)
    }
}

impl ResponseFrame {
    pub fn encode(&self) -> Bytes {
        encode_response(self)
    }
}
