//! Frame types
//!
//! Requests and responses share module, cmd, session id and payload;
//! responses add a status code. Payloads are `Bytes` so decoded frames can
//! hand slices of the read buffer to handlers without copying.

use crate::constants::*;
use crate::error::{ProtocolError, ProtocolResult};
use bytes::Bytes;

/// Frame kind carried in the type tag byte
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Request = TYPE_TAG_REQUEST,
    Response = TYPE_TAG_RESPONSE,
}

impl FrameType {
    /// Bytes after the tag that this frame type always carries
    pub fn fixed_body_len(self) -> usize {
        match self {
            Self::Request => REQUEST_FIXED_BODY,
            Self::Response => RESPONSE_FIXED_BODY,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
        }
    }
}

impl TryFrom<u8> for FrameType {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> ProtocolResult<Self> {
        match tag {
            TYPE_TAG_REQUEST => Ok(Self::Request),
            TYPE_TAG_RESPONSE => Ok(Self::Response),
            other => Err(ProtocolError::unknown_type_tag(other)),
        }
    }
}

/// Request frame sent by the initiating side of an exchange
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestFrame {
    pub module: u32,
    pub cmd: u32,
    pub session_id: String,
    pub payload: Bytes,
}

/// Response frame; `code` is 0 on success
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResponseFrame {
    pub module: u32,
    pub cmd: u32,
    pub session_id: String,
    pub code: u32,
    pub payload: Bytes,
}

/// Either kind of frame, as produced by the decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Request(RequestFrame),
    Response(ResponseFrame),
}

/// True for the reserved heartbeat route (module 0, cmd 0)
pub fn is_heartbeat(module: u32, cmd: u32) -> bool {
    module == HEARTBEAT_MODULE && cmd == HEARTBEAT_CMD
}

impl RequestFrame {
    pub fn new(
        module: u32,
        cmd: u32,
        session_id: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            module,
            cmd,
            session_id: session_id.into(),
            payload: payload.into(),
        }
    }

    /// Heartbeat request: reserved route, sentinel session id, empty payload
    pub fn heartbeat() -> Self {
        Self {
            module: HEARTBEAT_MODULE,
            cmd: HEARTBEAT_CMD,
            session_id: HEARTBEAT_SESSION_ID.to_string(),
            payload: Bytes::new(),
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        is_heartbeat(self.module, self.cmd)
    }

    /// Total encoded size including the length field
    pub fn encoded_len(&self) -> usize {
        REQUEST_HEADER_SIZE + self.payload.len()
    }
}

impl ResponseFrame {
    pub fn new(
        module: u32,
        cmd: u32,
        session_id: impl Into<String>,
        code: u32,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            module,
            cmd,
            session_id: session_id.into(),
            code,
            payload: payload.into(),
        }
    }

    /// Echo of a heartbeat request with code 0 and no payload
    pub fn heartbeat_reply(request: &RequestFrame) -> Self {
        Self {
            module: request.module,
            cmd: request.cmd,
            session_id: request.session_id.clone(),
            code: CODE_OK,
            payload: Bytes::new(),
        }
    }

    /// Reply on the route and session of `request`
    pub fn reply_to(request: &RequestFrame, code: u32, payload: impl Into<Bytes>) -> Self {
        Self::new(
            request.module,
            request.cmd,
            request.session_id.clone(),
            code,
            payload,
        )
    }

    pub fn is_heartbeat(&self) -> bool {
        is_heartbeat(self.module, self.cmd)
    }

    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }

    /// Total encoded size including the length field
    pub fn encoded_len(&self) -> usize {
        RESPONSE_HEADER_SIZE + self.payload.len()
    }
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Request(_) => FrameType::Request,
            Self::Response(_) => FrameType::Response,
        }
    }

    pub fn module(&self) -> u32 {
        match self {
            Self::Request(req) => req.module,
            Self::Response(resp) => resp.module,
        }
    }

    pub fn cmd(&self) -> u32 {
        match self {
            Self::Request(req) => req.cmd,
            Self::Response(resp) => resp.cmd,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Self::Request(req) => &req.session_id,
            Self::Response(resp) => &resp.session_id,
        }
    }

    pub fn payload(&self) -> &Bytes {
        match self {
            Self::Request(req) => &req.payload,
            Self::Response(resp) => &resp.payload,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        is_heartbeat(self.module(), self.cmd())
    }

    /// Encode either variant
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Request(req) => crate::builder::encode_request(req),
            Self::Response(resp) => crate::builder::encode_response(resp),
        }
    }
}

impl From<RequestFrame> for Frame {
    fn from(req: RequestFrame) -> Self {
        Self::Request(req)
    }
}

impl From<ResponseFrame> for Frame {
    fn from(resp: ResponseFrame) -> Self {
        Self::Response(resp)
    }
}
