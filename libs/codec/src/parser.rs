//! # Frame Parser
//!
//! Decodes frames from an in-memory buffer or straight off an async stream.
//! Both paths apply the same checks in the same order:
//!
//! 1. length ≥ 1 and length ≤ the frame ceiling (checked before allocating)
//! 2. tag is a known [`FrameType`]
//! 3. length covers the fixed fields for that type
//! 4. exactly `length - 1` further bytes are available
//!
//! There is no resynchronisation: any failure leaves the stream position
//! undefined and the caller must drop the connection.

use crate::constants::*;
use crate::error::{ProtocolError, ProtocolResult};
use crate::frame::{Frame, FrameType, RequestFrame, ResponseFrame};
use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Decode the first frame in `buf` using the default frame ceiling
///
/// Bytes after the first frame are ignored.
pub fn decode(buf: &[u8]) -> ProtocolResult<Frame> {
    decode_with_limit(buf, DEFAULT_MAX_FRAME_SIZE)
}

/// Decode the first frame in `buf`, rejecting declared lengths above `max_frame_size`
pub fn decode_with_limit(buf: &[u8], max_frame_size: usize) -> ProtocolResult<Frame> {
    if buf.len() < LENGTH_FIELD_SIZE + TYPE_TAG_SIZE {
        return Err(ProtocolError::short_read(
            LENGTH_FIELD_SIZE + TYPE_TAG_SIZE,
            buf.len(),
            "frame prefix",
        ));
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    check_length(length, max_frame_size)?;

    let frame_type = FrameType::try_from(buf[LENGTH_FIELD_SIZE])?;
    check_body(length, frame_type)?;

    let body_start = LENGTH_FIELD_SIZE + TYPE_TAG_SIZE;
    let body_end = LENGTH_FIELD_SIZE + length as usize;
    if buf.len() < body_end {
        return Err(ProtocolError::short_read(body_end, buf.len(), "frame body"));
    }

    Ok(parse_body(
        frame_type,
        Bytes::copy_from_slice(&buf[body_start..body_end]),
    ))
}

/// Read one frame from an async stream
///
/// Blocks until a full frame has arrived. End-of-stream before or inside a
/// frame is reported as [`ProtocolError::ShortRead`].
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> ProtocolResult<Frame>
where
    R: AsyncRead + Unpin,
{
    let length = reader
        .read_u32()
        .await
        .map_err(|e| ProtocolError::from_io("reading frame length", LENGTH_FIELD_SIZE, e))?;
    check_length(length, max_frame_size)?;

    let tag = reader
        .read_u8()
        .await
        .map_err(|e| ProtocolError::from_io("reading type tag", TYPE_TAG_SIZE, e))?;
    let frame_type = FrameType::try_from(tag)?;
    check_body(length, frame_type)?;

    let body_len = length as usize - TYPE_TAG_SIZE;
    let mut body = vec![0u8; body_len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| ProtocolError::from_io("reading frame body", body_len, e))?;

    trace!(
        frame_type = frame_type.name(),
        bytes = body_len,
        "Decoded frame from stream"
    );

    Ok(parse_body(frame_type, Bytes::from(body)))
}

/// Encode `frame` and write it with a single `write_all`, then flush
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin,
{
    let buf = frame.encode();
    writer
        .write_all(&buf)
        .await
        .map_err(|e| ProtocolError::from_io("writing frame", buf.len(), e))?;
    writer
        .flush()
        .await
        .map_err(|e| ProtocolError::from_io("flushing frame", 0, e))?;
    Ok(())
}

fn check_length(length: u32, max_frame_size: usize) -> ProtocolResult<()> {
    if length < TYPE_TAG_SIZE as u32 {
        return Err(ProtocolError::bad_length(length, TYPE_TAG_SIZE, "any"));
    }
    if length as usize > max_frame_size {
        return Err(ProtocolError::frame_too_large(length as usize, max_frame_size));
    }
    Ok(())
}

fn check_body(length: u32, frame_type: FrameType) -> ProtocolResult<()> {
    let minimum = TYPE_TAG_SIZE + frame_type.fixed_body_len();
    if (length as usize) < minimum {
        return Err(ProtocolError::bad_length(length, minimum, frame_type.name()));
    }
    Ok(())
}

/// Slice the fixed offsets of a body whose length was already validated
fn parse_body(frame_type: FrameType, mut body: Bytes) -> Frame {
    let module = body.get_u32();
    let cmd = body.get_u32();
    let session_id = trim_session_id(&body.split_to(SESSION_ID_SIZE));

    match frame_type {
        FrameType::Request => Frame::Request(RequestFrame {
            module,
            cmd,
            session_id,
            payload: body,
        }),
        FrameType::Response => {
            let code = body.get_u32();
            Frame::Response(ResponseFrame {
                module,
                cmd,
                session_id,
                code,
                payload: body,
            })
        }
    }
}

/// Strip trailing space and NUL padding
fn trim_session_id(raw: &[u8]) -> String {
    let end = raw
        .iter()
        .rposition(|b| *b != SESSION_ID_PAD && *b != 0)
        .map(|i| i + 1)
        .unwrap_or(0);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}
