//! TCP Framing Helpers
//!
//! Dialing and framed send/receive over tokio TCP streams. Frames are always
//! written with a single `write_all` so concurrent writers on different
//! pooled connections never interleave partial frames.

use crate::{ClusterError, Result};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};
use trellis_codec::{read_frame, Frame};

/// Dial `target` and disable Nagle's algorithm on the new socket
///
/// Failure to set `TCP_NODELAY` is logged and otherwise ignored.
pub async fn dial(target: &str) -> Result<TcpStream> {
    let stream = TcpStream::connect(target)
        .await
        .map_err(|e| ClusterError::connection_with_source("Failed to dial peer", target, e))?;

    if let Err(e) = stream.set_nodelay(true) {
        warn!(peer = %target, error = %e, "Failed to set TCP_NODELAY");
    }

    debug!(
        peer = %target,
        local = ?stream.local_addr().ok(),
        "Dialed peer connection"
    );

    Ok(stream)
}

/// Encode `frame` and write it in one call, then flush
pub async fn send_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let buf = frame.encode();

    writer
        .write_all(&buf)
        .await
        .map_err(|e| ClusterError::network_with_source("Failed to write frame", e))?;

    writer
        .flush()
        .await
        .map_err(|e| ClusterError::network_with_source("Failed to flush TCP stream", e))?;

    debug!(
        module = frame.module(),
        cmd = frame.cmd(),
        session_id = %frame.session_id(),
        bytes = buf.len(),
        "Sent frame over TCP"
    );

    Ok(())
}

/// Read one frame, optionally bounded by a read deadline
pub async fn recv_frame<R>(
    reader: &mut R,
    max_frame_size: usize,
    deadline: Option<Duration>,
) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let frame = match deadline {
        Some(limit) => tokio::time::timeout(limit, read_frame(reader, max_frame_size))
            .await
            .map_err(|_| ClusterError::timeout("frame read", limit.as_millis() as u64))??,
        None => read_frame(reader, max_frame_size).await?,
    };

    debug!(
        module = frame.module(),
        cmd = frame.cmd(),
        session_id = %frame.session_id(),
        bytes = frame.payload().len(),
        "Received frame over TCP"
    );

    Ok(frame)
}
