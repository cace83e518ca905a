//! Wire frame format.
//!
//! Every frame starts with a 4-byte little-endian total length covering the
//! whole frame (itself included), and carries a little-endian `i32`
//! response-to id at byte offset 8. Everything else in the frame is opaque
//! to this crate; encoding and decoding the payload belongs to the
//! caller-supplied encoder.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::buffer::InputBuffer;
use crate::cancel::CancelToken;
use crate::error::ConnectionError;

/// Smallest frame that can carry a length prefix and a response-to id.
pub(crate) const MIN_FRAME_LEN: u32 = 12;

/// Hard ceiling on a single frame's declared length. A server that claims a
/// bigger frame is either broken or malicious; either way, refusing to
/// allocate for it is the right call.
pub(crate) const MAX_FRAME_LEN: u32 = 48 * 1024 * 1024;

const RESPONSE_TO_OFFSET: usize = 8;
const RESPONSE_TO_LEN: usize = 4;

/// Reads one complete frame off `stream`: the 4-byte length prefix, then
/// the rest of the frame. The returned buffer includes the length prefix.
///
/// Raced against `cancel`: a stalled peer must not be able to wedge the
/// read half forever. If `cancel` fires first, the in-progress read is
/// dropped along with whatever partial bytes it had buffered.
pub(crate) async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S, cancel: &CancelToken) -> io::Result<InputBuffer> {
    tokio::select! {
        biased;
        result = read_frame_inner(stream) => result,
        () = cancel.cancelled() => Err(io::Error::new(io::ErrorKind::TimedOut, "frame read cancelled")),
    }
}

async fn read_frame_inner<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<InputBuffer> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);
    if len < MIN_FRAME_LEN || len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} outside [{MIN_FRAME_LEN}, {MAX_FRAME_LEN}]"),
        ));
    }

    let mut buf = BytesMut::zeroed(len as usize);
    buf[..4].copy_from_slice(&len_buf);
    stream.read_exact(&mut buf[4..]).await?;
    Ok(buf.freeze())
}

/// Writes `frame` to `stream` in full. `AsyncWriteExt::write_all` already
/// retries on partial writes, so either the whole frame lands contiguously
/// or this returns an error and the caller fails the connection.
///
/// Raced against `cancel` -- the connection's background token, not a
/// caller's, so a write already underway can't be abandoned by anything
/// short of the connection itself giving up on the socket.
pub(crate) async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, frame: &[u8], cancel: &CancelToken) -> io::Result<()> {
    tokio::select! {
        biased;
        result = stream.write_all(frame) => result,
        () = cancel.cancelled() => Err(io::Error::new(io::ErrorKind::TimedOut, "frame write cancelled")),
    }
}

/// Extracts the little-endian response-to id from a complete frame.
/// `read_frame` already guarantees every frame it returns is long enough
/// for this to succeed; this only returns `InternalError` if that
/// invariant has somehow been violated upstream.
pub(crate) fn response_to(frame: &[u8]) -> Result<i32, ConnectionError> {
    crate::buffer::segment_at(frame, RESPONSE_TO_OFFSET, RESPONSE_TO_LEN)
        .map(|bytes| i32::from_le_bytes(bytes.try_into().expect("segment_at returned 4 bytes")))
        .ok_or(ConnectionError::InternalError(
            "frame shorter than the response-to header field",
        ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn build_frame(response_to_id: i32, payload: &[u8]) -> Vec<u8> {
        let total_len = MIN_FRAME_LEN as usize + payload.len();
        let mut out = Vec::with_capacity(total_len);
        out.extend_from_slice(&(total_len as u32).to_le_bytes());
        out.extend_from_slice(&0i32.to_le_bytes()); // request id, opaque here
        out.extend_from_slice(&response_to_id.to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[tokio::test]
    async fn reads_a_well_formed_frame() {
        let raw = build_frame(7, b"payload");
        let mut cursor = Cursor::new(raw.clone());
        let cancel = CancelToken::new();
        let frame = read_frame(&mut cursor, &cancel).await.unwrap();
        assert_eq!(&frame[..], &raw[..]);
        assert_eq!(response_to(&frame).unwrap(), 7);
    }

    #[tokio::test]
    async fn rejects_a_frame_shorter_than_the_header() {
        let mut cursor = Cursor::new(8u32.to_le_bytes().to_vec());
        let cancel = CancelToken::new();
        let err = read_frame(&mut cursor, &cancel).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn rejects_a_frame_over_the_cap() {
        let mut cursor = Cursor::new((MAX_FRAME_LEN + 1).to_le_bytes().to_vec());
        let cancel = CancelToken::new();
        let err = read_frame(&mut cursor, &cancel).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn read_is_interrupted_by_cancellation() {
        let (mut local, _remote) = tokio::io::duplex(64);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = read_frame(&mut local, &cancel).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn write_is_interrupted_by_cancellation() {
        let (mut local, _remote) = tokio::io::duplex(4);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = write_frame(&mut local, &build_frame(1, b"abcdefgh"), &cancel).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
