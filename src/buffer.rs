//! Buffer model.
//!
//! `bytes::{Bytes, BytesMut}` already give us exactly the split the design
//! calls for: a growable, exclusively-owned output buffer while a frame is
//! being assembled, frozen to a cheaply-shared, read-only buffer once it's
//! complete and ready to hand to a decoder or park in the coordinator.
//! There's no bespoke buffer type here because there's nothing `bytes`
//! doesn't already do better.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use bytes::{Bytes, BytesMut};

/// An in-progress, exclusively-owned frame being written.
pub type OutputBuffer = BytesMut;

/// A complete frame, read-only and cheap to clone (refcounted).
pub type InputBuffer = Bytes;

/// Freezes a finished output buffer into a dispatch-ready input buffer.
/// A thin name for `BytesMut::freeze`, kept so call sites read in terms of
/// the buffer model's own vocabulary instead of `bytes`'s.
pub(crate) fn make_read_only(buf: OutputBuffer) -> InputBuffer {
    buf.freeze()
}

/// Borrows `len` bytes at `offset` without consuming them. Returns `None`
/// if the buffer is shorter than `offset + len`.
pub(crate) fn segment_at(buf: &[u8], offset: usize, len: usize) -> Option<&[u8]> {
    buf.get(offset..offset + len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_at_rejects_out_of_range_reads() {
        let buf = [0u8, 1, 2, 3];
        assert!(segment_at(&buf, 2, 4).is_none());
        assert_eq!(segment_at(&buf, 1, 2), Some(&buf[1..3]));
    }

    #[test]
    fn make_read_only_preserves_bytes() {
        let mut out = OutputBuffer::new();
        out.extend_from_slice(b"hello");
        let frozen = make_read_only(out);
        assert_eq!(&frozen[..], b"hello");
    }
}
