//! Reference wire framing: `SYNC | ID | LEN | PAYLOAD | CRC`.
//!
//! Every field is one byte except the payload, whose length is given by
//! `LEN`. The checksum is a running XOR over the bytes from `ID` to the end
//! of the payload. Protocols may use richer framing as long as their parser
//! honours the [`crate::parser::ProtocolParser`] contract; this module is the
//! minimum any of them must provide.

mod parser;

use bytes::{BufMut, BytesMut};
pub use parser::SyncFrameParser;

use crate::error::FramingError;

/// Bytes preceding the payload (`SYNC`, `ID`, `LEN`).
pub const HEADER_SIZE: usize = 3;

/// Smallest valid frame: header plus checksum with an empty payload.
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + 1;

/// Largest payload the one-byte length field can describe.
pub const MAX_PAYLOAD_SIZE: usize = u8::MAX as usize;

/// XOR-fold of `bytes`.
#[must_use]
pub fn checksum(bytes: &[u8]) -> u8 { bytes.iter().fold(0, |acc, b| acc ^ b) }

/// Total frame size for a payload of `payload_len` bytes.
#[must_use]
pub const fn frame_size(payload_len: usize) -> usize { MIN_FRAME_SIZE + payload_len }

/// Append a complete frame to `dst`.
///
/// The length byte is written as a placeholder, back-patched once
/// `write_payload` has run, and followed by the checksum.
///
/// # Errors
///
/// Returns [`FramingError::PayloadTooLarge`] if the payload exceeds
/// [`MAX_PAYLOAD_SIZE`]; `dst` is restored to its original length.
pub fn encode_frame(
    sync: u8,
    id: u8,
    dst: &mut BytesMut,
    write_payload: impl FnOnce(&mut BytesMut),
) -> Result<usize, FramingError> {
    let start = dst.len();
    dst.put_u8(sync);
    dst.put_u8(id);
    dst.put_u8(0);
    write_payload(dst);
    let payload_len = dst.len() - start - HEADER_SIZE;
    let Ok(len) = u8::try_from(payload_len) else {
        dst.truncate(start);
        return Err(FramingError::PayloadTooLarge {
            size: payload_len,
            max: MAX_PAYLOAD_SIZE,
        });
    };
    dst[start + 2] = len;
    let crc = checksum(&dst[start + 1..]);
    dst.put_u8(crc);
    Ok(dst.len() - start)
}

/// Borrowed view of a validated frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameView<'a> {
    /// Message identifier.
    pub id: u8,
    /// Payload bytes.
    pub payload: &'a [u8],
}

impl FrameView<'_> {
    /// Bytes occupied by the frame on the wire.
    #[must_use]
    pub fn wire_len(&self) -> usize { frame_size(self.payload.len()) }
}

/// Validate the frame at the start of `src`.
///
/// Trailing bytes after the frame are ignored.
///
/// # Errors
///
/// Returns [`FramingError::TooShort`] if `src` holds less than a full frame,
/// [`FramingError::BadSync`] if the first byte is not `sync`, and
/// [`FramingError::ChecksumMismatch`] if the checksum disagrees.
pub fn decode_frame(sync: u8, src: &[u8]) -> Result<FrameView<'_>, FramingError> {
    if src.len() < MIN_FRAME_SIZE {
        return Err(FramingError::TooShort {
            have: src.len(),
            need: MIN_FRAME_SIZE,
        });
    }
    if src[0] != sync {
        return Err(FramingError::BadSync {
            expected: sync,
            actual: src[0],
        });
    }
    let id = src[1];
    let need = frame_size(usize::from(src[2]));
    if src.len() < need {
        return Err(FramingError::TooShort {
            have: src.len(),
            need,
        });
    }
    let body = &src[1..need - 1];
    let expected = checksum(body);
    let actual = src[need - 1];
    if expected != actual {
        return Err(FramingError::ChecksumMismatch { expected, actual });
    }
    Ok(FrameView {
        id,
        payload: &body[2..],
    })
}
