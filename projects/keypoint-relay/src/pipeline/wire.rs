// UDP wire layouts for raw-frame mirroring and inference results.
//
// Integers are little-endian. Header bytes not assigned to a field are zero.

use crate::pipeline::types::{Keypoint, Roi};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const FRAGMENT_MAGIC: [u8; 4] = [0x55, 0xAA, 0x55, 0xAA];
pub const HEADER_LEN: usize = 40;
pub const FRAGMENT_PAYLOAD: usize = 1400;
pub const MAX_DATAGRAM: usize = HEADER_LEN + FRAGMENT_PAYLOAD;
pub const ROI_LEN: usize = 16;
pub const KEYPOINT_LEN: usize = 4;
pub const MAX_KEYPOINTS: usize = (MAX_DATAGRAM - HEADER_LEN - ROI_LEN) / KEYPOINT_LEN;

pub const DEFAULT_MIRROR_PORT: u16 = 6071;
pub const DEFAULT_RESULT_PORT: u16 = 6072;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("result packet would carry {keypoints} keypoints, at most {max} fit in a datagram")]
    PayloadTooLarge { keypoints: usize, max: usize },
}

pub fn fragment_count(len: usize) -> usize {
    len.div_ceil(FRAGMENT_PAYLOAD)
}

/// Splits a raw packet into mirror datagrams, in index order.
pub fn fragments(data: &[u8]) -> Fragments<'_> {
    Fragments {
        chunks: data.chunks(FRAGMENT_PAYLOAD),
        total: fragment_count(data.len()) as i32,
        index: 0,
    }
}

pub struct Fragments<'a> {
    chunks: std::slice::Chunks<'a, u8>,
    total: i32,
    index: i32,
}

impl Iterator for Fragments<'_> {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        let chunk = self.chunks.next()?;
        let datagram = encode_fragment(self.total, self.index, chunk);
        self.index += 1;
        Some(datagram)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}

impl ExactSizeIterator for Fragments<'_> {}

fn encode_fragment(total: i32, index: i32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_slice(&FRAGMENT_MAGIC);
    buf.put_i32_le(total);
    buf.put_i32_le(index);
    buf.put_bytes(0, HEADER_LEN - buf.len());
    buf.put_slice(payload);
    buf.freeze()
}

/// ROI corners followed by `(x, y)` pairs in model output order.
pub fn encode_result(roi: &Roi, keypoints: &[Keypoint]) -> Result<Bytes, WireError> {
    if keypoints.len() > MAX_KEYPOINTS {
        return Err(WireError::PayloadTooLarge {
            keypoints: keypoints.len(),
            max: MAX_KEYPOINTS,
        });
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + ROI_LEN + keypoints.len() * KEYPOINT_LEN);
    buf.put_bytes(0, HEADER_LEN);
    buf.put_i32_le(roi.x0);
    buf.put_i32_le(roi.y0);
    buf.put_i32_le(roi.x1);
    buf.put_i32_le(roi.y1);
    for kp in keypoints {
        buf.put_i16_le(kp.x);
        buf.put_i16_le(kp.y);
    }
    Ok(buf.freeze())
}

/// Sent once when detections stop arriving.
pub fn encode_empty_result() -> Bytes {
    Bytes::from_static(&[0u8; HEADER_LEN])
}
