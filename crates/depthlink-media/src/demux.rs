//! Frame payload classification and decoding
//!
//! Providers send four kinds of binary payloads over the data channel and the
//! frame sockets. They carry no type tag, so the kind is inferred from magic
//! bytes and size.

use bytes::{BufMut, Bytes, BytesMut};
use depthlink_protocol::Matrices;

use crate::depth::DepthImage;
use crate::MediaError;

const JPEG_MAGIC: [u8; 2] = [0xFF, 0xD8];
const PNG_MAGIC: [u8; 4] = [0x89, 0x50, 0x4E, 0x47];

/// Payloads shorter than this that are neither JPEG nor PNG are matrices JSON
pub const MATRICES_MAX_LEN: usize = 1000;

/// Header of a packed frame: width, height and RVL length as u32 LE
pub const PACKED_HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadClass {
    Empty,
    ColorJpeg,
    DepthPng,
    Matrices,
    PackedDepth,
}

/// Infer the payload kind. Magic bytes are checked before the size rule.
pub fn classify(payload: &[u8]) -> PayloadClass {
    if payload.is_empty() {
        PayloadClass::Empty
    } else if payload.starts_with(&JPEG_MAGIC) {
        PayloadClass::ColorJpeg
    } else if payload.starts_with(&PNG_MAGIC) {
        PayloadClass::DepthPng
    } else if payload.len() < MATRICES_MAX_LEN {
        PayloadClass::Matrices
    } else {
        PayloadClass::PackedDepth
    }
}

/// Borrowed view of a packed RVL depth + matrices frame.
///
/// Layout: `[width u32 LE][height u32 LE][rvl_len u32 LE][rvl bytes][matrices JSON]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedFrame<'a> {
    pub width: u32,
    pub height: u32,
    pub rvl: &'a [u8],
    pub matrices: &'a [u8],
}

impl<'a> PackedFrame<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self, MediaError> {
        if payload.len() < PACKED_HEADER_LEN {
            return Err(MediaError::PackedFrame(format!(
                "{} bytes is shorter than the header",
                payload.len()
            )));
        }
        let read_u32 = |at: usize| {
            u32::from_le_bytes([payload[at], payload[at + 1], payload[at + 2], payload[at + 3]])
        };
        let width = read_u32(0);
        let height = read_u32(4);
        let rvl_len = read_u32(8) as usize;

        let body = &payload[PACKED_HEADER_LEN..];
        if rvl_len > body.len() {
            return Err(MediaError::PackedFrame(format!(
                "RVL length {} exceeds remaining {} bytes",
                rvl_len,
                body.len()
            )));
        }
        let (rvl, matrices) = body.split_at(rvl_len);

        Ok(Self {
            width,
            height,
            rvl,
            matrices,
        })
    }

    pub fn encode(width: u32, height: u32, rvl: &[u8], matrices: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKED_HEADER_LEN + rvl.len() + matrices.len());
        buf.put_u32_le(width);
        buf.put_u32_le(height);
        buf.put_u32_le(rvl.len() as u32);
        buf.put_slice(rvl);
        buf.put_slice(matrices);
        buf.freeze()
    }
}

/// A decoded frame payload
#[derive(Debug, Clone)]
pub enum Demuxed {
    /// JPEG bytes, passed through undecoded
    Color(Bytes),
    DepthPng(DepthImage),
    Matrices(Matrices),
    /// Depth and matrices decode independently; either may fail
    Packed {
        depth: Option<DepthImage>,
        matrices: Option<Matrices>,
    },
}

/// Classify and decode one payload. Empty payloads yield `Ok(None)`.
pub fn demultiplex(payload: Bytes) -> Result<Option<Demuxed>, MediaError> {
    let demuxed = match classify(&payload) {
        PayloadClass::Empty => return Ok(None),
        PayloadClass::ColorJpeg => Demuxed::Color(payload),
        PayloadClass::DepthPng => Demuxed::DepthPng(DepthImage::from_png(&payload)?),
        PayloadClass::Matrices => Demuxed::Matrices(Matrices::from_json(&payload)?),
        PayloadClass::PackedDepth => {
            let packed = PackedFrame::parse(&payload)?;

            let depth = match DepthImage::from_rvl(packed.width, packed.height, packed.rvl) {
                Ok(depth) => Some(depth),
                Err(e) => {
                    tracing::warn!(
                        "Dropping depth of {}x{} packed frame: {}",
                        packed.width,
                        packed.height,
                        e
                    );
                    None
                }
            };

            let matrices = match Matrices::from_json(packed.matrices) {
                Ok(matrices) => Some(matrices),
                Err(e) => {
                    tracing::warn!("Dropping matrices of packed frame: {}", e);
                    None
                }
            };

            Demuxed::Packed { depth, matrices }
        }
    };

    Ok(Some(demuxed))
}
