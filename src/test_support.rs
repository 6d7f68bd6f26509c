//! Lossless in-memory codec for unit tests.

use crate::codec::Codec;
use crate::error::CodecError;
use crate::format::Format;
use image::RgbaImage;

/// Stores pixels as `width` and `height` (little-endian `u32`) followed by
/// raw RGBA bytes, for every format.
pub(crate) struct RawCodec;

impl RawCodec {
    pub(crate) fn encode_raw(image: &RgbaImage) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + image.as_raw().len());
        out.extend_from_slice(&image.width().to_le_bytes());
        out.extend_from_slice(&image.height().to_le_bytes());
        out.extend_from_slice(image.as_raw());
        out
    }

    pub(crate) fn decode_raw(bytes: &[u8]) -> Option<RgbaImage> {
        let width = u32::from_le_bytes(bytes.get(0..4)?.try_into().ok()?);
        let height = u32::from_le_bytes(bytes.get(4..8)?.try_into().ok()?);
        RgbaImage::from_raw(width, height, bytes.get(8..)?.to_vec())
    }
}

impl Codec for RawCodec {
    fn supports(&self, _format: Format) -> bool {
        true
    }

    fn decode(&self, bytes: &[u8], format: Format) -> Result<RgbaImage, CodecError> {
        Self::decode_raw(bytes).ok_or(CodecError::Decode {
            format,
            message: "malformed raw buffer".to_string(),
        })
    }

    fn encode(
        &self,
        image: &RgbaImage,
        _format: Format,
        _quality: u8,
    ) -> Result<Vec<u8>, CodecError> {
        Ok(Self::encode_raw(image))
    }
}
