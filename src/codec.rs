//! Codec capability injected into the pipeline.
//!
//! The engine never touches format internals itself; it only asks a [`Codec`]
//! to turn bytes into pixels and back. [`ImageCodec`] is the stock
//! implementation used by the binary.

use crate::error::CodecError;
use crate::format::Format;
use base64::Engine as _;
use image::{ImageFormat, RgbaImage};
use std::io::Cursor;
use std::sync::Arc;
use tracing::debug;

/// Decode/encode capability for the supported formats.
///
/// Implementations must be `Send + Sync` so one codec can be shared between
/// engines.
#[cfg_attr(test, mockall::automock)]
pub trait Codec: Send + Sync {
    /// Whether this host can handle `format` at all.
    fn supports(&self, format: Format) -> bool;

    /// Decodes encoded bytes into straight-alpha RGBA pixels.
    fn decode(&self, bytes: &[u8], format: Format) -> Result<RgbaImage, CodecError>;

    /// Decodes at `width` x `height`. Resolution-independent formats render
    /// directly at that size; the default decodes at the natural size and
    /// leaves resampling to the caller.
    fn decode_at(
        &self,
        bytes: &[u8],
        format: Format,
        width: u32,
        height: u32,
    ) -> Result<RgbaImage, CodecError> {
        let _ = (width, height);
        self.decode(bytes, format)
    }

    /// Encodes RGBA pixels. `quality` is 10..=100 and may be ignored by
    /// lossless formats.
    fn encode(&self, image: &RgbaImage, format: Format, quality: u8)
        -> Result<Vec<u8>, CodecError>;
}

impl<T: Codec + ?Sized> Codec for Arc<T> {
    fn supports(&self, format: Format) -> bool {
        (**self).supports(format)
    }

    fn decode(&self, bytes: &[u8], format: Format) -> Result<RgbaImage, CodecError> {
        (**self).decode(bytes, format)
    }

    fn decode_at(
        &self,
        bytes: &[u8],
        format: Format,
        width: u32,
        height: u32,
    ) -> Result<RgbaImage, CodecError> {
        (**self).decode_at(bytes, format, width, height)
    }

    fn encode(
        &self,
        image: &RgbaImage,
        format: Format,
        quality: u8,
    ) -> Result<Vec<u8>, CodecError> {
        (**self).encode(image, format, quality)
    }
}

/// Codec backed by the `image` crate for rasters and `resvg` for SVG.
///
/// SVG output wraps a PNG rendition of the pixels in an `<image>` element, so
/// a raster never becomes "true" vector data.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageCodec;

impl ImageCodec {
    pub fn new() -> Self {
        Self
    }

    fn raster_format(format: Format) -> Option<ImageFormat> {
        match format {
            Format::Png => Some(ImageFormat::Png),
            Format::Jpeg => Some(ImageFormat::Jpeg),
            Format::Webp => Some(ImageFormat::WebP),
            Format::Gif => Some(ImageFormat::Gif),
            Format::Svg => None,
        }
    }

    /// Renders SVG at its intrinsic size, or scaled to exactly `target`.
    fn rasterize_svg(bytes: &[u8], target: Option<(u32, u32)>) -> Result<RgbaImage, CodecError> {
        let decode_err = |message: String| CodecError::Decode {
            format: Format::Svg,
            message,
        };

        let tree = usvg::Tree::from_data(bytes, &usvg::Options::default())
            .map_err(|e| decode_err(format!("failed to parse SVG: {}", e)))?;

        let size = tree.size();
        if size.width() <= 0.0 || size.height() <= 0.0 {
            return Err(decode_err(format!(
                "invalid SVG dimensions: {}x{}",
                size.width(),
                size.height()
            )));
        }

        let (width, height, transform) = match target {
            Some((width, height)) => (
                width,
                height,
                resvg::tiny_skia::Transform::from_scale(
                    width as f32 / size.width(),
                    height as f32 / size.height(),
                ),
            ),
            None => (
                size.width().ceil() as u32,
                size.height().ceil() as u32,
                resvg::tiny_skia::Transform::identity(),
            ),
        };
        let mut pixmap = resvg::tiny_skia::Pixmap::new(width, height)
            .ok_or_else(|| decode_err(format!("cannot allocate {}x{} canvas", width, height)))?;
        resvg::render(&tree, transform, &mut pixmap.as_mut());

        let mut raw = Vec::with_capacity(pixmap.pixels().len() * 4);
        for pixel in pixmap.pixels() {
            let color = pixel.demultiply();
            raw.extend_from_slice(&[color.red(), color.green(), color.blue(), color.alpha()]);
        }
        RgbaImage::from_raw(width, height, raw)
            .ok_or_else(|| decode_err("pixel buffer size mismatch".to_string()))
    }

    fn encode_svg(image: &RgbaImage) -> Result<Vec<u8>, CodecError> {
        let png = Self::encode_raster(image, Format::Png, ImageFormat::Png, 100)?;
        let data = base64::engine::general_purpose::STANDARD.encode(png);
        let (w, h) = image.dimensions();
        let svg = format!(
            concat!(
                r#"<svg xmlns="http://www.w3.org/2000/svg" "#,
                r#"xmlns:xlink="http://www.w3.org/1999/xlink" "#,
                r#"width="{w}" height="{h}" viewBox="0 0 {w} {h}">"#,
                r#"<image width="{w}" height="{h}" xlink:href="data:image/png;base64,{data}"/>"#,
                "</svg>"
            ),
            w = w,
            h = h,
            data = data
        );
        Ok(svg.into_bytes())
    }

    fn encode_raster(
        image: &RgbaImage,
        format: Format,
        image_format: ImageFormat,
        quality: u8,
    ) -> Result<Vec<u8>, CodecError> {
        let encode_err = |e: image::ImageError| CodecError::Encode {
            format,
            message: e.to_string(),
        };

        let mut buf = Vec::new();
        if image_format == ImageFormat::Jpeg {
            let rgb = image::DynamicImage::ImageRgba8(image.clone()).to_rgb8();
            image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality)
                .encode_image(&rgb)
                .map_err(encode_err)?;
        } else {
            image
                .write_to(&mut Cursor::new(&mut buf), image_format)
                .map_err(encode_err)?;
        }
        Ok(buf)
    }
}

impl Codec for ImageCodec {
    fn supports(&self, _format: Format) -> bool {
        true
    }

    fn decode(&self, bytes: &[u8], format: Format) -> Result<RgbaImage, CodecError> {
        let Some(image_format) = Self::raster_format(format) else {
            return Self::rasterize_svg(bytes, None);
        };
        let image = image::load_from_memory_with_format(bytes, image_format).map_err(|e| {
            CodecError::Decode {
                format,
                message: e.to_string(),
            }
        })?;
        debug!(format = %format, width = image.width(), height = image.height(), "Decoded image");
        Ok(image.to_rgba8())
    }

    fn decode_at(
        &self,
        bytes: &[u8],
        format: Format,
        width: u32,
        height: u32,
    ) -> Result<RgbaImage, CodecError> {
        if format.is_vector() {
            Self::rasterize_svg(bytes, Some((width, height)))
        } else {
            self.decode(bytes, format)
        }
    }

    fn encode(
        &self,
        image: &RgbaImage,
        format: Format,
        quality: u8,
    ) -> Result<Vec<u8>, CodecError> {
        match Self::raster_format(format) {
            Some(image_format) => Self::encode_raster(image, format, image_format, quality),
            None => Self::encode_svg(image),
        }
    }
}
