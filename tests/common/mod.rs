//! Shared helpers for the integration tests.

#![allow(dead_code)]

use image::{Rgba, RgbaImage};
use imgconv_engine::codec::Codec;
use imgconv_engine::config::EngineConfig;
use imgconv_engine::error::CodecError;
use imgconv_engine::governor::MemorySampler;
use imgconv_engine::{ConversionEngine, Format};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Lossless codec storing `width`, `height` and raw RGBA for every format.
pub struct FastCodec;

impl FastCodec {
    pub fn encode_raw(image: &RgbaImage) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + image.as_raw().len());
        out.extend_from_slice(&image.width().to_le_bytes());
        out.extend_from_slice(&image.height().to_le_bytes());
        out.extend_from_slice(image.as_raw());
        out
    }

    pub fn decode_raw(bytes: &[u8]) -> Option<RgbaImage> {
        let width = u32::from_le_bytes(bytes.get(0..4)?.try_into().ok()?);
        let height = u32::from_le_bytes(bytes.get(4..8)?.try_into().ok()?);
        RgbaImage::from_raw(width, height, bytes.get(8..)?.to_vec())
    }
}

impl Codec for FastCodec {
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

/// Wraps [`FastCodec`] and fails the first `failures` encodes with a fixed
/// message, recording the size and quality of every encode call.
pub struct FlakyCodec {
    message: &'static str,
    failures: AtomicUsize,
    pub encodes: Mutex<Vec<(u32, u32, u8)>>,
}

impl FlakyCodec {
    pub fn new(message: &'static str, failures: usize) -> Self {
        Self {
            message,
            failures: AtomicUsize::new(failures),
            encodes: Mutex::new(Vec::new()),
        }
    }

    pub fn encodes(&self) -> Vec<(u32, u32, u8)> {
        self.encodes.lock().unwrap().clone()
    }
}

impl Codec for FlakyCodec {
    fn supports(&self, _format: Format) -> bool {
        true
    }

    fn decode(&self, bytes: &[u8], format: Format) -> Result<RgbaImage, CodecError> {
        FastCodec.decode(bytes, format)
    }

    fn encode(
        &self,
        image: &RgbaImage,
        format: Format,
        quality: u8,
    ) -> Result<Vec<u8>, CodecError> {
        self.encodes
            .lock()
            .unwrap()
            .push((image.width(), image.height(), quality));
        let remaining = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if remaining.is_ok() {
            return Err(CodecError::Encode {
                format,
                message: self.message.to_string(),
            });
        }
        FastCodec.encode(image, format, quality)
    }
}

/// Wraps [`FastCodec`] and blocks the first `slow_calls` encodes for
/// `delay`, the way a heavy synchronous encoder holds the runtime thread.
pub struct SlowCodec {
    delay: Duration,
    slow_calls: AtomicUsize,
    encodes: Mutex<Vec<(u32, u32)>>,
}

impl SlowCodec {
    pub fn new(delay: Duration, slow_calls: usize) -> Self {
        Self {
            delay,
            slow_calls: AtomicUsize::new(slow_calls),
            encodes: Mutex::new(Vec::new()),
        }
    }

    pub fn encodes(&self) -> Vec<(u32, u32)> {
        self.encodes.lock().unwrap().clone()
    }
}

impl Codec for SlowCodec {
    fn supports(&self, _format: Format) -> bool {
        true
    }

    fn decode(&self, bytes: &[u8], format: Format) -> Result<RgbaImage, CodecError> {
        FastCodec.decode(bytes, format)
    }

    fn encode(
        &self,
        image: &RgbaImage,
        format: Format,
        quality: u8,
    ) -> Result<Vec<u8>, CodecError> {
        self.encodes.lock().unwrap().push(image.dimensions());
        let slow = self
            .slow_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if slow {
            std::thread::sleep(self.delay);
        }
        FastCodec.encode(image, format, quality)
    }
}

/// Sampler for hosts without memory introspection.
pub struct NullSampler;

impl MemorySampler for NullSampler {
    fn sample(&self) -> Option<u64> {
        None
    }

    fn reclaim(&self) {}
}

pub fn engine(codec: Arc<dyn Codec>) -> ConversionEngine {
    engine_with_config(codec, EngineConfig::default())
}

pub fn engine_with_config(codec: Arc<dyn Codec>, config: EngineConfig) -> ConversionEngine {
    ConversionEngine::new(codec, config)
        .unwrap()
        .with_sampler(Arc::new(NullSampler))
}

pub fn solid(width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_pixel(width, height, Rgba([40, 80, 120, 255]))
}
