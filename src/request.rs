//! Conversion requests, options and their validation.

use crate::error::ConvertError;
use crate::format::Format;
use image::Rgba;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const MIN_QUALITY: u8 = 10;
pub const MAX_QUALITY: u8 = 100;

const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);

/// Output options of a conversion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConversionOptions {
    /// Encoder quality, 10 to 100. Only lossy targets honour it.
    pub quality: u8,
    pub target_width: Option<u32>,
    pub target_height: Option<u32>,
    pub maintain_aspect_ratio: bool,
    pub transparent_background: bool,
    /// CSS colour used when flattening alpha.
    pub background_color: Option<String>,
    /// Declared input size; overrides the byte length for the tiling decision.
    pub size_hint_bytes: Option<u64>,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            quality: 90,
            target_width: None,
            target_height: None,
            maintain_aspect_ratio: true,
            transparent_background: true,
            background_color: None,
            size_hint_bytes: None,
        }
    }
}

impl ConversionOptions {
    pub fn validate(&self) -> Result<(), ConvertError> {
        if !(MIN_QUALITY..=MAX_QUALITY).contains(&self.quality) {
            return Err(ConvertError::InvalidOptions(format!(
                "quality {} outside {}..={}",
                self.quality, MIN_QUALITY, MAX_QUALITY
            )));
        }
        if self.target_width == Some(0) || self.target_height == Some(0) {
            return Err(ConvertError::InvalidOptions(
                "target dimensions must be positive".to_string(),
            ));
        }
        if let Some(color) = &self.background_color {
            parse_css_color(color)?;
        }
        Ok(())
    }

    /// Resolves output dimensions for a source of `width` x `height`.
    ///
    /// Both targets with aspect preservation fit within the box; both without
    /// it stretch; a single target derives the other edge from the source
    /// aspect ratio; no target keeps the source size.
    pub fn resolve_dimensions(&self, width: u32, height: u32) -> (u32, u32) {
        let (w, h) = (f64::from(width.max(1)), f64::from(height.max(1)));
        match (self.target_width, self.target_height) {
            (Some(tw), Some(th)) if self.maintain_aspect_ratio => {
                let scale = (f64::from(tw) / w).min(f64::from(th) / h);
                (scaled(w, scale).min(tw), scaled(h, scale).min(th))
            }
            (Some(tw), Some(th)) => (tw, th),
            (Some(tw), None) => (tw, scaled(h, f64::from(tw) / w)),
            (None, Some(th)) => (scaled(w, f64::from(th) / h), th),
            (None, None) => (width, height),
        }
    }

    /// Background colour to flatten onto, or `None` to keep alpha.
    pub fn flatten_color(&self, target: Format) -> Result<Option<Rgba<u8>>, ConvertError> {
        if self.transparent_background && target.supports_alpha() {
            return Ok(None);
        }
        match &self.background_color {
            Some(color) => {
                let mut rgba = parse_css_color(color)?;
                // Flattening always yields an opaque pixel.
                if rgba[3] == 0 {
                    rgba = WHITE;
                }
                rgba[3] = 255;
                Ok(Some(rgba))
            }
            None => Ok(Some(WHITE)),
        }
    }
}

fn scaled(edge: f64, scale: f64) -> u32 {
    ((edge * scale).round() as u32).max(1)
}

/// One conversion call: encoded input plus source/target formats and options.
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub source_data: Arc<[u8]>,
    pub from_format: Format,
    pub to_format: Format,
    pub options: ConversionOptions,
}

impl ConversionRequest {
    pub fn new(
        source_data: impl Into<Arc<[u8]>>,
        from_format: Format,
        to_format: Format,
        options: ConversionOptions,
    ) -> Self {
        Self {
            source_data: source_data.into(),
            from_format,
            to_format,
            options,
        }
    }

    pub fn validate(&self) -> Result<(), ConvertError> {
        if self.source_data.is_empty() {
            return Err(ConvertError::InvalidOptions("source data is empty".to_string()));
        }
        self.options.validate()
    }

    /// Size used for the tiling decision.
    pub fn effective_size_bytes(&self) -> u64 {
        self.options
            .size_hint_bytes
            .unwrap_or(self.source_data.len() as u64)
    }

    /// Same input with different options; used for retries.
    pub fn with_options(&self, options: ConversionOptions) -> Self {
        Self {
            source_data: Arc::clone(&self.source_data),
            from_format: self.from_format,
            to_format: self.to_format,
            options,
        }
    }
}

/// Parses a CSS colour string into RGBA.
///
/// Accepts `#rgb`, `#rgba`, `#rrggbb`, `#rrggbbaa`, `rgb()`, `rgba()` and a
/// few named colours.
pub fn parse_css_color(input: &str) -> Result<Rgba<u8>, ConvertError> {
    let s = input.trim().to_ascii_lowercase();
    let bad = || ConvertError::InvalidOptions(format!("invalid background color '{}'", input));

    if let Some(hex) = s.strip_prefix('#') {
        let digits: Vec<u8> = hex
            .chars()
            .map(|c| c.to_digit(16).map(|d| d as u8))
            .collect::<Option<_>>()
            .ok_or_else(bad)?;
        let [r, g, b, a] = match digits.as_slice() {
            [r, g, b] => [r * 17, g * 17, b * 17, 255],
            [r, g, b, a] => [r * 17, g * 17, b * 17, a * 17],
            [r1, r2, g1, g2, b1, b2] => [r1 * 16 + r2, g1 * 16 + g2, b1 * 16 + b2, 255],
            [r1, r2, g1, g2, b1, b2, a1, a2] => {
                [r1 * 16 + r2, g1 * 16 + g2, b1 * 16 + b2, a1 * 16 + a2]
            }
            _ => return Err(bad()),
        };
        return Ok(Rgba([r, g, b, a]));
    }

    if let Some(args) = s
        .strip_prefix("rgba(")
        .or_else(|| s.strip_prefix("rgb("))
        .and_then(|rest| rest.strip_suffix(')'))
    {
        let parts: Vec<&str> = args.split(',').map(str::trim).collect();
        if parts.len() != 3 && parts.len() != 4 {
            return Err(bad());
        }
        let mut channels = [0u8, 0, 0, 255];
        for (slot, part) in channels.iter_mut().zip(&parts[..3]) {
            *slot = part.parse::<u8>().map_err(|_| bad())?;
        }
        if let Some(alpha) = parts.get(3) {
            let alpha: f64 = alpha.parse().map_err(|_| bad())?;
            if !(0.0..=1.0).contains(&alpha) {
                return Err(bad());
            }
            channels[3] = (alpha * 255.0).round() as u8;
        }
        return Ok(Rgba(channels));
    }

    match s.as_str() {
        "white" => Ok(WHITE),
        "black" => Ok(Rgba([0, 0, 0, 255])),
        "red" => Ok(Rgba([255, 0, 0, 255])),
        "green" => Ok(Rgba([0, 128, 0, 255])),
        "blue" => Ok(Rgba([0, 0, 255, 255])),
        "transparent" => Ok(Rgba([0, 0, 0, 0])),
        _ => Err(bad()),
    }
}
