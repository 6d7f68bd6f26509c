//! Supported image formats.

use crate::error::ConvertError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The closed set of formats the engine converts between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Svg,
    Png,
    #[serde(alias = "jpg")]
    Jpeg,
    Webp,
    Gif,
}

impl Format {
    /// All supported formats in a fixed order.
    pub const ALL: [Format; 5] = [
        Format::Svg,
        Format::Png,
        Format::Jpeg,
        Format::Webp,
        Format::Gif,
    ];

    /// Canonical file extension without the leading dot.
    pub fn extension(self) -> &'static str {
        match self {
            Format::Svg => "svg",
            Format::Png => "png",
            Format::Jpeg => "jpg",
            Format::Webp => "webp",
            Format::Gif => "gif",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Format::Svg => "image/svg+xml",
            Format::Png => "image/png",
            Format::Jpeg => "image/jpeg",
            Format::Webp => "image/webp",
            Format::Gif => "image/gif",
        }
    }

    /// Whether encoded output can carry an alpha channel.
    pub fn supports_alpha(self) -> bool {
        !matches!(self, Format::Jpeg)
    }

    pub fn is_vector(self) -> bool {
        matches!(self, Format::Svg)
    }

    /// Detects the format of encoded bytes from their signature.
    ///
    /// SVG is recognised by a leading `<svg` or `<?xml` after optional
    /// whitespace and BOM.
    pub fn sniff(bytes: &[u8]) -> Option<Format> {
        const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

        if bytes.starts_with(PNG_MAGIC) {
            return Some(Format::Png);
        }
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Some(Format::Jpeg);
        }
        if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
            return Some(Format::Gif);
        }
        if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            return Some(Format::Webp);
        }

        let text = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
        let start = text
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(text.len());
        let text = &text[start..];
        if text.starts_with(b"<svg") || text.starts_with(b"<?xml") {
            return Some(Format::Svg);
        }
        None
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::Svg => write!(f, "SVG"),
            Format::Png => write!(f, "PNG"),
            Format::Jpeg => write!(f, "JPG"),
            Format::Webp => write!(f, "WEBP"),
            Format::Gif => write!(f, "GIF"),
        }
    }
}

impl FromStr for Format {
    type Err = ConvertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "svg" => Ok(Format::Svg),
            "png" => Ok(Format::Png),
            "jpg" | "jpeg" => Ok(Format::Jpeg),
            "webp" => Ok(Format::Webp),
            "gif" => Ok(Format::Gif),
            _ => Err(ConvertError::UnsupportedFormat(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_parse_aliases() {
        assert_eq!("jpg".parse::<Format>().unwrap(), Format::Jpeg);
        assert_eq!("JPEG".parse::<Format>().unwrap(), Format::Jpeg);
        assert_eq!(".webp".parse::<Format>().unwrap(), Format::Webp);
        assert_eq!("Svg".parse::<Format>().unwrap(), Format::Svg);
    }

    #[test]
    fn test_parse_unknown_format() {
        let err = "bmp".parse::<Format>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedFormat);
        assert!(err.to_string().contains("bmp"));
    }

    #[test]
    fn test_sniff_signatures() {
        assert_eq!(
            Format::sniff(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0]),
            Some(Format::Png)
        );
        assert_eq!(Format::sniff(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(Format::Jpeg));
        assert_eq!(Format::sniff(b"GIF89a...."), Some(Format::Gif));
        assert_eq!(Format::sniff(b"RIFF\x10\x00\x00\x00WEBPVP8 "), Some(Format::Webp));
        assert_eq!(
            Format::sniff(b"  \n<svg xmlns=\"http://www.w3.org/2000/svg\"/>"),
            Some(Format::Svg)
        );
        assert_eq!(Format::sniff(b"<?xml version=\"1.0\"?><svg/>"), Some(Format::Svg));
        assert_eq!(Format::sniff(b"BM...."), None);
        assert_eq!(Format::sniff(&[]), None);
    }

    #[test]
    fn test_alpha_support() {
        assert!(!Format::Jpeg.supports_alpha());
        assert!(Format::Png.supports_alpha());
        assert!(Format::Webp.supports_alpha());
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(serde_json::to_string(&Format::Jpeg).unwrap(), "\"jpeg\"");
        let parsed: Format = serde_json::from_str("\"jpg\"").unwrap();
        assert_eq!(parsed, Format::Jpeg);
    }
}
