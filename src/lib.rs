//! Image Conversion Engine Library
//!
//! Converts images between SVG, PNG, JPG, WEBP and GIF. Requests are routed
//! through the format graph (direct, or via a PNG or SVG hub), large rasters
//! are processed in tiles, every route runs under a timeout and memory
//! budget, and failures are classified and retried once where that can help.
//!
//! ## Module Overview
//!
//! - `format`: Supported formats, metadata and sniffing
//! - `router`: Format graph and route search
//! - `request`: Conversion requests, options and colour parsing
//! - `codec`: Decode/encode seam and the `image`/`resvg` implementation
//! - `chunk`: Tile planning
//! - `scratch`: Reusable tile buffers
//! - `pipeline`: Single-pass and tiled stage conversion
//! - `governor`: Timeout, cancellation and memory governance
//! - `error`: Error taxonomy
//! - `recovery`: Classification, retry strategies and error history
//! - `job`: Job lifecycle
//! - `engine`: Orchestration of all of the above
//! - `config`: Engine settings and environment overrides
//! - `telemetry`: OpenTelemetry integration and structured logging
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use imgconv_engine::{
//!     codec::ImageCodec,
//!     config::EngineConfig,
//!     engine::ConversionEngine,
//!     format::Format,
//!     request::{ConversionOptions, ConversionRequest},
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut engine =
//!         ConversionEngine::new(Arc::new(ImageCodec::new()), EngineConfig::default()).unwrap();
//!
//!     let svg = br#"<svg xmlns="http://www.w3.org/2000/svg" width="10" height="10"/>"#;
//!     let request = ConversionRequest::new(
//!         svg.to_vec(),
//!         Format::Svg,
//!         Format::Png,
//!         ConversionOptions::default(),
//!     );
//!
//!     let result = engine.convert(request).await;
//!     assert!(result.is_ok());
//! }
//! ```

pub mod chunk;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod format;
pub mod governor;
pub mod job;
pub mod pipeline;
pub mod recovery;
pub mod request;
pub mod router;
pub mod scratch;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod test_support;

pub use engine::{ConversionEngine, ConversionResult};
pub use error::{ConvertError, ErrorKind};
pub use format::Format;
pub use recovery::ErrorRecord;
pub use request::{ConversionOptions, ConversionRequest};
