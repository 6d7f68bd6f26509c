//! Image conversion CLI.
//!
//! Converts one file between SVG, PNG, JPG, WEBP and GIF using the
//! conversion engine and prints the result metadata as JSON.
//!
//! ## Configuration
//!
//! Environment variables:
//! - `IMGCONV_*`: engine thresholds, see `config::EngineConfig::from_env`
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP collector endpoint
//! - `IMGCONV_OTEL`: set to `1` to enable OpenTelemetry export
//! - `IMGCONV_LOG_FORMAT`: set to `json` for one JSON object per log line
//! - `RUST_LOG`: Log level (default: info)

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use imgconv_engine::codec::ImageCodec;
use imgconv_engine::config::EngineConfig;
use imgconv_engine::telemetry;
use imgconv_engine::{ConversionEngine, ConversionOptions, ConversionRequest, Format};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "imgconv", version, about = "Convert an image between SVG, PNG, JPG, WEBP and GIF")]
struct Cli {
    /// Source image
    input: PathBuf,

    /// Destination file
    output: PathBuf,

    /// Source format; detected from the file contents when omitted
    #[arg(long)]
    from: Option<Format>,

    /// Target format; taken from the output extension when omitted
    #[arg(long)]
    to: Option<Format>,

    /// Encoder quality (10-100)
    #[arg(short, long, default_value_t = 90)]
    quality: u8,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    /// Stretch to exactly --width x --height instead of fitting inside
    #[arg(long)]
    stretch: bool,

    /// Keep transparency when the target format supports it
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    transparent: bool,

    /// CSS colour used when flattening transparency
    #[arg(long)]
    background: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let json_logs = std::env::var("IMGCONV_LOG_FORMAT").is_ok_and(|v| v == "json");
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(json_logs.then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
        }))
        .with((!json_logs).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();

    if std::env::var("IMGCONV_OTEL").is_ok_and(|v| v == "1") {
        if let Err(e) = telemetry::init_telemetry() {
            warn!("Failed to initialize telemetry: {}", e);
        }
    }

    let cli = Cli::parse();
    let source = tokio::fs::read(&cli.input)
        .await
        .with_context(|| format!("Failed to read {}", cli.input.display()))?;

    let from = match cli.from {
        Some(format) => format,
        None => Format::sniff(&source)
            .ok_or_else(|| anyhow!("Cannot detect format of {}", cli.input.display()))?,
    };
    let to = match cli.to {
        Some(format) => format,
        None => target_from_extension(&cli.output)?,
    };

    let options = ConversionOptions {
        quality: cli.quality,
        target_width: cli.width,
        target_height: cli.height,
        maintain_aspect_ratio: !cli.stretch,
        transparent_background: cli.transparent,
        background_color: cli.background.clone(),
        ..ConversionOptions::default()
    };

    let config = EngineConfig::from_env();
    let mut engine = ConversionEngine::new(Arc::new(ImageCodec::new()), config)
        .context("Invalid engine configuration")?;

    info!(input = %cli.input.display(), from = %from, to = %to, "Converting");
    let result = engine
        .convert(ConversionRequest::new(source, from, to, options))
        .await
        .map_err(|record| anyhow!("{}", record))?;

    write_atomically(&cli.output, &result.encoded_bytes)?;

    let summary = serde_json::to_string_pretty(&result).context("Failed to serialize result")?;
    println!("{}", summary);
    Ok(())
}

fn target_from_extension(output: &Path) -> Result<Format> {
    let extension = output
        .extension()
        .and_then(|ext| ext.to_str())
        .ok_or_else(|| anyhow!("Output has no extension; pass --to"))?;
    extension
        .parse()
        .with_context(|| format!("Unknown output extension '{}'", extension))
}

/// Writes through a temp file in the destination directory, so a failed run
/// never leaves a truncated output behind.
fn write_atomically(output: &Path, bytes: &[u8]) -> Result<()> {
    let dir = output
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut file = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    file.write_all(bytes).context("Failed to write output")?;
    file.persist(output)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    Ok(())
}
