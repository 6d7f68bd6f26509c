//! Raster conversion of route hops, with tiling for large images.
//!
//! A stage decodes its input once, resolves the output size, and either
//! renders the whole canvas in one pass or walks it tile by tile. Tiles are
//! processed strictly one after another: each is rendered into the shared
//! scratch buffer, encoded to the target format, decoded back and placed
//! into the assembly canvas. The final encode only starts after every tile
//! has been placed.
//!
//! Both paths render through the same per-pixel mapping, so a tiled stage
//! produces the same pixels as a single pass, up to the target codec's own
//! lossy re-encoding.

use crate::chunk::{plan_chunks, Chunk};
use crate::codec::Codec;
use crate::config::EngineConfig;
use crate::error::{CodecError, ConvertError};
use crate::format::Format;
use crate::governor::GovernorScope;
use crate::request::{ConversionOptions, ConversionRequest};
use crate::router::ConversionRoute;
use crate::scratch::ScratchArena;
use image::{Rgba, RgbaImage};
use std::sync::Arc;
use tracing::{debug, info};

/// Progress notification: `(tile_index, total_tiles)`, 1-based.
pub type ProgressFn = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Thresholds deciding between the single-pass and the tiled path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilingPolicy {
    pub input_threshold_bytes: u64,
    pub pixel_threshold: u64,
    pub tile_edge: u32,
    pub cleanup_interval: usize,
    pub max_dimension: u32,
}

impl TilingPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            input_threshold_bytes: config.chunk_input_threshold_bytes,
            pixel_threshold: config.chunk_pixel_threshold,
            tile_edge: config.tile_edge,
            cleanup_interval: config.cleanup_interval.max(1),
            max_dimension: config.max_dimension,
        }
    }

    /// Either a large input or a large output switches to tiling.
    pub fn should_chunk(&self, input_bytes: u64, width: u32, height: u32) -> bool {
        input_bytes > self.input_threshold_bytes
            || u64::from(width) * u64::from(height) > self.pixel_threshold
    }
}

/// Encoded output of one stage.
#[derive(Debug, Clone)]
pub struct StageOutput {
    pub bytes: Vec<u8>,
    pub format: Format,
    pub width: u32,
    pub height: u32,
    /// Tiles processed; 0 for the single-pass path.
    pub tiles: usize,
}

impl StageOutput {
    pub fn was_chunked(&self) -> bool {
        self.tiles > 0
    }
}

/// Converts route hops using an injected codec and one scratch arena.
pub struct ChunkedPipeline {
    codec: Arc<dyn Codec>,
    policy: TilingPolicy,
    scratch: ScratchArena,
    on_progress: Option<ProgressFn>,
    last_output_size: Option<(u32, u32)>,
}

impl ChunkedPipeline {
    pub fn new(codec: Arc<dyn Codec>, policy: TilingPolicy) -> Self {
        Self {
            codec,
            policy,
            scratch: ScratchArena::new(),
            on_progress: None,
            last_output_size: None,
        }
    }

    pub fn with_progress(mut self, on_progress: ProgressFn) -> Self {
        self.on_progress = Some(on_progress);
        self
    }

    pub fn set_progress(&mut self, on_progress: Option<ProgressFn>) {
        self.on_progress = on_progress;
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    pub fn policy(&self) -> TilingPolicy {
        self.policy
    }

    pub fn scratch(&self) -> &ScratchArena {
        &self.scratch
    }

    /// Output size resolved by the most recent stage of the current route.
    pub fn last_output_size(&self) -> Option<(u32, u32)> {
        self.last_output_size
    }

    /// Drops all scratch memory. Called before any retry.
    pub fn release(&mut self) {
        self.scratch.reset();
    }

    /// Runs every hop of `route`, feeding each stage's output to the next.
    ///
    /// Resizing applies on the first hop only; later hops keep dimensions.
    pub async fn run_route(
        &mut self,
        route: &ConversionRoute,
        request: &ConversionRequest,
        scope: &GovernorScope,
    ) -> Result<StageOutput, ConvertError> {
        let mut input: Arc<[u8]> = Arc::clone(&request.source_data);
        let mut input_bytes = request.effective_size_bytes();
        let mut output = None;
        self.last_output_size = None;

        for (hop, (from, to)) in route.hops().enumerate() {
            let options = if hop == 0 {
                request.options.clone()
            } else {
                ConversionOptions {
                    target_width: None,
                    target_height: None,
                    ..request.options.clone()
                }
            };

            let stage = self
                .convert_stage(&input, from, to, &options, input_bytes, scope)
                .await?;
            debug!(
                hop = hop + 1,
                from = %from,
                to = %to,
                bytes = stage.bytes.len(),
                tiles = stage.tiles,
                "Stage complete"
            );

            input_bytes = stage.bytes.len() as u64;
            input = Arc::from(stage.bytes.as_slice());
            output = Some(stage);
        }

        // Codec work is synchronous, so the deadline may pass inside a stage.
        scope.check()?;
        output.ok_or_else(|| ConvertError::Processing("route has no hops".to_string()))
    }

    /// Converts encoded `source` from one format to another.
    ///
    /// `input_bytes` is the declared or actual input size used for the
    /// tiling decision. Any tile failure aborts the whole stage and nothing
    /// partial is returned.
    pub async fn convert_stage(
        &mut self,
        source: &[u8],
        from: Format,
        to: Format,
        options: &ConversionOptions,
        input_bytes: u64,
        scope: &GovernorScope,
    ) -> Result<StageOutput, ConvertError> {
        scope.check()?;
        let codec = Arc::clone(&self.codec);
        let policy = self.policy;
        let progress = self.on_progress.clone();
        let mut scratch = self.scratch.guard();

        let mut decoded = codec.decode(source, from)?;
        if decoded.width() == 0 || decoded.height() == 0 {
            return Err(CodecError::Decode {
                format: from,
                message: format!("decoded image is {}x{}", decoded.width(), decoded.height()),
            }
            .into());
        }
        scope.checkpoint(|| scratch.reset()).await?;

        let (width, height) = options.resolve_dimensions(decoded.width(), decoded.height());
        self.last_output_size = Some((width, height));
        if width > policy.max_dimension || height > policy.max_dimension {
            return Err(ConvertError::SizeLimit {
                width,
                height,
                max: policy.max_dimension,
            });
        }
        if from.is_vector() && decoded.dimensions() != (width, height) {
            decoded = codec.decode_at(source, from, width, height)?;
            scope.check()?;
        }
        let renderer = Renderer::new(&decoded, width, height, options.flatten_color(to)?);

        if !policy.should_chunk(input_bytes, width, height) {
            let mut canvas = RgbaImage::new(width, height);
            renderer.render(Chunk::full(width, height), &mut canvas);
            let bytes = codec.encode(&canvas, to, options.quality)?;
            scope.check()?;
            if let Some(progress) = &progress {
                progress(1, 1);
            }
            return Ok(StageOutput {
                bytes,
                format: to,
                width,
                height,
                tiles: 0,
            });
        }

        let chunks = plan_chunks(width, height, policy.tile_edge);
        let total = chunks.len();
        info!(
            from = %from,
            to = %to,
            width = width,
            height = height,
            tiles = total,
            "Converting in tiles"
        );

        let mut assembly = RgbaImage::new(width, height);
        for (index, chunk) in chunks.into_iter().enumerate() {
            scope.checkpoint(|| scratch.reset()).await?;

            let mut tile = scratch.take_tile(chunk.width, chunk.height);
            renderer.render(chunk, &mut tile);
            let encoded = codec.encode(&tile, to, options.quality);
            scratch.give_back(tile);
            let encoded = encoded.map_err(|source| ConvertError::TileFailed { chunk, source })?;
            scope.check()?;

            let placed = codec
                .decode(&encoded, to)
                .map_err(|source| ConvertError::TileFailed { chunk, source })?;
            if placed.dimensions() != (chunk.width, chunk.height) {
                return Err(ConvertError::TileFailed {
                    chunk,
                    source: CodecError::Decode {
                        format: to,
                        message: format!(
                            "tile came back as {}x{}",
                            placed.width(),
                            placed.height()
                        ),
                    },
                });
            }
            image::imageops::replace(
                &mut assembly,
                &placed,
                i64::from(chunk.origin_x),
                i64::from(chunk.origin_y),
            );

            if let Some(progress) = &progress {
                progress(index + 1, total);
            }
            if (index + 1) % policy.cleanup_interval == 0 {
                debug!(tiles_done = index + 1, "Scratch cleanup pass");
                scratch.reset();
            }
        }
        drop(renderer);
        drop(decoded);

        // Every tile is placed before the final encode.
        scope.checkpoint(|| scratch.reset()).await?;
        let bytes = codec.encode(&assembly, to, options.quality)?;
        scope.check()?;

        Ok(StageOutput {
            bytes,
            format: to,
            width,
            height,
            tiles: total,
        })
    }
}

/// Maps output pixels back onto the decoded source with bilinear sampling,
/// then optionally flattens onto a background colour.
struct Renderer<'a> {
    source: &'a RgbaImage,
    scale_x: f64,
    scale_y: f64,
    identity: bool,
    background: Option<Rgba<u8>>,
}

impl<'a> Renderer<'a> {
    fn new(
        source: &'a RgbaImage,
        width: u32,
        height: u32,
        background: Option<Rgba<u8>>,
    ) -> Self {
        Self {
            source,
            scale_x: f64::from(source.width()) / f64::from(width),
            scale_y: f64::from(source.height()) / f64::from(height),
            identity: source.dimensions() == (width, height),
            background,
        }
    }

    /// Renders the output region `chunk` into `dst`, which must be exactly
    /// `chunk.width` x `chunk.height`.
    fn render(&self, chunk: Chunk, dst: &mut RgbaImage) {
        let columns: Vec<Tap> = (0..chunk.width)
            .map(|x| Tap::new(chunk.origin_x + x, self.scale_x, self.source.width()))
            .collect();

        for y in 0..chunk.height {
            let row = Tap::new(chunk.origin_y + y, self.scale_y, self.source.height());
            for (x, column) in columns.iter().enumerate() {
                let pixel = if self.identity {
                    *self.source.get_pixel(column.lo, row.lo)
                } else {
                    self.sample(column, &row)
                };
                let pixel = match self.background {
                    Some(background) => flatten(pixel, background),
                    None => pixel,
                };
                dst.put_pixel(x as u32, y, pixel);
            }
        }
    }

    fn sample(&self, column: &Tap, row: &Tap) -> Rgba<u8> {
        let p00 = self.source.get_pixel(column.lo, row.lo).0;
        let p10 = self.source.get_pixel(column.hi, row.lo).0;
        let p01 = self.source.get_pixel(column.lo, row.hi).0;
        let p11 = self.source.get_pixel(column.hi, row.hi).0;
        let (fx, fy) = (column.frac, row.frac);

        let mut out = [0u8; 4];
        for c in 0..4 {
            let top = f64::from(p00[c]) * (1.0 - fx) + f64::from(p10[c]) * fx;
            let bottom = f64::from(p01[c]) * (1.0 - fx) + f64::from(p11[c]) * fx;
            out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
        }
        Rgba(out)
    }
}

/// Two neighbouring source indices and the weight of the upper one.
struct Tap {
    lo: u32,
    hi: u32,
    frac: f64,
}

impl Tap {
    fn new(out: u32, scale: f64, len: u32) -> Self {
        let max = f64::from(len.saturating_sub(1));
        let pos = ((f64::from(out) + 0.5) * scale - 0.5).clamp(0.0, max);
        let lo = pos.floor();
        Self {
            lo: lo as u32,
            hi: (lo + 1.0).min(max) as u32,
            frac: pos - lo,
        }
    }
}

fn flatten(pixel: Rgba<u8>, background: Rgba<u8>) -> Rgba<u8> {
    let alpha = u32::from(pixel[3]);
    if alpha == 255 {
        return pixel;
    }
    let blend = |fg: u8, bg: u8| {
        ((u32::from(fg) * alpha + u32::from(bg) * (255 - alpha) + 127) / 255) as u8
    };
    Rgba([
        blend(pixel[0], background[0]),
        blend(pixel[1], background[1]),
        blend(pixel[2], background[2]),
        255,
    ])
}
