//! Tiling of an output canvas into disjoint rectangular chunks.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A rectangular region of a raster's output area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Chunk {
    pub origin_x: u32,
    pub origin_y: u32,
    pub width: u32,
    pub height: u32,
}

impl Chunk {
    pub fn new(origin_x: u32, origin_y: u32, width: u32, height: u32) -> Self {
        Self {
            origin_x,
            origin_y,
            width,
            height,
        }
    }

    /// A single chunk spanning a whole `width` x `height` canvas.
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.origin_x
            && y >= self.origin_y
            && x - self.origin_x < self.width
            && y - self.origin_y < self.height
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}) {}x{}",
            self.origin_x, self.origin_y, self.width, self.height
        )
    }
}

/// Partitions a `width` x `height` canvas into square tiles of `tile_edge`
/// pixels in row-major order.
///
/// Tiles on the right and bottom edges are truncated to what remains, so the
/// result covers the canvas exactly once. A zero-sized canvas or a zero tile
/// edge yields no chunks.
pub fn plan_chunks(width: u32, height: u32, tile_edge: u32) -> Vec<Chunk> {
    if width == 0 || height == 0 || tile_edge == 0 {
        return Vec::new();
    }

    let cols = width.div_ceil(tile_edge);
    let rows = height.div_ceil(tile_edge);
    let mut chunks = Vec::with_capacity((cols as usize) * (rows as usize));

    for row in 0..rows {
        let origin_y = row * tile_edge;
        let chunk_height = tile_edge.min(height - origin_y);
        for col in 0..cols {
            let origin_x = col * tile_edge;
            let chunk_width = tile_edge.min(width - origin_x);
            chunks.push(Chunk::new(origin_x, origin_y, chunk_width, chunk_height));
        }
    }

    chunks
}
