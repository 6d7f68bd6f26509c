//! Reusable per-tile scratch memory.
//!
//! A pipeline owns exactly one [`ScratchArena`]. Tiles borrow a buffer from
//! it, hand it back when done, and the arena is shrunk to nothing with
//! [`ScratchArena::reset`] between stages, on failure, and before retries.

use image::RgbaImage;
use std::ops::{Deref, DerefMut};

#[derive(Debug, Default)]
pub struct ScratchArena {
    buf: Vec<u8>,
    high_water: usize,
    resets: u64,
}

impl ScratchArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a zeroed `width` x `height` RGBA buffer, reusing the arena's
    /// allocation when it is large enough.
    pub fn take_tile(&mut self, width: u32, height: u32) -> RgbaImage {
        let len = width as usize * height as usize * 4;
        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        buf.resize(len, 0);
        self.high_water = self.high_water.max(buf.capacity());
        // Length matches the dimensions exactly, so this cannot fail.
        RgbaImage::from_raw(width, height, buf).unwrap_or_else(|| RgbaImage::new(width, height))
    }

    /// Returns a tile buffer so its allocation can be reused.
    pub fn give_back(&mut self, tile: RgbaImage) {
        let buf = tile.into_raw();
        if buf.capacity() >= self.buf.capacity() {
            self.buf = buf;
        }
    }

    /// Bytes currently held by the arena.
    pub fn held_bytes(&self) -> usize {
        self.buf.capacity()
    }

    /// Largest allocation the arena has handed out since creation.
    pub fn high_water_bytes(&self) -> usize {
        self.high_water
    }

    pub fn reset_count(&self) -> u64 {
        self.resets
    }

    /// Releases all held memory.
    pub fn reset(&mut self) {
        self.buf = Vec::new();
        self.resets += 1;
    }

    /// Borrows the arena for one stage; the arena is reset when the guard
    /// drops, whether the stage finished, failed or was cancelled.
    pub fn guard(&mut self) -> ScratchGuard<'_> {
        ScratchGuard { arena: self }
    }
}

pub struct ScratchGuard<'a> {
    arena: &'a mut ScratchArena,
}

impl Deref for ScratchGuard<'_> {
    type Target = ScratchArena;

    fn deref(&self) -> &ScratchArena {
        self.arena
    }
}

impl DerefMut for ScratchGuard<'_> {
    fn deref_mut(&mut self) -> &mut ScratchArena {
        self.arena
    }
}

impl Drop for ScratchGuard<'_> {
    fn drop(&mut self) {
        self.arena.reset();
    }
}
