#![forbid(unsafe_code)]
//! Free-block tracking with a lookahead bitmap window.
//!
//! The allocator never holds a full free-block map in RAM. It keeps a
//! bounded bitmap over a contiguous (wrapping) sub-range of block indices
//! and scans it lazily. When the window is exhausted it advances to the next
//! range and re-derives the bitmap from current metadata state via a
//! traversal closure supplied by the caller, so a block reported free here is
//! re-verified against the metadata log before it is ever handed out. The
//! rescan is O(block_count) in the worst case and amortized rare.
//!
//! Blocks are never freed explicitly. Reclamation is deferred: a block whose
//! last reference was dropped simply stops being marked at the next rebuild.

use moss_error::{FsError, Result};
use moss_types::{BlockPointer, Geometry};
use tracing::debug;

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    let mut free = 0_u32;
    for idx in 0..count {
        if !bitmap_get(bitmap, idx) {
            free += 1;
        }
    }
    free
}

// ── Lookahead window ────────────────────────────────────────────────────────

/// Lookahead free-block allocator.
///
/// A set bit means "in use". The window covers `lookahead_size * 8` block
/// indices (capped at `block_count`) starting at `window_start`, wrapping
/// around the end of the device.
#[derive(Debug)]
pub struct Lookahead {
    block_count: u32,
    window_blocks: u32,
    bitmap: Vec<u8>,
    window_start: u32,
    cursor: u32,
    primed: bool,
    /// No allocation has been served from the current bitmap, so its free
    /// bits reflect the traversal exactly.
    fresh: bool,
    scanned: u64,
}

impl Lookahead {
    #[must_use]
    pub fn new(geom: &Geometry) -> Self {
        let bits = u64::from(geom.lookahead_size()) * 8;
        let window_blocks = u32::try_from(bits.min(u64::from(geom.block_count())))
            .unwrap_or(geom.block_count());
        Self {
            block_count: geom.block_count(),
            window_blocks,
            bitmap: vec![0_u8; geom.lookahead_size() as usize],
            window_start: 0,
            cursor: 0,
            primed: false,
            fresh: false,
            scanned: 0,
        }
    }

    /// Number of blocks covered by one window.
    #[must_use]
    pub fn window_blocks(&self) -> u32 {
        self.window_blocks
    }

    /// Allocate one free block.
    ///
    /// `refill` must mark every in-use block by calling the sink it is given:
    /// committed metadata reachable from the root plus any blocks allocated
    /// but not yet committed. It is invoked only when the window needs to be
    /// re-derived.
    ///
    /// Two calls within one mount session never return the same block before
    /// the first is committed, provided the caller's `refill` reports
    /// uncommitted allocations.
    pub fn allocate<F>(&mut self, mut refill: F) -> Result<BlockPointer>
    where
        F: FnMut(&mut dyn FnMut(BlockPointer)) -> Result<()>,
    {
        loop {
            if !self.primed {
                self.rebuild(&mut refill)?;
            }
            while self.cursor < self.window_blocks {
                let bit = self.cursor;
                self.cursor += 1;
                if !bitmap_get(&self.bitmap, bit) {
                    bitmap_set(&mut self.bitmap, bit);
                    self.scanned = 0;
                    self.fresh = false;
                    let block = (self.window_start + bit) % self.block_count;
                    return Ok(BlockPointer(block));
                }
            }

            // Window exhausted. A bitmap that already served allocations may
            // hide blocks freed since it was derived, so re-derive it in
            // place once before moving on. Give up only after a full device
            // revolution of freshly derived windows finds no free bit.
            if self.fresh {
                self.scanned += u64::from(self.window_blocks);
                if self.scanned >= u64::from(self.block_count) {
                    return Err(FsError::NoSpace);
                }
                self.window_start =
                    (self.window_start + self.window_blocks) % self.block_count;
            }
            self.primed = false;
        }
    }

    fn rebuild<F>(&mut self, refill: &mut F) -> Result<()>
    where
        F: FnMut(&mut dyn FnMut(BlockPointer)) -> Result<()>,
    {
        debug!(
            window_start = self.window_start,
            window_blocks = self.window_blocks,
            "rebuilding lookahead window"
        );
        let start = self.window_start;
        let count = self.block_count;
        let window = self.window_blocks;
        let mut bits = vec![0_u8; self.bitmap.len()];
        refill(&mut |block: BlockPointer| {
            let b = block.0 % count;
            let distance = if b >= start {
                b - start
            } else {
                b + count - start
            };
            if distance < window {
                bitmap_set(&mut bits, distance);
            }
        })?;
        self.bitmap = bits;
        self.cursor = 0;
        self.primed = true;
        self.fresh = true;
        Ok(())
    }
}
