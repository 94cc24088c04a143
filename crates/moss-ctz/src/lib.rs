#![forbid(unsafe_code)]
//! CTZ skip-list chains for file data.
//!
//! File contents live in a singly-linked chain of blocks anchored at its
//! most recent block (the head). A block at chain index `n >= 1` begins with
//! `ctz(n) + 1` little-endian pointer words; pointer `i` addresses the block
//! at chain index `n - 2^i`. Index 0 carries no pointers. This gives
//! O(log n) random lookup and O(1) amortized append, and because a block's
//! pointers never change once written, chains are immutable: rewrites share
//! the unaffected prefix and re-head the chain (copy-on-write).
//!
//! Everything here is on-disk index arithmetic over `u32` positions. There
//! is no in-memory linked structure to manage.

use moss_device::{read_unaligned, BlockDevice};
use moss_error::{FsError, Result};
use moss_types::{BlockPointer, Geometry};

/// Number of pointer words stored at the start of the block at `index`.
#[must_use]
pub fn pointer_count(index: u32) -> u32 {
    if index == 0 {
        0
    } else {
        index.trailing_zeros() + 1
    }
}

/// Byte offset where file data begins inside the block at `index`.
#[must_use]
pub fn data_offset(index: u32) -> u32 {
    4 * pointer_count(index)
}

/// Bytes of file data the block at `index` can hold.
#[must_use]
pub fn block_capacity(block_size: u32, index: u32) -> u32 {
    block_size - data_offset(index)
}

/// Map a byte position to `(chain index, offset within that block)`.
///
/// Closed form: with `b = block_size - 8` (the amortized per-block data
/// capacity, since the chain averages two pointer words per block), a first
/// estimate `pos / b` overshoots by at most the pointer-overhead correction,
/// which the popcount terms remove exactly.
#[must_use]
pub fn chain_index(block_size: u32, pos: u32) -> (u32, u32) {
    let b = block_size - 2 * 4;
    let guess = pos / b;
    if guess == 0 {
        return (0, pos);
    }
    let index = (pos - 4 * ((guess - 1).count_ones() + 2)) / b;
    let off = pos - b * index - 4 * index.count_ones();
    (index, off)
}

/// Chain index of the head block for a file of `size` bytes (`size >= 1`).
#[must_use]
pub fn index_for_size(block_size: u32, size: u32) -> u32 {
    debug_assert!(size > 0, "empty files have no chain");
    chain_index(block_size, size - 1).0
}

fn read_pointer(
    dev: &dyn BlockDevice,
    geom: &Geometry,
    block: BlockPointer,
    word: u32,
) -> Result<BlockPointer> {
    let mut raw = [0_u8; 4];
    read_unaligned(dev, geom, block, word * 4, &mut raw)?;
    BlockPointer::decode(u32::from_le_bytes(raw)).ok_or_else(|| FsError::Corrupt {
        block: block.0,
        detail: format!("chain pointer word {word} is the null sentinel"),
    })
}

/// Locate the block holding chain index `target`, descending from the head.
///
/// Each hop takes the largest power-of-two step that does not overshoot,
/// capped by the pointers the current block actually carries, so the walk is
/// O(log n).
pub fn find(
    dev: &dyn BlockDevice,
    geom: &Geometry,
    head: BlockPointer,
    head_index: u32,
    target: u32,
) -> Result<BlockPointer> {
    debug_assert!(target <= head_index);
    let mut current = head_index;
    let mut block = head;
    while current > target {
        let diff = current - target;
        let skip = (31 - diff.leading_zeros()).min(current.trailing_zeros());
        block = read_pointer(dev, geom, block, skip)?;
        current -= 1 << skip;
    }
    Ok(block)
}

/// Build the pointer area for the block that will follow `prev_block`
/// (chain index `prev_index`) in a chain.
///
/// Pointer word `i` of index `n` addresses index `n - 2^i`. Word 0 is the
/// previous block itself; each further word is read from word `i` of the
/// block the previous word addressed, which by construction carries at least
/// `i + 1` pointers.
pub fn build_pointers(
    dev: &dyn BlockDevice,
    geom: &Geometry,
    prev_block: BlockPointer,
    prev_index: u32,
) -> Result<Vec<u8>> {
    let new_index = prev_index + 1;
    let skips = pointer_count(new_index);
    let mut out = Vec::with_capacity((skips * 4) as usize);
    let mut ptr = prev_block;
    for word in 0..skips {
        out.extend_from_slice(&ptr.0.to_le_bytes());
        if word + 1 < skips {
            ptr = read_pointer(dev, geom, ptr, word)?;
        }
    }
    Ok(out)
}

/// Read up to `buf.len()` bytes starting at byte position `pos` of a chain
/// with the given head and size. Returns the number of bytes read; a read at
/// or past end of file returns zero bytes without error.
pub fn read_range(
    dev: &dyn BlockDevice,
    geom: &Geometry,
    head: BlockPointer,
    size: u32,
    pos: u32,
    buf: &mut [u8],
) -> Result<usize> {
    if pos >= size || buf.is_empty() {
        return Ok(0);
    }
    let want = buf.len().min((size - pos) as usize);
    let bs = geom.block_size();
    let head_index = index_for_size(bs, size);
    let mut done = 0_usize;
    let mut cursor = pos;
    while done < want {
        let (index, off) = chain_index(bs, cursor);
        let block = find(dev, geom, head, head_index, index)?;
        let n = ((bs - off) as usize).min(want - done);
        read_unaligned(dev, geom, block, off, &mut buf[done..done + n])?;
        done += n;
        cursor += n as u32;
    }
    Ok(want)
}

/// Visit every block of a chain, head first.
///
/// Used by the allocator's window rebuild; each step follows pointer word 0,
/// so the walk touches all `index + 1` blocks.
pub fn traverse(
    dev: &dyn BlockDevice,
    geom: &Geometry,
    head: BlockPointer,
    size: u32,
    visit: &mut dyn FnMut(BlockPointer),
) -> Result<()> {
    if size == 0 {
        return Ok(());
    }
    let mut index = index_for_size(geom.block_size(), size);
    let mut block = head;
    loop {
        visit(block);
        if index == 0 {
            return Ok(());
        }
        block = read_pointer(dev, geom, block, 0)?;
        index -= 1;
    }
}
