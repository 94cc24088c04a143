//! Committed-state traversal.
//!
//! Everything on the device is reachable from the superblock pair and the
//! root directory pair; there is no inode table. The allocator's window
//! rebuild and `fs_stat` both walk that reachability graph and mark every
//! block it touches: pair blocks, then file chains via their CTZ pointers.

use moss_device::BlockDevice;
use moss_error::Result;
use moss_mdlog::{EntryPayload, MetaPair};
use moss_types::{BlockPointer, Geometry};

use crate::SUPERBLOCK_PAIR;

/// Mark every block referenced by committed metadata.
///
/// Uncommitted allocations (open write streams, half-built directories) are
/// the caller's responsibility; the filesystem layers its pending sets on
/// top of this walk.
pub(crate) fn mark_in_use(
    dev: &dyn BlockDevice,
    geom: &Geometry,
    root: [BlockPointer; 2],
    mark: &mut dyn FnMut(BlockPointer),
) -> Result<()> {
    mark(SUPERBLOCK_PAIR[0]);
    mark(SUPERBLOCK_PAIR[1]);

    let mut stack = vec![root];
    while let Some(blocks) = stack.pop() {
        mark(blocks[0]);
        mark(blocks[1]);
        let pair = MetaPair::fetch(dev, geom, blocks)?;
        for entry in pair.entries(dev, geom)? {
            match entry.payload {
                EntryPayload::File {
                    head: Some(head),
                    size,
                } => moss_ctz::traverse(dev, geom, head, size, mark)?,
                EntryPayload::File { head: None, .. } => {}
                EntryPayload::Dir { pair } => stack.push(pair),
            }
        }
    }
    Ok(())
}
