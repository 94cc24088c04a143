//! File handles and the write engine over CTZ chains.
//!
//! A handle tracks the committed chain `(head, size)`, the logical position,
//! and while writing, a one-block RAM cache for the block currently being
//! appended. Writes that strictly extend the file append into the cache;
//! a write that lands inside committed data copies the containing block's
//! prefix into a freshly allocated block and appends from there, so the
//! committed chain stays fully valid until the new head is committed on
//! sync. Flush preserves any committed data past the write position by
//! copying it forward from the old chain.

use moss_device::read_unaligned;
use moss_error::{FsError, Result};
use moss_mdlog::{EntryPayload, LogOp, MetaPair};
use moss_types::{align_up, BlockPointer};

use crate::{BlockDevice, Filesystem};

bitflags::bitflags! {
    /// Open mode for [`Filesystem::file_open`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Open for reading.
        const READ = 1 << 0;
        /// Open for writing.
        const WRITE = 1 << 1;
        /// Create the file if it does not exist.
        const CREATE = 1 << 2;
        /// With `CREATE`, fail if the file already exists.
        const EXCL = 1 << 3;
        /// Discard existing contents on open.
        const TRUNCATE = 1 << 4;
        /// Every write appends to the end of the file.
        const APPEND = 1 << 5;
    }
}

/// Seek origin for [`Filesystem::file_seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    Start(u32),
    Current(i64),
    End(i64),
}

/// An open file. Owned exclusively by the caller that opened it and
/// destroyed by [`Filesystem::file_close`], which flushes pending writes
/// first.
#[derive(Debug)]
pub struct FileHandle {
    pub(crate) id: u64,
    pub(crate) parent: [BlockPointer; 2],
    pub(crate) name: String,
    flags: OpenFlags,
    pos: u32,
    head: Option<BlockPointer>,
    size: u32,
    dirty: bool,
    write: Option<WriteState>,
}

#[derive(Debug)]
struct WriteState {
    /// Block currently being filled; programmed when full or at flush.
    block: BlockPointer,
    /// Its chain index.
    index: u32,
    /// Whole-block image under construction.
    cache: Vec<u8>,
    /// Next byte to fill in `cache`.
    off: u32,
    /// Committed chain at the time writing began, for the flush tail copy.
    old_head: Option<BlockPointer>,
    old_size: u32,
}

impl FileHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

const COPY_CHUNK: usize = 256;

impl<D: BlockDevice> Filesystem<D> {
    /// Open a file. The entry is created immediately under `CREATE`, so a
    /// crash right after open leaves an empty file rather than nothing.
    pub fn file_open(&mut self, path: &str, flags: OpenFlags) -> Result<FileHandle> {
        if !flags.intersects(OpenFlags::READ | OpenFlags::WRITE) {
            return Err(FsError::InvalidArgument(
                "open requires read or write access".to_owned(),
            ));
        }
        if flags.contains(OpenFlags::EXCL) && !flags.contains(OpenFlags::CREATE) {
            return Err(FsError::InvalidArgument(
                "EXCL is only meaningful with CREATE".to_owned(),
            ));
        }
        if flags.intersects(OpenFlags::TRUNCATE | OpenFlags::APPEND)
            && !flags.contains(OpenFlags::WRITE)
        {
            return Err(FsError::InvalidArgument(
                "TRUNCATE and APPEND require write access".to_owned(),
            ));
        }

        let segments = crate::path::normalize(path)?;
        if segments.is_empty() {
            return Err(FsError::IsDirectory);
        }
        let (mut parent, name) = self.resolve_parent(&segments)?;

        let geom = *self.geometry();
        let (head, size, dirty) = match parent.lookup(&self.device, &geom, &name)? {
            Some(EntryPayload::Dir { .. }) => return Err(FsError::IsDirectory),
            Some(EntryPayload::File { head, size }) => {
                if flags.contains(OpenFlags::CREATE | OpenFlags::EXCL) {
                    return Err(FsError::Exists(path.to_owned()));
                }
                if flags.contains(OpenFlags::TRUNCATE) {
                    (None, 0, true)
                } else {
                    (head, size, false)
                }
            }
            None => {
                if !flags.contains(OpenFlags::CREATE) {
                    return Err(FsError::NotFound(path.to_owned()));
                }
                parent.commit(
                    &self.device,
                    &geom,
                    &[LogOp::Upsert {
                        name: &name,
                        payload: EntryPayload::File {
                            head: None,
                            size: 0,
                        },
                    }],
                )?;
                (None, 0, false)
            }
        };

        let id = self.next_handle;
        self.next_handle += 1;
        self.pending.insert(id, Vec::new());
        Ok(FileHandle {
            id,
            parent: parent.blocks(),
            name,
            flags,
            pos: 0,
            head,
            size,
            dirty,
            write: None,
        })
    }

    /// Read from the current position. Returns the number of bytes read;
    /// reading at or past end of file yields zero bytes without error.
    pub fn file_read(&mut self, handle: &mut FileHandle, buf: &mut [u8]) -> Result<usize> {
        if !handle.flags.contains(OpenFlags::READ) {
            return Err(FsError::InvalidArgument(
                "file is not open for reading".to_owned(),
            ));
        }
        self.flush(handle)?;
        if handle.size == 0 || handle.pos >= handle.size {
            return Ok(0);
        }
        let geom = *self.geometry();
        let head = handle.head.expect("nonzero size implies a chain");
        let n = moss_ctz::read_range(&self.device, &geom, head, handle.size, handle.pos, buf)?;
        handle.pos += n as u32;
        Ok(n)
    }

    /// Write at the current position, extending the file as needed.
    pub fn file_write(&mut self, handle: &mut FileHandle, data: &[u8]) -> Result<usize> {
        if !handle.flags.contains(OpenFlags::WRITE) {
            return Err(FsError::InvalidArgument(
                "file is not open for writing".to_owned(),
            ));
        }
        if data.is_empty() {
            return Ok(0);
        }
        if handle.flags.contains(OpenFlags::APPEND) && handle.pos < self.file_size(handle) {
            self.flush(handle)?;
            handle.pos = handle.size;
        }
        u32::try_from(data.len())
            .ok()
            .and_then(|len| handle.pos.checked_add(len))
            .ok_or_else(|| FsError::InvalidArgument("file size overflows u32".to_owned()))?;

        // A position past the end is a gap to zero-fill first.
        if handle.write.is_none() && handle.pos > handle.size {
            let target = handle.pos;
            handle.pos = handle.size;
            self.write_begin(handle)?;
            let zeros = [0_u8; COPY_CHUNK];
            while handle.pos < target {
                let n = ((target - handle.pos) as usize).min(COPY_CHUNK);
                self.append_cached(handle, &zeros[..n])?;
            }
        }
        if handle.write.is_none() {
            self.write_begin(handle)?;
        }
        self.append_cached(handle, data)?;
        Ok(data.len())
    }

    /// Move the read/write position. Seeking past the end is allowed; a
    /// later write zero-fills the gap.
    pub fn file_seek(&mut self, handle: &mut FileHandle, from: SeekFrom) -> Result<u32> {
        self.flush(handle)?;
        let target = match from {
            SeekFrom::Start(off) => i64::from(off),
            SeekFrom::Current(delta) => i64::from(handle.pos) + delta,
            SeekFrom::End(delta) => i64::from(handle.size) + delta,
        };
        let pos = u32::try_from(target)
            .map_err(|_| FsError::InvalidArgument(format!("seek out of range: {target}")))?;
        handle.pos = pos;
        Ok(pos)
    }

    /// Current position.
    #[must_use]
    pub fn file_tell(&self, handle: &FileHandle) -> u32 {
        handle.pos
    }

    /// Logical file size, including unflushed appends.
    #[must_use]
    pub fn file_size(&self, handle: &FileHandle) -> u32 {
        if handle.write.is_some() {
            handle.size.max(handle.pos)
        } else {
            handle.size
        }
    }

    /// Shrink or grow the file. Shrinking re-points the head at the chain
    /// node covering the new size; the blocks beyond it are reclaimed
    /// lazily by the next allocator rescan. Growing zero-fills.
    pub fn file_truncate(&mut self, handle: &mut FileHandle, new_size: u32) -> Result<()> {
        if !handle.flags.contains(OpenFlags::WRITE) {
            return Err(FsError::InvalidArgument(
                "file is not open for writing".to_owned(),
            ));
        }
        self.flush(handle)?;
        let geom = *self.geometry();
        match new_size.cmp(&handle.size) {
            std::cmp::Ordering::Equal => Ok(()),
            std::cmp::Ordering::Less => {
                if new_size == 0 {
                    handle.head = None;
                } else {
                    let bs = geom.block_size();
                    let head = handle.head.expect("nonzero size implies a chain");
                    let head_index = moss_ctz::index_for_size(bs, handle.size);
                    let target = moss_ctz::chain_index(bs, new_size - 1).0;
                    handle.head =
                        Some(moss_ctz::find(&self.device, &geom, head, head_index, target)?);
                }
                handle.size = new_size;
                handle.dirty = true;
                Ok(())
            }
            std::cmp::Ordering::Greater => {
                let saved = handle.pos;
                handle.pos = handle.size;
                self.write_begin(handle)?;
                let zeros = [0_u8; COPY_CHUNK];
                while handle.pos < new_size {
                    let n = ((new_size - handle.pos) as usize).min(COPY_CHUNK);
                    self.append_cached(handle, &zeros[..n])?;
                }
                self.flush(handle)?;
                handle.pos = saved;
                Ok(())
            }
        }
    }

    /// Flush pending writes and commit the new chain head into the owning
    /// metadata entry. This is the operation's single atomic commit point:
    /// until it completes, the file's committed state is unchanged.
    pub fn file_sync(&mut self, handle: &mut FileHandle) -> Result<()> {
        self.flush(handle)?;
        if handle.dirty {
            let geom = *self.geometry();
            let mut parent = MetaPair::fetch(&self.device, &geom, handle.parent)?;
            parent.commit(
                &self.device,
                &geom,
                &[LogOp::Upsert {
                    name: &handle.name,
                    payload: EntryPayload::File {
                        head: handle.head,
                        size: handle.size,
                    },
                }],
            )?;
            handle.dirty = false;
            // The chain is now reachable from committed metadata.
            if let Some(pending) = self.pending.get_mut(&handle.id) {
                pending.clear();
            }
        }
        self.device.sync()
    }

    /// Close the handle, flushing and committing pending writes first.
    pub fn file_close(&mut self, mut handle: FileHandle) -> Result<()> {
        let result = self.file_sync(&mut handle);
        self.pending.remove(&handle.id);
        result
    }

    /// Set up a write stream appending at `handle.pos` (which is within the
    /// committed size). Re-heads the chain with a copy-on-write block when
    /// the position lands inside committed data.
    fn write_begin(&mut self, handle: &mut FileHandle) -> Result<()> {
        debug_assert!(handle.write.is_none());
        debug_assert!(handle.pos <= handle.size);
        let geom = *self.geometry();
        let bs = geom.block_size();

        let (block, index, off, cache) = if handle.pos == 0 || handle.head.is_none() {
            let block = self.alloc_for(handle.id, &[])?;
            (block, 0, 0, vec![0_u8; bs as usize])
        } else {
            let head = handle.head.expect("checked above");
            let head_index = moss_ctz::index_for_size(bs, handle.size);
            let (index, last_off) = moss_ctz::chain_index(bs, handle.pos - 1);
            let prev = moss_ctz::find(&self.device, &geom, head, head_index, index)?;
            let off = last_off + 1;
            if off == bs {
                // The position starts a fresh block; chain it to the shared
                // prefix.
                let block = self.alloc_for(handle.id, &[])?;
                let pointers = moss_ctz::build_pointers(&self.device, &geom, prev, index)?;
                let mut cache = vec![0_u8; bs as usize];
                cache[..pointers.len()].copy_from_slice(&pointers);
                (block, index + 1, pointers.len() as u32, cache)
            } else {
                // Copy-on-write: duplicate the block prefix (pointers
                // included) and continue inside the copy.
                let block = self.alloc_for(handle.id, &[])?;
                let mut cache = vec![0_u8; bs as usize];
                read_unaligned(&self.device, &geom, prev, 0, &mut cache[..off as usize])?;
                (block, index, off, cache)
            }
        };

        handle.write = Some(WriteState {
            block,
            index,
            cache,
            off,
            old_head: handle.head,
            old_size: handle.size,
        });
        Ok(())
    }

    /// Append bytes into the write cache, programming full blocks and
    /// chaining new ones as boundaries are crossed.
    ///
    /// Any failure kills the write stream: the committed chain is untouched
    /// by design, so dropping the buffered bytes leaves the file exactly as
    /// of its last commit.
    fn append_cached(&mut self, handle: &mut FileHandle, data: &[u8]) -> Result<()> {
        let result = self.append_cached_inner(handle, data);
        if result.is_err() {
            handle.write = None;
        }
        result
    }

    fn append_cached_inner(&mut self, handle: &mut FileHandle, data: &[u8]) -> Result<()> {
        let geom = *self.geometry();
        let bs = geom.block_size();
        let mut remaining = data;
        while !remaining.is_empty() {
            let full = {
                let ws = handle.write.as_ref().expect("write stream active");
                ws.off == bs
            };
            if full {
                let (prev_block, prev_index) = {
                    let ws = handle.write.as_ref().expect("write stream active");
                    self.device.prog(ws.block, 0, &ws.cache)?;
                    (ws.block, ws.index)
                };
                let block = self.alloc_for(handle.id, &[])?;
                let pointers =
                    moss_ctz::build_pointers(&self.device, &geom, prev_block, prev_index)?;

                let ws = handle.write.as_mut().expect("write stream active");
                ws.block = block;
                ws.index = prev_index + 1;
                ws.off = pointers.len() as u32;
                ws.cache.fill(0);
                ws.cache[..pointers.len()].copy_from_slice(&pointers);
            }

            let ws = handle.write.as_mut().expect("write stream active");
            let n = ((bs - ws.off) as usize).min(remaining.len());
            let start = ws.off as usize;
            ws.cache[start..start + n].copy_from_slice(&remaining[..n]);
            ws.off += n as u32;
            handle.pos += n as u32;
            remaining = &remaining[n..];
        }
        Ok(())
    }

    /// Complete the write stream: preserve committed data past the write
    /// position, program the partial tail block, and adopt the new head.
    /// The metadata entry is not touched; that happens on sync.
    ///
    /// On failure the stream is dropped and the handle keeps its committed
    /// state, per the nothing-observable-before-commit contract.
    pub(crate) fn flush(&mut self, handle: &mut FileHandle) -> Result<()> {
        if handle.write.is_none() {
            return Ok(());
        }
        let user_pos = handle.pos;
        let result = self.flush_inner(handle);
        if result.is_err() {
            handle.write = None;
        }
        handle.pos = user_pos;
        result
    }

    fn flush_inner(&mut self, handle: &mut FileHandle) -> Result<()> {
        let geom = *self.geometry();
        let user_pos = handle.pos;
        let (old_head, old_size) = {
            let ws = handle.write.as_ref().expect("write stream active");
            (ws.old_head, ws.old_size)
        };
        if user_pos < old_size {
            let head = old_head.expect("nonzero committed size implies a chain");
            let mut buf = [0_u8; COPY_CHUNK];
            let mut cursor = user_pos;
            while cursor < old_size {
                let n = ((old_size - cursor) as usize).min(COPY_CHUNK);
                moss_ctz::read_range(&self.device, &geom, head, old_size, cursor, &mut buf[..n])?;
                self.append_cached(handle, &buf[..n])?;
                cursor += n as u32;
            }
        }

        let ws = handle.write.take().expect("write stream active");
        if ws.off > 0 {
            let prog_len = align_up(ws.off, geom.prog_size());
            self.device.prog(ws.block, 0, &ws.cache[..prog_len as usize])?;
            handle.head = Some(ws.block);
            handle.size = handle.pos;
            handle.dirty = true;
        }
        Ok(())
    }
}
