#![forbid(unsafe_code)]
//! Metadata log over directory block pairs.
//!
//! Every directory (and the superblock) is a pair of blocks holding a small
//! append-only log of tagged records. Appends accumulate at the tail of the
//! active half and become visible only through a commit record carrying a
//! CRC32C over everything before it; a torn append is invisible after
//! remount because its commit never validates. When the active half fills
//! (or its erased tail was dirtied by a torn append), a compaction writes a
//! consolidated copy of the live entries into the sibling half under the next
//! revision number, and the active role flips. The flip is the sole
//! atomicity mechanism: a crash before the sibling's commit validates leaves
//! the prior half intact, a crash after leaves the new one, so a pair is
//! always recoverable to its last complete commit.
//!
//! ## Block layout
//!
//! ```text
//! [revision: u32 LE][record]...[record][commit][pad*] ... erased tail (0xFF)
//! ```
//!
//! Records carry a 4-byte header `{tag, name_len, data_len: u16 LE}` followed
//! by the name and data bytes. A commit's data is the CRC32C of all bytes
//! from the block start through the commit header. Commits are padded with
//! zero bytes to the next `prog_size` boundary so every append starts on a
//! programmable unit.
//!
//! Lookup and iteration present results in the log's logical order, with
//! later records overriding earlier ones of the same name and tombstones
//! removing them.

use moss_device::{read_block, BlockDevice};
use moss_error::{FsError, Result};
use moss_types::{
    align_up, read_fixed, read_le_u16, read_le_u32, BlockPointer, Geometry, ParseError,
    DISK_MAGIC, NAME_MAX,
};
use tracing::{debug, warn};

const TAG_FILE: u8 = 0x01;
const TAG_DIR: u8 = 0x02;
const TAG_TOMBSTONE: u8 = 0x04;
const TAG_SUPERBLOCK: u8 = 0x0F;
const TAG_COMMIT: u8 = 0x2F;
const TAG_PAD: u8 = 0x00;
const TAG_ERASED: u8 = 0xFF;

const RECORD_HEADER_LEN: usize = 4;
const REVISION_LEN: usize = 4;

/// What a directory entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPayload {
    /// Regular file: head of its CTZ chain and its size in bytes.
    File {
        head: Option<BlockPointer>,
        size: u32,
    },
    /// Subdirectory: its own block pair.
    Dir { pair: [BlockPointer; 2] },
}

/// A live directory entry as presented by [`MetaPair::entries`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryRecord {
    pub name: String,
    pub payload: EntryPayload,
}

/// The superblock record stored in the fixed pair `{0, 1}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperblockRecord {
    pub version: u32,
    pub block_size: u32,
    pub block_count: u32,
    pub root: [BlockPointer; 2],
}

/// One mutation submitted to [`MetaPair::commit`]. All ops in a single
/// commit become visible atomically.
#[derive(Debug, Clone)]
pub enum LogOp<'a> {
    Upsert {
        name: &'a str,
        payload: EntryPayload,
    },
    Remove {
        name: &'a str,
    },
    Superblock(SuperblockRecord),
}

/// Which half of the pair currently holds the valid log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairHalf {
    A,
    B,
}

impl PairHalf {
    fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    fn index(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }
}

/// In-RAM handle to one directory pair. Holds only protocol state; record
/// contents are re-read from the device on demand.
#[derive(Debug, Clone)]
pub struct MetaPair {
    blocks: [BlockPointer; 2],
    active: PairHalf,
    rev: u32,
    committed_len: u32,
    tail_clean: bool,
}

// ── Record encoding ─────────────────────────────────────────────────────────

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(FsError::InvalidArgument("empty entry name".to_owned()));
    }
    if name.len() > NAME_MAX {
        return Err(FsError::NameTooLong);
    }
    Ok(())
}

fn push_header(buf: &mut Vec<u8>, tag: u8, name_len: usize, data_len: usize) {
    buf.push(tag);
    buf.push(name_len as u8);
    buf.extend_from_slice(&(data_len as u16).to_le_bytes());
}

fn encode_op(buf: &mut Vec<u8>, op: &LogOp<'_>) -> Result<()> {
    match op {
        LogOp::Upsert { name, payload } => {
            check_name(name)?;
            match payload {
                EntryPayload::File { head, size } => {
                    push_header(buf, TAG_FILE, name.len(), 8);
                    buf.extend_from_slice(name.as_bytes());
                    buf.extend_from_slice(&BlockPointer::encode(*head).to_le_bytes());
                    buf.extend_from_slice(&size.to_le_bytes());
                }
                EntryPayload::Dir { pair } => {
                    push_header(buf, TAG_DIR, name.len(), 8);
                    buf.extend_from_slice(name.as_bytes());
                    buf.extend_from_slice(&pair[0].0.to_le_bytes());
                    buf.extend_from_slice(&pair[1].0.to_le_bytes());
                }
            }
        }
        LogOp::Remove { name } => {
            check_name(name)?;
            push_header(buf, TAG_TOMBSTONE, name.len(), 0);
            buf.extend_from_slice(name.as_bytes());
        }
        LogOp::Superblock(sb) => {
            push_header(buf, TAG_SUPERBLOCK, 0, 28);
            buf.extend_from_slice(&DISK_MAGIC);
            buf.extend_from_slice(&sb.version.to_le_bytes());
            buf.extend_from_slice(&sb.block_size.to_le_bytes());
            buf.extend_from_slice(&sb.block_count.to_le_bytes());
            buf.extend_from_slice(&sb.root[0].0.to_le_bytes());
            buf.extend_from_slice(&sb.root[1].0.to_le_bytes());
        }
    }
    Ok(())
}

/// Append a commit record and pad to the next program unit.
fn encode_commit(buf: &mut Vec<u8>, prog_size: u32) {
    push_header(buf, TAG_COMMIT, 0, 4);
    let crc = crc32c::crc32c(buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    let padded = align_up(buf.len() as u32, prog_size) as usize;
    buf.resize(padded, TAG_PAD);
}

// ── Record decoding ─────────────────────────────────────────────────────────

enum ParsedRecord {
    Pad,
    Commit { crc: u32, crc_offset: usize },
    Entry(DirEntryRecord),
    Tombstone(String),
    Superblock(SuperblockRecord),
}

fn parse_name(bytes: &[u8], offset: usize, len: usize) -> std::result::Result<String, ParseError> {
    let raw = moss_types::ensure_slice(bytes, offset, len)?;
    String::from_utf8(raw.to_vec()).map_err(|_| ParseError::InvalidField {
        field: "name",
        reason: "not valid utf-8",
    })
}

/// Parse one record at `offset`; returns the record and the offset just
/// past it.
fn parse_record(
    bytes: &[u8],
    offset: usize,
) -> std::result::Result<(ParsedRecord, usize), ParseError> {
    let tag = *bytes.get(offset).ok_or(ParseError::InsufficientData {
        needed: 1,
        offset,
        actual: 0,
    })?;
    if tag == TAG_PAD {
        return Ok((ParsedRecord::Pad, offset + 1));
    }

    let name_len = usize::from(*bytes.get(offset + 1).ok_or(ParseError::InsufficientData {
        needed: RECORD_HEADER_LEN,
        offset,
        actual: 1,
    })?);
    let data_len = usize::from(read_le_u16(bytes, offset + 2)?);
    let name_start = offset + RECORD_HEADER_LEN;
    let data_start = name_start + name_len;
    let end = data_start + data_len;
    moss_types::ensure_slice(bytes, offset, end - offset)?;

    let record = match tag {
        TAG_FILE => {
            if data_len != 8 {
                return Err(ParseError::InvalidField {
                    field: "file record",
                    reason: "data length must be 8",
                });
            }
            let name = parse_name(bytes, name_start, name_len)?;
            let head = BlockPointer::decode(read_le_u32(bytes, data_start)?);
            let size = read_le_u32(bytes, data_start + 4)?;
            ParsedRecord::Entry(DirEntryRecord {
                name,
                payload: EntryPayload::File { head, size },
            })
        }
        TAG_DIR => {
            if data_len != 8 {
                return Err(ParseError::InvalidField {
                    field: "dir record",
                    reason: "data length must be 8",
                });
            }
            let name = parse_name(bytes, name_start, name_len)?;
            let pair = [
                BlockPointer(read_le_u32(bytes, data_start)?),
                BlockPointer(read_le_u32(bytes, data_start + 4)?),
            ];
            ParsedRecord::Entry(DirEntryRecord {
                name,
                payload: EntryPayload::Dir { pair },
            })
        }
        TAG_TOMBSTONE => {
            let name = parse_name(bytes, name_start, name_len)?;
            ParsedRecord::Tombstone(name)
        }
        TAG_SUPERBLOCK => {
            if name_len != 0 || data_len != 28 {
                return Err(ParseError::InvalidField {
                    field: "superblock record",
                    reason: "unexpected length",
                });
            }
            let magic: [u8; 8] = read_fixed(bytes, data_start)?;
            if magic != DISK_MAGIC {
                return Err(ParseError::InvalidField {
                    field: "magic",
                    reason: "not a mossfs superblock",
                });
            }
            ParsedRecord::Superblock(SuperblockRecord {
                version: read_le_u32(bytes, data_start + 8)?,
                block_size: read_le_u32(bytes, data_start + 12)?,
                block_count: read_le_u32(bytes, data_start + 16)?,
                root: [
                    BlockPointer(read_le_u32(bytes, data_start + 20)?),
                    BlockPointer(read_le_u32(bytes, data_start + 24)?),
                ],
            })
        }
        TAG_COMMIT => {
            if name_len != 0 || data_len != 4 {
                return Err(ParseError::InvalidField {
                    field: "commit record",
                    reason: "unexpected length",
                });
            }
            ParsedRecord::Commit {
                crc: read_le_u32(bytes, data_start)?,
                crc_offset: data_start,
            }
        }
        other => return Err(ParseError::UnknownTag { tag: other, offset }),
    };
    Ok((record, end))
}

// ── Half scanning ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct ScanOutcome {
    rev: u32,
    committed_len: u32,
    tail_clean: bool,
}

/// Scan one half of a pair. Returns `None` when no commit validates.
///
/// Parsing is lenient past the last valid commit: a torn append leaves
/// arbitrary bytes there, which simply end the scan.
fn scan_half(bytes: &[u8], prog_size: u32) -> Option<ScanOutcome> {
    let rev = read_le_u32(bytes, 0).ok()?;
    let mut offset = REVISION_LEN;
    let mut committed_len: Option<u32> = None;

    while offset < bytes.len() {
        if bytes[offset] == TAG_ERASED {
            break;
        }
        let Ok((record, next)) = parse_record(bytes, offset) else {
            break;
        };
        if let ParsedRecord::Commit { crc, crc_offset } = record {
            if crc32c::crc32c(&bytes[..crc_offset]) != crc {
                break;
            }
            let end = align_up(next as u32, prog_size).min(bytes.len() as u32);
            committed_len = Some(end);
        }
        offset = next;
    }

    committed_len.map(|committed_len| ScanOutcome {
        rev,
        committed_len,
        tail_clean: bytes[committed_len as usize..]
            .iter()
            .all(|b| *b == TAG_ERASED),
    })
}

/// Wrapping revision comparison: `a` is strictly newer than `b`.
fn rev_newer(a: u32, b: u32) -> bool {
    a.wrapping_sub(b) as i32 > 0
}

/// The materialized live view of one half's committed records.
#[derive(Debug, Default)]
struct LiveView {
    entries: Vec<Option<DirEntryRecord>>,
    superblock: Option<SuperblockRecord>,
}

impl LiveView {
    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|e| e.name == name))
    }

    fn upsert(&mut self, record: DirEntryRecord) {
        match self.position(&record.name) {
            Some(idx) => self.entries[idx] = Some(record),
            None => self.entries.push(Some(record)),
        }
    }

    fn remove(&mut self, name: &str) {
        if let Some(idx) = self.position(name) {
            self.entries[idx] = None;
        }
    }

    fn live(self) -> Vec<DirEntryRecord> {
        self.entries.into_iter().flatten().collect()
    }
}

fn live_view(bytes: &[u8], committed_len: u32) -> std::result::Result<LiveView, ParseError> {
    let mut view = LiveView::default();
    let mut offset = REVISION_LEN;
    while offset < committed_len as usize {
        let (record, next) = parse_record(bytes, offset)?;
        match record {
            ParsedRecord::Pad | ParsedRecord::Commit { .. } => {}
            ParsedRecord::Entry(entry) => view.upsert(entry),
            ParsedRecord::Tombstone(name) => view.remove(&name),
            ParsedRecord::Superblock(sb) => view.superblock = Some(sb),
        }
        offset = next;
    }
    Ok(view)
}

// ── Pair protocol ───────────────────────────────────────────────────────────

impl MetaPair {
    /// Initialize a fresh pair: erase both halves and commit an empty log
    /// with revision 1 into half A.
    pub fn create(
        dev: &dyn BlockDevice,
        geom: &Geometry,
        blocks: [BlockPointer; 2],
    ) -> Result<Self> {
        dev.erase(blocks[0])?;
        dev.erase(blocks[1])?;

        let mut img = Vec::with_capacity(16);
        img.extend_from_slice(&1_u32.to_le_bytes());
        encode_commit(&mut img, geom.prog_size());
        dev.prog(blocks[0], 0, &img)?;

        Ok(Self {
            blocks,
            active: PairHalf::A,
            rev: 1,
            committed_len: img.len() as u32,
            tail_clean: true,
        })
    }

    /// Load a pair from the device, recovering to the newest valid half.
    pub fn fetch(
        dev: &dyn BlockDevice,
        geom: &Geometry,
        blocks: [BlockPointer; 2],
    ) -> Result<Self> {
        let bytes_a = read_block(dev, geom, blocks[0])?;
        let bytes_b = read_block(dev, geom, blocks[1])?;
        let a = scan_half(&bytes_a, geom.prog_size());
        let b = scan_half(&bytes_b, geom.prog_size());

        let (active, outcome) = match (a, b) {
            (Some(a), Some(b)) => {
                if rev_newer(b.rev, a.rev) {
                    (PairHalf::B, b)
                } else {
                    (PairHalf::A, a)
                }
            }
            (Some(a), None) => {
                // An erased sibling is the normal state for a pair that has
                // never compacted; anything else is a torn or damaged half.
                if !bytes_b.iter().all(|byte| *byte == 0xFF) {
                    warn!(
                        block = blocks[1].0,
                        "pair half has no valid commit, recovering from sibling"
                    );
                }
                (PairHalf::A, a)
            }
            (None, Some(b)) => {
                if !bytes_a.iter().all(|byte| *byte == 0xFF) {
                    warn!(
                        block = blocks[0].0,
                        "pair half has no valid commit, recovering from sibling"
                    );
                }
                (PairHalf::B, b)
            }
            (None, None) => {
                return Err(FsError::Corrupt {
                    block: blocks[0].0,
                    detail: "no valid commit in either half of the pair".to_owned(),
                });
            }
        };

        Ok(Self {
            blocks,
            active,
            rev: outcome.rev,
            committed_len: outcome.committed_len,
            tail_clean: outcome.tail_clean,
        })
    }

    #[must_use]
    pub fn blocks(&self) -> [BlockPointer; 2] {
        self.blocks
    }

    #[must_use]
    pub fn active_block(&self) -> BlockPointer {
        self.blocks[self.active.index()]
    }

    #[must_use]
    pub fn revision(&self) -> u32 {
        self.rev
    }

    fn corrupt(&self, err: &ParseError) -> FsError {
        FsError::Corrupt {
            block: self.active_block().0,
            detail: err.to_string(),
        }
    }

    fn view(&self, dev: &dyn BlockDevice, geom: &Geometry) -> Result<LiveView> {
        let bytes = read_block(dev, geom, self.active_block())?;
        live_view(&bytes, self.committed_len).map_err(|e| self.corrupt(&e))
    }

    /// Live entries in the log's logical order.
    pub fn entries(&self, dev: &dyn BlockDevice, geom: &Geometry) -> Result<Vec<DirEntryRecord>> {
        Ok(self.view(dev, geom)?.live())
    }

    /// Look up one entry by exact (byte-compared) name.
    pub fn lookup(
        &self,
        dev: &dyn BlockDevice,
        geom: &Geometry,
        name: &str,
    ) -> Result<Option<EntryPayload>> {
        Ok(self
            .view(dev, geom)?
            .live()
            .into_iter()
            .find(|e| e.name == name)
            .map(|e| e.payload))
    }

    /// The superblock record, if this pair carries one.
    pub fn superblock(
        &self,
        dev: &dyn BlockDevice,
        geom: &Geometry,
    ) -> Result<Option<SuperblockRecord>> {
        Ok(self.view(dev, geom)?.superblock)
    }

    /// Whether the pair holds no live entries.
    pub fn is_empty(&self, dev: &dyn BlockDevice, geom: &Geometry) -> Result<bool> {
        Ok(self.entries(dev, geom)?.is_empty())
    }

    /// Commit a batch of mutations atomically.
    ///
    /// Appends to the active half when its erased tail has room; otherwise
    /// compacts into the sibling. Nothing is observable until the commit
    /// record is durably programmed.
    pub fn commit(&mut self, dev: &dyn BlockDevice, geom: &Geometry, ops: &[LogOp<'_>]) -> Result<()> {
        if self.tail_clean {
            let mut img = read_block(dev, geom, self.active_block())?;
            img.truncate(self.committed_len as usize);
            for op in ops {
                encode_op(&mut img, op)?;
            }
            encode_commit(&mut img, geom.prog_size());
            if img.len() <= geom.block_size_usize() {
                dev.prog(
                    self.active_block(),
                    self.committed_len,
                    &img[self.committed_len as usize..],
                )?;
                self.committed_len = img.len() as u32;
                return Ok(());
            }
        }
        self.compact(dev, geom, ops)
    }

    /// Consolidate live entries plus `ops` into the sibling half and flip.
    fn compact(&mut self, dev: &dyn BlockDevice, geom: &Geometry, ops: &[LogOp<'_>]) -> Result<()> {
        let mut view = self.view(dev, geom)?;
        for op in ops {
            match op {
                LogOp::Upsert { name, payload } => {
                    check_name(name)?;
                    view.upsert(DirEntryRecord {
                        name: (*name).to_owned(),
                        payload: *payload,
                    });
                }
                LogOp::Remove { name } => {
                    check_name(name)?;
                    view.remove(name);
                }
                LogOp::Superblock(sb) => view.superblock = Some(*sb),
            }
        }

        let next_rev = self.rev.wrapping_add(1);
        let mut img = Vec::with_capacity(geom.block_size_usize());
        img.extend_from_slice(&next_rev.to_le_bytes());
        if let Some(sb) = view.superblock {
            encode_op(&mut img, &LogOp::Superblock(sb))?;
        }
        for entry in view.entries.iter().flatten() {
            encode_op(
                &mut img,
                &LogOp::Upsert {
                    name: &entry.name,
                    payload: entry.payload,
                },
            )?;
        }
        encode_commit(&mut img, geom.prog_size());
        if img.len() > geom.block_size_usize() {
            return Err(FsError::NoSpace);
        }

        let sibling = self.blocks[self.active.other().index()];
        dev.erase(sibling)?;
        dev.prog(sibling, 0, &img)?;

        debug!(
            from = self.active_block().0,
            to = sibling.0,
            rev = next_rev,
            "compacted metadata pair"
        );
        self.active = self.active.other();
        self.rev = next_rev;
        self.committed_len = img.len() as u32;
        self.tail_clean = true;
        Ok(())
    }
}
