#![forbid(unsafe_code)]
//! Block device adapter layer.
//!
//! Provides the [`BlockDevice`] capability contract the engine calls into
//! (read, program, erase, sync plus nothing else), alignment and bounds
//! checking shared by all implementations, and two reference devices: a
//! RAM-backed device for tests and simulation, and a file-backed device for
//! persistent images.
//!
//! The adapter performs no retries. Any error from a callback propagates
//! unchanged to the engine and from there to the caller. A program
//! interrupted by power loss may leave a half-written region; layers above
//! detect that through metadata CRCs, not here.

use moss_error::{FsError, Result};
use moss_types::{align_down, align_up, BlockPointer, Geometry};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// The erased byte value. `erase` resets every byte of a block to this.
pub const ERASED_BYTE: u8 = 0xFF;

/// Block-addressed storage interface.
///
/// Preconditions shared by `read` and `prog`: `off + len` lies within
/// `block_size` and `off`/`len` are aligned to `read_size` or `prog_size` as
/// applicable. Implementations may assume the engine has validated this via
/// [`check_access`] and should still reject violations defensively.
///
/// A block must be erased before it is programmed; programming the same
/// region twice without an intervening erase is a caller bug.
pub trait BlockDevice: Send + Sync {
    /// Read `buf.len()` bytes from `block` starting at `off`.
    fn read(&self, block: BlockPointer, off: u32, buf: &mut [u8]) -> Result<()>;

    /// Program `data` into `block` starting at `off`.
    fn prog(&self, block: BlockPointer, off: u32, data: &[u8]) -> Result<()>;

    /// Reset `block` to the erased state.
    fn erase(&self, block: BlockPointer) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

impl<'a, T: BlockDevice + ?Sized> BlockDevice for &'a T {
    fn read(&self, block: BlockPointer, off: u32, buf: &mut [u8]) -> Result<()> {
        (**self).read(block, off, buf)
    }

    fn prog(&self, block: BlockPointer, off: u32, data: &[u8]) -> Result<()> {
        (**self).prog(block, off, data)
    }

    fn erase(&self, block: BlockPointer) -> Result<()> {
        (**self).erase(block)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

/// Validate a block access against the device geometry.
///
/// `unit` is the required alignment for `off` and `len`: `read_size` for
/// reads, `prog_size` for programs.
pub fn check_access(
    geom: &Geometry,
    block: BlockPointer,
    off: u32,
    len: usize,
    unit: u32,
) -> Result<()> {
    if block.0 >= geom.block_count() {
        return Err(FsError::InvalidArgument(format!(
            "block {} out of range (block_count {})",
            block.0,
            geom.block_count()
        )));
    }
    let len = u32::try_from(len)
        .map_err(|_| FsError::InvalidArgument("access length exceeds u32".to_owned()))?;
    let end = off
        .checked_add(len)
        .ok_or_else(|| FsError::InvalidArgument("access range overflows u32".to_owned()))?;
    if end > geom.block_size() {
        return Err(FsError::InvalidArgument(format!(
            "access beyond block end: off={off} len={len} block_size={}",
            geom.block_size()
        )));
    }
    if off % unit != 0 || len % unit != 0 {
        return Err(FsError::InvalidArgument(format!(
            "unaligned access: off={off} len={len} unit={unit}"
        )));
    }
    Ok(())
}

/// Read an arbitrary byte range by widening it to the covering
/// `read_size`-aligned region and copying out the requested slice.
pub fn read_unaligned(
    dev: &dyn BlockDevice,
    geom: &Geometry,
    block: BlockPointer,
    off: u32,
    buf: &mut [u8],
) -> Result<()> {
    if buf.is_empty() {
        return Ok(());
    }
    let len = u32::try_from(buf.len())
        .map_err(|_| FsError::InvalidArgument("read length exceeds u32".to_owned()))?;
    let unit = geom.read_size();
    let start = align_down(off, unit);
    let end = align_up(
        off.checked_add(len)
            .ok_or_else(|| FsError::InvalidArgument("read range overflows u32".to_owned()))?,
        unit,
    );
    if end > geom.block_size() {
        return Err(FsError::InvalidArgument(format!(
            "read beyond block end: off={off} len={len}"
        )));
    }
    if start == off && end == off + len {
        return dev.read(block, off, buf);
    }
    let mut scratch = vec![0_u8; (end - start) as usize];
    dev.read(block, start, &mut scratch)?;
    let skip = (off - start) as usize;
    buf.copy_from_slice(&scratch[skip..skip + buf.len()]);
    Ok(())
}

/// Read one whole block.
pub fn read_block(
    dev: &dyn BlockDevice,
    geom: &Geometry,
    block: BlockPointer,
) -> Result<Vec<u8>> {
    let mut buf = vec![0_u8; geom.block_size_usize()];
    dev.read(block, 0, &mut buf)?;
    Ok(buf)
}

/// RAM-backed block device.
///
/// Erase fills the block with [`ERASED_BYTE`]; in debug builds, programming a
/// region that is not fully erased panics, which surfaces protocol bugs in
/// the layers above.
#[derive(Debug)]
pub struct RamBlockDevice {
    geometry: Geometry,
    cells: Mutex<Vec<u8>>,
}

impl RamBlockDevice {
    #[must_use]
    pub fn new(geometry: Geometry) -> Self {
        let len = geometry.device_bytes() as usize;
        Self {
            geometry,
            cells: Mutex::new(vec![ERASED_BYTE; len]),
        }
    }

    /// Rehydrate a device from a previously captured image.
    pub fn from_image(geometry: Geometry, image: Vec<u8>) -> Result<Self> {
        if image.len() as u64 != geometry.device_bytes() {
            return Err(FsError::InvalidArgument(format!(
                "image length {} does not match geometry ({} bytes)",
                image.len(),
                geometry.device_bytes()
            )));
        }
        Ok(Self {
            geometry,
            cells: Mutex::new(image),
        })
    }

    /// Snapshot the full device contents.
    #[must_use]
    pub fn image(&self) -> Vec<u8> {
        self.cells.lock().clone()
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn range(&self, block: BlockPointer, off: u32, len: usize) -> (usize, usize) {
        let base = block.0 as usize * self.geometry.block_size_usize() + off as usize;
        (base, base + len)
    }
}

impl BlockDevice for RamBlockDevice {
    fn read(&self, block: BlockPointer, off: u32, buf: &mut [u8]) -> Result<()> {
        check_access(&self.geometry, block, off, buf.len(), self.geometry.read_size())?;
        let (start, end) = self.range(block, off, buf.len());
        buf.copy_from_slice(&self.cells.lock()[start..end]);
        Ok(())
    }

    fn prog(&self, block: BlockPointer, off: u32, data: &[u8]) -> Result<()> {
        check_access(&self.geometry, block, off, data.len(), self.geometry.prog_size())?;
        let (start, end) = self.range(block, off, data.len());
        let mut cells = self.cells.lock();
        debug_assert!(
            cells[start..end].iter().all(|b| *b == ERASED_BYTE),
            "program of non-erased region: block={} off={off} len={}",
            block.0,
            data.len()
        );
        cells[start..end].copy_from_slice(data);
        Ok(())
    }

    fn erase(&self, block: BlockPointer) -> Result<()> {
        check_access(&self.geometry, block, 0, self.geometry.block_size_usize(), 1)?;
        let (start, end) = self.range(block, 0, self.geometry.block_size_usize());
        self.cells.lock()[start..end].fill(ERASED_BYTE);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// File-backed block device using fixed-offset I/O (`pread`/`pwrite`
/// semantics via `FileExt`, which needs no shared seek position).
#[derive(Debug, Clone)]
pub struct FileBlockDevice {
    file: Arc<File>,
    geometry: Geometry,
}

impl FileBlockDevice {
    /// Open an existing image; its length must match the geometry.
    pub fn open(path: impl AsRef<Path>, geometry: Geometry) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        if len != geometry.device_bytes() {
            return Err(FsError::InvalidArgument(format!(
                "image length {len} does not match geometry ({} bytes)",
                geometry.device_bytes()
            )));
        }
        Ok(Self {
            file: Arc::new(file),
            geometry,
        })
    }

    /// Create a fresh image with every block in the erased state.
    pub fn create(path: impl AsRef<Path>, geometry: Geometry) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        let blank = vec![ERASED_BYTE; geometry.block_size_usize()];
        for block in 0..geometry.block_count() {
            let offset = u64::from(block) * u64::from(geometry.block_size());
            file.write_all_at(&blank, offset)?;
        }
        Ok(Self {
            file: Arc::new(file),
            geometry,
        })
    }

    fn byte_offset(&self, block: BlockPointer, off: u32) -> u64 {
        u64::from(block.0) * u64::from(self.geometry.block_size()) + u64::from(off)
    }
}

impl BlockDevice for FileBlockDevice {
    fn read(&self, block: BlockPointer, off: u32, buf: &mut [u8]) -> Result<()> {
        check_access(&self.geometry, block, off, buf.len(), self.geometry.read_size())?;
        self.file.read_exact_at(buf, self.byte_offset(block, off))?;
        Ok(())
    }

    fn prog(&self, block: BlockPointer, off: u32, data: &[u8]) -> Result<()> {
        check_access(&self.geometry, block, off, data.len(), self.geometry.prog_size())?;
        self.file.write_all_at(data, self.byte_offset(block, off))?;
        Ok(())
    }

    fn erase(&self, block: BlockPointer) -> Result<()> {
        check_access(&self.geometry, block, 0, self.geometry.block_size_usize(), 1)?;
        let blank = vec![ERASED_BYTE; self.geometry.block_size_usize()];
        self.file.write_all_at(&blank, self.byte_offset(block, 0))?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geom() -> Geometry {
        Geometry::new(16, 16, 512, 8, 16).expect("geometry")
    }

    #[test]
    fn ram_device_round_trips() {
        let dev = RamBlockDevice::new(geom());
        dev.prog(BlockPointer(2), 32, &[7_u8; 64]).expect("prog");
        let mut buf = [0_u8; 64];
        dev.read(BlockPointer(2), 32, &mut buf).expect("read");
        assert_eq!(buf, [7_u8; 64]);
    }

    #[test]
    fn ram_device_starts_erased_and_erase_restores() {
        let dev = RamBlockDevice::new(geom());
        let mut buf = [0_u8; 16];
        dev.read(BlockPointer(0), 0, &mut buf).expect("read");
        assert_eq!(buf, [ERASED_BYTE; 16]);

        dev.prog(BlockPointer(0), 0, &[1_u8; 16]).expect("prog");
        dev.erase(BlockPointer(0)).expect("erase");
        dev.read(BlockPointer(0), 0, &mut buf).expect("read");
        assert_eq!(buf, [ERASED_BYTE; 16]);
    }

    #[test]
    fn bounds_and_alignment_are_rejected() {
        let dev = RamBlockDevice::new(geom());
        let mut buf = [0_u8; 16];
        // out-of-range block
        assert!(dev.read(BlockPointer(8), 0, &mut buf).is_err());
        // unaligned offset
        assert!(dev.read(BlockPointer(0), 3, &mut buf).is_err());
        // unaligned length
        assert!(dev.prog(BlockPointer(0), 0, &[0_u8; 5]).is_err());
        // past block end
        assert!(dev.read(BlockPointer(0), 512, &mut buf).is_err());
    }

    #[test]
    fn read_unaligned_widens_to_read_units() {
        let dev = RamBlockDevice::new(geom());
        let mut pattern = [0_u8; 64];
        for (i, b) in pattern.iter_mut().enumerate() {
            *b = i as u8;
        }
        dev.prog(BlockPointer(1), 0, &pattern).expect("prog");

        let mut out = [0_u8; 10];
        read_unaligned(&dev, &geom(), BlockPointer(1), 3, &mut out).expect("read");
        assert_eq!(out, pattern[3..13]);
    }

    #[test]
    fn image_snapshot_round_trips() {
        let dev = RamBlockDevice::new(geom());
        dev.prog(BlockPointer(5), 16, &[9_u8; 16]).expect("prog");
        let image = dev.image();

        let copy = RamBlockDevice::from_image(geom(), image).expect("from_image");
        let mut buf = [0_u8; 16];
        copy.read(BlockPointer(5), 16, &mut buf).expect("read");
        assert_eq!(buf, [9_u8; 16]);
    }

    #[test]
    fn file_device_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("moss.img");
        let dev = FileBlockDevice::create(&path, geom()).expect("create");
        dev.prog(BlockPointer(3), 48, &[5_u8; 32]).expect("prog");
        dev.sync().expect("sync");
        drop(dev);

        let dev = FileBlockDevice::open(&path, geom()).expect("open");
        let mut buf = [0_u8; 32];
        dev.read(BlockPointer(3), 48, &mut buf).expect("read");
        assert_eq!(buf, [5_u8; 32]);

        // erased regions read back as 0xFF
        let mut blank = [0_u8; 16];
        dev.read(BlockPointer(7), 0, &mut blank).expect("read");
        assert_eq!(blank, [ERASED_BYTE; 16]);
    }

    #[test]
    fn file_device_rejects_wrong_length() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("short.img");
        std::fs::write(&path, [0_u8; 100]).expect("write");
        assert!(FileBlockDevice::open(&path, geom()).is_err());
    }
}
