#![forbid(unsafe_code)]
//! The mossfs engine: a small power-loss-resilient filesystem for raw block
//! storage with bounded RAM.
//!
//! Each mounted filesystem is an explicit, independently constructed
//! [`Filesystem`] instance over a caller-supplied block device; there is no
//! global state, and any number of instances over disjoint devices coexist.
//! One logical thread of control per instance is assumed: methods take
//! `&mut self` and perform no internal locking. Callers needing shared
//! access wrap the instance in their own mutex.
//!
//! Consistency after unclean shutdown is structural. Directory metadata
//! lives in paired-block logs whose commits are CRC-checked and whose
//! compactions alternate halves (`moss-mdlog`); file data lives in immutable
//! copy-on-write chains (`moss-ctz`) whose new head only becomes visible
//! through a metadata commit. Mount therefore runs no repair pass.

mod config;
mod dir;
mod file;
mod path;
mod traverse;

use std::collections::{BTreeSet, HashMap};

use moss_alloc::Lookahead;
use moss_mdlog::{LogOp, MetaPair, SuperblockRecord};
use moss_types::{version_major, version_minor, DISK_VERSION};
use serde::{Deserialize, Serialize};
use tracing::info;

pub use config::Config;
pub use dir::{DirHandle, EntryInfo, EntryType};
pub use file::{FileHandle, OpenFlags, SeekFrom};
pub use moss_device::{BlockDevice, FileBlockDevice, RamBlockDevice};
pub use moss_error::{FsError, Result};
pub use moss_types::{BlockPointer, Geometry, NAME_MAX};

/// The superblock pair lives at a fixed well-known location.
pub const SUPERBLOCK_PAIR: [BlockPointer; 2] = [BlockPointer(0), BlockPointer(1)];

/// Where `format` places the root directory pair.
const INITIAL_ROOT_PAIR: [BlockPointer; 2] = [BlockPointer(2), BlockPointer(3)];

/// Usage report returned by [`Filesystem::fs_stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsInfo {
    pub block_size: u32,
    pub block_count: u32,
    pub blocks_in_use: u32,
}

/// A mounted filesystem instance owning its block device.
#[derive(Debug)]
pub struct Filesystem<D: BlockDevice> {
    device: D,
    config: Config,
    root: [BlockPointer; 2],
    alloc: Lookahead,
    /// Blocks allocated per open handle but not yet reachable from committed
    /// metadata; layered onto traversal so the allocator cannot hand them
    /// out twice.
    pending: HashMap<u64, Vec<BlockPointer>>,
    next_handle: u64,
}

impl<D: BlockDevice> Filesystem<D> {
    /// Write a fresh filesystem: a root pair and the superblock record that
    /// points at it.
    pub fn format(device: &D, config: &Config) -> Result<()> {
        let geom = config.geometry();
        let root = MetaPair::create(device, geom, INITIAL_ROOT_PAIR)?;
        let mut superblock = MetaPair::create(device, geom, SUPERBLOCK_PAIR)?;
        superblock.commit(
            device,
            geom,
            &[LogOp::Superblock(SuperblockRecord {
                version: DISK_VERSION,
                block_size: geom.block_size(),
                block_count: geom.block_count(),
                root: root.blocks(),
            })],
        )?;
        device.sync()?;
        info!(
            block_size = geom.block_size(),
            block_count = geom.block_count(),
            "formatted filesystem"
        );
        Ok(())
    }

    /// Validate the superblock and take ownership of the device.
    pub fn mount(device: D, config: Config) -> Result<Self> {
        let geom = *config.geometry();
        let superblock_pair = MetaPair::fetch(&device, &geom, SUPERBLOCK_PAIR)?;
        let Some(superblock) = superblock_pair.superblock(&device, &geom)? else {
            return Err(FsError::Corrupt {
                block: SUPERBLOCK_PAIR[0].0,
                detail: "superblock record missing".to_owned(),
            });
        };

        if version_major(superblock.version) != version_major(DISK_VERSION)
            || version_minor(superblock.version) > version_minor(DISK_VERSION)
        {
            return Err(FsError::Incompatible(format!(
                "on-disk version {}.{}, supported {}.{}",
                version_major(superblock.version),
                version_minor(superblock.version),
                version_major(DISK_VERSION),
                version_minor(DISK_VERSION),
            )));
        }
        if superblock.block_size != geom.block_size()
            || superblock.block_count != geom.block_count()
        {
            return Err(FsError::Incompatible(format!(
                "on-disk geometry {}x{}, configured {}x{}",
                superblock.block_size,
                superblock.block_count,
                geom.block_size(),
                geom.block_count(),
            )));
        }

        // The root pair must hold at least one valid commit.
        MetaPair::fetch(&device, &geom, superblock.root)?;
        info!(
            block_count = geom.block_count(),
            root_a = superblock.root[0].0,
            root_b = superblock.root[1].0,
            "mounted filesystem"
        );

        let alloc = Lookahead::new(&geom);
        Ok(Self {
            device,
            config,
            root: superblock.root,
            alloc,
            pending: HashMap::new(),
            next_handle: 1,
        })
    }

    /// Release the instance and hand the device back. Callers should close
    /// or sync open file handles first; unflushed writes are dropped.
    pub fn unmount(self) -> D {
        self.device
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn geometry(&self) -> &Geometry {
        self.config.geometry()
    }

    /// Allocate one block and erase it, re-verifying window state against
    /// committed metadata plus all uncommitted allocations. `extra` carries
    /// blocks allocated earlier in the same operation that no pending list
    /// covers yet.
    pub(crate) fn alloc_block(&mut self, extra: &[BlockPointer]) -> Result<BlockPointer> {
        let Self {
            device,
            config,
            root,
            alloc,
            pending,
            ..
        } = self;
        let geom = config.geometry();
        let block = alloc.allocate(|mark| {
            traverse::mark_in_use(&*device, geom, *root, mark)?;
            for list in pending.values() {
                for block in list {
                    mark(*block);
                }
            }
            for block in extra {
                mark(*block);
            }
            Ok(())
        })?;
        self.device.erase(block)?;
        Ok(block)
    }

    pub(crate) fn alloc_for(&mut self, handle: u64, extra: &[BlockPointer]) -> Result<BlockPointer> {
        let block = self.alloc_block(extra)?;
        self.pending.entry(handle).or_default().push(block);
        Ok(block)
    }

    /// Count blocks in use by walking reachable metadata and chains.
    pub fn fs_stat(&self) -> Result<FsInfo> {
        let geom = self.geometry();
        let mut used = BTreeSet::new();
        traverse::mark_in_use(&self.device, geom, self.root, &mut |block| {
            used.insert(block.0);
        })?;
        for list in self.pending.values() {
            for block in list {
                used.insert(block.0);
            }
        }
        Ok(FsInfo {
            block_size: geom.block_size(),
            block_count: geom.block_count(),
            blocks_in_use: used.len() as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::new(Geometry::new(16, 16, 512, 64, 16).expect("geometry"))
    }

    fn mounted() -> Filesystem<RamBlockDevice> {
        let device = RamBlockDevice::new(*config().geometry());
        Filesystem::format(&device, &config()).expect("format");
        Filesystem::mount(device, config()).expect("mount")
    }

    #[test]
    fn format_then_mount_yields_empty_root() {
        let fs = mounted();
        let mut dir = fs.dir_open("/").expect("dir_open");
        assert_eq!(fs.dir_read(&mut dir).expect("dir_read"), None);

        let info = fs.stat("/").expect("stat");
        assert_eq!(info.entry_type, EntryType::Directory);
        assert_eq!(info.name, "/");
    }

    #[test]
    fn mount_of_blank_device_is_corrupt() {
        let device = RamBlockDevice::new(*config().geometry());
        let err = Filesystem::mount(device, config()).expect_err("unformatted");
        assert!(matches!(err, FsError::Corrupt { .. }));
    }

    #[test]
    fn mount_rejects_mismatched_geometry() {
        let device = RamBlockDevice::new(*config().geometry());
        Filesystem::format(&device, &config()).expect("format");

        // Same device bytes, different claimed block_count.
        let other = Config::new(Geometry::new(16, 16, 512, 32, 16).expect("geometry"));
        let image = device.image();
        let shrunk =
            RamBlockDevice::from_image(*other.geometry(), image[..512 * 32].to_vec())
                .expect("image");
        let err = Filesystem::mount(shrunk, other).expect_err("geometry mismatch");
        assert!(matches!(err, FsError::Incompatible(_)));
    }

    #[test]
    fn mount_rejects_newer_version() {
        let device = RamBlockDevice::new(*config().geometry());
        let geom = *config().geometry();
        let root = MetaPair::create(&device, &geom, INITIAL_ROOT_PAIR).expect("root");
        let mut superblock = MetaPair::create(&device, &geom, SUPERBLOCK_PAIR).expect("sb");
        superblock
            .commit(
                &device,
                &geom,
                &[LogOp::Superblock(SuperblockRecord {
                    version: 0x0002_0000,
                    block_size: geom.block_size(),
                    block_count: geom.block_count(),
                    root: root.blocks(),
                })],
            )
            .expect("commit");

        let err = Filesystem::mount(device, config()).expect_err("newer version");
        assert!(matches!(err, FsError::Incompatible(_)));
    }

    #[test]
    fn file_write_read_round_trip() {
        let mut fs = mounted();
        let mut file = fs
            .file_open(
                "/hello.txt",
                OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE,
            )
            .expect("open");
        let payload = b"hello, mossfs";
        assert_eq!(fs.file_write(&mut file, payload).expect("write"), payload.len());
        fs.file_seek(&mut file, SeekFrom::Start(0)).expect("seek");
        let mut buf = vec![0_u8; payload.len()];
        assert_eq!(fs.file_read(&mut file, &mut buf).expect("read"), payload.len());
        assert_eq!(&buf, payload);
        fs.file_close(file).expect("close");

        let info = fs.stat("/hello.txt").expect("stat");
        assert_eq!(info.entry_type, EntryType::File);
        assert_eq!(info.size, payload.len() as u32);
    }

    #[test]
    fn multi_block_file_round_trips() {
        let mut fs = mounted();
        let mut file = fs
            .file_open(
                "/big.bin",
                OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE,
            )
            .expect("open");
        // Five blocks' worth, written in uneven chunks.
        let data: Vec<u8> = (0..2600_u32).map(|i| (i % 251) as u8).collect();
        for chunk in data.chunks(317) {
            fs.file_write(&mut file, chunk).expect("write");
        }
        fs.file_sync(&mut file).expect("sync");

        fs.file_seek(&mut file, SeekFrom::Start(0)).expect("seek");
        let mut back = vec![0_u8; data.len()];
        assert_eq!(fs.file_read(&mut file, &mut back).expect("read"), data.len());
        assert_eq!(back, data);
        fs.file_close(file).expect("close");
    }

    #[test]
    fn overlapping_writes_read_back_last_writer() {
        let mut fs = mounted();
        let mut file = fs
            .file_open(
                "/overlap",
                OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE,
            )
            .expect("open");
        fs.file_write(&mut file, &[0xAA_u8; 10]).expect("write");
        fs.file_seek(&mut file, SeekFrom::Start(5)).expect("seek");
        fs.file_write(&mut file, &[0xBB_u8; 10]).expect("write");
        fs.file_seek(&mut file, SeekFrom::Start(0)).expect("seek");

        let mut buf = [0_u8; 15];
        assert_eq!(fs.file_read(&mut file, &mut buf).expect("read"), 15);
        assert_eq!(&buf[..5], &[0xAA; 5]);
        assert_eq!(&buf[5..], &[0xBB; 10]);
        assert_eq!(fs.file_size(&file), 15);
        fs.file_close(file).expect("close");
    }

    #[test]
    fn mid_file_write_preserves_tail() {
        let mut fs = mounted();
        let mut file = fs
            .file_open(
                "/tail",
                OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE,
            )
            .expect("open");
        let data: Vec<u8> = (0..1500_u32).map(|i| (i % 251) as u8).collect();
        fs.file_write(&mut file, &data).expect("write");
        fs.file_sync(&mut file).expect("sync");

        // Overwrite 8 bytes in the middle; everything after must survive.
        fs.file_seek(&mut file, SeekFrom::Start(700)).expect("seek");
        fs.file_write(&mut file, &[0xEE_u8; 8]).expect("write");
        fs.file_sync(&mut file).expect("sync");

        fs.file_seek(&mut file, SeekFrom::Start(0)).expect("seek");
        let mut back = vec![0_u8; 1500];
        assert_eq!(fs.file_read(&mut file, &mut back).expect("read"), 1500);
        assert_eq!(&back[..700], &data[..700]);
        assert_eq!(&back[700..708], &[0xEE; 8]);
        assert_eq!(&back[708..], &data[708..]);
        assert_eq!(fs.file_size(&file), 1500);
        fs.file_close(file).expect("close");
    }

    #[test]
    fn truncate_shrinks_and_grows() {
        let mut fs = mounted();
        let mut file = fs
            .file_open(
                "/trunc",
                OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE,
            )
            .expect("open");
        let data: Vec<u8> = (0..1200_u32).map(|i| (i % 251) as u8).collect();
        fs.file_write(&mut file, &data).expect("write");
        fs.file_sync(&mut file).expect("sync");

        fs.file_truncate(&mut file, 300).expect("shrink");
        assert_eq!(fs.file_size(&file), 300);
        fs.file_seek(&mut file, SeekFrom::Start(0)).expect("seek");
        let mut back = vec![0_u8; 400];
        assert_eq!(fs.file_read(&mut file, &mut back).expect("read"), 300);
        assert_eq!(&back[..300], &data[..300]);

        fs.file_truncate(&mut file, 500).expect("grow");
        assert_eq!(fs.file_size(&file), 500);
        fs.file_seek(&mut file, SeekFrom::Start(0)).expect("seek");
        let mut grown = vec![0_u8; 500];
        assert_eq!(fs.file_read(&mut file, &mut grown).expect("read"), 500);
        assert_eq!(&grown[..300], &data[..300]);
        assert!(grown[300..].iter().all(|b| *b == 0));
        fs.file_close(file).expect("close");
    }

    #[test]
    fn seek_past_end_zero_fills_gap() {
        let mut fs = mounted();
        let mut file = fs
            .file_open(
                "/gap",
                OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE,
            )
            .expect("open");
        fs.file_write(&mut file, b"go").expect("write");
        fs.file_seek(&mut file, SeekFrom::Start(100)).expect("seek");
        fs.file_write(&mut file, b"end").expect("write");
        fs.file_sync(&mut file).expect("sync");
        assert_eq!(fs.file_size(&file), 103);

        fs.file_seek(&mut file, SeekFrom::Start(0)).expect("seek");
        let mut back = vec![0_u8; 103];
        assert_eq!(fs.file_read(&mut file, &mut back).expect("read"), 103);
        assert_eq!(&back[..2], b"go");
        assert!(back[2..100].iter().all(|b| *b == 0));
        assert_eq!(&back[100..], b"end");
        fs.file_close(file).expect("close");
    }

    #[test]
    fn open_flag_combinations() {
        let mut fs = mounted();
        // missing access mode
        assert!(matches!(
            fs.file_open("/x", OpenFlags::CREATE).expect_err("no access"),
            FsError::InvalidArgument(_)
        ));
        // no such file without CREATE
        assert!(matches!(
            fs.file_open("/x", OpenFlags::READ).expect_err("missing"),
            FsError::NotFound(_)
        ));

        let file = fs
            .file_open("/x", OpenFlags::WRITE | OpenFlags::CREATE)
            .expect("create");
        fs.file_close(file).expect("close");

        // EXCL on an existing file
        assert!(matches!(
            fs.file_open(
                "/x",
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::EXCL
            )
            .expect_err("exists"),
            FsError::Exists(_)
        ));
        // opening a directory as a file
        fs.create_dir("/d").expect("mkdir");
        assert!(matches!(
            fs.file_open("/d", OpenFlags::READ).expect_err("directory"),
            FsError::IsDirectory
        ));
    }

    #[test]
    fn append_mode_writes_at_end() {
        let mut fs = mounted();
        let mut file = fs
            .file_open(
                "/log",
                OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE,
            )
            .expect("open");
        fs.file_write(&mut file, b"first").expect("write");
        fs.file_close(file).expect("close");

        let mut file = fs
            .file_open("/log", OpenFlags::READ | OpenFlags::WRITE | OpenFlags::APPEND)
            .expect("open");
        fs.file_seek(&mut file, SeekFrom::Start(0)).expect("seek");
        fs.file_write(&mut file, b"+more").expect("write");
        fs.file_seek(&mut file, SeekFrom::Start(0)).expect("seek");
        let mut buf = [0_u8; 10];
        assert_eq!(fs.file_read(&mut file, &mut buf).expect("read"), 10);
        assert_eq!(&buf, b"first+more");
        fs.file_close(file).expect("close");
    }

    #[test]
    fn directories_nest_and_list() {
        let mut fs = mounted();
        fs.create_dir("/d").expect("mkdir");
        fs.create_dir("/d/e").expect("mkdir");
        let file = fs
            .file_open("/d/b.txt", OpenFlags::WRITE | OpenFlags::CREATE)
            .expect("open");
        fs.file_close(file).expect("close");

        let mut dir = fs.dir_open("/d").expect("dir_open");
        let mut names = Vec::new();
        while let Some(entry) = fs.dir_read(&mut dir).expect("dir_read") {
            names.push((entry.name, entry.entry_type));
        }
        assert_eq!(
            names,
            vec![
                ("e".to_owned(), EntryType::Directory),
                ("b.txt".to_owned(), EntryType::File)
            ]
        );

        fs.dir_rewind(&mut dir);
        assert!(fs.dir_read(&mut dir).expect("dir_read").is_some());
        fs.dir_close(dir);

        // errors
        assert!(matches!(
            fs.dir_open("/d/b.txt").expect_err("file"),
            FsError::NotDirectory
        ));
        assert!(matches!(
            fs.dir_open("/missing").expect_err("missing"),
            FsError::NotFound(_)
        ));
        assert!(matches!(
            fs.create_dir("/d").expect_err("exists"),
            FsError::Exists(_)
        ));
    }

    #[test]
    fn remove_semantics() {
        let mut fs = mounted();
        fs.create_dir("/d").expect("mkdir");
        let file = fs
            .file_open("/d/f", OpenFlags::WRITE | OpenFlags::CREATE)
            .expect("open");
        fs.file_close(file).expect("close");

        assert!(matches!(fs.remove("/d").expect_err("occupied"), FsError::NotEmpty));
        fs.remove("/d/f").expect("remove file");
        fs.remove("/d").expect("remove dir");
        assert!(matches!(fs.stat("/d").expect_err("gone"), FsError::NotFound(_)));
        assert!(matches!(
            fs.remove("/").expect_err("root"),
            FsError::InvalidArgument(_)
        ));
    }

    #[test]
    fn rename_within_and_across_directories() {
        let mut fs = mounted();
        fs.create_dir("/a").expect("mkdir");
        fs.create_dir("/b").expect("mkdir");
        let mut file = fs
            .file_open("/a/old", OpenFlags::WRITE | OpenFlags::CREATE)
            .expect("open");
        fs.file_write(&mut file, b"payload").expect("write");
        fs.file_close(file).expect("close");

        fs.rename("/a/old", "/a/new").expect("rename same dir");
        assert!(matches!(fs.stat("/a/old").expect_err("gone"), FsError::NotFound(_)));
        assert_eq!(fs.stat("/a/new").expect("stat").size, 7);

        fs.rename("/a/new", "/b/moved").expect("rename across");
        assert_eq!(fs.stat("/b/moved").expect("stat").size, 7);

        // directory cycle guard
        fs.create_dir("/a/sub").expect("mkdir");
        assert!(matches!(
            fs.rename("/a", "/a/sub/inner").expect_err("cycle"),
            FsError::InvalidArgument(_)
        ));

        // overwrite an existing empty directory with a directory
        fs.create_dir("/c").expect("mkdir");
        fs.rename("/a/sub", "/c").expect("replace empty dir");
        assert!(matches!(fs.stat("/a/sub").expect_err("gone"), FsError::NotFound(_)));
    }

    #[test]
    fn stat_size_matches_highest_offset_written() {
        let mut fs = mounted();
        let mut file = fs
            .file_open("/sz", OpenFlags::WRITE | OpenFlags::CREATE)
            .expect("open");
        assert_eq!(fs.stat("/sz").expect("stat").size, 0);
        fs.file_write(&mut file, &[1_u8; 999]).expect("write");
        fs.file_write(&mut file, &[2_u8; 1]).expect("write");
        fs.file_close(file).expect("close");
        assert_eq!(fs.stat("/sz").expect("stat").size, 1000);
    }

    #[test]
    fn fs_stat_counts_reachable_blocks() {
        let mut fs = mounted();
        let fresh = fs.fs_stat().expect("fs_stat");
        // Superblock pair and root pair.
        assert_eq!(fresh.blocks_in_use, 4);
        assert_eq!(fresh.block_count, 64);

        let mut file = fs
            .file_open("/data", OpenFlags::WRITE | OpenFlags::CREATE)
            .expect("open");
        fs.file_write(&mut file, &[7_u8; 2000]).expect("write");
        fs.file_close(file).expect("close");
        let used = fs.fs_stat().expect("fs_stat");
        // Four blocks of chain on top of the metadata pairs.
        assert_eq!(used.blocks_in_use, 8);
    }

    #[test]
    fn unsynced_writes_are_invisible_after_remount() {
        let mut fs = mounted();
        let mut file = fs
            .file_open("/volatile", OpenFlags::WRITE | OpenFlags::CREATE)
            .expect("open");
        fs.file_write(&mut file, &[9_u8; 100]).expect("write");
        // No sync, no close: the entry exists but the chain head was never
        // committed.
        let device = fs.unmount();
        let mut fs = Filesystem::mount(device, config()).expect("remount");
        assert_eq!(fs.stat("/volatile").expect("stat").size, 0);

        let mut reopened = fs
            .file_open("/volatile", OpenFlags::READ)
            .expect("open");
        let mut buf = [0_u8; 10];
        assert_eq!(fs.file_read(&mut reopened, &mut buf).expect("read"), 0);
        fs.file_close(reopened).expect("close");
    }

    #[test]
    fn two_instances_over_distinct_devices_coexist() {
        let mut fs_a = mounted();
        let fs_b = mounted();
        let file = fs_a
            .file_open("/only-in-a", OpenFlags::WRITE | OpenFlags::CREATE)
            .expect("open");
        fs_a.file_close(file).expect("close");
        assert!(fs_a.stat("/only-in-a").is_ok());
        assert!(matches!(
            fs_b.stat("/only-in-a").expect_err("isolated"),
            FsError::NotFound(_)
        ));
    }
}
