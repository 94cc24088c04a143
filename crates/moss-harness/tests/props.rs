#![forbid(unsafe_code)]
//! Randomized round-trip properties against an in-RAM reference model.

use moss_device::RamBlockDevice;
use mossfs::{Config, Filesystem, Geometry, OpenFlags, SeekFrom};
use proptest::prelude::*;

// Copy-on-write rewrites keep superseded uncommitted chains reserved until
// the next sync, so the random workloads get a roomier device than the
// acceptance scenarios use.
fn config() -> Config {
    Config::new(Geometry::new(16, 16, 512, 256, 32).expect("geometry"))
}

fn mounted() -> Filesystem<RamBlockDevice> {
    let device = RamBlockDevice::new(*config().geometry());
    Filesystem::format(&device, &config()).expect("format");
    Filesystem::mount(device, config()).expect("mount")
}

/// Apply one positioned write to the reference model.
fn model_write(model: &mut Vec<u8>, offset: usize, data: &[u8]) {
    if model.len() < offset {
        model.resize(offset, 0);
    }
    let end = offset + data.len();
    if model.len() < end {
        model.resize(end, 0);
    }
    model[offset..end].copy_from_slice(data);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Arbitrary sequences of positioned writes read back exactly, both
    /// live and after a sync/remount cycle.
    #[test]
    fn positioned_writes_match_reference_model(
        ops in prop::collection::vec(
            (0_u32..3000, prop::collection::vec(any::<u8>(), 1..400)),
            1..12,
        )
    ) {
        let mut fs = mounted();
        let mut model: Vec<u8> = Vec::new();
        let mut file = fs
            .file_open(
                "/model",
                OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE,
            )
            .expect("open");

        for (offset, data) in &ops {
            fs.file_seek(&mut file, SeekFrom::Start(*offset)).expect("seek");
            fs.file_write(&mut file, data).expect("write");
            model_write(&mut model, *offset as usize, data);
        }

        // Live read before any sync.
        fs.file_seek(&mut file, SeekFrom::Start(0)).expect("seek");
        let mut live = vec![0_u8; model.len() + 16];
        let n = fs.file_read(&mut file, &mut live).expect("read");
        prop_assert_eq!(n, model.len());
        prop_assert_eq!(&live[..n], model.as_slice());
        prop_assert_eq!(fs.file_size(&file), model.len() as u32);

        // Committed read after remount.
        fs.file_close(file).expect("close");
        let device = fs.unmount();
        let mut fs = Filesystem::mount(device, config()).expect("remount");
        prop_assert_eq!(fs.stat("/model").expect("stat").size, model.len() as u32);
        let mut file = fs.file_open("/model", OpenFlags::READ).expect("open");
        let mut back = vec![0_u8; model.len() + 16];
        let n = fs.file_read(&mut file, &mut back).expect("read");
        prop_assert_eq!(n, model.len());
        prop_assert_eq!(&back[..n], model.as_slice());
        fs.file_close(file).expect("close");
    }

    /// Truncation tracks the model at arbitrary cut points.
    #[test]
    fn truncate_matches_reference_model(
        initial in prop::collection::vec(any::<u8>(), 1..2500),
        cut in 0_u32..3000,
    ) {
        let mut fs = mounted();
        let mut file = fs
            .file_open(
                "/trunc",
                OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE,
            )
            .expect("open");
        fs.file_write(&mut file, &initial).expect("write");

        let mut model = initial.clone();
        model.resize(cut as usize, 0);
        fs.file_truncate(&mut file, cut).expect("truncate");
        prop_assert_eq!(fs.file_size(&file), cut);

        fs.file_seek(&mut file, SeekFrom::Start(0)).expect("seek");
        let mut back = vec![0_u8; model.len() + 16];
        let n = fs.file_read(&mut file, &mut back).expect("read");
        prop_assert_eq!(n, model.len());
        prop_assert_eq!(&back[..n], model.as_slice());
        fs.file_close(file).expect("close");
    }
}
