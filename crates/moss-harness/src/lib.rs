#![forbid(unsafe_code)]
//! Test harness for mossfs.
//!
//! Provides [`FaultDevice`], a RAM-backed block device that simulates power
//! loss by failing (optionally tearing) the Nth mutating operation, plus the
//! crash-sweep runner and the concrete acceptance scenarios the `moss-harness`
//! binary and the e2e tests share.

use anyhow::{bail, Context, Result};
use moss_device::{BlockDevice, RamBlockDevice};
use moss_error::FsError;
use moss_types::{align_down, BlockPointer, Geometry};
use mossfs::{Config, EntryType, Filesystem, OpenFlags, SeekFrom};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// How the fatal operation behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPolicy {
    /// The operation fails without touching the device.
    FailCleanly,
    /// A program writes a truncated prefix before failing, like flash losing
    /// power mid-page. Erases still fail cleanly.
    TornWrite,
}

#[derive(Debug)]
struct FaultState {
    budget: Option<u64>,
    used: u64,
    tripped: bool,
}

/// RAM block device that counts mutating operations (program and erase) and
/// simulates power loss once a budget is exhausted. Reads and syncs are
/// unaffected; every mutating operation after the trip fails too.
#[derive(Debug)]
pub struct FaultDevice {
    inner: RamBlockDevice,
    policy: FaultPolicy,
    state: Mutex<FaultState>,
}

impl FaultDevice {
    #[must_use]
    pub fn new(geometry: Geometry, budget: Option<u64>, policy: FaultPolicy) -> Self {
        Self {
            inner: RamBlockDevice::new(geometry),
            policy,
            state: Mutex::new(FaultState {
                budget,
                used: 0,
                tripped: false,
            }),
        }
    }

    pub fn from_image(
        geometry: Geometry,
        image: Vec<u8>,
        budget: Option<u64>,
        policy: FaultPolicy,
    ) -> moss_error::Result<Self> {
        Ok(Self {
            inner: RamBlockDevice::from_image(geometry, image)?,
            policy,
            state: Mutex::new(FaultState {
                budget,
                used: 0,
                tripped: false,
            }),
        })
    }

    /// Mutating operations performed so far.
    #[must_use]
    pub fn ops_used(&self) -> u64 {
        self.state.lock().used
    }

    /// Whether the simulated power loss has occurred.
    #[must_use]
    pub fn tripped(&self) -> bool {
        self.state.lock().tripped
    }

    /// Snapshot the surviving device contents.
    #[must_use]
    pub fn image(&self) -> Vec<u8> {
        self.inner.image()
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        self.inner.geometry()
    }

    /// Account for one mutating op. `Ok(true)` means this is the fatal one.
    fn consume(&self) -> moss_error::Result<bool> {
        let mut state = self.state.lock();
        if state.tripped {
            return Err(FsError::io("simulated power loss"));
        }
        match state.budget {
            Some(budget) if state.used >= budget => {
                state.tripped = true;
                Ok(true)
            }
            _ => {
                state.used += 1;
                Ok(false)
            }
        }
    }
}

impl BlockDevice for FaultDevice {
    fn read(&self, block: BlockPointer, off: u32, buf: &mut [u8]) -> moss_error::Result<()> {
        self.inner.read(block, off, buf)
    }

    fn prog(&self, block: BlockPointer, off: u32, data: &[u8]) -> moss_error::Result<()> {
        if self.consume()? {
            if self.policy == FaultPolicy::TornWrite {
                let torn = align_down(data.len() as u32 / 2, self.geometry().prog_size());
                if torn > 0 {
                    self.inner.prog(block, off, &data[..torn as usize])?;
                }
            }
            return Err(FsError::io("simulated power loss"));
        }
        self.inner.prog(block, off, data)
    }

    fn erase(&self, block: BlockPointer) -> moss_error::Result<()> {
        if self.consume()? {
            return Err(FsError::io("simulated power loss"));
        }
        self.inner.erase(block)
    }

    fn sync(&self) -> moss_error::Result<()> {
        if self.state.lock().tripped {
            return Err(FsError::io("simulated power loss"));
        }
        Ok(())
    }
}

/// Outcome of one scripted run against a [`FaultDevice`].
#[derive(Debug)]
pub struct FaultRun {
    /// Surviving device contents after the (possibly interrupted) script.
    pub image: Vec<u8>,
    /// Whether the script ran to completion.
    pub completed: bool,
    pub error: Option<String>,
    pub ops_used: u64,
}

/// Run `script` against a fault device with the given budget, starting from
/// `base` contents (or an erased device), and capture what survives.
pub fn run_to_crash(
    geometry: Geometry,
    base: Option<&[u8]>,
    budget: Option<u64>,
    policy: FaultPolicy,
    script: impl FnOnce(&FaultDevice) -> moss_error::Result<()>,
) -> moss_error::Result<FaultRun> {
    let device = match base {
        Some(image) => FaultDevice::from_image(geometry, image.to_vec(), budget, policy)?,
        None => FaultDevice::new(geometry, budget, policy),
    };
    let outcome = script(&device);
    Ok(FaultRun {
        image: device.image(),
        completed: outcome.is_ok(),
        error: outcome.err().map(|e| e.to_string()),
        ops_used: device.ops_used(),
    })
}

/// The geometry the acceptance scenarios run on: 64 blocks of 512 bytes.
#[must_use]
pub fn standard_geometry() -> Geometry {
    Geometry::new(16, 16, 512, 64, 16).expect("static geometry is valid")
}

/// A tiny device for exhaustion scenarios: 16 blocks of 512 bytes.
#[must_use]
pub fn tiny_geometry() -> Geometry {
    Geometry::new(16, 16, 512, 16, 4).expect("static geometry is valid")
}

/// Result of one named scenario, serializable for the harness report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

fn report(name: &str, outcome: Result<String>) -> ScenarioReport {
    match outcome {
        Ok(detail) => ScenarioReport {
            name: name.to_owned(),
            passed: true,
            detail,
        },
        Err(err) => ScenarioReport {
            name: name.to_owned(),
            passed: false,
            detail: format!("{err:#}"),
        },
    }
}

/// Format, write 1000 bytes to `a.txt`, remount, and read them back.
pub fn scenario_remount_roundtrip() -> Result<String> {
    let geometry = standard_geometry();
    let config = Config::new(geometry);
    let device = RamBlockDevice::new(geometry);
    Filesystem::format(&device, &config).context("format")?;

    let payload: Vec<u8> = (0..1000_u32).map(|i| (i % 251) as u8).collect();
    let mut fs = Filesystem::mount(device, config).context("mount")?;
    let mut file = fs
        .file_open("/a.txt", OpenFlags::WRITE | OpenFlags::CREATE)
        .context("open")?;
    fs.file_write(&mut file, &payload).context("write")?;
    fs.file_close(file).context("close")?;
    let device = fs.unmount();

    let mut fs = Filesystem::mount(device, config).context("remount")?;
    let mut file = fs.file_open("/a.txt", OpenFlags::READ).context("reopen")?;
    let mut back = vec![0_u8; 1000];
    let n = fs.file_read(&mut file, &mut back).context("read")?;
    if n != 1000 || back != payload {
        bail!("read {n} bytes, contents mismatched");
    }
    fs.file_close(file).context("close")?;
    Ok("1000 bytes byte-for-byte identical across remount".to_owned())
}

/// Create `d`, create `d/b.txt`, list `d`: exactly one file entry.
pub fn scenario_directory_listing() -> Result<String> {
    let geometry = standard_geometry();
    let config = Config::new(geometry);
    let device = RamBlockDevice::new(geometry);
    Filesystem::format(&device, &config).context("format")?;
    let mut fs = Filesystem::mount(device, config).context("mount")?;

    fs.create_dir("/d").context("mkdir")?;
    let file = fs
        .file_open("/d/b.txt", OpenFlags::WRITE | OpenFlags::CREATE)
        .context("open")?;
    fs.file_close(file).context("close")?;

    let mut dir = fs.dir_open("/d").context("dir_open")?;
    let mut entries = Vec::new();
    while let Some(entry) = fs.dir_read(&mut dir).context("dir_read")? {
        entries.push(entry);
    }
    fs.dir_close(dir);
    if entries.len() != 1 || entries[0].name != "b.txt" || entries[0].entry_type != EntryType::File
    {
        bail!("unexpected listing: {entries:?}");
    }
    Ok("directory lists exactly one file entry named b.txt".to_owned())
}

/// Write 10 bytes at offset 0, then 10 at offset 5; the 15-byte read sees
/// the first writer for [0, 5) and the second for [5, 15).
pub fn scenario_overlapping_writes() -> Result<String> {
    let geometry = standard_geometry();
    let config = Config::new(geometry);
    let device = RamBlockDevice::new(geometry);
    Filesystem::format(&device, &config).context("format")?;
    let mut fs = Filesystem::mount(device, config).context("mount")?;

    let mut file = fs
        .file_open(
            "/w",
            OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE,
        )
        .context("open")?;
    fs.file_write(&mut file, &[1_u8; 10]).context("write")?;
    fs.file_seek(&mut file, SeekFrom::Start(5)).context("seek")?;
    fs.file_write(&mut file, &[2_u8; 10]).context("write")?;
    fs.file_seek(&mut file, SeekFrom::Start(0)).context("seek")?;

    let mut back = [0_u8; 15];
    let n = fs.file_read(&mut file, &mut back).context("read")?;
    fs.file_close(file).context("close")?;
    if n != 15 || back[..5] != [1_u8; 5] || back[5..] != [2_u8; 10] {
        bail!("overlap mismatch: read {n} bytes, {back:?}");
    }
    Ok("overlapping writes resolve to the last writer per byte".to_owned())
}

/// Fill a tiny device until `NoSpace`, then verify every file committed
/// before exhaustion is fully intact.
pub fn scenario_out_of_space_preserves_committed_files() -> Result<String> {
    let geometry = tiny_geometry();
    let config = Config::new(geometry);
    let device = RamBlockDevice::new(geometry);
    Filesystem::format(&device, &config).context("format")?;
    let mut fs = Filesystem::mount(device, config).context("mount")?;

    let mut committed = Vec::new();
    let mut hit_no_space = false;
    for index in 0..32 {
        let path = format!("/f{index}");
        let payload = vec![(index % 251) as u8; 900];
        let mut file = fs
            .file_open(&path, OpenFlags::WRITE | OpenFlags::CREATE)
            .context("open")?;
        let write_result = fs
            .file_write(&mut file, &payload)
            .and_then(|_| fs.file_sync(&mut file));
        let _ = fs.file_close(file);
        match write_result {
            Ok(()) => committed.push((path, payload)),
            Err(FsError::NoSpace) => {
                hit_no_space = true;
                break;
            }
            Err(other) => return Err(other).context("unexpected failure"),
        }
    }
    if !hit_no_space {
        bail!("device never filled");
    }
    if committed.is_empty() {
        bail!("nothing committed before exhaustion");
    }

    // Remount and verify all committed files byte for byte.
    let device = fs.unmount();
    let mut fs = Filesystem::mount(device, config).context("remount")?;
    for (path, payload) in &committed {
        let mut file = fs.file_open(path, OpenFlags::READ).context("reopen")?;
        let mut back = vec![0_u8; payload.len()];
        let n = fs.file_read(&mut file, &mut back).context("read")?;
        if n != payload.len() || &back != payload {
            bail!("{path} damaged after exhaustion");
        }
        fs.file_close(file).context("close")?;
    }
    Ok(format!(
        "{} files committed before NoSpace, all intact after remount",
        committed.len()
    ))
}

/// Run every acceptance scenario.
#[must_use]
pub fn run_all_scenarios() -> Vec<ScenarioReport> {
    vec![
        report("remount_roundtrip", scenario_remount_roundtrip()),
        report("directory_listing", scenario_directory_listing()),
        report("overlapping_writes", scenario_overlapping_writes()),
        report(
            "out_of_space_preserves_committed_files",
            scenario_out_of_space_preserves_committed_files(),
        ),
    ]
}
