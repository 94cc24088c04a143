#![forbid(unsafe_code)]

use anyhow::{bail, Result};
use moss_harness::{
    run_all_scenarios, run_to_crash, standard_geometry, FaultPolicy, ScenarioReport,
};
use moss_device::RamBlockDevice;
use mossfs::{Config, Filesystem, OpenFlags};
use serde::Serialize;
use std::env;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str);

    match cmd {
        Some("scenarios") => {
            let reports = run_all_scenarios();
            println!("{}", serde_json::to_string_pretty(&reports)?);
            if reports.iter().any(|r| !r.passed) {
                bail!("scenario failures");
            }
            Ok(())
        }
        Some("crash-sweep") => crash_sweep(),
        Some("--help" | "-h" | "help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

#[derive(Debug, Serialize)]
struct CrashSweepReport {
    budgets_tested: u64,
    mounts_succeeded: u64,
    mounts_corrupt: u64,
    scenarios: Vec<ScenarioReport>,
}

/// Interrupt a format-and-write script at every possible mutating operation
/// and verify that each surviving image either refuses to mount (never
/// formatted far enough) or mounts to a consistent committed state.
fn crash_sweep() -> Result<()> {
    let geometry = standard_geometry();
    let config = Config::new(geometry);
    let payload = vec![0x42_u8; 700];

    let script = |payload: Vec<u8>| {
        move |dev: &moss_harness::FaultDevice| {
            Filesystem::format(dev, &Config::new(*dev.geometry()))?;
            // The harness mounts a snapshot wrapper; operate through a
            // second mount over the same fault device by reference.
            let mut fs = Filesystem::mount(dev, Config::new(*dev.geometry()))?;
            let mut file = fs.file_open("/a", OpenFlags::WRITE | OpenFlags::CREATE)?;
            fs.file_write(&mut file, &payload)?;
            fs.file_close(file)
        }
    };

    let total = run_to_crash(
        geometry,
        None,
        None,
        FaultPolicy::TornWrite,
        script(payload.clone()),
    )?
    .ops_used;

    let mut mounts_succeeded = 0_u64;
    let mut mounts_corrupt = 0_u64;
    for budget in 0..=total {
        let run = run_to_crash(
            geometry,
            None,
            Some(budget),
            FaultPolicy::TornWrite,
            script(payload.clone()),
        )?;
        let device = RamBlockDevice::from_image(geometry, run.image)?;
        match Filesystem::mount(device, config) {
            Ok(mut fs) => {
                mounts_succeeded += 1;
                // Any visible file must be empty or fully written.
                if let Ok(info) = fs.stat("/a") {
                    if info.size != 0 && info.size != payload.len() as u32 {
                        bail!("budget {budget}: partial commit visible ({} bytes)", info.size);
                    }
                    if info.size != 0 {
                        let mut file = fs.file_open("/a", OpenFlags::READ)?;
                        let mut back = vec![0_u8; payload.len()];
                        fs.file_read(&mut file, &mut back)?;
                        if back != payload {
                            bail!("budget {budget}: committed contents damaged");
                        }
                        fs.file_close(file)?;
                    }
                }
            }
            Err(mossfs::FsError::Corrupt { .. }) => mounts_corrupt += 1,
            Err(other) => bail!("budget {budget}: unexpected mount error: {other}"),
        }
    }

    let report = CrashSweepReport {
        budgets_tested: total + 1,
        mounts_succeeded,
        mounts_corrupt,
        scenarios: run_all_scenarios(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.scenarios.iter().any(|r| !r.passed) {
        bail!("scenario failures");
    }
    Ok(())
}

fn print_usage() {
    println!(
        "moss-harness: acceptance scenarios and crash sweeps for mossfs\n\
         \n\
         usage:\n\
         \x20 moss-harness scenarios     run the acceptance scenarios, emit JSON\n\
         \x20 moss-harness crash-sweep   interrupt a write workload at every op\n\
         \x20 moss-harness help          this message"
    );
}
