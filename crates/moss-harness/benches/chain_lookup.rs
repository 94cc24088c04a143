use criterion::{criterion_group, criterion_main, Criterion};
use moss_device::RamBlockDevice;
use mossfs::{Config, Filesystem, Geometry, OpenFlags, SeekFrom};

/// Random positioned reads over a ~190-block chain: each hop is O(log n)
/// through the skip pointers, which is what this measures.
fn chain_lookup(c: &mut Criterion) {
    let geometry = Geometry::new(16, 16, 512, 256, 32).expect("geometry");
    let config = Config::new(geometry);
    let device = RamBlockDevice::new(geometry);
    Filesystem::format(&device, &config).expect("format");
    let mut fs = Filesystem::mount(device, config).expect("mount");

    let payload: Vec<u8> = (0..95_000_u32).map(|i| (i % 251) as u8).collect();
    let mut file = fs
        .file_open(
            "/bench",
            OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE,
        )
        .expect("open");
    for chunk in payload.chunks(4096) {
        fs.file_write(&mut file, chunk).expect("write");
    }
    fs.file_sync(&mut file).expect("sync");

    let mut offset: u32 = 0;
    c.bench_function("seek_read_256b", |b| {
        b.iter(|| {
            // A fixed stride that is coprime to the file size walks the
            // whole chain without an RNG.
            offset = (offset + 37_501) % 90_000;
            fs.file_seek(&mut file, SeekFrom::Start(offset)).expect("seek");
            let mut buf = [0_u8; 256];
            let n = fs.file_read(&mut file, &mut buf).expect("read");
            assert_eq!(n, 256);
        });
    });

    fs.file_close(file).expect("close");
}

criterion_group!(benches, chain_lookup);
criterion_main!(benches);
