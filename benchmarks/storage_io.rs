//! Storage Benchmark: partitioned object throughput
//!
//! Measures collective `write_sync()`/`read_sync()` throughput of a single
//! participant for host payloads, and device payloads staged through host
//! memory or written through GPUDirect Storage when a GPU is present.
//!
//! # Usage
//!
//! ```sh
//! cargo run --example bench_storage --release
//! cargo run --example bench_storage --release -- --size 1MiB,128MiB --nruns 10 --dir /scratch
//! ```

#[path = "common.rs"]
mod common;

use std::path::Path;

use common::{
    BenchArgs, Throughput, cuda_device, gen_data, human_bytes, print_banner, print_table_header,
    scratch_dir,
};

use zckpt::storage::{Payload, Selection, variable_name};
use zckpt::timer::Timer;
use zckpt::{
    BufferRole, DeviceBuffer, DeviceManager, PartitionedReader, PartitionedWriter, Solo,
    StagingMode,
};

const DEFAULT_SIZES: &[usize] = &[
    1 << 20,   // 1 MiB
    16 << 20,  // 16 MiB
    128 << 20, // 128 MiB
];

fn main() {
    let args = BenchArgs::parse_with(DEFAULT_SIZES);
    print_banner("zckpt storage benchmark");

    let host = DeviceManager::host(None);
    let gpu = cuda_device();
    let dir = scratch_dir(args.dir.as_ref());
    let object = dir.path().join("bench.bp");

    for &size in &args.sizes {
        println!(
            "{}, {} runs after {} warmup",
            human_bytes(size),
            args.nruns,
            args.warmup
        );
        print_table_header();
        let data = gen_data(size);

        bench_host(&object, &data, &args);
        bench_device("staged", &host, StagingMode::Staged, &object, &data, &args);
        if let Some(gpu) = &gpu {
            bench_device("gpu-staged", gpu, StagingMode::Staged, &object, &data, &args);
            bench_device("gpu-direct", gpu, StagingMode::Auto, &object, &data, &args);
        }
        println!();
    }
}

fn write_object(object: &Path, staging: StagingMode, payload: Payload<'_>) {
    let mut writer =
        PartitionedWriter::open_for_write(object, &Solo, staging).expect("open for write failed");
    writer
        .declare_partition(&variable_name(0), payload.len() as u64)
        .expect("declare failed");
    writer.write_sync(payload).expect("write failed");
}

/// The whole of participant 0's block.
fn open_block(object: &Path, staging: StagingMode) -> (PartitionedReader, Selection) {
    let reader = PartitionedReader::open_for_read(object, staging).expect("open failed");
    let block = reader
        .block_for_rank(&variable_name(0), 0)
        .expect("missing block");
    let selection = Selection {
        offset: block.start,
        len: block.count,
    };
    (reader, selection)
}

fn bench_host(object: &Path, data: &[u8], args: &BenchArgs) {
    let mut timer = Timer::new();
    let mut write = Throughput::default();
    let mut read = Throughput::default();

    for run in 0..args.runs() {
        let timed = args.is_timed(run);
        write.measure(&mut timer, data.len(), timed, || {
            write_object(object, StagingMode::Staged, Payload::Host(data))
        });
        let back = read.measure(&mut timer, data.len(), timed, || {
            let (reader, selection) = open_block(object, StagingMode::Staged);
            reader
                .read_sync(&variable_name(0), selection)
                .expect("read failed")
        });
        if run == args.warmup {
            assert_eq!(back, data, "data verification failed");
        }
    }

    write.print("host", "write");
    read.print("host", "read");
}

fn bench_device(
    mode: &str,
    device: &DeviceManager,
    staging: StagingMode,
    object: &Path,
    data: &[u8],
    args: &BenchArgs,
) {
    let size = data.len();
    let mut src = device
        .allocate(BufferRole::Compressed, size)
        .expect("failed to allocate source");
    device
        .copy_to_device(data, &mut src)
        .expect("failed to stage payload");
    let mut dst = device
        .allocate(BufferRole::Staged, size)
        .expect("failed to allocate destination");

    let mut timer = Timer::new();
    let mut write = Throughput::default();
    let mut read = Throughput::default();

    for run in 0..args.runs() {
        let timed = args.is_timed(run);
        write.measure(&mut timer, size, timed, || {
            let payload = Payload::Device {
                device,
                buffer: &src,
                len: size,
            };
            write_object(object, staging, payload)
        });
        read.measure(&mut timer, size, timed, || {
            let (reader, selection) = open_block(object, staging);
            reader
                .read_sync_into(&variable_name(0), selection, device, &mut dst)
                .expect("read failed")
        });
        if run == args.warmup {
            verify(device, &dst, data);
        }
    }

    write.print(mode, "write");
    read.print(mode, "read");
}

fn verify(device: &DeviceManager, buffer: &DeviceBuffer, data: &[u8]) {
    let mut back = vec![0u8; data.len()];
    device
        .copy_to_host(buffer, &mut back)
        .expect("copy to host failed");
    assert_eq!(back, data, "data verification failed");
}
