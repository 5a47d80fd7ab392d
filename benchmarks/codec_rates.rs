//! Codec Benchmark: fixed-rate compression throughput
//!
//! Measures `compress_on_device()`/`decompress_on_device()` throughput of
//! double-precision 1-D fields at several fixed rates, serially on the
//! emulated device and with CUDA kernels when a GPU is present.
//!
//! # Usage
//!
//! ```sh
//! cargo run --example bench_codec --release
//! cargo run --example bench_codec --release -- --size 8MiB --rates 4,8,16 --nruns 10
//! ```

#[path = "common.rs"]
mod common;

use common::{
    BenchArgs, Throughput, cuda_device, gen_field, human_bytes, print_banner, print_table_header,
};

use zckpt::timer::Timer;
use zckpt::{Array, BufferRole, CodecSession, DeviceManager, ExecutionPolicy, ScalarType};

const DEFAULT_SIZES: &[usize] = &[
    1 << 20,  // 1 MiB
    8 << 20,  // 8 MiB
    64 << 20, // 64 MiB
];

fn main() {
    let args = BenchArgs::parse_with(DEFAULT_SIZES);
    print_banner("zckpt codec benchmark");

    let host = DeviceManager::host(None);
    let gpu = cuda_device();

    for &size in &args.sizes {
        let elements = size / ScalarType::Double.size();
        let array = Array::from_values(&[elements], ScalarType::Double, &gen_field(elements))
            .expect("failed to build field");
        println!(
            "{} ({elements} doubles), {} runs after {} warmup",
            human_bytes(array.byte_len()),
            args.nruns,
            args.warmup
        );
        print_table_header();

        for &rate in &args.rates {
            bench_rate(&host, ExecutionPolicy::Serial, &array, rate, &args);
            if let Some(gpu) = &gpu {
                bench_rate(gpu, ExecutionPolicy::Cuda, &array, rate, &args);
            }
        }
        println!();
    }
}

fn bench_rate(
    device: &DeviceManager,
    policy: ExecutionPolicy,
    array: &Array,
    rate: f64,
    args: &BenchArgs,
) {
    let session = CodecSession::configure(device, array.shape(), array.scalar(), rate, policy)
        .expect("failed to configure codec");
    let mut original = device
        .allocate(BufferRole::Original, array.byte_len())
        .expect("failed to allocate original");
    device
        .copy_to_device(array.as_bytes(), &mut original)
        .expect("failed to stage field");
    let mut compressed = device
        .allocate(BufferRole::Compressed, session.maximum_compressed_size())
        .expect("failed to allocate compressed");
    let mut decompressed = device
        .allocate(BufferRole::Decompressed, array.byte_len())
        .expect("failed to allocate decompressed");

    let mut timer = Timer::new();
    let mut comp = Throughput::default();
    let mut decomp = Throughput::default();
    let mut stored = 0;

    for run in 0..args.runs() {
        let timed = args.is_timed(run);
        stored = comp.measure(&mut timer, array.byte_len(), timed, || {
            let len = session
                .compress_on_device(&original, &mut compressed)
                .expect("compress failed");
            device.synchronize().expect("synchronize failed");
            len
        });
        decomp.measure(&mut timer, array.byte_len(), timed, || {
            session
                .decompress_on_device(&compressed, &mut decompressed, stored)
                .expect("decompress failed");
            device.synchronize().expect("synchronize failed");
        });
    }

    let mode = format!("{policy} r={rate}");
    comp.print(&mode, "comp");
    decomp.print(&mode, "decomp");
    println!(
        "  {mode:<14} {:<8} {:>9.2}x      ({})",
        "ratio",
        array.byte_len() as f64 / stored as f64,
        human_bytes(stored)
    );
    session.close();
}
