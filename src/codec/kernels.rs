//! CUDA implementation of the fixed-rate block codec.
//!
//! One thread codes one block. Blocks sit at fixed bit offsets, so threads
//! never write the same bits; neighbouring blocks may share a 64-bit word,
//! which is why words are merged with `atomicOr` into a zeroed stream.

use cudarc::driver::{CudaSlice, LaunchConfig, PushKernelArg};

use crate::codec::block::{FixedRate, check_len};
use crate::codec::field::{Field, ScalarType};
use crate::device::CudaDevice;
use crate::error::{Error, ErrorKind, Result};

const MODULE: &str = "zckpt_fixed_rate";
const THREADS_PER_BLOCK: u32 = 128;

const SOURCE: &str = r#"
typedef unsigned long long u64;
typedef long long i64;

#define NEGABINARY 0xaaaaaaaaaaaaaaaaull

__device__ u64 precision_mask(int p) {
    return p == 64 ? ~0ull : ((1ull << p) - 1ull);
}

__device__ u64 to_negabinary(i64 q, int p) {
    u64 mask = precision_mask(p);
    u64 nb = NEGABINARY & mask;
    return (((u64)q + nb) ^ nb) & mask;
}

__device__ i64 from_negabinary(u64 u, int p) {
    u64 mask = precision_mask(p);
    u64 nb = NEGABINARY & mask;
    u64 raw = ((u ^ nb) - nb) & mask;
    if (p == 64) return (i64)raw;
    int s = 64 - p;
    return ((i64)(raw << s)) >> s;
}

struct Writer {
    u64* words;
    u64 pos;
    u64 acc;
};

__device__ void put_bit(Writer& w, u64 bit) {
    w.acc |= (bit & 1ull) << (w.pos & 63ull);
    w.pos++;
    if ((w.pos & 63ull) == 0) {
        if (w.acc) atomicOr(&w.words[(w.pos >> 6) - 1], w.acc);
        w.acc = 0;
    }
}

__device__ void finish(Writer& w) {
    if ((w.pos & 63ull) != 0 && w.acc) atomicOr(&w.words[w.pos >> 6], w.acc);
}

__device__ u64 get_bit(const u64* words, u64& pos) {
    u64 bit = (words[pos >> 6] >> (pos & 63ull)) & 1ull;
    pos++;
    return bit;
}

// Linear index of value i of a block, clamped into the field.
__device__ u64 block_index(const u64* size, const u64* origin, int dims, int i, bool* inside) {
    u64 linear = 0, stride = 1;
    *inside = true;
    for (int d = 0; d < 4; d++) {
        u64 local = d < dims ? (u64)((i >> (2 * d)) & 3) : 0ull;
        u64 coord = origin[d] + local;
        if (coord >= size[d]) {
            coord = size[d] - 1;
            *inside = false;
        }
        linear += coord * stride;
        stride *= size[d];
    }
    return linear;
}

__device__ void block_origin(const u64* size, u64 block, u64* origin) {
    u64 rest = block;
    for (int d = 0; d < 4; d++) {
        u64 count = (size[d] + 3) / 4;
        origin[d] = (rest % count) * 4;
        rest /= count;
    }
}

template <typename T, int P, int EBITS, int BIAS>
__device__ void encode(const unsigned char* src, u64* words,
                       u64 nx, u64 ny, u64 nz, u64 nw,
                       int dims, unsigned int maxbits, u64 blocks) {
    u64 block = (u64)blockIdx.x * blockDim.x + threadIdx.x;
    if (block >= blocks) return;

    const T* data = (const T*)src;
    u64 size[4] = {nx, ny, nz, nw};
    u64 origin[4];
    block_origin(size, block, origin);

    int n = 1 << (2 * dims);
    double v[256];
    u64 u[256];
    bool inside;
    for (int i = 0; i < n; i++) {
        v[i] = (double)data[block_index(size, origin, dims, i, &inside)];
    }

    Writer w = {words, block * (u64)maxbits, 0ull};

    bool any = false;
    int emax = 0;
    for (int i = 0; i < n; i++) {
        double x = v[i];
        if (isfinite(x) && x != 0.0) {
            int e;
            frexp(x, &e);
            if (!any || e > emax) emax = e;
            any = true;
        }
    }
    if (!any) {
        put_bit(w, 0ull);
        finish(w);
        return;
    }

    put_bit(w, 1ull);
    int biased = emax + BIAS;
    int top = (1 << EBITS) - 1;
    biased = biased < 0 ? 0 : (biased > top ? top : biased);
    for (int i = 0; i < EBITS; i++) put_bit(w, (u64)((biased >> i) & 1));
    emax = biased - BIAS;

    int shift = P - 2 - emax;
    for (int i = 0; i < n; i++) {
        i64 q = isfinite(v[i]) ? (i64)ldexp(v[i], shift) : 0ll;
        u[i] = to_negabinary(q, P);
    }

    unsigned int budget = maxbits - 1u - (unsigned int)EBITS;
    for (int plane = P - 1; plane >= 0 && budget; plane--) {
        for (int i = 0; i < n && budget; i++, budget--) {
            put_bit(w, u[i] >> plane);
        }
    }
    finish(w);
}

template <typename T, int P, int EBITS, int BIAS>
__device__ void decode(const unsigned char* src, unsigned char* dst,
                       u64 nx, u64 ny, u64 nz, u64 nw,
                       int dims, unsigned int maxbits, u64 blocks) {
    u64 block = (u64)blockIdx.x * blockDim.x + threadIdx.x;
    if (block >= blocks) return;

    const u64* words = (const u64*)src;
    T* data = (T*)dst;
    u64 size[4] = {nx, ny, nz, nw};
    u64 origin[4];
    block_origin(size, block, origin);

    int n = 1 << (2 * dims);
    u64 u[256];
    for (int i = 0; i < n; i++) u[i] = 0ull;

    u64 pos = block * (u64)maxbits;
    bool nonzero = get_bit(words, pos) != 0ull;
    int emax = 0;
    if (nonzero) {
        u64 biased = 0;
        for (int i = 0; i < EBITS; i++) biased |= get_bit(words, pos) << i;
        emax = (int)biased - BIAS;

        unsigned int budget = maxbits - 1u - (unsigned int)EBITS;
        for (int plane = P - 1; plane >= 0 && budget; plane--) {
            for (int i = 0; i < n && budget; i++, budget--) {
                u[i] |= get_bit(words, pos) << plane;
            }
        }
    }

    int shift = emax - (P - 2);
    bool inside;
    for (int i = 0; i < n; i++) {
        u64 linear = block_index(size, origin, dims, i, &inside);
        if (!inside) continue;
        double value = nonzero ? ldexp((double)from_negabinary(u[i], P), shift) : 0.0;
        data[linear] = (T)value;
    }
}

extern "C" __global__ void encode_f32(const unsigned char* src, u64* words,
        u64 nx, u64 ny, u64 nz, u64 nw, int dims, unsigned int maxbits, u64 blocks) {
    encode<float, 32, 8, 127>(src, words, nx, ny, nz, nw, dims, maxbits, blocks);
}

extern "C" __global__ void encode_f64(const unsigned char* src, u64* words,
        u64 nx, u64 ny, u64 nz, u64 nw, int dims, unsigned int maxbits, u64 blocks) {
    encode<double, 64, 11, 1023>(src, words, nx, ny, nz, nw, dims, maxbits, blocks);
}

extern "C" __global__ void decode_f32(const unsigned char* src, unsigned char* dst,
        u64 nx, u64 ny, u64 nz, u64 nw, int dims, unsigned int maxbits, u64 blocks) {
    decode<float, 32, 8, 127>(src, dst, nx, ny, nz, nw, dims, maxbits, blocks);
}

extern "C" __global__ void decode_f64(const unsigned char* src, unsigned char* dst,
        u64 nx, u64 ny, u64 nz, u64 nw, int dims, unsigned int maxbits, u64 blocks) {
    decode<double, 64, 11, 1023>(src, dst, nx, ny, nz, nw, dims, maxbits, blocks);
}
"#;

#[derive(Clone, Copy)]
enum Direction {
    Encode,
    Decode,
}

fn kernel_name(direction: Direction, scalar: ScalarType) -> &'static str {
    match (direction, scalar) {
        (Direction::Encode, ScalarType::Float) => "encode_f32",
        (Direction::Encode, ScalarType::Double) => "encode_f64",
        (Direction::Decode, ScalarType::Float) => "decode_f32",
        (Direction::Decode, ScalarType::Double) => "decode_f64",
    }
}

/// Compile and load the codec kernels on `dev` unless already loaded.
pub(crate) fn prepare(dev: &CudaDevice) -> Result<()> {
    dev.module(MODULE, SOURCE).map(|_| ())
}

pub(crate) fn is_prepared(dev: &CudaDevice) -> bool {
    dev.has_module(MODULE)
}

fn launch(
    dev: &CudaDevice,
    direction: Direction,
    field: &Field,
    rate: &FixedRate,
    src: &CudaSlice<u8>,
    dst: &mut CudaSlice<u8>,
) -> Result<()> {
    let name = kernel_name(direction, field.scalar());
    let module = dev.module(MODULE, SOURCE)?;
    let func = module.load_function(name).map_err(|e| {
        Error::from(e)
            .with_operation("codec::kernels::launch")
            .with_context("kernel", name)
    })?;

    let [nx, ny, nz, nw] = field.sizes().map(|n| n as u64);
    let dims = field.dims() as i32;
    let maxbits = rate.maxbits;
    let blocks = field.block_count() as u64;
    let grid = blocks.div_ceil(THREADS_PER_BLOCK as u64);
    let grid = u32::try_from(grid).map_err(|_| {
        Error::new(ErrorKind::CodecError, "field has too many blocks for one launch")
            .with_operation("codec::kernels::launch")
            .with_context("blocks", blocks.to_string())
    })?;
    let cfg = LaunchConfig {
        grid_dim: (grid, 1, 1),
        block_dim: (THREADS_PER_BLOCK, 1, 1),
        shared_mem_bytes: 0,
    };

    let stream = dev.stream();
    let mut builder = stream.launch_builder(&func);
    builder
        .arg(src)
        .arg(dst)
        .arg(&nx)
        .arg(&ny)
        .arg(&nz)
        .arg(&nw)
        .arg(&dims)
        .arg(&maxbits)
        .arg(&blocks);
    // SAFETY: argument types match the kernel signature, `src` holds the whole
    // input and `dst` the whole output (checked by the callers).
    unsafe { builder.launch(cfg) }.map_err(|e| {
        Error::from(e)
            .with_operation("codec::kernels::launch")
            .with_context("kernel", name)
    })?;
    stream.synchronize()?;
    Ok(())
}

/// Encode the field in `src` into `dst`. Returns the stream length in bytes.
pub(crate) fn compress_cuda(
    dev: &CudaDevice,
    field: &Field,
    rate: &FixedRate,
    src: &CudaSlice<u8>,
    dst: &mut CudaSlice<u8>,
) -> Result<usize> {
    let stream_bytes = rate.stream_bytes(field);
    check_len(src.len(), field.byte_len(), "source field")?;
    check_len(dst.len(), stream_bytes, "compressed buffer")?;

    dev.stream().memset_zeros(dst)?;
    launch(dev, Direction::Encode, field, rate, src, dst)?;
    Ok(stream_bytes)
}

/// Decode the stream in `src` into the field in `dst`.
pub(crate) fn decompress_cuda(
    dev: &CudaDevice,
    field: &Field,
    rate: &FixedRate,
    src: &CudaSlice<u8>,
    dst: &mut CudaSlice<u8>,
) -> Result<()> {
    check_len(src.len(), rate.stream_bytes(field), "compressed stream")?;
    check_len(dst.len(), field.byte_len(), "destination field")?;
    launch(dev, Direction::Decode, field, rate, src, dst)
}
