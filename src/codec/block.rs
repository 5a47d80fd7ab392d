//! Fixed-rate block coding.
//!
//! A field is cut into blocks of `4^D` values. Every block is coded into
//! exactly `maxbits` bits at bit offset `block * maxbits`, which lets blocks
//! be encoded and decoded independently:
//!
//! ```text
//! [nonzero: 1] [biased exponent: ebits] [bit planes, MSB first, 4^D bits each ...]
//! ```
//!
//! Values are quantized to `P`-bit integers relative to the largest exponent
//! in the block, mapped to negabinary and emitted one bit plane at a time
//! until the budget runs out. The CUDA kernels in `kernels.rs` implement the
//! same layout bit for bit.

use crate::codec::bitstream::{BitReader, BitWriter, words_from_le_bytes, words_to_le_bytes};
use crate::codec::field::{Field, ScalarType};
use crate::error::{Error, ErrorKind, Result};

/// Upper bound on the per-block budget.
const MAX_BLOCK_BITS: f64 = (1u64 << 24) as f64;

const NEGABINARY_MASK: u64 = 0xaaaa_aaaa_aaaa_aaaa;

/// Stream parameters for fixed-rate mode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedRate {
    /// Requested bits per value.
    pub requested: f64,
    /// Bits per block.
    pub maxbits: u32,
    /// Bits per value actually spent: `maxbits / 4^D`.
    pub effective: f64,
}

impl FixedRate {
    /// Clamp a stream to `rate` bits per value for `field`.
    pub fn new(rate: f64, field: &Field) -> Result<Self> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(Error::new(
                ErrorKind::CodecError,
                format!("fixed rate must be a positive number of bits per value, got {rate}"),
            )
            .with_operation("FixedRate::new"));
        }
        let n = field.values_per_block() as f64;
        let bits = (n * rate + 0.5).floor();
        if bits > MAX_BLOCK_BITS {
            return Err(Error::new(
                ErrorKind::CodecError,
                format!("fixed rate {rate} exceeds the per-block bit budget"),
            )
            .with_operation("FixedRate::new"));
        }
        let header = 1 + field.scalar().exponent_bits();
        let maxbits = (bits as u32).max(header);
        Ok(Self {
            requested: rate,
            maxbits,
            effective: maxbits as f64 / n,
        })
    }

    /// Stream length in bytes for `field`, whole 64-bit words.
    pub fn stream_bytes(&self, field: &Field) -> usize {
        let bits = field.block_count() as u128 * self.maxbits as u128;
        (bits.div_ceil(64) * 8) as usize
    }
}

/// Exponent `e` with `2^(e-1) <= |x| < 2^e`, for finite nonzero `x`.
pub(crate) fn exponent(x: f64) -> i32 {
    let bits = x.to_bits();
    let biased = ((bits >> 52) & 0x7ff) as i32;
    if biased != 0 {
        biased - 1022
    } else {
        let mantissa = bits & ((1u64 << 52) - 1);
        let top = 63 - mantissa.leading_zeros() as i32;
        top - 1073
    }
}

/// `x * 2^e` without overflowing the intermediate power of two.
pub(crate) fn ldexp(mut x: f64, mut e: i32) -> f64 {
    const STEP: i32 = 1000;
    while e > STEP {
        x *= pow2(STEP);
        e -= STEP;
    }
    while e < -STEP {
        x *= pow2(-STEP);
        e += STEP;
    }
    x * pow2(e)
}

/// `2^e` for `-1022 <= e <= 1023`.
fn pow2(e: i32) -> f64 {
    f64::from_bits(((e + 1023) as u64) << 52)
}

fn precision_mask(precision: u32) -> u64 {
    if precision == 64 {
        u64::MAX
    } else {
        (1u64 << precision) - 1
    }
}

fn to_negabinary(q: i64, precision: u32) -> u64 {
    let mask = precision_mask(precision);
    let nb = NEGABINARY_MASK & mask;
    ((q as u64).wrapping_add(nb) ^ nb) & mask
}

fn from_negabinary(u: u64, precision: u32) -> i64 {
    let mask = precision_mask(precision);
    let nb = NEGABINARY_MASK & mask;
    let raw = (u ^ nb).wrapping_sub(nb) & mask;
    if precision == 64 {
        raw as i64
    } else {
        // Sign-extend from `precision` bits.
        let shift = 64 - precision;
        ((raw << shift) as i64) >> shift
    }
}

/// Encode one block of values at the writer's position.
pub(crate) fn encode_block(
    values: &[f64],
    scalar: ScalarType,
    maxbits: u32,
    quantized: &mut Vec<u64>,
    writer: &mut BitWriter<'_>,
) {
    let ebits = scalar.exponent_bits();
    let precision = scalar.precision();

    let emax = values
        .iter()
        .filter(|v| v.is_finite() && **v != 0.0)
        .map(|&v| exponent(v))
        .max();
    let Some(emax) = emax else {
        writer.write_bit(0);
        return;
    };

    writer.write_bit(1);
    let bias = scalar.exponent_bias();
    let biased = (emax + bias).clamp(0, (1 << ebits) - 1);
    writer.write_bits(biased as u64, ebits);
    let emax = biased - bias;

    let shift = precision as i32 - 2 - emax;
    quantized.clear();
    quantized.extend(values.iter().map(|&v| {
        let q = if v.is_finite() {
            ldexp(v, shift).trunc() as i64
        } else {
            0
        };
        to_negabinary(q, precision)
    }));

    let mut budget = maxbits - 1 - ebits;
    for plane in (0..precision).rev() {
        for &u in quantized.iter() {
            if budget == 0 {
                return;
            }
            writer.write_bit(u >> plane);
            budget -= 1;
        }
    }
}

/// Decode one block of `values.len()` values at the reader's position.
pub(crate) fn decode_block(
    values: &mut [f64],
    scalar: ScalarType,
    maxbits: u32,
    quantized: &mut Vec<u64>,
    reader: &mut BitReader<'_>,
) {
    let ebits = scalar.exponent_bits();
    let precision = scalar.precision();

    if reader.read_bit() == 0 {
        values.fill(0.0);
        return;
    }
    let emax = reader.read_bits(ebits) as i32 - scalar.exponent_bias();

    quantized.clear();
    quantized.resize(values.len(), 0);
    let mut budget = maxbits - 1 - ebits;
    'planes: for plane in (0..precision).rev() {
        for u in quantized.iter_mut() {
            if budget == 0 {
                break 'planes;
            }
            *u |= reader.read_bit() << plane;
            budget -= 1;
        }
    }

    let shift = emax - (precision as i32 - 2);
    for (v, &u) in values.iter_mut().zip(quantized.iter()) {
        *v = ldexp(from_negabinary(u, precision) as f64, shift);
    }
}

/// Compress `src` (the field's little-endian bytes) into `dst`.
///
/// Returns the stream length in bytes.
pub(crate) fn compress_serial(
    field: &Field,
    rate: &FixedRate,
    src: &[u8],
    dst: &mut [u8],
) -> Result<usize> {
    let stream_bytes = rate.stream_bytes(field);
    check_len(src.len(), field.byte_len(), "source field")?;
    check_len(dst.len(), stream_bytes, "compressed buffer")?;

    let scalar = field.scalar();
    let mut words = vec![0u64; stream_bytes / 8];
    let mut indices = Vec::with_capacity(field.values_per_block());
    let mut values = vec![0f64; field.values_per_block()];
    let mut quantized = Vec::with_capacity(field.values_per_block());

    for block in 0..field.block_count() {
        field.block_indices(block, &mut indices);
        for (v, &(idx, _)) in values.iter_mut().zip(indices.iter()) {
            *v = scalar.load(src, idx);
        }
        let mut writer = BitWriter::new(&mut words, block * rate.maxbits as usize);
        encode_block(&values, scalar, rate.maxbits, &mut quantized, &mut writer);
    }

    words_to_le_bytes(&words, &mut dst[..stream_bytes]);
    Ok(stream_bytes)
}

/// Reconstruct the field from the stream in `src` into `dst`.
pub(crate) fn decompress_serial(
    field: &Field,
    rate: &FixedRate,
    src: &[u8],
    dst: &mut [u8],
) -> Result<()> {
    let stream_bytes = rate.stream_bytes(field);
    check_len(src.len(), stream_bytes, "compressed stream")?;
    check_len(dst.len(), field.byte_len(), "destination field")?;

    let scalar = field.scalar();
    let words = words_from_le_bytes(&src[..stream_bytes]);
    let mut indices = Vec::with_capacity(field.values_per_block());
    let mut values = vec![0f64; field.values_per_block()];
    let mut quantized = Vec::with_capacity(field.values_per_block());

    for block in 0..field.block_count() {
        let mut reader = BitReader::new(&words, block * rate.maxbits as usize);
        decode_block(&mut values, scalar, rate.maxbits, &mut quantized, &mut reader);
        field.block_indices(block, &mut indices);
        for (&v, &(idx, inside)) in values.iter().zip(indices.iter()) {
            if inside {
                scalar.store(dst, idx, v);
            }
        }
    }
    Ok(())
}

pub(crate) fn check_len(actual: usize, required: usize, what: &str) -> Result<()> {
    if actual < required {
        return Err(Error::new(
            ErrorKind::CodecError,
            format!("{what} holds {actual} bytes, {required} required"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(shape: &[usize], scalar: ScalarType) -> Field {
        Field::new(shape, scalar).unwrap()
    }

    fn encode_f64(values: &[f64]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn decode_f64(bytes: &[u8]) -> Vec<f64> {
        bytes
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    // ---- Rate to bits ----

    #[test]
    fn test_rate_to_maxbits() {
        let f1 = field(&[100], ScalarType::Double);
        assert_eq!(FixedRate::new(2.0, &f1).unwrap().maxbits, 12);
        assert_eq!(FixedRate::new(11.0, &f1).unwrap().maxbits, 44);
        assert_eq!(FixedRate::new(21.0, &f1).unwrap().maxbits, 84);
        // Clamped up to the header size.
        assert_eq!(FixedRate::new(1.0, &f1).unwrap().maxbits, 12);

        let f3 = field(&[8, 8, 8], ScalarType::Float);
        let r = FixedRate::new(1.0, &f3).unwrap();
        assert_eq!(r.maxbits, 64);
        assert_eq!(r.effective, 1.0);
    }

    #[test]
    fn test_invalid_rates() {
        let f = field(&[16], ScalarType::Double);
        for rate in [0.0, -1.0, f64::NAN, f64::INFINITY, 1e12] {
            let err = FixedRate::new(rate, &f).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::CodecError, "rate {rate}");
        }
    }

    #[test]
    fn test_stream_bytes_one_million_doubles_rate_two() {
        let f = field(&[1_000_000], ScalarType::Double);
        let r = FixedRate::new(2.0, &f).unwrap();
        // 250,000 blocks of 12 bits.
        assert_eq!(r.stream_bytes(&f), 375_000);
    }

    // ---- Numeric helpers ----

    #[test]
    fn test_exponent_matches_definition() {
        for x in [1.0, 0.5, 0.75, 3.0, -6.0, 1e-300, 123456.0] {
            let e = exponent(x);
            let a = x.abs();
            assert!(ldexp(1.0, e - 1) <= a && a < ldexp(1.0, e), "x={x} e={e}");
        }
        let tiny = f64::from_bits(1);
        assert_eq!(exponent(tiny), -1073);
    }

    #[test]
    fn test_ldexp_extremes() {
        assert_eq!(ldexp(1.0, 10), 1024.0);
        assert_eq!(ldexp(3.0, -1), 1.5);
        assert_eq!(ldexp(ldexp(1.0, -1074), 1074), 1.0);
        assert_eq!(ldexp(1.0, 1023), f64::MAX / (2.0 - f64::EPSILON));
    }

    #[test]
    fn test_negabinary_round_trip() {
        for q in [0i64, 1, -1, 2, -2, 1 << 40, -(1 << 40), (1 << 61) - 1, -(1 << 61)] {
            assert_eq!(from_negabinary(to_negabinary(q, 64), 64), q);
        }
        for q in [0i64, 5, -5, (1 << 29) - 1, -(1 << 29)] {
            let u = to_negabinary(q, 32);
            assert!(u <= u32::MAX as u64);
            assert_eq!(from_negabinary(u, 32), q);
        }
    }

    // ---- Block coding ----

    #[test]
    fn test_zero_block_is_one_cleared_bit() {
        let mut words = [0u64; 1];
        let mut q = Vec::new();
        let mut w = BitWriter::new(&mut words, 0);
        encode_block(&[0.0; 4], ScalarType::Double, 40, &mut q, &mut w);
        assert_eq!(w.position(), 1);
        assert_eq!(words[0], 0);
    }

    #[test]
    fn test_block_never_exceeds_budget() {
        let mut words = [0u64; 8];
        let mut q = Vec::new();
        let values = [1.5, -2.25, 1e3, 7.0];
        let mut w = BitWriter::new(&mut words, 5);
        encode_block(&values, ScalarType::Double, 100, &mut q, &mut w);
        assert_eq!(w.position(), 105);
    }

    #[test]
    fn test_high_rate_round_trip_is_close() {
        let f = field(&[37], ScalarType::Double);
        let data: Vec<f64> = (0..37).map(|i| (i as f64 * 0.1).sin() * 100.0).collect();
        let src = encode_f64(&data);
        let r = FixedRate::new(64.0, &f).unwrap();
        let mut stream = vec![0u8; r.stream_bytes(&f)];
        compress_serial(&f, &r, &src, &mut stream).unwrap();

        let mut out = vec![0u8; src.len()];
        decompress_serial(&f, &r, &stream, &mut out).unwrap();
        for (a, b) in data.iter().zip(decode_f64(&out)) {
            assert!((a - b).abs() <= 1e-9, "{a} vs {b}");
        }
    }

    #[test]
    fn test_low_rate_round_trip_preserves_shape() {
        let f = field(&[6, 7, 5], ScalarType::Float);
        let data: Vec<f32> = (0..f.element_count()).map(|i| i as f32 * 0.5 - 20.0).collect();
        let src: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        let r = FixedRate::new(2.0, &f).unwrap();
        let mut stream = vec![0u8; r.stream_bytes(&f)];
        let n = compress_serial(&f, &r, &src, &mut stream).unwrap();
        assert_eq!(n, stream.len());
        assert!(n < src.len());

        let mut out = vec![0u8; src.len()];
        decompress_serial(&f, &r, &stream, &mut out).unwrap();
        assert_eq!(out.len() / 4, f.element_count());
    }

    #[test]
    fn test_zero_and_nonfinite_values() {
        let f = field(&[8], ScalarType::Double);
        let data = [0.0, 0.0, 0.0, 0.0, 1.0, f64::NAN, -1.0, 0.5];
        let src = encode_f64(&data);
        let r = FixedRate::new(32.0, &f).unwrap();
        let mut stream = vec![0u8; r.stream_bytes(&f)];
        compress_serial(&f, &r, &src, &mut stream).unwrap();
        let mut out = vec![0u8; src.len()];
        decompress_serial(&f, &r, &stream, &mut out).unwrap();
        let out = decode_f64(&out);
        assert_eq!(&out[..4], &[0.0; 4]);
        assert_eq!(out[5], 0.0);
        assert!((out[4] - 1.0).abs() < 1e-6);
        assert!((out[6] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_short_buffers_rejected() {
        let f = field(&[16], ScalarType::Double);
        let r = FixedRate::new(8.0, &f).unwrap();
        let src = vec![0u8; f.byte_len()];
        let mut dst = vec![0u8; r.stream_bytes(&f) - 8];
        let err = compress_serial(&f, &r, &src, &mut dst).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CodecError);

        let mut out = vec![0u8; f.byte_len()];
        let err = decompress_serial(&f, &r, &dst, &mut out).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CodecError);
    }
}
