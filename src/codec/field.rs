//! Field metadata in codec order.
//!
//! Arrays are described slowest dimension first (`shape[0]`), while the codec
//! indexes fastest dimension first: `nx = shape[D-1]`, `ny = shape[D-2]`, and
//! so on. Unused codec dimensions have extent 1.

use crate::error::{Error, ErrorKind, Result};

/// Largest dimensionality the codec supports.
pub const MAX_DIMS: usize = 4;

/// Element precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    Float,
    Double,
}

impl ScalarType {
    /// Parse the `-t` option value: `s` (single) or `d` (double).
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "s" | "single" | "f32" | "float" => Ok(ScalarType::Float),
            "d" | "double" | "f64" => Ok(ScalarType::Double),
            _ => Err(Error::new(
                ErrorKind::Usage,
                format!("unknown precision {s:?}, expected 's' or 'd'"),
            )
            .with_operation("ScalarType::parse")),
        }
    }

    /// Bytes per element.
    pub fn size(self) -> usize {
        match self {
            ScalarType::Float => 4,
            ScalarType::Double => 8,
        }
    }

    /// Width of the biased block exponent.
    pub fn exponent_bits(self) -> u32 {
        match self {
            ScalarType::Float => 8,
            ScalarType::Double => 11,
        }
    }

    pub(crate) fn exponent_bias(self) -> i32 {
        match self {
            ScalarType::Float => 127,
            ScalarType::Double => 1023,
        }
    }

    /// Width of the quantized integers.
    pub(crate) fn precision(self) -> u32 {
        match self {
            ScalarType::Float => 32,
            ScalarType::Double => 64,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScalarType::Float => "float",
            ScalarType::Double => "double",
        }
    }

    /// Load element `idx` of a little-endian array as `f64`.
    pub(crate) fn load(self, bytes: &[u8], idx: usize) -> f64 {
        match self {
            ScalarType::Float => {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&bytes[idx * 4..idx * 4 + 4]);
                f32::from_le_bytes(raw) as f64
            }
            ScalarType::Double => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes[idx * 8..idx * 8 + 8]);
                f64::from_le_bytes(raw)
            }
        }
    }

    /// Store `value` as element `idx` of a little-endian array.
    pub(crate) fn store(self, bytes: &mut [u8], idx: usize, value: f64) {
        match self {
            ScalarType::Float => {
                bytes[idx * 4..idx * 4 + 4].copy_from_slice(&(value as f32).to_le_bytes())
            }
            ScalarType::Double => bytes[idx * 8..idx * 8 + 8].copy_from_slice(&value.to_le_bytes()),
        }
    }
}

impl std::fmt::Display for ScalarType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dense field as the codec sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    scalar: ScalarType,
    dims: usize,
    /// Extents in codec order (`nx`, `ny`, `nz`, `nw`).
    sizes: [usize; MAX_DIMS],
    elements: usize,
}

impl Field {
    /// Describe an array of `shape` (slowest dimension first).
    ///
    /// Fails with `UnsupportedDimensionality` unless `1 <= shape.len() <= 4`.
    pub fn new(shape: &[usize], scalar: ScalarType) -> Result<Self> {
        let dims = shape.len();
        if !(1..=MAX_DIMS).contains(&dims) {
            return Err(Error::new(
                ErrorKind::UnsupportedDimensionality,
                format!("{dims}-dimensional fields are not supported, expected 1 to {MAX_DIMS}"),
            )
            .with_operation("Field::new")
            .with_context("shape", format!("{shape:?}")));
        }
        if shape.contains(&0) {
            return Err(Error::new(ErrorKind::CodecError, "field has a zero extent")
                .with_operation("Field::new")
                .with_context("shape", format!("{shape:?}")));
        }

        let mut sizes = [1usize; MAX_DIMS];
        for (slot, &extent) in sizes.iter_mut().zip(shape.iter().rev()) {
            *slot = extent;
        }

        let elements = shape
            .iter()
            .try_fold(1usize, |acc, &n| acc.checked_mul(n))
            .and_then(|n| n.checked_mul(scalar.size()).map(|_| n))
            .ok_or_else(|| {
                Error::new(ErrorKind::CodecError, "field size overflows usize")
                    .with_operation("Field::new")
                    .with_context("shape", format!("{shape:?}"))
            })?;

        Ok(Self {
            scalar,
            dims,
            sizes,
            elements,
        })
    }

    pub fn scalar(&self) -> ScalarType {
        self.scalar
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn nx(&self) -> usize {
        self.sizes[0]
    }

    pub fn ny(&self) -> usize {
        self.sizes[1]
    }

    pub fn nz(&self) -> usize {
        self.sizes[2]
    }

    pub fn nw(&self) -> usize {
        self.sizes[3]
    }

    /// Extents in codec order, 1 for unused dimensions.
    pub fn sizes(&self) -> [usize; MAX_DIMS] {
        self.sizes
    }

    pub fn element_count(&self) -> usize {
        self.elements
    }

    pub fn byte_len(&self) -> usize {
        self.elements * self.scalar.size()
    }

    /// Values per block: `4^D`.
    pub fn values_per_block(&self) -> usize {
        1 << (2 * self.dims)
    }

    /// Blocks per dimension in codec order.
    pub fn block_counts(&self) -> [usize; MAX_DIMS] {
        self.sizes.map(|n| n.div_ceil(4))
    }

    pub fn block_count(&self) -> usize {
        self.block_counts().iter().product()
    }

    /// Linear element indices of `block`, padded by clamping to the last
    /// valid element along each dimension.
    ///
    /// The second slot of each entry is `true` when the position lies inside
    /// the field (as opposed to a padding duplicate).
    pub(crate) fn block_indices(&self, block: usize, out: &mut Vec<(usize, bool)>) {
        out.clear();
        let counts = self.block_counts();
        let mut origin = [0usize; MAX_DIMS];
        let mut rest = block;
        for d in 0..MAX_DIMS {
            origin[d] = (rest % counts[d]) * 4;
            rest /= counts[d];
        }

        let n = self.values_per_block();
        for i in 0..n {
            let mut linear = 0usize;
            let mut stride = 1usize;
            let mut inside = true;
            for d in 0..MAX_DIMS {
                let local = if d < self.dims { (i >> (2 * d)) & 3 } else { 0 };
                let coord = origin[d] + local;
                let clamped = if coord >= self.sizes[d] {
                    inside = false;
                    self.sizes[d] - 1
                } else {
                    coord
                };
                linear += clamped * stride;
                stride *= self.sizes[d];
            }
            out.push((linear, inside));
        }
    }
}
