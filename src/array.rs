//! The dense input array and the decompressed output file.

use std::path::Path;

use crate::codec::ScalarType;
use crate::error::{Error, ErrorKind, Result};
use crate::staging::StagingMode;
use crate::storage::FileHandle;

/// A dense array of little-endian values, shape slowest to fastest.
///
/// Loaded once per participant and shared read-only by every pass.
#[derive(Clone, PartialEq)]
pub struct Array {
    shape: Vec<usize>,
    scalar: ScalarType,
    bytes: Vec<u8>,
}

impl Array {
    /// Wrap raw bytes. `bytes` must hold exactly the elements of `shape`.
    pub fn new(shape: &[usize], scalar: ScalarType, bytes: Vec<u8>) -> Result<Self> {
        let expected = byte_len(shape, scalar)?;
        if bytes.len() != expected {
            return Err(Error::new(
                ErrorKind::Usage,
                format!(
                    "{} bytes do not hold a {scalar} array of shape {shape:?} ({expected} bytes)",
                    bytes.len()
                ),
            )
            .with_operation("Array::new"));
        }
        Ok(Self {
            shape: shape.to_vec(),
            scalar,
            bytes,
        })
    }

    /// Build an array from values, narrowing to `scalar`.
    pub fn from_values(shape: &[usize], scalar: ScalarType, values: &[f64]) -> Result<Self> {
        let mut bytes = vec![0u8; values.len() * scalar.size()];
        for (i, &v) in values.iter().enumerate() {
            scalar.store(&mut bytes, i, v);
        }
        Self::new(shape, scalar, bytes)
    }

    /// Read an array of `shape` from the start of the file at `path`.
    ///
    /// A file shorter than the array is a usage error; trailing bytes are
    /// ignored.
    pub fn load(path: &Path, shape: &[usize], scalar: ScalarType) -> Result<Self> {
        let len = byte_len(shape, scalar).map_err(|e| e.with_operation("Array::load"))?;
        let file = FileHandle::open(path, "r", 0o644, StagingMode::Staged)
            .map_err(|e| e.with_operation("Array::load"))?;
        let available = file.nbytes()?;
        if available < len as u64 {
            return Err(Error::new(
                ErrorKind::Usage,
                format!("input holds {available} bytes, the array needs {len}"),
            )
            .with_operation("Array::load")
            .with_context("path", path.display().to_string()));
        }

        let mut bytes = vec![0u8; len];
        file.pread_host(&mut bytes, 0, 0)
            .map_err(|e| e.with_operation("Array::load"))?;
        tracing::info!(path = %path.display(), bytes = len, shape = ?shape, "loaded input array");
        Self::new(shape, scalar, bytes)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn scalar(&self) -> ScalarType {
        self.scalar
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Element `idx` widened to `f64`.
    pub fn value(&self, idx: usize) -> f64 {
        self.scalar.load(&self.bytes, idx)
    }

    /// Largest absolute difference between this array and `other`, raw bytes
    /// of the same shape and type. NaN pairs count as equal.
    pub fn max_abs_error(&self, other: &[u8]) -> Result<f64> {
        if other.len() != self.bytes.len() {
            return Err(Error::new(
                ErrorKind::CodecError,
                format!(
                    "reconstruction has {} bytes, the array has {}",
                    other.len(),
                    self.bytes.len()
                ),
            )
            .with_operation("Array::max_abs_error"));
        }
        let mut max = 0.0f64;
        for i in 0..self.element_count() {
            let a = self.value(i);
            let b = self.scalar.load(other, i);
            if a.is_nan() && b.is_nan() {
                continue;
            }
            let diff = (a - b).abs();
            if diff.is_nan() || diff > max {
                max = if diff.is_nan() { f64::INFINITY } else { diff };
            }
        }
        Ok(max)
    }
}

impl std::fmt::Debug for Array {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Array")
            .field("shape", &self.shape)
            .field("scalar", &self.scalar)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

/// Write `bytes` into the file at `path` at offset `rank * bytes.len()`,
/// creating it if needed. Participants share one file.
///
/// Every participant sizes the file to `participants * bytes.len()`, so a
/// longer file left by an earlier run loses its tail whatever order the
/// participants write in.
pub fn write_output(path: &Path, bytes: &[u8], rank: usize, participants: usize) -> Result<()> {
    let file = FileHandle::open(path, "w+", 0o644, StagingMode::Staged)
        .map_err(|e| e.with_operation("array::write_output"))?;
    let offset = (bytes.len() as u64) * rank as u64;
    file.set_len(bytes.len() as u64 * participants.max(rank + 1) as u64)
        .map_err(|e| e.with_operation("array::write_output"))?;
    file.pwrite_host(bytes, offset, 0)
        .map_err(|e| e.with_operation("array::write_output"))?;
    tracing::debug!(path = %path.display(), bytes = bytes.len(), offset, "wrote decompressed output");
    Ok(())
}

fn byte_len(shape: &[usize], scalar: ScalarType) -> Result<usize> {
    if shape.is_empty() || shape.contains(&0) {
        return Err(Error::new(
            ErrorKind::Usage,
            format!("array shape {shape:?} must have at least one dimension and no zero extent"),
        ));
    }
    shape
        .iter()
        .try_fold(scalar.size(), |acc, &n| acc.checked_mul(n))
        .ok_or_else(|| {
            Error::new(ErrorKind::Usage, format!("array shape {shape:?} is too large"))
        })
}
