//! Fixed-rate compression of device-resident fields.
//!
//! A [`CodecSession`] is configured once per pass for a field shape, element
//! type and rate. It reports the maximum compressed size up front, then
//! compresses and decompresses between [`DeviceBuffer`]s on the session's
//! device.
//!
//! The session never moves data to a different execution path than the one
//! requested: asking for [`ExecutionPolicy::Cuda`] on the emulated device, or
//! [`ExecutionPolicy::Serial`] on a CUDA device, is
//! [`ErrorKind::CodecExecutionUnavailable`].

mod bitstream;
mod block;
mod field;
mod kernels;

pub use block::FixedRate;
pub use field::{Field, MAX_DIMS, ScalarType};

use crate::device::{Backend, DeviceBuffer, DeviceManager, Memory};
use crate::error::{Error, ErrorKind, Result};

/// Where the codec runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPolicy {
    /// Single-threaded host implementation on the emulated device.
    Serial,
    /// CUDA kernels on a CUDA device (default).
    #[default]
    Cuda,
}

impl ExecutionPolicy {
    /// Parse an execution policy: `serial` (or `host`) and `cuda` (or `gpu`).
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "serial" | "host" | "cpu" => Ok(ExecutionPolicy::Serial),
            "cuda" | "gpu" => Ok(ExecutionPolicy::Cuda),
            _ => Err(Error::new(
                ErrorKind::ConfigInvalid,
                format!("unknown execution policy: {s:?}"),
            )
            .with_operation("ExecutionPolicy::parse")),
        }
    }

    /// The device backend this policy executes on.
    pub fn backend(self) -> Backend {
        match self {
            ExecutionPolicy::Serial => Backend::Host,
            ExecutionPolicy::Cuda => Backend::Cuda,
        }
    }
}

impl std::fmt::Display for ExecutionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionPolicy::Serial => f.write_str("serial"),
            ExecutionPolicy::Cuda => f.write_str("cuda"),
        }
    }
}

/// A configured compression stream bound to one device.
///
/// Close it with [`CodecSession::close`]; dropping an open session closes it.
pub struct CodecSession<'d> {
    device: &'d DeviceManager,
    policy: ExecutionPolicy,
    field: Field,
    rate: FixedRate,
    open: bool,
}

impl<'d> CodecSession<'d> {
    /// Configure a fixed-rate stream for an array of `shape` (slowest first).
    ///
    /// Validates the dimensionality before anything else, so an unsupported
    /// field never reaches device allocation.
    pub fn configure(
        device: &'d DeviceManager,
        shape: &[usize],
        scalar: ScalarType,
        rate: f64,
        policy: ExecutionPolicy,
    ) -> Result<Self> {
        let field = Field::new(shape, scalar).map_err(|e| e.with_operation("CodecSession::configure"))?;
        let rate =
            FixedRate::new(rate, &field).map_err(|e| e.with_operation("CodecSession::configure"))?;
        tracing::debug!(
            dims = field.dims(),
            nx = field.nx(),
            ny = field.ny(),
            nz = field.nz(),
            nw = field.nw(),
            scalar = %scalar,
            rate = rate.requested,
            maxbits = rate.maxbits,
            %policy,
            "configured codec stream"
        );
        // Kernel compilation stays out of the first timed compression.
        if policy == ExecutionPolicy::Cuda {
            if let Some(dev) = device.cuda_device() {
                kernels::prepare(dev).map_err(|e| e.with_operation("CodecSession::configure"))?;
            }
        }
        Ok(Self {
            device,
            policy,
            field,
            rate,
            open: true,
        })
    }

    pub fn field(&self) -> &Field {
        &self.field
    }

    pub fn rate(&self) -> &FixedRate {
        &self.rate
    }

    pub fn policy(&self) -> ExecutionPolicy {
        self.policy
    }

    /// Upper bound on the compressed size in bytes.
    pub fn maximum_compressed_size(&self) -> usize {
        self.rate.stream_bytes(&self.field)
    }

    fn check_execution(&self, operation: &'static str) -> Result<()> {
        if self.policy.backend() != self.device.backend() {
            return Err(Error::new(
                ErrorKind::CodecExecutionUnavailable,
                format!(
                    "{} execution is not available on a {} device",
                    self.policy,
                    self.device.backend()
                ),
            )
            .with_operation(operation));
        }
        Ok(())
    }

    /// Compress `src` into `dst`, returning the compressed length in bytes.
    pub fn compress_on_device(&self, src: &DeviceBuffer, dst: &mut DeviceBuffer) -> Result<usize> {
        const OP: &str = "CodecSession::compress_on_device";
        self.check_execution(OP)?;
        let len = match (src.memory(), dst.memory_mut()) {
            (Some(Memory::Host(src)), Some(Memory::Host(dst))) => {
                block::compress_serial(&self.field, &self.rate, src, dst)
            }
            (Some(Memory::Cuda(src)), Some(Memory::Cuda(dst))) => {
                let dev = self.cuda_device(OP)?;
                kernels::compress_cuda(dev, &self.field, &self.rate, src, dst)
            }
            _ => Err(unusable_buffers()),
        }
        .map_err(|e| e.with_operation(OP))?;

        tracing::debug!(
            bytes_in = self.field.byte_len(),
            bytes_out = len,
            "compressed field"
        );
        Ok(len)
    }

    /// Reconstruct the field from the first `expected_len` bytes of `src`.
    pub fn decompress_on_device(
        &self,
        src: &DeviceBuffer,
        dst: &mut DeviceBuffer,
        expected_len: usize,
    ) -> Result<()> {
        const OP: &str = "CodecSession::decompress_on_device";
        self.check_execution(OP)?;
        let stream_len = self.maximum_compressed_size();
        if expected_len != stream_len || src.len() < expected_len {
            return Err(Error::new(
                ErrorKind::CodecError,
                format!(
                    "compressed stream of {expected_len} bytes (buffer {}) does not match the configured stream of {stream_len} bytes",
                    src.len()
                ),
            )
            .with_operation(OP));
        }

        match (src.memory(), dst.memory_mut()) {
            (Some(Memory::Host(src)), Some(Memory::Host(dst))) => {
                block::decompress_serial(&self.field, &self.rate, &src[..expected_len], dst)
            }
            (Some(Memory::Cuda(src)), Some(Memory::Cuda(dst))) => {
                let dev = self.cuda_device(OP)?;
                kernels::decompress_cuda(dev, &self.field, &self.rate, src, dst)
            }
            _ => Err(unusable_buffers()),
        }
        .map_err(|e| e.with_operation(OP))
    }

    fn cuda_device(&self, operation: &'static str) -> Result<&'d crate::device::CudaDevice> {
        self.device.cuda_device().ok_or_else(|| {
            Error::new(ErrorKind::CodecExecutionUnavailable, "no CUDA device bound")
                .with_operation(operation)
        })
    }

    /// Release the stream.
    pub fn close(mut self) {
        self.close_inner();
    }

    fn close_inner(&mut self) {
        if self.open {
            self.open = false;
            tracing::trace!(rate = self.rate.requested, "closed codec stream");
        }
    }
}

impl Drop for CodecSession<'_> {
    fn drop(&mut self) {
        self.close_inner();
    }
}

impl std::fmt::Debug for CodecSession<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecSession")
            .field("policy", &self.policy)
            .field("field", &self.field)
            .field("rate", &self.rate)
            .field("open", &self.open)
            .finish()
    }
}

fn unusable_buffers() -> Error {
    Error::new(
        ErrorKind::CodecError,
        "codec buffers are released or belong to a different backend",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::BufferRole;

    fn doubles(n: usize) -> Vec<u8> {
        (0..n)
            .flat_map(|i| ((i as f64) * 0.01).cos().to_le_bytes())
            .collect()
    }

    // ---- Policy ----

    #[test]
    fn test_parse_policy() {
        assert_eq!(ExecutionPolicy::parse("serial").unwrap(), ExecutionPolicy::Serial);
        assert_eq!(ExecutionPolicy::parse(" CUDA ").unwrap(), ExecutionPolicy::Cuda);
        assert_eq!(
            ExecutionPolicy::parse("opencl").unwrap_err().kind(),
            ErrorKind::ConfigInvalid
        );
        assert_eq!(ExecutionPolicy::default(), ExecutionPolicy::Cuda);
        assert_eq!(ExecutionPolicy::Serial.backend(), Backend::Host);
    }

    // ---- Session ----

    #[test]
    #[ignore = "requires CUDA GPU: cargo test --lib codec -- --ignored --nocapture"]
    fn test_configure_loads_kernels_before_first_launch() {
        let Ok(dev) = DeviceManager::cuda(0) else {
            eprintln!("SKIP: no CUDA device");
            return;
        };
        let Some(gpu) = dev.cuda_device() else {
            eprintln!("SKIP: no CUDA device");
            return;
        };
        assert!(!kernels::is_prepared(gpu));
        let session =
            CodecSession::configure(&dev, &[64], ScalarType::Double, 8.0, ExecutionPolicy::Cuda)
                .unwrap();
        assert!(kernels::is_prepared(gpu));
        session.close();
    }

    #[test]
    fn test_configure_rejects_five_dims_before_allocation() {
        let dev = DeviceManager::host(None);
        let err = CodecSession::configure(
            &dev,
            &[2, 2, 2, 2, 2],
            ScalarType::Double,
            2.0,
            ExecutionPolicy::Serial,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedDimensionality);
        assert_eq!(err.operation(), "CodecSession::configure");
        assert_eq!(dev.live_buffers(), 0);
    }

    #[test]
    fn test_cuda_policy_on_host_device_is_unavailable() {
        let dev = DeviceManager::host(None);
        let session =
            CodecSession::configure(&dev, &[64], ScalarType::Double, 8.0, ExecutionPolicy::Cuda)
                .unwrap();
        let src = dev.allocate(BufferRole::Original, 64 * 8).unwrap();
        let mut dst = dev
            .allocate(BufferRole::Compressed, session.maximum_compressed_size())
            .unwrap();
        let err = session.compress_on_device(&src, &mut dst).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CodecExecutionUnavailable);
        session.close();
    }

    #[test]
    fn test_serial_round_trip_on_host_device() {
        let dev = DeviceManager::host(None);
        let n = 1000;
        let data = doubles(n);
        let session =
            CodecSession::configure(&dev, &[10, 100], ScalarType::Double, 11.0, ExecutionPolicy::Serial)
                .unwrap();

        let mut original = dev.allocate(BufferRole::Original, data.len()).unwrap();
        dev.copy_to_device(&data, &mut original).unwrap();
        let max = session.maximum_compressed_size();
        let mut compressed = dev.allocate(BufferRole::Compressed, max).unwrap();
        let len = session.compress_on_device(&original, &mut compressed).unwrap();
        assert!(len <= max);
        assert!(len < data.len());

        let mut decompressed = dev.allocate(BufferRole::Decompressed, data.len()).unwrap();
        session
            .decompress_on_device(&compressed, &mut decompressed, len)
            .unwrap();
        let mut out = vec![0u8; data.len()];
        dev.copy_to_host(&decompressed, &mut out).unwrap();
        assert_eq!(out.len() / 8, n);
        session.close();
    }

    #[test]
    fn test_decompress_rejects_wrong_length() {
        let dev = DeviceManager::host(None);
        let session =
            CodecSession::configure(&dev, &[16], ScalarType::Float, 4.0, ExecutionPolicy::Serial)
                .unwrap();
        let max = session.maximum_compressed_size();
        let compressed = dev.allocate(BufferRole::Staged, max).unwrap();
        let mut out = dev.allocate(BufferRole::Decompressed, 64).unwrap();
        let err = session
            .decompress_on_device(&compressed, &mut out, max - 8)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CodecError);
    }

    #[test]
    fn test_released_buffer_is_codec_error() {
        let dev = DeviceManager::host(None);
        let session =
            CodecSession::configure(&dev, &[16], ScalarType::Double, 4.0, ExecutionPolicy::Serial)
                .unwrap();
        let mut src = dev.allocate(BufferRole::Original, 128).unwrap();
        src.release();
        let mut dst = dev
            .allocate(BufferRole::Compressed, session.maximum_compressed_size())
            .unwrap();
        let err = session.compress_on_device(&src, &mut dst).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CodecError);
    }

    #[test]
    fn test_maximum_size_bounds_actual_size() {
        let dev = DeviceManager::host(None);
        let shapes: [&[usize]; 4] = [&[37], &[9, 11], &[5, 6, 7], &[3, 4, 5, 6]];
        for scalar in [ScalarType::Float, ScalarType::Double] {
            for shape in shapes {
                for rate in [1.0, 2.0, 11.0, 21.0] {
                    let session =
                        CodecSession::configure(&dev, shape, scalar, rate, ExecutionPolicy::Serial)
                            .unwrap();
                    let bytes = session.field().byte_len();
                    let src = dev.allocate(BufferRole::Original, bytes).unwrap();
                    let max = session.maximum_compressed_size();
                    let mut dst = dev.allocate(BufferRole::Compressed, max).unwrap();
                    let len = session.compress_on_device(&src, &mut dst).unwrap();
                    assert!(len <= max, "{shape:?} {scalar} rate {rate}: {len} > {max}");
                    session.close();
                }
            }
        }
        assert_eq!(dev.live_buffers(), 0);
    }
}
