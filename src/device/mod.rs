//! Accelerator memory: allocation, host/device transfers and release.
//!
//! [`DeviceManager`] owns one backend, either a CUDA device driven through
//! `cudarc` or an emulated device that keeps "device" memory in host RAM. The
//! emulated backend runs the same pipeline on machines without a GPU and lets
//! tests impose a capacity limit.
//!
//! # Ownership
//!
//! A [`DeviceBuffer`] is always either empty or the sole owner of its memory.
//! Releasing is idempotent and dropping a buffer releases it, so an early
//! return from a pass cannot leak device memory. The manager keeps a count of
//! live buffers and bytes for every backend so leaks are observable.

mod cuda;
mod host;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use cudarc::driver::CudaSlice;

pub use cuda::CudaDevice;
pub use host::HostDevice;

use crate::config::Config;
use crate::error::{Error, ErrorKind, Result};

/// Logical role of a device buffer within one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferRole {
    /// The staged input array.
    Original,
    /// Codec output, sized by the codec's maximum compressed size.
    Compressed,
    /// Codec reconstruction of the array.
    Decompressed,
    /// Bytes returned by the storage read phase.
    Staged,
}

impl BufferRole {
    pub fn as_str(self) -> &'static str {
        match self {
            BufferRole::Original => "original",
            BufferRole::Compressed => "compressed",
            BufferRole::Decompressed => "decompressed",
            BufferRole::Staged => "staged",
        }
    }
}

impl std::fmt::Display for BufferRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which kind of device a [`DeviceManager`] drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Cuda,
    Host,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Cuda => f.write_str("cuda"),
            Backend::Host => f.write_str("host"),
        }
    }
}

/// Backing storage of a device buffer.
pub(crate) enum Memory {
    Cuda(CudaSlice<u8>),
    Host(Vec<u8>),
}

#[derive(Debug, Default)]
struct Accounting {
    bytes: AtomicUsize,
    buffers: AtomicUsize,
}

impl Accounting {
    fn record_alloc(&self, len: usize) {
        self.bytes.fetch_add(len, Ordering::Relaxed);
        self.buffers.fetch_add(1, Ordering::Relaxed);
    }

    fn record_free(&self, len: usize) {
        self.bytes.fetch_sub(len, Ordering::Relaxed);
        self.buffers.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A region of device memory tagged with its role.
pub struct DeviceBuffer {
    role: BufferRole,
    len: usize,
    mem: Option<Memory>,
    accounting: Option<Arc<Accounting>>,
}

impl DeviceBuffer {
    /// A handle that owns nothing. Releasing it is a no-op.
    pub fn empty(role: BufferRole) -> Self {
        Self {
            role,
            len: 0,
            mem: None,
            accounting: None,
        }
    }

    pub fn role(&self) -> BufferRole {
        self.role
    }

    /// Length in bytes (zero once released).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether this handle currently owns device memory.
    pub fn is_owning(&self) -> bool {
        self.mem.is_some()
    }

    /// Free the memory if owned. Calling this again does nothing.
    pub fn release(&mut self) {
        if let Some(mem) = self.mem.take() {
            drop(mem);
            if let Some(accounting) = self.accounting.take() {
                accounting.record_free(self.len);
            }
            tracing::trace!(role = %self.role, bytes = self.len, "released device buffer");
            self.len = 0;
        }
    }

    pub(crate) fn memory(&self) -> Option<&Memory> {
        self.mem.as_ref()
    }

    pub(crate) fn memory_mut(&mut self) -> Option<&mut Memory> {
        self.mem.as_mut()
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match self.mem {
            Some(Memory::Cuda(_)) => Some(Backend::Cuda),
            Some(Memory::Host(_)) => Some(Backend::Host),
            None => None,
        };
        f.debug_struct("DeviceBuffer")
            .field("role", &self.role)
            .field("len", &self.len)
            .field("backend", &backend)
            .finish()
    }
}

enum Device {
    Cuda(CudaDevice),
    Host(HostDevice),
}

/// Allocates device buffers and moves bytes between host and device.
pub struct DeviceManager {
    device: Device,
    accounting: Arc<Accounting>,
}

impl DeviceManager {
    /// Create a manager for CUDA device `ordinal`.
    pub fn cuda(ordinal: usize) -> Result<Self> {
        let device = CudaDevice::new(ordinal)?;
        tracing::info!(ordinal, "using CUDA device");
        Ok(Self {
            device: Device::Cuda(device),
            accounting: Arc::default(),
        })
    }

    /// Create an emulated device backed by host memory.
    ///
    /// `capacity` bounds the bytes that may be live at once; `None` leaves it
    /// limited only by the host allocator.
    pub fn host(capacity: Option<usize>) -> Self {
        Self {
            device: Device::Host(HostDevice::new(capacity)),
            accounting: Arc::default(),
        }
    }

    /// Create the backend the configured execution policy runs on.
    pub fn from_config(config: &Config) -> Result<Self> {
        match config.exec_policy.backend() {
            Backend::Cuda => Self::cuda(config.device_ordinal),
            Backend::Host => Ok(Self::host(config.host_device_capacity)),
        }
    }

    pub fn backend(&self) -> Backend {
        match self.device {
            Device::Cuda(_) => Backend::Cuda,
            Device::Host(_) => Backend::Host,
        }
    }

    pub(crate) fn cuda_device(&self) -> Option<&CudaDevice> {
        match &self.device {
            Device::Cuda(dev) => Some(dev),
            Device::Host(_) => None,
        }
    }

    /// Allocate `len` zeroed bytes for `role`.
    pub fn allocate(&self, role: BufferRole, len: usize) -> Result<DeviceBuffer> {
        if len == 0 {
            return Err(Error::new(ErrorKind::DeviceError, "zero-length device allocation")
                .with_operation("DeviceManager::allocate")
                .with_context("role", role.as_str()));
        }

        let mem = match &self.device {
            Device::Cuda(dev) => dev.alloc(len).map(Memory::Cuda),
            Device::Host(dev) => dev.alloc(len, self.allocated_bytes()).map(Memory::Host),
        }
        .map_err(|e| {
            e.with_operation("DeviceManager::allocate")
                .with_context("role", role.as_str())
                .with_context("bytes", len.to_string())
        })?;

        self.accounting.record_alloc(len);
        tracing::debug!(role = %role, bytes = len, backend = %self.backend(), "allocated device buffer");

        Ok(DeviceBuffer {
            role,
            len,
            mem: Some(mem),
            accounting: Some(Arc::clone(&self.accounting)),
        })
    }

    /// Copy `host` into the start of `buf`.
    pub fn copy_to_device(&self, host: &[u8], buf: &mut DeviceBuffer) -> Result<()> {
        check_transfer(host.len(), buf, "DeviceManager::copy_to_device")?;
        let role = buf.role;
        match (&self.device, buf.memory_mut()) {
            (Device::Cuda(dev), Some(Memory::Cuda(slice))) => dev.upload(host, slice),
            (Device::Host(_), Some(Memory::Host(vec))) => {
                vec[..host.len()].copy_from_slice(host);
                Ok(())
            }
            _ => Err(foreign_buffer()),
        }
        .map_err(|e| {
            e.with_operation("DeviceManager::copy_to_device")
                .with_context("role", role.as_str())
        })
    }

    /// Copy the first `host.len()` bytes of `buf` into `host`.
    pub fn copy_to_host(&self, buf: &DeviceBuffer, host: &mut [u8]) -> Result<()> {
        check_transfer(host.len(), buf, "DeviceManager::copy_to_host")?;
        match (&self.device, buf.memory()) {
            (Device::Cuda(dev), Some(Memory::Cuda(slice))) => dev.download(slice, host),
            (Device::Host(_), Some(Memory::Host(vec))) => {
                host.copy_from_slice(&vec[..host.len()]);
                Ok(())
            }
            _ => Err(foreign_buffer()),
        }
        .map_err(|e| {
            e.with_operation("DeviceManager::copy_to_host")
                .with_context("role", buf.role.as_str())
        })
    }

    /// Block until all outstanding work on this device has completed.
    pub fn synchronize(&self) -> Result<()> {
        match &self.device {
            Device::Cuda(dev) => dev
                .synchronize()
                .map_err(|e| e.with_operation("DeviceManager::synchronize")),
            Device::Host(_) => Ok(()),
        }
    }

    /// Release `buf`. Releasing an empty or already released buffer is a no-op.
    pub fn release(&self, buf: &mut DeviceBuffer) {
        buf.release();
    }

    /// Bytes currently held by live buffers of this manager.
    pub fn allocated_bytes(&self) -> usize {
        self.accounting.bytes.load(Ordering::Relaxed)
    }

    /// Number of live buffers of this manager.
    pub fn live_buffers(&self) -> usize {
        self.accounting.buffers.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("backend", &self.backend())
            .field("allocated_bytes", &self.allocated_bytes())
            .field("live_buffers", &self.live_buffers())
            .finish()
    }
}

fn check_transfer(host_len: usize, buf: &DeviceBuffer, operation: &'static str) -> Result<()> {
    if !buf.is_owning() {
        return Err(Error::new(
            ErrorKind::TransferError,
            "transfer involving a released device buffer",
        )
        .with_operation(operation)
        .with_context("role", buf.role.as_str()));
    }
    if host_len > buf.len {
        return Err(Error::new(
            ErrorKind::TransferError,
            format!(
                "host span of {host_len} bytes exceeds device buffer of {} bytes",
                buf.len
            ),
        )
        .with_operation(operation)
        .with_context("role", buf.role.as_str()));
    }
    Ok(())
}

fn foreign_buffer() -> Error {
    Error::new(
        ErrorKind::TransferError,
        "device buffer belongs to a different backend",
    )
}
