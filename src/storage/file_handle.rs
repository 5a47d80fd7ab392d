//! File access for storage objects.
//!
//! [`FileHandle`] owns one file descriptor and, when device bytes may go
//! straight to storage, a cuFile handle for GPUDirect Storage. Host memory is
//! moved with positional I/O split across scoped threads; device memory takes
//! the cuFile path when registered and is staged through host memory
//! otherwise.

use std::ffi::c_void;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cudarc::driver::{CudaSlice, DevicePtr, DevicePtrMut};

use crate::config::Config;
use crate::device::{DeviceBuffer, DeviceManager, Memory};
use crate::error::{Error, ErrorKind, Result};
use crate::staging::StagingMode;
use crate::storage::posix_io;

/// An open file of a storage object.
pub struct FileHandle {
    fd: RawFd,
    /// cuFile handle for GDS (None when staging through host memory).
    cufile_handle: Option<cudarc::cufile::FileHandle>,
    /// Keeps the cuFile driver open while the handle is registered.
    driver: Option<Arc<cudarc::cufile::Cufile>>,
    /// Effective staging mode: `Direct` or `Staged`, never `Auto`.
    staging: StagingMode,
    path: PathBuf,
}

impl FileHandle {
    /// Open a file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the file.
    /// * `flags` - `"r"` (read), `"w"` (write/create/truncate), `"r+"`
    ///   (read-write) or `"w+"` (read-write/create, keep contents).
    /// * `mode` - File creation mode (e.g., `0o644`).
    /// * `staging` - `Direct` requires cuFile, `Auto` tries it, `Staged`
    ///   never registers with cuFile.
    pub fn open(path: &Path, flags: &str, mode: u32, staging: StagingMode) -> Result<Self> {
        let o_flags = parse_flags(flags)?;
        let fd = posix_io::posix_open(path, o_flags, mode)
            .map_err(|e| e.with_operation("FileHandle::open"))?;

        let (driver, cufile_handle, effective) = match staging {
            StagingMode::Staged => (None, None, StagingMode::Staged),
            StagingMode::Direct => match init_cufile(path) {
                Ok((d, h)) => (Some(d), Some(h), StagingMode::Direct),
                Err(e) => {
                    posix_io::posix_close(fd);
                    return Err(e
                        .with_operation("FileHandle::open")
                        .with_context("path", path.display().to_string()));
                }
            },
            StagingMode::Auto => match init_cufile(path) {
                Ok((d, h)) => (Some(d), Some(h), StagingMode::Direct),
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "cuFile unavailable, staging through host");
                    (None, None, StagingMode::Staged)
                }
            },
        };

        Ok(Self {
            fd,
            cufile_handle,
            driver,
            staging: effective,
            path: path.to_path_buf(),
        })
    }

    /// Current file size in bytes.
    pub fn nbytes(&self) -> Result<u64> {
        posix_io::file_size(self.fd).map_err(|e| {
            e.with_operation("FileHandle::nbytes")
                .with_context("path", self.path.display().to_string())
        })
    }

    /// Resize the file to `len` bytes.
    pub fn set_len(&self, len: u64) -> Result<()> {
        posix_io::set_file_size(self.fd, len).map_err(|e| {
            e.with_operation("FileHandle::set_len")
                .with_context("path", self.path.display().to_string())
        })
    }

    /// Effective staging mode, `Direct` or `Staged`.
    pub fn staging(&self) -> StagingMode {
        self.staging
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `true` if this handle has a GDS/cuFile handle.
    pub fn is_gds_available(&self) -> bool {
        self.cufile_handle.is_some()
    }

    /// Close the file handle. Also done on drop.
    pub fn close(&mut self) {
        self.cufile_handle.take();
        self.driver.take();
        posix_io::posix_close(self.fd);
        self.fd = -1;
    }

    /// Read exactly `buf.len()` bytes at `file_offset` into host memory.
    pub fn read_host(&self, buf: &mut [u8], file_offset: u64) -> Result<usize> {
        posix_io::pread_all(self.fd, buf, file_offset).map_err(|e| {
            e.with_operation("FileHandle::read_host")
                .with_context("path", self.path.display().to_string())
        })
    }

    /// Write all of `buf` at `file_offset` from host memory.
    pub fn write_host(&self, buf: &[u8], file_offset: u64) -> Result<usize> {
        posix_io::pwrite_all(self.fd, buf, file_offset).map_err(|e| {
            e.with_operation("FileHandle::write_host")
                .with_context("path", self.path.display().to_string())
        })
    }

    /// Parallel read: splits into chunks across scoped threads.
    ///
    /// `task_size` of 0 uses [`Config::task_size`]. Returns total bytes read.
    pub fn pread_host(&self, buf: &mut [u8], file_offset: u64, task_size: usize) -> Result<usize> {
        let ts = effective_task_size(task_size);
        if buf.len() <= ts {
            return self.read_host(buf, file_offset);
        }

        let fd = self.fd;
        let results: Vec<Result<usize>> = std::thread::scope(|scope| {
            let handles: Vec<_> = buf
                .chunks_mut(ts)
                .enumerate()
                .map(|(i, chunk)| {
                    let offset = file_offset + (i * ts) as u64;
                    scope.spawn(move || posix_io::pread_all(fd, chunk, offset))
                })
                .collect();
            handles.into_iter().map(join_task).collect()
        });

        self.sum_results(results, "FileHandle::pread_host")
    }

    /// Parallel write: splits into chunks across scoped threads.
    ///
    /// `task_size` of 0 uses [`Config::task_size`]. Returns total bytes written.
    pub fn pwrite_host(&self, buf: &[u8], file_offset: u64, task_size: usize) -> Result<usize> {
        let ts = effective_task_size(task_size);
        if buf.len() <= ts {
            return self.write_host(buf, file_offset);
        }

        let fd = self.fd;
        let results: Vec<Result<usize>> = std::thread::scope(|scope| {
            let handles: Vec<_> = buf
                .chunks(ts)
                .enumerate()
                .map(|(i, chunk)| {
                    let offset = file_offset + (i * ts) as u64;
                    scope.spawn(move || posix_io::pwrite_all(fd, chunk, offset))
                })
                .collect();
            handles.into_iter().map(join_task).collect()
        });

        self.sum_results(results, "FileHandle::pwrite_host")
    }

    /// Write the first `len` bytes of a device buffer at `file_offset`.
    ///
    /// Emulated-device buffers are host memory and are written directly.
    /// CUDA buffers use cuFile when registered and are copied through a host
    /// buffer otherwise.
    pub fn write_device(
        &self,
        device: &DeviceManager,
        buf: &DeviceBuffer,
        len: usize,
        file_offset: u64,
    ) -> Result<usize> {
        check_device_len(buf, len, "FileHandle::write_device")?;
        match buf.memory() {
            Some(Memory::Host(vec)) => self.pwrite_host(&vec[..len], file_offset, 0),
            Some(Memory::Cuda(slice)) => match &self.cufile_handle {
                Some(handle) => self.cufile_write(handle, slice, len, file_offset),
                None => {
                    let mut staged = vec![0u8; len];
                    device.copy_to_host(buf, &mut staged)?;
                    self.pwrite_host(&staged, file_offset, 0)
                }
            },
            None => Err(released_buffer("FileHandle::write_device")),
        }
        .map_err(|e| e.with_context("role", buf.role().as_str()))
    }

    /// Read `len` bytes at `file_offset` into the start of a device buffer.
    pub fn read_device(
        &self,
        device: &DeviceManager,
        buf: &mut DeviceBuffer,
        len: usize,
        file_offset: u64,
    ) -> Result<usize> {
        check_device_len(buf, len, "FileHandle::read_device")?;
        let role = buf.role();
        let cufile = match buf.memory_mut() {
            Some(Memory::Host(vec)) => return self.pread_host(&mut vec[..len], file_offset, 0),
            Some(Memory::Cuda(slice)) => match &self.cufile_handle {
                Some(handle) => Some(self.cufile_read(handle, slice, len, file_offset)),
                None => None,
            },
            None => return Err(released_buffer("FileHandle::read_device")),
        };
        match cufile {
            Some(result) => result,
            None => {
                let mut staged = vec![0u8; len];
                self.pread_host(&mut staged, file_offset, 0)?;
                device.copy_to_device(&staged, buf)?;
                Ok(len)
            }
        }
        .map_err(|e| e.with_context("role", role.as_str()))
    }

    fn cufile_write(
        &self,
        handle: &cudarc::cufile::FileHandle,
        slice: &CudaSlice<u8>,
        len: usize,
        file_offset: u64,
    ) -> Result<usize> {
        let stream = slice.stream().clone();
        let (src, _record_src) = slice.device_ptr(&stream);
        stream
            .synchronize()
            .map_err(|e| Error::from(e).with_operation("FileHandle::cufile_write"))?;

        // SAFETY: `handle.cu()` is a registered CUfileHandle_t, `src` is a
        // device pointer of the synchronized slice and `len <= slice.len()`.
        let ret = unsafe {
            cudarc::cufile::result::write(
                handle.cu(),
                src as *mut c_void,
                len,
                file_offset as i64,
                0,
            )
        };
        self.check_cufile(ret, len, "FileHandle::cufile_write")
    }

    fn cufile_read(
        &self,
        handle: &cudarc::cufile::FileHandle,
        slice: &mut CudaSlice<u8>,
        len: usize,
        file_offset: u64,
    ) -> Result<usize> {
        let stream = slice.stream().clone();
        let (dst, _record_dst) = slice.device_ptr_mut(&stream);
        stream
            .synchronize()
            .map_err(|e| Error::from(e).with_operation("FileHandle::cufile_read"))?;

        // SAFETY: as in `cufile_write`, with `dst` writable for `len` bytes.
        let ret = unsafe {
            cudarc::cufile::result::read(
                handle.cu(),
                dst as *mut c_void,
                len,
                file_offset as i64,
                0,
            )
        };
        self.check_cufile(ret, len, "FileHandle::cufile_read")
    }

    fn check_cufile<E: std::fmt::Debug>(
        &self,
        ret: std::result::Result<isize, E>,
        len: usize,
        operation: &'static str,
    ) -> Result<usize> {
        let n = ret.map_err(|e| {
            Error::new(ErrorKind::StorageError, format!("cuFile call failed: {e:?}"))
                .with_operation(operation)
                .with_context("path", self.path.display().to_string())
        })?;
        if n < 0 || n as usize != len {
            return Err(Error::new(
                ErrorKind::StorageError,
                format!("cuFile transferred {n} of {len} bytes"),
            )
            .with_operation(operation)
            .with_context("path", self.path.display().to_string()));
        }
        Ok(len)
    }

    fn sum_results(&self, results: Vec<Result<usize>>, operation: &'static str) -> Result<usize> {
        let mut total = 0;
        for result in results {
            total += result.map_err(|e| {
                e.with_operation(operation)
                    .with_context("path", self.path.display().to_string())
            })?;
        }
        Ok(total)
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("path", &self.path)
            .field("fd", &self.fd)
            .field("staging", &self.staging)
            .field("gds_available", &self.cufile_handle.is_some())
            .finish()
    }
}

/// Parse a flag string into `libc::O_*` flags.
fn parse_flags(flags: &str) -> Result<i32> {
    match flags {
        "r" => Ok(libc::O_RDONLY),
        "w" => Ok(libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC),
        "r+" => Ok(libc::O_RDWR),
        "w+" => Ok(libc::O_RDWR | libc::O_CREAT),
        _ => Err(Error::new(
            ErrorKind::Unexpected,
            format!("unknown file flags: {flags:?}"),
        )
        .with_operation("FileHandle::open")),
    }
}

fn effective_task_size(task_size: usize) -> usize {
    let ts = if task_size == 0 {
        Config::get().task_size
    } else {
        task_size
    };
    ts.max(1)
}

fn join_task(handle: std::thread::ScopedJoinHandle<'_, Result<usize>>) -> Result<usize> {
    handle.join().unwrap_or_else(|_| {
        Err(Error::new(ErrorKind::Unexpected, "I/O task panicked").with_operation("FileHandle::join"))
    })
}

fn check_device_len(buf: &DeviceBuffer, len: usize, operation: &'static str) -> Result<()> {
    if len > buf.len() {
        return Err(Error::new(
            ErrorKind::TransferError,
            format!("{len} bytes requested from a {} byte device buffer", buf.len()),
        )
        .with_operation(operation)
        .with_context("role", buf.role().as_str()));
    }
    Ok(())
}

fn released_buffer(operation: &'static str) -> Error {
    Error::new(ErrorKind::TransferError, "device buffer was released").with_operation(operation)
}

/// Initialize the cuFile driver and register the file.
fn init_cufile(path: &Path) -> Result<(Arc<cudarc::cufile::Cufile>, cudarc::cufile::FileHandle)> {
    // Dynamic loading panics rather than erroring when libcufile is absent.
    let driver = std::panic::catch_unwind(cudarc::cufile::Cufile::new)
        .map_err(|_| {
            Error::new(ErrorKind::StorageUnavailable, "cuFile library could not be loaded")
        })?
        .map_err(|e| {
            Error::new(
                ErrorKind::StorageUnavailable,
                format!("failed to initialize cuFile driver: {e:?}"),
            )
        })?;

    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| {
            Error::new(
                ErrorKind::StorageUnavailable,
                format!("failed to open file for cuFile: {e}"),
            )
            .set_source(e)
        })?;

    let handle = driver.register(file).map_err(|e| {
        Error::new(
            ErrorKind::StorageUnavailable,
            format!("cuFile handle registration failed: {e:?}"),
        )
    })?;

    Ok((driver, handle))
}
