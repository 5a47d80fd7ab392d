//! Positional POSIX I/O on raw file descriptors.
//!
//! Storage objects are written and read with `pread(2)` / `pwrite(2)` at
//! explicit offsets, so several participants (and several threads of one
//! participant) can share a data file without coordinating a file cursor.

use std::os::fd::RawFd;
use std::path::Path;

use crate::error::{Error, ErrorKind, Result};

/// Perform a single `pread` call.
///
/// Returns the number of bytes read, or an error.
///
/// # Safety
///
/// `buf` must point to valid, writable memory of at least `count` bytes.
/// `fd` must be a valid file descriptor open for reading.
pub unsafe fn pread_raw(fd: RawFd, buf: *mut u8, count: usize, offset: u64) -> Result<usize> {
    // SAFETY: Caller guarantees buf is valid for count bytes and fd is valid.
    let ret = unsafe { libc::pread(fd, buf as *mut libc::c_void, count, offset as libc::off_t) };
    if ret < 0 {
        let io_err = std::io::Error::last_os_error();
        Err(Error::new(ErrorKind::StorageError, format!("pread failed: {io_err}"))
            .with_operation("pread")
            .with_context("fd", fd.to_string())
            .with_context("count", count.to_string())
            .with_context("offset", offset.to_string())
            .set_source(io_err))
    } else {
        Ok(ret as usize)
    }
}

/// Perform a single `pwrite` call.
///
/// Returns the number of bytes written, or an error.
///
/// # Safety
///
/// `buf` must point to valid, readable memory of at least `count` bytes.
/// `fd` must be a valid file descriptor open for writing.
pub unsafe fn pwrite_raw(fd: RawFd, buf: *const u8, count: usize, offset: u64) -> Result<usize> {
    // SAFETY: Caller guarantees buf is valid for count bytes and fd is valid.
    let ret =
        unsafe { libc::pwrite(fd, buf as *const libc::c_void, count, offset as libc::off_t) };
    if ret < 0 {
        let io_err = std::io::Error::last_os_error();
        Err(Error::new(ErrorKind::StorageError, format!("pwrite failed: {io_err}"))
            .with_operation("pwrite")
            .with_context("fd", fd.to_string())
            .with_context("count", count.to_string())
            .with_context("offset", offset.to_string())
            .set_source(io_err))
    } else {
        Ok(ret as usize)
    }
}

/// Read exactly `buf.len()` bytes starting at `offset`.
///
/// Interrupted calls are retried; reaching end of file before the buffer is
/// full is a [`ErrorKind::StorageError`].
pub fn pread_all(fd: RawFd, buf: &mut [u8], offset: u64) -> Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        let rest = &mut buf[done..];
        // SAFETY: `rest` is a live, writable slice of `rest.len()` bytes.
        let n = match unsafe { pread_raw(fd, rest.as_mut_ptr(), rest.len(), offset + done as u64) }
        {
            Ok(n) => n,
            Err(e) if is_interrupted(&e) => continue,
            Err(e) => return Err(e.with_operation("posix_io::pread_all")),
        };
        if n == 0 {
            return Err(Error::new(
                ErrorKind::StorageError,
                format!("short read: {done} of {} bytes", buf.len()),
            )
            .with_operation("posix_io::pread_all")
            .with_context("offset", offset.to_string()));
        }
        done += n;
    }
    Ok(done)
}

/// Write all of `buf` starting at `offset`.
pub fn pwrite_all(fd: RawFd, buf: &[u8], offset: u64) -> Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        let rest = &buf[done..];
        // SAFETY: `rest` is a live slice of `rest.len()` bytes.
        let n = match unsafe { pwrite_raw(fd, rest.as_ptr(), rest.len(), offset + done as u64) } {
            Ok(n) => n,
            Err(e) if is_interrupted(&e) => continue,
            Err(e) => return Err(e.with_operation("posix_io::pwrite_all")),
        };
        if n == 0 {
            return Err(Error::new(
                ErrorKind::StorageError,
                format!("pwrite made no progress after {done} of {} bytes", buf.len()),
            )
            .with_operation("posix_io::pwrite_all")
            .with_context("offset", offset.to_string()));
        }
        done += n;
    }
    Ok(done)
}

fn is_interrupted(err: &Error) -> bool {
    std::error::Error::source(err)
        .and_then(|s| s.downcast_ref::<std::io::Error>())
        .is_some_and(|io| io.kind() == std::io::ErrorKind::Interrupted)
}

/// Open a file with POSIX `open(2)`.
///
/// Any failure is [`ErrorKind::StorageUnavailable`].
pub fn posix_open(path: &Path, flags: i32, mode: u32) -> Result<RawFd> {
    let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes()).map_err(|_| {
        Error::new(
            ErrorKind::StorageUnavailable,
            format!("path contains null byte: {}", path.display()),
        )
        .with_operation("posix_open")
    })?;

    // SAFETY: c_path is a valid C string.
    let fd = unsafe { libc::open(c_path.as_ptr(), flags | libc::O_CLOEXEC, mode) };
    if fd < 0 {
        let io_err = std::io::Error::last_os_error();
        Err(Error::new(ErrorKind::StorageUnavailable, format!("open failed: {io_err}"))
            .with_operation("posix_open")
            .with_context("path", path.display().to_string())
            .set_source(io_err))
    } else {
        Ok(fd)
    }
}

/// Close a file descriptor. Errors on close are ignored; negative
/// descriptors are skipped.
pub fn posix_close(fd: RawFd) {
    if fd >= 0 {
        // SAFETY: we only close descriptors we opened.
        unsafe {
            libc::close(fd);
        }
    }
}

/// Get the file size via `fstat`.
pub fn file_size(fd: RawFd) -> Result<u64> {
    // SAFETY: an all-zero `stat` is a valid value to be overwritten.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: stat is a valid out-pointer.
    let ret = unsafe { libc::fstat(fd, &mut stat) };
    if ret < 0 {
        let io_err = std::io::Error::last_os_error();
        Err(Error::new(ErrorKind::StorageError, format!("fstat failed: {io_err}"))
            .with_operation("file_size")
            .set_source(io_err))
    } else {
        Ok(stat.st_size as u64)
    }
}

/// Set the file size via `ftruncate`, cutting or zero-extending the tail.
pub fn set_file_size(fd: RawFd, len: u64) -> Result<()> {
    let len = libc::off_t::try_from(len).map_err(|_| {
        Error::new(ErrorKind::StorageError, "file size exceeds off_t")
            .with_operation("set_file_size")
            .with_context("len", len.to_string())
    })?;
    // SAFETY: ftruncate only reads its integer arguments.
    let ret = unsafe { libc::ftruncate(fd, len) };
    if ret < 0 {
        let io_err = std::io::Error::last_os_error();
        Err(Error::new(ErrorKind::StorageError, format!("ftruncate failed: {io_err}"))
            .with_operation("set_file_size")
            .set_source(io_err))
    } else {
        Ok(())
    }
}
