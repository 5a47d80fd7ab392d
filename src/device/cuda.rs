//! CUDA backend over `cudarc`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use cudarc::driver::{CudaContext, CudaModule, CudaSlice, CudaStream};

use crate::error::{Error, ErrorKind, Result};

/// One CUDA device with the stream all pipeline work is issued on.
pub struct CudaDevice {
    ordinal: usize,
    ctx: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    /// Compiled kernel modules, keyed by module name.
    modules: Mutex<HashMap<&'static str, Arc<CudaModule>>>,
}

impl CudaDevice {
    /// Create a context on device `ordinal` and use its default stream.
    pub fn new(ordinal: usize) -> Result<Self> {
        // Dynamic loading panics rather than erroring when libcuda is absent.
        let ctx = std::panic::catch_unwind(|| CudaContext::new(ordinal))
            .map_err(|_| {
                Error::new(ErrorKind::DeviceError, "CUDA driver library could not be loaded")
                    .with_operation("CudaDevice::new")
            })?
            .map_err(|e| {
                Error::from(e)
                    .with_operation("CudaDevice::new")
                    .with_context("ordinal", ordinal.to_string())
            })?;
        let stream = ctx.default_stream();
        Ok(Self {
            ordinal,
            ctx,
            stream,
            modules: Mutex::new(HashMap::new()),
        })
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn context(&self) -> &Arc<CudaContext> {
        &self.ctx
    }

    pub fn stream(&self) -> &Arc<CudaStream> {
        &self.stream
    }

    pub(crate) fn alloc(&self, len: usize) -> Result<CudaSlice<u8>> {
        Ok(self.stream.alloc_zeros::<u8>(len)?)
    }

    pub(crate) fn upload(&self, host: &[u8], dst: &mut CudaSlice<u8>) -> Result<()> {
        if host.len() == dst.len() {
            self.stream.memcpy_htod(host, dst)
        } else {
            let mut view = dst.slice_mut(0..host.len());
            self.stream.memcpy_htod(host, &mut view)
        }
        .map_err(transfer_error)?;
        self.stream.synchronize().map_err(transfer_error)
    }

    pub(crate) fn download(&self, src: &CudaSlice<u8>, host: &mut [u8]) -> Result<()> {
        if host.len() == src.len() {
            self.stream.memcpy_dtoh(src, host)
        } else {
            let view = src.slice(0..host.len());
            self.stream.memcpy_dtoh(&view, host)
        }
        .map_err(transfer_error)?;
        self.stream.synchronize().map_err(transfer_error)
    }

    pub(crate) fn synchronize(&self) -> Result<()> {
        Ok(self.stream.synchronize()?)
    }

    /// Compile `source` with NVRTC on first use and cache the loaded module.
    pub(crate) fn module(&self, name: &'static str, source: &str) -> Result<Arc<CudaModule>> {
        let mut modules = match self.modules.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(module) = modules.get(name) {
            return Ok(Arc::clone(module));
        }

        tracing::debug!(module = name, "compiling CUDA kernels");
        let ptx = cudarc::nvrtc::compile_ptx(source).map_err(|e| {
            Error::new(
                ErrorKind::CodecExecutionUnavailable,
                format!("NVRTC compilation failed: {e:?}"),
            )
            .with_operation("CudaDevice::module")
            .with_context("module", name)
        })?;
        let module = self.ctx.load_module(ptx).map_err(|e| {
            Error::from(e)
                .with_operation("CudaDevice::module")
                .with_context("module", name)
        })?;
        modules.insert(name, Arc::clone(&module));
        Ok(module)
    }

    pub(crate) fn has_module(&self, name: &str) -> bool {
        match self.modules.lock() {
            Ok(guard) => guard.contains_key(name),
            Err(poisoned) => poisoned.into_inner().contains_key(name),
        }
    }
}

impl std::fmt::Debug for CudaDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaDevice")
            .field("ordinal", &self.ordinal)
            .finish()
    }
}

fn transfer_error(err: cudarc::driver::DriverError) -> Error {
    Error::new(ErrorKind::TransferError, format!("CUDA transfer failed: {err}")).set_source(err)
}
