//! Error types for zckpt.
//!
//! # Design
//!
//! - [`ErrorKind`] categorizes *what* went wrong.
//! - [`ErrorCategory`] groups kinds into the failure domains the benchmark
//!   reports on (usage, device, codec, storage, partition) and decides the
//!   process exit code.
//! - [`Error`] combines the kind with rich context for debugging.
//!
//! There is deliberately no retry status: a retried phase would corrupt the
//! timing it is measuring, so every error is final for the pass it occurs in.
//!
//! Errors are constructed via a fluent builder pattern:
//!
//! ```
//! use zckpt::error::{Error, ErrorKind};
//!
//! let err = Error::new(ErrorKind::StorageUnavailable, "cannot create object directory")
//!     .with_operation("PartitionedWriter::open")
//!     .with_context("path", "/scratch/ckpt.bp");
//! assert_eq!(err.kind().exit_code(), 3);
//! ```

use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;

/// A specialized `Result` type for zckpt operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Categorizes the type of error that occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An unexpected/internal error that should not happen under normal conditions.
    Unexpected,
    /// A missing or malformed command-line argument.
    Usage,
    /// Invalid runtime configuration (environment variables, option values).
    ConfigInvalid,
    /// The accelerator could not satisfy an allocation.
    DeviceOutOfMemory,
    /// A host/device transfer failed or had mismatched sizes.
    TransferError,
    /// Any other accelerator failure (context creation, synchronize, kernel launch).
    DeviceError,
    /// The field has a dimensionality the codec cannot handle.
    UnsupportedDimensionality,
    /// The requested codec execution policy cannot run on this device.
    CodecExecutionUnavailable,
    /// The codec rejected its input (bad sizes, corrupt stream).
    CodecError,
    /// A storage object could not be created or opened.
    StorageUnavailable,
    /// The requested variable is absent from the storage object.
    VariableNotFound,
    /// A storage read or write failed.
    StorageError,
    /// Participants disagree on partition sizing, or a selection falls outside it.
    PartitionMismatch,
    /// This participant was fine but another one failed the same collective phase.
    PeerFailed,
}

/// Failure domain of an [`ErrorKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Usage,
    Device,
    Codec,
    Storage,
    Partition,
    Internal,
}

impl ErrorKind {
    /// Returns a static string label for this error kind.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Unexpected => "Unexpected",
            ErrorKind::Usage => "Usage",
            ErrorKind::ConfigInvalid => "ConfigInvalid",
            ErrorKind::DeviceOutOfMemory => "DeviceOutOfMemory",
            ErrorKind::TransferError => "TransferError",
            ErrorKind::DeviceError => "DeviceError",
            ErrorKind::UnsupportedDimensionality => "UnsupportedDimensionality",
            ErrorKind::CodecExecutionUnavailable => "CodecExecutionUnavailable",
            ErrorKind::CodecError => "CodecError",
            ErrorKind::StorageUnavailable => "StorageUnavailable",
            ErrorKind::VariableNotFound => "VariableNotFound",
            ErrorKind::StorageError => "StorageError",
            ErrorKind::PartitionMismatch => "PartitionMismatch",
            ErrorKind::PeerFailed => "PeerFailed",
        }
    }

    /// Returns the failure domain of this kind.
    pub fn category(self) -> ErrorCategory {
        match self {
            ErrorKind::Usage | ErrorKind::ConfigInvalid => ErrorCategory::Usage,
            ErrorKind::DeviceOutOfMemory | ErrorKind::TransferError | ErrorKind::DeviceError => {
                ErrorCategory::Device
            }
            ErrorKind::UnsupportedDimensionality
            | ErrorKind::CodecExecutionUnavailable
            | ErrorKind::CodecError => ErrorCategory::Codec,
            ErrorKind::StorageUnavailable
            | ErrorKind::VariableNotFound
            | ErrorKind::StorageError => ErrorCategory::Storage,
            ErrorKind::PartitionMismatch => ErrorCategory::Partition,
            ErrorKind::Unexpected | ErrorKind::PeerFailed => ErrorCategory::Internal,
        }
    }

    /// Process exit code for a run that ends with this kind.
    ///
    /// `2` usage, `3` storage (including partition mismatches), `4` device
    /// and codec, `1` anything unexpected.
    pub fn exit_code(self) -> i32 {
        match self.category() {
            ErrorCategory::Usage => 2,
            ErrorCategory::Storage | ErrorCategory::Partition => 3,
            ErrorCategory::Device | ErrorCategory::Codec => 4,
            ErrorCategory::Internal => 1,
        }
    }

    /// Whether to capture a backtrace for this error kind.
    ///
    /// Capturing a backtrace is expensive at runtime. We only capture it for
    /// kinds where the call site is likely to be surprising (e.g., `Unexpected`).
    fn enable_backtrace(&self) -> bool {
        matches!(self, ErrorKind::Unexpected)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The main error type for zckpt.
pub struct Error {
    kind: ErrorKind,
    message: String,
    operation: &'static str,
    context: Vec<(&'static str, String)>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
    backtrace: Option<Box<Backtrace>>,
}

impl Error {
    /// Create a new error with the given kind and message.
    ///
    /// For [`ErrorKind::Unexpected`], a backtrace is captured if `RUST_BACKTRACE`
    /// is enabled.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            operation: "",
            context: Vec::new(),
            source: None,
            backtrace: kind
                .enable_backtrace()
                .then(Backtrace::capture)
                .filter(|bt| bt.status() == BacktraceStatus::Captured)
                .map(Box::new),
        }
    }

    /// Returns the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the operation that caused this error.
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Returns the human-readable error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the error context as key-value pairs.
    pub fn context_iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.context.iter().map(|(k, v)| (*k, v.as_str()))
    }

    /// Set the operation that caused this error.
    ///
    /// If the error already has an operation, the previous one is pushed
    /// into context as `("called", previous_operation)`.
    pub fn with_operation(mut self, operation: &'static str) -> Self {
        if !self.operation.is_empty() {
            self.context.push(("called", self.operation.to_string()));
        }
        self.operation = operation;
        self
    }

    /// Add a key-value context pair.
    pub fn with_context(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.context.push((key, value.into()));
        self
    }

    /// Set the underlying source error.
    pub fn set_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Returns the captured backtrace, if any.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        self.backtrace.as_deref()
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            let mut d = f.debug_struct("Error");
            d.field("kind", &self.kind);
            d.field("message", &self.message);
            d.field("operation", &self.operation);
            d.field("context", &self.context);
            d.field("source", &self.source.as_ref().map(|s| s.to_string()));
            d.finish()
        } else {
            writeln!(f, "{} at {} => {}", self.kind, self.operation, self.message)?;
            if !self.context.is_empty() {
                writeln!(f)?;
                writeln!(f, "Context:")?;
                for (k, v) in &self.context {
                    writeln!(f, "   {k}: {v}")?;
                }
            }
            if let Some(source) = &self.source {
                writeln!(f)?;
                writeln!(f, "Source:")?;
                writeln!(f, "   {source}")?;
            }
            if let Some(backtrace) = &self.backtrace {
                writeln!(f)?;
                writeln!(f, "Backtrace:")?;
                writeln!(f, "{backtrace}")?;
            }
            Ok(())
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.kind, self.operation)?;
        if !self.context.is_empty() {
            write!(f, ", context: {{ ")?;
            for (i, (k, v)) in self.context.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{k}: {v}")?;
            }
            write!(f, " }}")?;
        }
        write!(f, " => {}", self.message)?;
        if let Some(source) = &self.source {
            write!(f, ", source: {source}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl From<cudarc::driver::DriverError> for Error {
    fn from(err: cudarc::driver::DriverError) -> Self {
        let kind = if err.0 == cudarc::driver::sys::CUresult::CUDA_ERROR_OUT_OF_MEMORY {
            ErrorKind::DeviceOutOfMemory
        } else {
            ErrorKind::DeviceError
        };
        Error::new(kind, format!("CUDA driver call failed: {err}")).set_source(err)
    }
}
