//! # zckpt
//!
//! Benchmark for lossy fixed-rate compression inserted into a partitioned
//! checkpoint write/read pipeline.
//!
//! For one baseline pass and one pass per fixed rate, every participant
//! stages its array onto the accelerator, compresses it, writes its
//! partition of a shared storage object, reads the partition back and
//! decompresses what it read. Each phase is timed between barriers and
//! reduced to the slowest participant.
//!
//! ## Architecture
//!
//! - [`device`]: device buffers with one owner per role, on CUDA
//!   ([`cudarc`]) or an emulated host-memory device.
//! - [`codec`]: fixed-rate block codec sessions, serial on the host or as
//!   NVRTC-compiled CUDA kernels.
//! - [`storage`]: step-indexed partitioned objects over positional POSIX I/O,
//!   with GPUDirect Storage (cuFile) for device buffers when available.
//! - [`aggregator`]: barrier and max-reduction across participants (single,
//!   threads, or MPI ranks with the `mpi` feature).
//! - [`sweep`]: the pass pipeline, the rate sweep and its report.
//!
//! ## Feature Flags
//!
//! - `mpi`: run participants as MPI ranks (requires an MPI installation).

pub mod aggregator;
pub mod array;
pub mod cli;
pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod staging;
pub mod storage;
pub mod sweep;
pub mod timer;

pub use aggregator::{Aggregator, LocalGroup, Solo};
pub use array::Array;
pub use codec::{CodecSession, ExecutionPolicy, ScalarType};
pub use config::Config;
pub use device::{BufferRole, DeviceBuffer, DeviceManager};
pub use error::{Error, ErrorKind, Result};
pub use staging::StagingMode;
pub use storage::{ObjectNaming, PartitionDescriptor, PartitionedReader, PartitionedWriter};
pub use sweep::{FailurePolicy, PassResult, Sweep, SweepConfig, SweepReport};
