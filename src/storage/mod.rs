//! Partitioned, step-indexed storage objects.
//!
//! An object is a directory:
//!
//! - `data.0` holds the concatenated partitions of every participant.
//! - `md.idx` is the JSON step index ([`index::ObjectIndex`]) naming each
//!   variable, its global shape and where every rank's block starts.
//!
//! Opening for write and writing are collective: every participant of the
//! [`Aggregator`] must call them in the same order. A failure on any
//! participant fails the call on all of them, so no participant is left
//! waiting at a barrier its peers will never reach.

pub mod file_handle;
pub mod index;
pub mod posix_io;

use std::path::{Path, PathBuf};

use crate::aggregator::{Aggregator, agree};
use crate::device::{DeviceBuffer, DeviceManager};
use crate::error::{Error, ErrorKind, Result};
use crate::staging::StagingMode;

pub use file_handle::FileHandle;
pub use index::{BlockIndex, ObjectIndex, VariableIndex};

const DATA_FILE: &str = "data.0";
const INDEX_FILE: &str = "md.idx";

/// Name of the variable written at `step`.
pub fn variable_name(step: u64) -> String {
    format!("var_step{step}")
}

/// Storage object naming across the passes of a sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ObjectNaming {
    /// Every pass writes its own object, `<path>.<pass label>`.
    #[default]
    FreshPerPass,
    /// Every pass truncates and rewrites the object at `<path>`.
    Overwrite,
}

impl ObjectNaming {
    /// Parse from a string (case-insensitive).
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "fresh" | "fresh-per-pass" | "per-pass" => Ok(ObjectNaming::FreshPerPass),
            "overwrite" => Ok(ObjectNaming::Overwrite),
            _ => Err(Error::new(
                ErrorKind::ConfigInvalid,
                format!("invalid object naming: {s:?} (expected fresh or overwrite)"),
            )
            .with_operation("ObjectNaming::parse")),
        }
    }

    /// Object path of the pass labelled `label`.
    pub fn object_path(self, base: &Path, label: &str) -> PathBuf {
        match self {
            ObjectNaming::Overwrite => base.to_path_buf(),
            ObjectNaming::FreshPerPass => match base.file_name() {
                Some(name) => {
                    let mut name = name.to_os_string();
                    name.push(".");
                    name.push(label);
                    base.with_file_name(name)
                }
                None => base.join(label),
            },
        }
    }
}

impl std::fmt::Display for ObjectNaming {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectNaming::FreshPerPass => f.write_str("fresh"),
            ObjectNaming::Overwrite => f.write_str("overwrite"),
        }
    }
}

/// Byte range of one participant's partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub offset: u64,
    pub len: u64,
}

impl Selection {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// One participant's slice of a variable sharded uniformly across all
/// participants: `global = local * participants`, `offset = local * rank`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionDescriptor {
    pub global: u64,
    pub offset: u64,
    pub local: u64,
}

impl PartitionDescriptor {
    pub fn new(local: u64, participants: usize, rank: usize) -> Result<Self> {
        if rank >= participants {
            return Err(Error::new(
                ErrorKind::PartitionMismatch,
                format!("rank {rank} outside {participants} participants"),
            )
            .with_operation("PartitionDescriptor::new"));
        }
        let overflow = || {
            Error::new(ErrorKind::PartitionMismatch, "partition size overflows u64")
                .with_operation("PartitionDescriptor::new")
                .with_context("local", local.to_string())
                .with_context("participants", participants.to_string())
        };
        let global = local.checked_mul(participants as u64).ok_or_else(overflow)?;
        let offset = local.checked_mul(rank as u64).ok_or_else(overflow)?;
        Ok(Self {
            global,
            offset,
            local,
        })
    }

    pub fn selection(&self) -> Selection {
        Selection {
            offset: self.offset,
            len: self.local,
        }
    }

    /// Whether `selection` lies inside the global extent.
    pub fn contains(&self, selection: &Selection) -> bool {
        selection
            .offset
            .checked_add(selection.len)
            .is_some_and(|end| end <= self.global)
    }
}

/// Bytes handed to [`PartitionedWriter::write_sync`].
pub enum Payload<'a> {
    Host(&'a [u8]),
    /// The first `len` bytes of a device buffer.
    Device {
        device: &'a DeviceManager,
        buffer: &'a DeviceBuffer,
        len: usize,
    },
}

impl Payload<'_> {
    pub fn len(&self) -> usize {
        match self {
            Payload::Host(bytes) => bytes.len(),
            Payload::Device { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn unavailable(object: &Path, msg: String, source: std::io::Error) -> Error {
    Error::new(ErrorKind::StorageUnavailable, msg)
        .with_context("object", object.display().to_string())
        .set_source(source)
}

/// Write side of one pass's storage object.
pub struct PartitionedWriter<'a> {
    object: PathBuf,
    aggregator: &'a dyn Aggregator,
    file: FileHandle,
    step: u64,
    declared: Option<(String, PartitionDescriptor)>,
}

impl<'a> PartitionedWriter<'a> {
    /// Open `object` for writing, discarding previous contents. Collective.
    pub fn open_for_write(
        object: &Path,
        aggregator: &'a dyn Aggregator,
        staging: StagingMode,
    ) -> Result<Self> {
        let prepared = if aggregator.is_root() {
            prepare_object(object)
        } else {
            Ok(())
        };
        agree(
            aggregator,
            prepared,
            ErrorKind::StorageError,
            "PartitionedWriter::open_for_write",
        )?;

        let file = FileHandle::open(&object.join(DATA_FILE), "r+", 0o644, staging)
            .map_err(|e| e.with_operation("PartitionedWriter::open_for_write"));
        let file = agree(
            aggregator,
            file,
            ErrorKind::StorageError,
            "PartitionedWriter::open_for_write",
        )?;

        tracing::debug!(
            object = %object.display(),
            rank = aggregator.rank(),
            staging = %file.staging(),
            "opened object for write"
        );
        Ok(Self {
            object: object.to_path_buf(),
            aggregator,
            file,
            step: 0,
            declared: None,
        })
    }

    pub fn object(&self) -> &Path {
        &self.object
    }

    /// Effective staging of device payloads for this object.
    pub fn staging(&self) -> StagingMode {
        self.file.staging()
    }

    /// Set the step the next write lands in.
    pub fn set_step(&mut self, step: u64) {
        self.step = step;
    }

    /// Declare variable `name` with `local_len` bytes per participant.
    /// Every participant must pass the same length. Collective.
    pub fn declare_partition(&mut self, name: &str, local_len: u64) -> Result<PartitionDescriptor> {
        if !self.aggregator.all_equal(local_len) {
            return Err(Error::new(
                ErrorKind::PartitionMismatch,
                "participants declared different partition lengths",
            )
            .with_operation("PartitionedWriter::declare_partition")
            .with_context("variable", name)
            .with_context("rank", self.aggregator.rank().to_string())
            .with_context("local", local_len.to_string()));
        }
        let descriptor = PartitionDescriptor::new(
            local_len,
            self.aggregator.participants(),
            self.aggregator.rank(),
        )
        .map_err(|e| e.with_context("variable", name))?;
        self.declared = Some((name.to_string(), descriptor));
        Ok(descriptor)
    }

    /// Begin step, put this participant's partition, end step, close.
    /// Collective.
    pub fn write_sync(self, payload: Payload<'_>) -> Result<()> {
        let put = self.put(&payload);
        agree(
            self.aggregator,
            put,
            ErrorKind::StorageError,
            "PartitionedWriter::write_sync",
        )?;

        let published = if self.aggregator.is_root() {
            self.publish_index()
        } else {
            Ok(())
        };
        agree(
            self.aggregator,
            published,
            ErrorKind::StorageError,
            "PartitionedWriter::write_sync",
        )?;
        // Dropping closes the data file.
        Ok(())
    }

    fn put(&self, payload: &Payload<'_>) -> Result<()> {
        let (name, descriptor) = self.declared.as_ref().ok_or_else(|| {
            Error::new(ErrorKind::StorageError, "write without a declared partition")
                .with_operation("PartitionedWriter::write_sync")
                .with_context("object", self.object.display().to_string())
        })?;
        if payload.len() as u64 != descriptor.local {
            return Err(Error::new(
                ErrorKind::PartitionMismatch,
                format!(
                    "payload of {} bytes for a {} byte partition",
                    payload.len(),
                    descriptor.local
                ),
            )
            .with_operation("PartitionedWriter::write_sync")
            .with_context("variable", name.as_str()));
        }

        let written = match payload {
            Payload::Host(bytes) => self.file.pwrite_host(bytes, descriptor.offset, 0),
            Payload::Device {
                device,
                buffer,
                len,
            } => self.file.write_device(device, buffer, *len, descriptor.offset),
        }
        .map_err(|e| {
            e.with_operation("PartitionedWriter::write_sync")
                .with_context("variable", name.as_str())
        })?;
        tracing::trace!(variable = %name, bytes = written, offset = descriptor.offset, "put partition");
        Ok(())
    }

    fn publish_index(&self) -> Result<()> {
        let (name, descriptor) = self.declared.as_ref().ok_or_else(|| {
            Error::new(ErrorKind::Unexpected, "publishing an undeclared variable")
                .with_operation("PartitionedWriter::publish_index")
        })?;
        let blocks = (0..self.aggregator.participants())
            .map(|rank| BlockIndex {
                rank,
                start: descriptor.local * rank as u64,
                count: descriptor.local,
            })
            .collect();
        let mut index = ObjectIndex::new();
        index.insert(
            self.step,
            VariableIndex {
                name: name.clone(),
                dtype: "uint8".to_string(),
                shape: vec![descriptor.global],
                blocks,
            },
        );
        index
            .store(&self.object.join(INDEX_FILE))
            .map_err(|e| e.with_operation("PartitionedWriter::publish_index"))
    }
}

impl std::fmt::Debug for PartitionedWriter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionedWriter")
            .field("object", &self.object)
            .field("step", &self.step)
            .field("declared", &self.declared)
            .finish()
    }
}

/// Create the object directory, drop any previous index, truncate the data.
fn prepare_object(object: &Path) -> Result<()> {
    std::fs::create_dir_all(object).map_err(|e| {
        unavailable(object, format!("cannot create object directory: {e}"), e)
            .with_operation("PartitionedWriter::open_for_write")
    })?;
    match std::fs::remove_file(object.join(INDEX_FILE)) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(
                unavailable(object, format!("cannot remove previous index: {e}"), e)
                    .with_operation("PartitionedWriter::open_for_write"),
            );
        }
    }
    FileHandle::open(&object.join(DATA_FILE), "w", 0o644, StagingMode::Staged)
        .map(drop)
        .map_err(|e| e.with_operation("PartitionedWriter::open_for_write"))
}

/// Read side of one pass's storage object.
pub struct PartitionedReader {
    object: PathBuf,
    /// `None` when the object has no data file; reads then fail with
    /// [`ErrorKind::VariableNotFound`].
    file: Option<FileHandle>,
}

impl PartitionedReader {
    /// Open `object` for reading.
    ///
    /// A missing object is not an error here; it is reported by the read.
    /// A path that exists but is not a readable object is
    /// [`ErrorKind::StorageUnavailable`].
    pub fn open_for_read(object: &Path, staging: StagingMode) -> Result<Self> {
        let file = match std::fs::metadata(object) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(unavailable(object, format!("cannot stat object: {e}"), e)
                    .with_operation("PartitionedReader::open_for_read"));
            }
            Ok(meta) if !meta.is_dir() => {
                return Err(Error::new(
                    ErrorKind::StorageUnavailable,
                    "object path is not a directory",
                )
                .with_operation("PartitionedReader::open_for_read")
                .with_context("object", object.display().to_string()));
            }
            Ok(_) => {
                let data = object.join(DATA_FILE);
                if data.exists() {
                    Some(
                        FileHandle::open(&data, "r", 0o644, staging)
                            .map_err(|e| e.with_operation("PartitionedReader::open_for_read"))?,
                    )
                } else {
                    None
                }
            }
        };
        Ok(Self {
            object: object.to_path_buf(),
            file,
        })
    }

    pub fn object(&self) -> &Path {
        &self.object
    }

    /// Look `name` up in the step index.
    pub fn variable(&self, name: &str) -> Result<VariableIndex> {
        let index = ObjectIndex::load(&self.object.join(INDEX_FILE))
            .map_err(|e| e.with_operation("PartitionedReader::variable"))?;
        index
            .find(name)
            .map(|(_, var)| var.clone())
            .ok_or_else(|| {
                Error::new(ErrorKind::VariableNotFound, format!("no variable {name:?}"))
                    .with_operation("PartitionedReader::variable")
                    .with_context("object", self.object.display().to_string())
            })
    }

    /// The block `rank` wrote for `name`.
    pub fn block_for_rank(&self, name: &str, rank: usize) -> Result<BlockIndex> {
        let var = self.variable(name)?;
        var.blocks
            .iter()
            .find(|b| b.rank == rank)
            .copied()
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::PartitionMismatch,
                    format!("variable {name:?} has no block for rank {rank}"),
                )
                .with_operation("PartitionedReader::block_for_rank")
            })
    }

    /// Read `selection` of `name` into host memory.
    pub fn read_sync(&self, name: &str, selection: Selection) -> Result<Vec<u8>> {
        let file = self.checked_file(name, &selection, "PartitionedReader::read_sync")?;
        let mut bytes = vec![0u8; selection.len as usize];
        file.pread_host(&mut bytes, selection.offset, 0)
            .map_err(|e| e.with_operation("PartitionedReader::read_sync"))?;
        Ok(bytes)
    }

    /// Read `selection` of `name` into the start of a device buffer.
    pub fn read_sync_into(
        &self,
        name: &str,
        selection: Selection,
        device: &DeviceManager,
        buffer: &mut DeviceBuffer,
    ) -> Result<usize> {
        let file = self.checked_file(name, &selection, "PartitionedReader::read_sync_into")?;
        file.read_device(device, buffer, selection.len as usize, selection.offset)
            .map_err(|e| e.with_operation("PartitionedReader::read_sync_into"))
    }

    fn checked_file(
        &self,
        name: &str,
        selection: &Selection,
        operation: &'static str,
    ) -> Result<&FileHandle> {
        let var = self.variable(name).map_err(|e| e.with_operation(operation))?;
        let global = var.shape.iter().product::<u64>();
        let inside = selection
            .offset
            .checked_add(selection.len)
            .is_some_and(|end| end <= global);
        if !inside {
            return Err(Error::new(
                ErrorKind::PartitionMismatch,
                format!(
                    "selection [{}, +{}) outside variable of {global} bytes",
                    selection.offset, selection.len
                ),
            )
            .with_operation(operation)
            .with_context("variable", name));
        }
        self.file.as_ref().ok_or_else(|| {
            Error::new(ErrorKind::VariableNotFound, "object has no data file")
                .with_operation(operation)
                .with_context("object", self.object.display().to_string())
        })
    }
}

impl std::fmt::Debug for PartitionedReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionedReader")
            .field("object", &self.object)
            .field("file", &self.file)
            .finish()
    }
}
