//! The rate sweep: one baseline pass, then one compressed pass per rate.
//!
//! Every pass runs the same phases in a fixed order:
//!
//! 1. stage the array onto the device,
//! 2. compress it (compressed passes only),
//! 3. write this participant's partition to the pass's storage object,
//! 4. read the same partition back,
//! 5. decompress the bytes the read returned (compressed passes only),
//! 6. record a [`PassResult`].
//!
//! Each timed phase starts at a barrier and its duration is reduced to the
//! slowest participant's at the root.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::aggregator::{self, Aggregator};
use crate::array::{self, Array};
use crate::codec::{CodecSession, ExecutionPolicy};
use crate::config::Config;
use crate::device::{BufferRole, DeviceBuffer, DeviceManager};
use crate::error::{Error, ErrorKind, Result};
use crate::staging::StagingMode;
use crate::storage::{
    ObjectNaming, PartitionedReader, PartitionedWriter, Payload, variable_name,
};
use crate::timer::Timer;

/// Rates swept when none are given.
pub const DEFAULT_RATES: [f64; 4] = [1.0, 2.0, 11.0, 21.0];

/// What the sweep does after a pass fails.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop the sweep and report the passes that completed.
    #[default]
    Abort,
    /// Record the failure for that pass and run the next one.
    SkipAndContinue,
}

impl FailurePolicy {
    /// Parse from a string (case-insensitive): `abort` or `skip`.
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "abort" => Ok(FailurePolicy::Abort),
            "skip" | "skip-and-continue" | "continue" => Ok(FailurePolicy::SkipAndContinue),
            _ => Err(Error::new(
                ErrorKind::ConfigInvalid,
                format!("invalid failure policy: {s:?} (expected abort or skip)"),
            )
            .with_operation("FailurePolicy::parse")),
        }
    }
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailurePolicy::Abort => f.write_str("abort"),
            FailurePolicy::SkipAndContinue => f.write_str("skip"),
        }
    }
}

/// Inputs of one sweep.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Base path of the storage objects.
    pub object: PathBuf,
    /// Fixed rates (bits per value) of the compressed passes, in order.
    pub rates: Vec<f64>,
    pub naming: ObjectNaming,
    pub failure_policy: FailurePolicy,
    pub exec_policy: ExecutionPolicy,
    pub staging: StagingMode,
    /// Sleep before the write and before the read phase.
    pub compute_delay: Duration,
    /// Where compressed passes write their reconstruction, suffixed with the
    /// pass label.
    pub output: Option<PathBuf>,
    /// Compute the max absolute error of each reconstruction.
    pub verify: bool,
    /// Step index of the written variable.
    pub step: u64,
}

impl SweepConfig {
    /// A sweep over [`DEFAULT_RATES`] with the given runtime configuration.
    pub fn new(object: impl Into<PathBuf>, config: &Config) -> Self {
        Self {
            object: object.into(),
            rates: DEFAULT_RATES.to_vec(),
            naming: config.object_naming,
            failure_policy: config.failure_policy,
            exec_policy: config.exec_policy,
            staging: config.staging,
            compute_delay: Duration::ZERO,
            output: None,
            verify: false,
            step: 0,
        }
    }
}

/// One configuration of the sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PassKind {
    /// Raw bytes, no codec.
    Baseline,
    /// Compressed at a fixed rate.
    Rate(f64),
}

impl PassKind {
    /// Label used in object names and reports: `baseline`, `rate2`, `rate0.5`.
    pub fn label(&self) -> String {
        match self {
            PassKind::Baseline => "baseline".to_string(),
            PassKind::Rate(rate) => format!("rate{rate}"),
        }
    }

    pub fn rate(&self) -> Option<f64> {
        match self {
            PassKind::Baseline => None,
            PassKind::Rate(rate) => Some(*rate),
        }
    }
}

/// Timings and sizes of one pass.
///
/// Times are seconds, the slowest participant's at the root and this
/// participant's own elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PassResult {
    pub label: String,
    pub rate: Option<f64>,
    pub write: f64,
    pub read: f64,
    pub comp: f64,
    pub decomp: f64,
    /// Compression plus write.
    pub total_write: f64,
    /// Read plus decompression.
    pub total_read: f64,
    /// Bytes of this participant's array.
    pub raw_bytes: u64,
    /// Bytes this participant stored.
    pub stored_bytes: u64,
    /// `raw_bytes / stored_bytes`.
    pub ratio: f64,
    /// Elements recovered by the read (and decompression).
    pub elements: u64,
    pub max_abs_error: Option<f64>,
    /// `raw_bytes` in GB.
    pub data_per_rank_gb: f64,
    /// Throughputs in GB/s over all participants. Compression and
    /// decompression count raw bytes, write and read count stored bytes.
    pub comp_gbps: f64,
    pub write_gbps: f64,
    pub read_gbps: f64,
    pub decomp_gbps: f64,
    /// Set when the pass failed and the sweep continued.
    pub failure: Option<String>,
}

impl PassResult {
    fn failed(kind: PassKind, err: &Error) -> Self {
        Self {
            label: kind.label(),
            rate: kind.rate(),
            write: 0.0,
            read: 0.0,
            comp: 0.0,
            decomp: 0.0,
            total_write: 0.0,
            total_read: 0.0,
            raw_bytes: 0,
            stored_bytes: 0,
            ratio: 0.0,
            elements: 0,
            max_abs_error: None,
            data_per_rank_gb: 0.0,
            comp_gbps: 0.0,
            write_gbps: 0.0,
            read_gbps: 0.0,
            decomp_gbps: 0.0,
            failure: Some(err.to_string()),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.failure.is_some()
    }
}

/// Outcome of a whole sweep.
#[derive(Debug, Serialize)]
pub struct SweepReport {
    pub participants: usize,
    pub passes: Vec<PassResult>,
    /// The error that stopped an aborted sweep.
    #[serde(serialize_with = "serialize_error")]
    pub aborted: Option<Error>,
}

fn serialize_error<S: serde::Serializer>(
    err: &Option<Error>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match err {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

impl SweepReport {
    pub fn baseline(&self) -> Option<&PassResult> {
        self.passes.iter().find(|p| p.rate.is_none())
    }

    /// Compressed passes in sweep order.
    pub fn compressed(&self) -> impl Iterator<Item = &PassResult> {
        self.passes.iter().filter(|p| p.rate.is_some())
    }

    /// Print the series, baseline separately from the compressed passes.
    pub fn print(&self, out: &mut impl Write) -> std::io::Result<()> {
        writeln!(out, "# participants: {}", self.participants)?;
        if let Some(pass) = self.passes.iter().find(|p| !p.is_failure()) {
            writeln!(out, "# data per rank: {} GB", pass.data_per_rank_gb)?;
        }
        writeln!(out, "# no compression")?;
        if let Some(base) = self.baseline() {
            print_series(out, "write", [base], |p| p.write)?;
            print_series(out, "read", [base], |p| p.read)?;
            print_series(out, "write_gbps", [base], |p| p.write_gbps)?;
            print_series(out, "read_gbps", [base], |p| p.read_gbps)?;
            print_failures(out, [base])?;
        }

        let labels: Vec<_> = self.compressed().map(|p| p.label.as_str()).collect();
        writeln!(out, "# with compression: {}", labels.join(" "))?;
        print_series(out, "comp", self.compressed(), |p| p.comp)?;
        print_series(out, "decomp", self.compressed(), |p| p.decomp)?;
        print_series(out, "write", self.compressed(), |p| p.write)?;
        print_series(out, "read", self.compressed(), |p| p.read)?;
        print_series(out, "total_write", self.compressed(), |p| p.total_write)?;
        print_series(out, "total_read", self.compressed(), |p| p.total_read)?;
        print_series(out, "ratio", self.compressed(), |p| p.ratio)?;
        print_series(out, "comp_gbps", self.compressed(), |p| p.comp_gbps)?;
        print_series(out, "write_gbps", self.compressed(), |p| p.write_gbps)?;
        print_series(out, "read_gbps", self.compressed(), |p| p.read_gbps)?;
        print_series(out, "decomp_gbps", self.compressed(), |p| p.decomp_gbps)?;
        if self.compressed().any(|p| p.max_abs_error.is_some()) {
            print_series(out, "max_abs_error", self.compressed(), |p| {
                p.max_abs_error.unwrap_or(f64::NAN)
            })?;
        }
        print_failures(out, self.compressed())?;

        if let Some(err) = &self.aborted {
            writeln!(out, "# aborted: {err}")?;
        }
        Ok(())
    }

    /// Write the report as JSON.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self).map_err(|e| {
            Error::new(ErrorKind::Unexpected, "failed to encode report")
                .with_operation("SweepReport::write_json")
                .set_source(e)
        })?;
        std::fs::write(path, text).map_err(|e| {
            Error::new(ErrorKind::StorageError, format!("failed to write report: {e}"))
                .with_operation("SweepReport::write_json")
                .with_context("path", path.display().to_string())
                .set_source(e)
        })
    }
}

fn print_series<'a>(
    out: &mut impl Write,
    name: &str,
    passes: impl IntoIterator<Item = &'a PassResult>,
    metric: impl Fn(&PassResult) -> f64,
) -> std::io::Result<()> {
    write!(out, "{name}:")?;
    for pass in passes {
        if pass.is_failure() {
            write!(out, " -")?;
        } else {
            write!(out, " {}", metric(pass))?;
        }
    }
    writeln!(out)
}

fn print_failures<'a>(
    out: &mut impl Write,
    passes: impl IntoIterator<Item = &'a PassResult>,
) -> std::io::Result<()> {
    for pass in passes {
        if let Some(failure) = &pass.failure {
            writeln!(out, "# {} failed: {failure}", pass.label)?;
        }
    }
    Ok(())
}

/// Device buffers of one pass, one owner per role.
///
/// Whatever a pass allocated is released when this is dropped, on success
/// and on every error path.
#[derive(Debug)]
struct PassBuffers {
    original: DeviceBuffer,
    compressed: DeviceBuffer,
    staged: DeviceBuffer,
    decompressed: DeviceBuffer,
}

impl PassBuffers {
    fn new() -> Self {
        Self {
            original: DeviceBuffer::empty(BufferRole::Original),
            compressed: DeviceBuffer::empty(BufferRole::Compressed),
            staged: DeviceBuffer::empty(BufferRole::Staged),
            decompressed: DeviceBuffer::empty(BufferRole::Decompressed),
        }
    }
}

/// The bytes a pass recovered: read straight back, or decompressed on the
/// device.
#[derive(Debug, Clone, Copy)]
enum Reconstruction<'a> {
    Host(&'a [u8]),
    Device(&'a DeviceBuffer),
}

/// Aggregate throughput in GB/s of `participants` each moving `bytes` in
/// the slowest participant's `secs`. Zero for a phase that did not run.
fn throughput_gbps(bytes: usize, participants: usize, secs: f64) -> f64 {
    if secs > 0.0 {
        bytes as f64 * participants as f64 / secs / 1e9
    } else {
        0.0
    }
}

/// Sweep progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepState {
    Init,
    RunBaseline,
    RunRate(usize),
    Report,
    Done,
}

/// Runs the passes of a sweep on one participant.
pub struct Sweep<'a> {
    config: SweepConfig,
    aggregator: &'a dyn Aggregator,
    device: &'a DeviceManager,
    array: &'a Array,
}

impl<'a> Sweep<'a> {
    pub fn new(
        config: SweepConfig,
        aggregator: &'a dyn Aggregator,
        device: &'a DeviceManager,
        array: &'a Array,
    ) -> Self {
        Self {
            config,
            aggregator,
            device,
            array,
        }
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    fn next_state(&self, state: SweepState) -> SweepState {
        match state {
            SweepState::Init => SweepState::RunBaseline,
            SweepState::RunBaseline | SweepState::RunRate(_) => {
                let next = match state {
                    SweepState::RunRate(i) => i + 1,
                    _ => 0,
                };
                if next < self.config.rates.len() {
                    SweepState::RunRate(next)
                } else {
                    SweepState::Report
                }
            }
            SweepState::Report | SweepState::Done => SweepState::Done,
        }
    }

    /// Run every pass and collect the report.
    pub fn run(&self) -> SweepReport {
        let mut report = SweepReport {
            participants: self.aggregator.participants(),
            passes: Vec::with_capacity(self.config.rates.len() + 1),
            aborted: None,
        };

        let mut state = SweepState::Init;
        while state != SweepState::Done {
            let kind = match state {
                SweepState::RunBaseline => Some(PassKind::Baseline),
                SweepState::RunRate(i) => Some(PassKind::Rate(self.config.rates[i])),
                _ => None,
            };

            if let Some(kind) = kind {
                match self.run_pass(kind) {
                    Ok(result) => report.passes.push(result),
                    Err(err) => {
                        tracing::warn!(
                            pass = %kind.label(),
                            rank = self.aggregator.rank(),
                            error = %err,
                            "pass failed"
                        );
                        match self.config.failure_policy {
                            FailurePolicy::SkipAndContinue => {
                                report.passes.push(PassResult::failed(kind, &err));
                            }
                            FailurePolicy::Abort => {
                                report.aborted = Some(err);
                                state = SweepState::Report;
                                continue;
                            }
                        }
                    }
                }
            }
            state = self.next_state(state);
        }
        report
    }

    /// Run one pass.
    ///
    /// Collective: every fallible step is agreed across participants, so a
    /// step that fails on one participant fails the pass on all of them.
    pub fn run_pass(&self, kind: PassKind) -> Result<PassResult> {
        let label = kind.label();
        let span = tracing::info_span!("pass", pass = %label, rank = self.aggregator.rank());
        let _enter = span.enter();

        let device = self.device;
        let array = self.array;
        let raw_len = array.byte_len();
        let name = variable_name(self.config.step);
        let object = self.config.naming.object_path(&self.config.object, &label);
        let mut timer = Timer::new();
        let mut buffers = PassBuffers::new();

        // Configure first: an unsupported field fails before any allocation.
        let session = match kind {
            PassKind::Baseline => None,
            PassKind::Rate(rate) => Some(self.agree(
                CodecSession::configure(
                    device,
                    array.shape(),
                    array.scalar(),
                    rate,
                    self.config.exec_policy,
                ),
                "Sweep::configure",
            )?),
        };

        // ---- stage ----
        let staged = device
            .allocate(BufferRole::Original, raw_len)
            .and_then(|mut buffer| {
                device.copy_to_device(array.as_bytes(), &mut buffer)?;
                Ok(buffer)
            });
        buffers.original = self.agree(staged, "Sweep::stage")?;

        // ---- compress ----
        let mut comp = 0.0;
        let stored_len = match &session {
            Some(session) => {
                buffers.compressed = self.agree(
                    device.allocate(BufferRole::Compressed, session.maximum_compressed_size()),
                    "Sweep::compress",
                )?;
                let (len, secs) = self.timed(&mut timer, || {
                    let len = session.compress_on_device(&buffers.original, &mut buffers.compressed)?;
                    device.synchronize()?;
                    Ok(len)
                })?;
                comp = secs;
                len
            }
            None => raw_len,
        };
        tracing::debug!(raw = raw_len, stored = stored_len, "staged pass payload");

        // ---- write ----
        self.compute_delay();
        let payload = match session {
            Some(_) => Payload::Device {
                device,
                buffer: &buffers.compressed,
                len: stored_len,
            },
            None => Payload::Host(array.as_bytes()),
        };
        let (descriptor, write) = self.timed(&mut timer, || {
            let mut writer =
                PartitionedWriter::open_for_write(&object, self.aggregator, self.staging())?;
            writer.set_step(self.config.step);
            let descriptor = writer.declare_partition(&name, stored_len as u64)?;
            writer.write_sync(payload)?;
            Ok(descriptor)
        })?;

        // ---- read ----
        self.compute_delay();
        let selection = descriptor.selection();
        let mut read_back = Vec::new();
        if session.is_some() {
            buffers.staged = self.agree(
                device.allocate(BufferRole::Staged, stored_len),
                "Sweep::read",
            )?;
        }
        let ((), read) = self.timed(&mut timer, || {
            let reader = PartitionedReader::open_for_read(&object, self.staging())?;
            if session.is_some() {
                reader.read_sync_into(&name, selection, device, &mut buffers.staged)?;
            } else {
                read_back = reader.read_sync(&name, selection)?;
            }
            Ok(())
        })?;

        // ---- decompress ----
        let mut decomp = 0.0;
        let reconstruction = match session {
            Some(session) => {
                buffers.decompressed = self.agree(
                    device.allocate(BufferRole::Decompressed, raw_len),
                    "Sweep::decompress",
                )?;
                let ((), secs) = self.timed(&mut timer, || {
                    session.decompress_on_device(
                        &buffers.staged,
                        &mut buffers.decompressed,
                        stored_len,
                    )?;
                    device.synchronize()
                })?;
                decomp = secs;
                session.close();
                Reconstruction::Device(&buffers.decompressed)
            }
            None => Reconstruction::Host(&read_back),
        };

        // ---- verify ----
        let checked = self.check(&label, reconstruction);
        let (elements, max_abs_error) = self.agree(checked, "Sweep::verify")?;

        // ---- record ----
        let participants = self.aggregator.participants();
        let result = PassResult {
            label,
            rate: kind.rate(),
            write,
            read,
            comp,
            decomp,
            total_write: comp + write,
            total_read: read + decomp,
            raw_bytes: raw_len as u64,
            stored_bytes: stored_len as u64,
            ratio: raw_len as f64 / stored_len as f64,
            elements: elements as u64,
            max_abs_error,
            data_per_rank_gb: raw_len as f64 / 1e9,
            comp_gbps: throughput_gbps(raw_len, participants, comp),
            write_gbps: throughput_gbps(stored_len, participants, write),
            read_gbps: throughput_gbps(stored_len, participants, read),
            decomp_gbps: throughput_gbps(raw_len, participants, decomp),
            failure: None,
        };
        tracing::info!(
            write = result.write,
            read = result.read,
            comp = result.comp,
            decomp = result.decomp,
            ratio = result.ratio,
            "pass complete"
        );
        Ok(result)
    }

    /// Count the recovered elements, and verify or write the reconstruction
    /// when asked to.
    fn check(
        &self,
        label: &str,
        reconstruction: Reconstruction<'_>,
    ) -> Result<(usize, Option<f64>)> {
        let array = self.array;
        let wanted = self.config.verify || self.config.output.is_some();
        let host = match reconstruction {
            Reconstruction::Host(bytes) => std::borrow::Cow::Borrowed(bytes),
            Reconstruction::Device(buffer) if wanted => {
                let mut host = vec![0u8; buffer.len()];
                self.device.copy_to_host(buffer, &mut host)?;
                std::borrow::Cow::Owned(host)
            }
            Reconstruction::Device(buffer) => {
                return Ok((buffer.len() / array.scalar().size(), None));
            }
        };

        let max_abs_error = if self.config.verify {
            Some(array.max_abs_error(&host)?)
        } else {
            None
        };
        if let (Some(output), Reconstruction::Device(_)) = (&self.config.output, reconstruction) {
            let path = ObjectNaming::FreshPerPass.object_path(output, label);
            array::write_output(
                &path,
                &host,
                self.aggregator.rank(),
                self.aggregator.participants(),
            )?;
        }
        Ok((host.len() / array.scalar().size(), max_abs_error))
    }

    fn agree<T>(&self, local: Result<T>, operation: &'static str) -> Result<T> {
        aggregator::agree(self.aggregator, local, ErrorKind::PeerFailed, operation)
    }

    /// Run `phase` between a barrier and a max-reduction of its duration.
    ///
    /// The phase outcome is agreed before the reduction, so a phase that
    /// fails anywhere fails on every participant.
    fn timed<T>(&self, timer: &mut Timer, phase: impl FnOnce() -> Result<T>) -> Result<(T, f64)> {
        self.aggregator.barrier();
        timer.start();
        let local = phase();
        timer.end();
        let value = self.agree(local, "Sweep::timed")?;
        let local = timer.get();
        let slowest = self.aggregator.reduce_max_to_root(local).unwrap_or(local);
        Ok((value, slowest))
    }

    fn compute_delay(&self) {
        if !self.config.compute_delay.is_zero() {
            std::thread::sleep(self.config.compute_delay);
        }
    }

    /// Emulated-device buffers are host memory and never go through cuFile.
    fn staging(&self) -> StagingMode {
        match self.device.backend() {
            crate::device::Backend::Host => StagingMode::Staged,
            crate::device::Backend::Cuda => crate::staging::resolve_staging_mode(self.config.staging),
        }
    }
}

impl std::fmt::Debug for Sweep<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sweep")
            .field("config", &self.config)
            .field("device", &self.device)
            .field("array", &self.array)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::Solo;

    fn smooth(n: usize) -> Vec<f64> {
        (0..n).map(|i| (i as f64 * 0.01).sin()).collect()
    }

    fn sweep_config(dir: &Path, rates: &[f64]) -> SweepConfig {
        SweepConfig {
            rates: rates.to_vec(),
            exec_policy: ExecutionPolicy::Serial,
            ..SweepConfig::new(dir.join("ckpt.bp"), &Config::default())
        }
    }

    // ---- parsing and labels ----

    #[test]
    fn test_failure_policy_parse() {
        assert_eq!(FailurePolicy::parse("abort").unwrap(), FailurePolicy::Abort);
        assert_eq!(FailurePolicy::parse("SKIP").unwrap(), FailurePolicy::SkipAndContinue);
        assert_eq!(
            FailurePolicy::parse("retry").unwrap_err().kind(),
            ErrorKind::ConfigInvalid
        );
        assert_eq!(FailurePolicy::default(), FailurePolicy::Abort);
    }

    #[test]
    fn test_pass_labels() {
        assert_eq!(PassKind::Baseline.label(), "baseline");
        assert_eq!(PassKind::Rate(2.0).label(), "rate2");
        assert_eq!(PassKind::Rate(0.5).label(), "rate0.5");
    }

    #[test]
    fn test_default_rates() {
        let cfg = SweepConfig::new("/tmp/x", &Config::default());
        assert_eq!(cfg.rates, vec![1.0, 2.0, 11.0, 21.0]);
        assert_eq!(cfg.step, 0);
    }

    #[test]
    fn test_state_machine_order() {
        let dir = tempfile::tempdir().unwrap();
        let device = DeviceManager::host(None);
        let array = Array::from_values(&[16], crate::codec::ScalarType::Double, &smooth(16)).unwrap();
        let sweep = Sweep::new(sweep_config(dir.path(), &[1.0, 2.0]), &Solo, &device, &array);

        let mut states = vec![SweepState::Init];
        while *states.last().unwrap() != SweepState::Done {
            states.push(sweep.next_state(*states.last().unwrap()));
        }
        assert_eq!(
            states,
            vec![
                SweepState::Init,
                SweepState::RunBaseline,
                SweepState::RunRate(0),
                SweepState::RunRate(1),
                SweepState::Report,
                SweepState::Done,
            ]
        );
    }

    // ---- passes ----

    #[test]
    fn test_baseline_pass_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let device = DeviceManager::host(None);
        let array =
            Array::from_values(&[1000], crate::codec::ScalarType::Double, &smooth(1000)).unwrap();
        let mut cfg = sweep_config(dir.path(), &[]);
        cfg.verify = true;
        let sweep = Sweep::new(cfg, &Solo, &device, &array);

        let result = sweep.run_pass(PassKind::Baseline).unwrap();
        assert_eq!(result.comp, 0.0);
        assert_eq!(result.decomp, 0.0);
        assert_eq!(result.stored_bytes, 8000);
        assert_eq!(result.elements, 1000);
        assert_eq!(result.max_abs_error, Some(0.0));
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn test_compressed_pass() {
        let dir = tempfile::tempdir().unwrap();
        let device = DeviceManager::host(None);
        let array =
            Array::from_values(&[64, 64], crate::codec::ScalarType::Float, &smooth(4096)).unwrap();
        let mut cfg = sweep_config(dir.path(), &[]);
        cfg.verify = true;
        let sweep = Sweep::new(cfg, &Solo, &device, &array);

        let result = sweep.run_pass(PassKind::Rate(8.0)).unwrap();
        assert!(result.stored_bytes < result.raw_bytes);
        assert_eq!(result.elements, 4096);
        assert!(result.ratio > 1.0);
        assert!(result.max_abs_error.unwrap() < 0.1);
        assert_eq!(device.live_buffers(), 0);
        assert!(dir.path().join("ckpt.bp.rate8").join("md.idx").exists());
    }

    #[test]
    fn test_output_written_per_pass() {
        let dir = tempfile::tempdir().unwrap();
        let device = DeviceManager::host(None);
        let array =
            Array::from_values(&[256], crate::codec::ScalarType::Double, &smooth(256)).unwrap();
        let mut cfg = sweep_config(dir.path(), &[]);
        cfg.output = Some(dir.path().join("out.dat"));
        let sweep = Sweep::new(cfg, &Solo, &device, &array);

        sweep.run_pass(PassKind::Rate(16.0)).unwrap();
        let out = std::fs::read(dir.path().join("out.dat.rate16")).unwrap();
        assert_eq!(out.len(), 256 * 8);
    }

    #[test]
    fn test_policy_mismatch_releases_pass_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let device = DeviceManager::host(None);
        let array = Array::from_values(&[64], crate::codec::ScalarType::Double, &smooth(64)).unwrap();
        let mut cfg = sweep_config(dir.path(), &[]);
        cfg.exec_policy = ExecutionPolicy::Cuda;
        let sweep = Sweep::new(cfg, &Solo, &device, &array);

        let err = sweep.run_pass(PassKind::Rate(4.0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CodecExecutionUnavailable);
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn test_throughput_arithmetic() {
        // 2 participants of 4 GB each in 2 s.
        assert_eq!(throughput_gbps(4_000_000_000, 2, 2.0), 4.0);
        assert_eq!(throughput_gbps(375_000, 4, 0.5), 0.003);
        assert_eq!(throughput_gbps(1024, 1, 0.0), 0.0);
    }

    #[test]
    fn test_pass_throughputs_follow_bytes_and_times() {
        let dir = tempfile::tempdir().unwrap();
        let device = DeviceManager::host(None);
        let array =
            Array::from_values(&[4096], crate::codec::ScalarType::Double, &smooth(4096)).unwrap();
        let sweep = Sweep::new(sweep_config(dir.path(), &[]), &Solo, &device, &array);

        let result = sweep.run_pass(PassKind::Rate(8.0)).unwrap();
        assert_eq!(result.raw_bytes, 32768);
        assert_eq!(result.stored_bytes, 4096);
        assert_eq!(result.data_per_rank_gb, 32768.0 / 1e9);
        assert_eq!(result.comp_gbps, 32768.0 / result.comp / 1e9);
        assert_eq!(result.decomp_gbps, 32768.0 / result.decomp / 1e9);
        assert_eq!(result.write_gbps, 4096.0 / result.write / 1e9);
        assert_eq!(result.read_gbps, 4096.0 / result.read / 1e9);

        let base = sweep.run_pass(PassKind::Baseline).unwrap();
        assert_eq!(base.comp_gbps, 0.0);
        assert_eq!(base.decomp_gbps, 0.0);
        assert_eq!(base.write_gbps, 32768.0 / base.write / 1e9);
    }

    // ---- report ----

    #[test]
    fn test_report_prints_both_series() {
        let dir = tempfile::tempdir().unwrap();
        let device = DeviceManager::host(None);
        let array = Array::from_values(&[128], crate::codec::ScalarType::Double, &smooth(128)).unwrap();
        let sweep = Sweep::new(sweep_config(dir.path(), &[2.0, 11.0]), &Solo, &device, &array);

        let report = sweep.run();
        assert!(report.aborted.is_none());
        assert_eq!(report.passes.len(), 3);

        let mut out = Vec::new();
        report.print(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("# no compression"));
        assert!(text.contains("# with compression: rate2 rate11"));
        assert!(text.contains("comp:"));
        assert!(text.contains("ratio:"));
        assert!(text.contains("# data per rank: 0.000001024 GB"));
        assert!(text.contains("comp_gbps:"));
        assert!(text.contains("decomp_gbps:"));
    }

    #[test]
    fn test_report_json() {
        let dir = tempfile::tempdir().unwrap();
        let device = DeviceManager::host(None);
        let array = Array::from_values(&[128], crate::codec::ScalarType::Double, &smooth(128)).unwrap();
        let sweep = Sweep::new(sweep_config(dir.path(), &[2.0]), &Solo, &device, &array);
        let report = sweep.run();

        let path = dir.path().join("report.json");
        report.write_json(&path).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["participants"], 1);
        assert_eq!(value["passes"][1]["label"], "rate2");
        let gb = value["passes"][1]["data_per_rank_gb"].as_f64().unwrap();
        assert!((gb - 1.024e-6).abs() < 1e-15);
        assert!(value["passes"][1]["write_gbps"].as_f64().unwrap() > 0.0);
        assert!(value["aborted"].is_null());
    }
}
