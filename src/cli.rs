//! Command-line surface of the `zckpt` binary.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::codec::{ExecutionPolicy, ScalarType};
use crate::config::Config;
use crate::error::{Error, ErrorKind, Result};
use crate::staging::StagingMode;
use crate::storage::ObjectNaming;
use crate::sweep::{DEFAULT_RATES, FailurePolicy, SweepConfig};

/// Error-bound mode of `-m`. Recorded, the sweep runs in fixed-rate mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ErrorBoundMode {
    Abs,
    Rel,
}

#[derive(Debug, Parser)]
#[command(name = "zckpt")]
#[command(version, about = "Benchmark fixed-rate GPU compression in a partitioned checkpoint pipeline", long_about = None)]
pub struct Cli {
    /// Compress (informational: every run writes and reads back)
    #[arg(short = 'z')]
    pub compress: bool,

    /// Decompress (informational)
    #[arg(short = 'x')]
    pub decompress: bool,

    /// Uncompressed input file
    #[arg(short = 'i', value_name = "PATH")]
    pub input: PathBuf,

    /// Storage object path, shared by the baseline and compressed passes
    #[arg(short = 'c', value_name = "PATH")]
    pub object: PathBuf,

    /// Write each pass's decompressed array to PATH.<pass>
    #[arg(short = 'o', value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Element precision: s (single) or d (double)
    #[arg(short = 't', value_name = "s|d", value_parser = ScalarType::parse)]
    pub precision: ScalarType,

    /// Dimensionality followed by the extents, slowest first
    #[arg(short = 'n', value_name = "D DIM", num_args = 2.., required = true)]
    pub dims: Vec<usize>,

    /// Error-bound mode
    #[arg(short = 'm', value_enum, default_value = "abs")]
    pub mode: ErrorBoundMode,

    /// Error tolerance
    #[arg(short = 'e', value_name = "ERROR")]
    pub tolerance: f64,

    /// Run a single fixed rate (bits per value) instead of the default sweep
    #[arg(short = 'r', value_name = "RATE", conflicts_with = "rates")]
    pub rate: Option<f64>,

    /// Comma-separated fixed rates to sweep
    #[arg(long, value_name = "R1,R2,..", value_delimiter = ',')]
    pub rates: Option<Vec<f64>>,

    /// Simulated compute time slept before each storage phase, in seconds
    #[arg(short = 'k', value_name = "SECONDS", default_value_t = 0.0, allow_negative_numbers = true)]
    pub compute_delay: f64,

    /// Storage object per pass (fresh) or one rewritten object (overwrite)
    #[arg(long, value_name = "fresh|overwrite", value_parser = ObjectNaming::parse)]
    pub object_naming: Option<ObjectNaming>,

    /// Sweep behavior after a failed pass
    #[arg(long = "on-failure", value_name = "abort|skip", value_parser = FailurePolicy::parse)]
    pub failure_policy: Option<FailurePolicy>,

    /// Codec execution: serial (emulated device) or cuda
    #[arg(long, value_name = "serial|cuda", value_parser = ExecutionPolicy::parse)]
    pub exec: Option<ExecutionPolicy>,

    /// How device bytes reach storage
    #[arg(long, value_name = "direct|staged|auto", value_parser = StagingMode::parse)]
    pub staging: Option<StagingMode>,

    /// CUDA device ordinal
    #[arg(long, value_name = "ORDINAL")]
    pub device: Option<usize>,

    /// Also write the report as JSON
    #[arg(long, value_name = "PATH")]
    pub report: Option<PathBuf>,

    /// Run this many participants as threads of one process
    #[arg(long, value_name = "P", default_value_t = 1)]
    pub local_participants: usize,

    /// Compute the max absolute error of every reconstruction
    #[arg(long)]
    pub verify: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

fn usage(msg: impl Into<String>) -> Error {
    Error::new(ErrorKind::Usage, msg).with_operation("Cli")
}

impl Cli {
    /// Array shape from `-n D dim1..dimD`.
    pub fn shape(&self) -> Result<Vec<usize>> {
        let (&d, extents) = self
            .dims
            .split_first()
            .ok_or_else(|| usage("-n needs the dimensionality and its extents"))?;
        if d == 0 || extents.len() != d {
            return Err(usage(format!(
                "-n {d} expects {d} extents, got {}",
                extents.len()
            )));
        }
        if extents.contains(&0) {
            return Err(usage("array extents must be positive"));
        }
        Ok(extents.to_vec())
    }

    /// Rates of the compressed passes: `-r`, else `--rates`, else the default list.
    pub fn sweep_rates(&self) -> Result<Vec<f64>> {
        let rates = match (&self.rate, &self.rates) {
            (Some(rate), _) => vec![*rate],
            (None, Some(rates)) => rates.clone(),
            (None, None) => DEFAULT_RATES.to_vec(),
        };
        if let Some(bad) = rates.iter().find(|r| !r.is_finite() || **r <= 0.0) {
            return Err(usage(format!("rate must be a positive number, got {bad}")));
        }
        Ok(rates)
    }

    /// Apply the options that override the runtime configuration.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(exec) = self.exec {
            config.exec_policy = exec;
        }
        if let Some(staging) = self.staging {
            config.staging = staging;
        }
        if let Some(device) = self.device {
            config.device_ordinal = device;
        }
        if let Some(naming) = self.object_naming {
            config.object_naming = naming;
        }
        if let Some(policy) = self.failure_policy {
            config.failure_policy = policy;
        }
    }

    /// The sweep this command line describes under `config`.
    pub fn sweep_config(&self, config: &Config) -> Result<SweepConfig> {
        if !self.compute_delay.is_finite() || self.compute_delay < 0.0 {
            return Err(usage("-k must be a non-negative number of seconds"));
        }
        if self.local_participants == 0 {
            return Err(usage("--local-participants must be at least 1"));
        }
        Ok(SweepConfig {
            rates: self.sweep_rates()?,
            compute_delay: Duration::from_secs_f64(self.compute_delay),
            output: self.output.clone(),
            verify: self.verify,
            ..SweepConfig::new(&self.object, config)
        })
    }
}
