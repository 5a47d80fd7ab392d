//! Harness shared by the zckpt benchmarks.
//!
//! Phases are timed with the same [`Timer`] the sweep uses, and throughput is
//! reported in GB/s (1e9 bytes) like the sweep report.

// Each benchmark includes this file via `#[path]` and uses part of it.
#![allow(dead_code)]

use std::path::PathBuf;

use clap::Parser;

use zckpt::timer::Timer;

/// Options common to every benchmark.
#[derive(Debug, Parser)]
pub struct BenchArgs {
    /// Payload sizes, e.g. `4KiB,16MiB` (defaults depend on the benchmark).
    #[arg(long = "size", value_delimiter = ',', value_parser = parse_size)]
    pub sizes: Vec<usize>,
    /// Timed runs per configuration.
    #[arg(long, default_value_t = 5)]
    pub nruns: usize,
    /// Untimed runs before the timed ones.
    #[arg(long, default_value_t = 1)]
    pub warmup: usize,
    /// Fixed rates in bits per value.
    #[arg(long, value_delimiter = ',', default_values_t = [1.0, 2.0, 11.0, 21.0])]
    pub rates: Vec<f64>,
    /// Directory for the storage objects (system temp dir by default).
    #[arg(long)]
    pub dir: Option<PathBuf>,
}

impl BenchArgs {
    /// Parse the command line, falling back to `default_sizes`.
    pub fn parse_with(default_sizes: &[usize]) -> Self {
        let mut args = Self::parse();
        if args.sizes.is_empty() {
            args.sizes = default_sizes.to_vec();
        }
        args
    }

    /// Whether run `run` (counting warmups) is timed.
    pub fn is_timed(&self, run: usize) -> bool {
        run >= self.warmup
    }

    pub fn runs(&self) -> usize {
        self.warmup + self.nruns
    }
}

/// `<n>`, `<n>KiB`, `<n>MiB` or `<n>GiB`.
pub fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let shift = match unit.trim() {
        "" | "B" => 0,
        "KiB" => 10,
        "MiB" => 20,
        "GiB" => 30,
        other => return Err(format!("unknown size unit {other:?} in {s:?}")),
    };
    let n: usize = digits.parse().map_err(|e| format!("invalid size {s:?}: {e}"))?;
    n.checked_mul(1 << shift)
        .ok_or_else(|| format!("size {s:?} overflows"))
}

/// GB/s samples of one phase across the timed runs.
#[derive(Debug, Default)]
pub struct Throughput {
    samples: Vec<f64>,
}

impl Throughput {
    /// Run `phase` under `timer` and, when `timed`, record `bytes` moved.
    pub fn measure<T>(
        &mut self,
        timer: &mut Timer,
        bytes: usize,
        timed: bool,
        phase: impl FnOnce() -> T,
    ) -> T {
        timer.start();
        let value = phase();
        timer.end();
        let secs = timer.get();
        if timed && secs > 0.0 {
            self.samples.push(bytes as f64 / secs / 1e9);
        }
        value
    }

    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    /// Largest deviation from the mean, in percent of the mean.
    pub fn spread_pct(&self) -> f64 {
        let mean = self.mean();
        if mean == 0.0 {
            return 0.0;
        }
        let worst = self
            .samples
            .iter()
            .map(|s| (s - mean).abs())
            .fold(0.0, f64::max);
        worst / mean * 100.0
    }

    /// Print one table row.
    pub fn print(&self, mode: &str, op: &str) {
        println!(
            "  {mode:<14} {op:<8} {:>9.3} GB/s  ±{:.1}%  ({} runs)",
            self.mean(),
            self.spread_pct(),
            self.samples.len()
        );
    }
}

/// Print the benchmark title and the runtime configuration.
pub fn print_banner(title: &str) {
    let config = zckpt::Config::get();
    println!("{title}");
    println!(
        "exec={} staging={} device={} task_size={}",
        config.exec_policy,
        config.staging,
        config.device_ordinal,
        human_bytes(config.task_size),
    );
    println!();
}

/// Column header of the result table.
pub fn print_table_header() {
    println!("  {:<14} {:<8} {:>14}", "Mode", "Op", "Throughput");
}

/// Binary-unit size, e.g. `16MiB`.
pub fn human_bytes(n: usize) -> String {
    match n {
        n if n >= 1 << 30 && n % (1 << 30) == 0 => format!("{}GiB", n >> 30),
        n if n >= 1 << 20 && n % (1 << 20) == 0 => format!("{}MiB", n >> 20),
        n if n >= 1 << 10 && n % (1 << 10) == 0 => format!("{}KiB", n >> 10),
        n => format!("{n}B"),
    }
}

/// A smooth, deterministic field of `n` values.
pub fn gen_field(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| {
            let x = i as f64 * 1e-3;
            x.sin() * 100.0 + (0.5 * x).cos() * 10.0
        })
        .collect()
}

/// Deterministic byte payload of the given size.
pub fn gen_data(nbytes: usize) -> Vec<u8> {
    (0..nbytes).map(|i| (i % 251) as u8).collect()
}

/// Scratch directory under `dir`, or the system temp dir.
pub fn scratch_dir(dir: Option<&PathBuf>) -> tempfile::TempDir {
    match dir {
        Some(d) => tempfile::tempdir_in(d),
        None => tempfile::tempdir(),
    }
    .unwrap_or_else(|e| panic!("failed to create scratch dir: {e}"))
}

/// Open the CUDA device if one is present.
pub fn cuda_device() -> Option<zckpt::DeviceManager> {
    // Loading the driver library panics when it is absent.
    match std::panic::catch_unwind(|| zckpt::DeviceManager::cuda(0)) {
        Ok(Ok(device)) => Some(device),
        Ok(Err(e)) => {
            println!("SKIP: no CUDA GPU ({e})");
            None
        }
        Err(_) => {
            println!("SKIP: CUDA driver not installed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("4KiB").unwrap(), 4096);
        assert_eq!(parse_size(" 16MiB ").unwrap(), 16 << 20);
        assert_eq!(parse_size("1GiB").unwrap(), 1 << 30);
        assert!(parse_size("3TB").is_err());
        assert!(parse_size("MiB").is_err());
    }

    #[test]
    fn test_human_bytes() {
        assert_eq!(human_bytes(16 << 20), "16MiB");
        assert_eq!(human_bytes(2048), "2KiB");
        assert_eq!(human_bytes(375_000), "375000B");
    }

    #[test]
    fn test_warmup_runs_are_not_sampled() {
        let mut timer = Timer::new();
        let mut throughput = Throughput::default();
        let value = throughput.measure(&mut timer, 1024, false, || 7);
        assert_eq!(value, 7);
        assert!(throughput.samples.is_empty());

        throughput.measure(&mut timer, 1024, true, || {
            std::thread::sleep(std::time::Duration::from_millis(1))
        });
        assert_eq!(throughput.samples.len(), 1);
        assert!(throughput.mean() > 0.0);
        assert_eq!(timer.peek(), std::time::Duration::ZERO);
    }

    #[test]
    fn test_mean_and_spread() {
        let throughput = Throughput {
            samples: vec![1.0, 3.0],
        };
        assert_eq!(throughput.mean(), 2.0);
        assert_eq!(throughput.spread_pct(), 50.0);
        assert_eq!(Throughput::default().spread_pct(), 0.0);
    }
}
