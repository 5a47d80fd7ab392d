//! `zckpt` - fixed-rate compression checkpoint benchmark.

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(not(feature = "mpi"))]
use zckpt::aggregator::Solo;
use zckpt::aggregator::{Aggregator, LocalGroup, agree};
use zckpt::array::Array;
use zckpt::cli::Cli;
use zckpt::config::Config;
use zckpt::device::DeviceManager;
use zckpt::error::{Error, ErrorKind, Result};
use zckpt::sweep::{Sweep, SweepConfig, SweepReport};

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("zckpt: {err}");
            exit_code(&err)
        }
    }
}

fn exit_code(err: &Error) -> ExitCode {
    ExitCode::from(err.kind().exit_code() as u8)
}

fn run(cli: &Cli) -> Result<ExitCode> {
    let shape = cli.shape()?;
    let mut config = Config::from_env()?;
    cli.apply_to(&mut config);
    Config::set(config.clone());
    let sweep_config = cli.sweep_config(&config)?;

    tracing::info!(
        compress = cli.compress,
        decompress = cli.decompress,
        mode = ?cli.mode,
        tolerance = cli.tolerance,
        rates = ?sweep_config.rates,
        exec = %config.exec_policy,
        staging = %config.staging,
        naming = %config.object_naming,
        "starting sweep"
    );

    let report = run_participants(cli, &shape, &config, &sweep_config)?;
    let Some(report) = report else {
        return Ok(ExitCode::SUCCESS);
    };

    let mut stdout = std::io::stdout().lock();
    report.print(&mut stdout).map_err(|e| {
        Error::new(ErrorKind::Unexpected, "failed to print report")
            .with_operation("main")
            .set_source(e)
    })?;
    if let Some(path) = &cli.report {
        report.write_json(path)?;
    }
    Ok(match &report.aborted {
        Some(err) => exit_code(err),
        None => ExitCode::SUCCESS,
    })
}

/// Run the sweep on every participant. Returns the root's report.
#[cfg(not(feature = "mpi"))]
fn run_participants(
    cli: &Cli,
    shape: &[usize],
    config: &Config,
    sweep_config: &SweepConfig,
) -> Result<Option<SweepReport>> {
    if cli.local_participants == 1 {
        return participant(&Solo, cli, shape, config, sweep_config).map(Some);
    }
    run_local_group(cli, shape, config, sweep_config)
}

#[cfg(feature = "mpi")]
fn run_participants(
    cli: &Cli,
    shape: &[usize],
    config: &Config,
    sweep_config: &SweepConfig,
) -> Result<Option<SweepReport>> {
    if cli.local_participants > 1 {
        return run_local_group(cli, shape, config, sweep_config);
    }
    let world = zckpt::aggregator::MpiAggregator::init()?;
    let report = participant(&world, cli, shape, config, sweep_config)?;
    Ok(world.is_root().then_some(report))
}

fn run_local_group(
    cli: &Cli,
    shape: &[usize],
    config: &Config,
    sweep_config: &SweepConfig,
) -> Result<Option<SweepReport>> {
    let results: Vec<Result<SweepReport>> = std::thread::scope(|scope| {
        let handles: Vec<_> = LocalGroup::new(cli.local_participants)
            .into_iter()
            .map(|member| {
                scope.spawn(move || participant(&member, cli, shape, config, sweep_config))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join().unwrap_or_else(|_| {
                    Err(Error::new(ErrorKind::Unexpected, "participant thread panicked")
                        .with_operation("run_local_group"))
                })
            })
            .collect()
    });

    let mut root = None;
    for result in results {
        let report = result?;
        if root.is_none() {
            root = Some(report);
        }
    }
    Ok(root)
}

fn participant(
    aggregator: &dyn Aggregator,
    cli: &Cli,
    shape: &[usize],
    config: &Config,
    sweep_config: &SweepConfig,
) -> Result<SweepReport> {
    let array = Array::load(&cli.input, shape, cli.precision);
    let array = agree(aggregator, array, ErrorKind::PeerFailed, "participant")?;
    let device = DeviceManager::from_config(config);
    let device = agree(aggregator, device, ErrorKind::PeerFailed, "participant")?;
    let sweep = Sweep::new(sweep_config.clone(), aggregator, &device, &array);
    let report = sweep.run();
    if device.live_buffers() != 0 {
        tracing::warn!(
            rank = aggregator.rank(),
            buffers = device.live_buffers(),
            bytes = device.allocated_bytes(),
            "device buffers outlived the sweep"
        );
    }
    Ok(report)
}
