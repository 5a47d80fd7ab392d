//! End-to-end sweep tests on the emulated host device.
//!
//! Every pass runs the full pipeline: stage, compress, write, read back,
//! decompress. The codec runs serially so no GPU is needed.


use std::path::Path;

use zckpt::storage::{Selection, variable_name};
use zckpt::{
    Aggregator, Array, Config, DeviceManager, ErrorKind, ExecutionPolicy, FailurePolicy,
    ObjectNaming, PartitionDescriptor, PartitionedReader, ScalarType, Solo, StagingMode, Sweep, SweepConfig,
};

use test_utils::{assert_data_eq, run_group, smooth_array};

fn host_sweep_config(object: &Path, rates: &[f64]) -> SweepConfig {
    SweepConfig {
        rates: rates.to_vec(),
        exec_policy: ExecutionPolicy::Serial,
        staging: StagingMode::Staged,
        verify: true,
        ..SweepConfig::new(object, &Config::default())
    }
}

fn read_partition(object: &Path, selection: Selection) -> Vec<u8> {
    let reader = PartitionedReader::open_for_read(object, StagingMode::Staged).unwrap();
    reader.read_sync(&variable_name(0), selection).unwrap()
}

// ---- Single participant ----

#[test]
fn test_baseline_million_doubles() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("ckpt.bp");
    let array = smooth_array(&[1_000_000], ScalarType::Double, 0.0);
    let device = DeviceManager::host(None);

    let report = Sweep::new(host_sweep_config(&base, &[]), &Solo, &device, &array).run();

    assert!(report.aborted.is_none());
    assert_eq!(report.passes.len(), 1);
    let baseline = report.baseline().unwrap();
    assert_eq!(baseline.label, "baseline");
    assert_eq!(baseline.comp, 0.0);
    assert_eq!(baseline.decomp, 0.0);
    assert_eq!(baseline.raw_bytes, 8_000_000);
    assert_eq!(baseline.stored_bytes, 8_000_000);
    assert_eq!(baseline.ratio, 1.0);
    assert_eq!(baseline.elements, 1_000_000);
    assert_eq!(baseline.max_abs_error, Some(0.0));
    assert_eq!(baseline.total_write, baseline.write);

    let stored = read_partition(
        &dir.path().join("ckpt.bp.baseline"),
        Selection {
            offset: 0,
            len: 8_000_000,
        },
    );
    assert_data_eq(array.as_bytes(), &stored);
    assert_eq!(device.live_buffers(), 0);
}

#[test]
fn test_rate_two_million_doubles() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("ckpt.bp");
    let array = smooth_array(&[1_000_000], ScalarType::Double, 0.0);
    let device = DeviceManager::host(None);

    let report = Sweep::new(host_sweep_config(&base, &[2.0]), &Solo, &device, &array).run();

    assert!(report.aborted.is_none());
    let pass = report.compressed().next().unwrap();
    assert_eq!(pass.label, "rate2");
    assert_eq!(pass.rate, Some(2.0));
    assert!(pass.comp > 0.0);
    assert!(pass.decomp > 0.0);
    // 250,000 blocks of 4 values, each coded into 1 + 11 header bits.
    assert_eq!(pass.stored_bytes, 375_000);
    assert!(pass.stored_bytes < pass.raw_bytes);
    assert!(pass.ratio > 21.0 && pass.ratio < 21.5);
    assert_eq!(pass.elements, 1_000_000);
    assert!(pass.max_abs_error.unwrap().is_finite());
    assert_eq!(pass.total_write, pass.comp + pass.write);
    assert_eq!(pass.total_read, pass.read + pass.decomp);

    let stored = std::fs::metadata(dir.path().join("ckpt.bp.rate2").join("data.0")).unwrap();
    assert_eq!(stored.len(), 375_000);
    assert_eq!(device.live_buffers(), 0);
    assert_eq!(device.allocated_bytes(), 0);
}

#[test]
fn test_higher_rate_is_more_accurate() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("ckpt.bp");
    let array = smooth_array(&[64, 64], ScalarType::Float, 0.3);
    let device = DeviceManager::host(None);

    let report =
        Sweep::new(host_sweep_config(&base, &[4.0, 16.0]), &Solo, &device, &array).run();

    let errors: Vec<f64> = report
        .compressed()
        .map(|p| p.max_abs_error.unwrap())
        .collect();
    assert_eq!(errors.len(), 2);
    assert!(errors[1] < errors[0], "errors {errors:?}");
    assert!(errors[1] < 0.1);
}

#[test]
fn test_five_dimensional_field_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("ckpt.bp");
    let array = smooth_array(&[2, 2, 2, 2, 2], ScalarType::Double, 0.0);
    let device = DeviceManager::host(None);

    let sweep = Sweep::new(host_sweep_config(&base, &[8.0]), &Solo, &device, &array);
    let report = sweep.run();

    let err = report.aborted.as_ref().unwrap();
    assert_eq!(err.kind(), ErrorKind::UnsupportedDimensionality);
    assert_eq!(err.kind().exit_code(), 4);
    // The baseline needs no codec and still ran.
    assert_eq!(report.passes.len(), 1);
    assert_eq!(device.live_buffers(), 0);
    assert!(!dir.path().join("ckpt.bp.rate8").exists());
}

// ---- Object naming ----

#[test]
fn test_fresh_naming_keeps_every_pass() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("ckpt.bp");
    let array = smooth_array(&[4096], ScalarType::Double, 0.0);
    let device = DeviceManager::host(None);

    let report = Sweep::new(host_sweep_config(&base, &[8.0]), &Solo, &device, &array).run();
    assert!(report.aborted.is_none());

    let baseline = PartitionedReader::open_for_read(&dir.path().join("ckpt.bp.baseline"), StagingMode::Staged)
        .unwrap();
    assert_eq!(baseline.variable("var_step0").unwrap().shape, vec![32_768]);
    let compressed = PartitionedReader::open_for_read(&dir.path().join("ckpt.bp.rate8"), StagingMode::Staged)
        .unwrap();
    // 1024 blocks of 32 bits.
    assert_eq!(compressed.variable("var_step0").unwrap().shape, vec![4096]);
    assert!(!base.exists());
}

#[test]
fn test_overwrite_naming_keeps_last_pass() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("ckpt.bp");
    let array = smooth_array(&[4096], ScalarType::Double, 0.0);
    let device = DeviceManager::host(None);
    let config = SweepConfig {
        naming: ObjectNaming::Overwrite,
        ..host_sweep_config(&base, &[8.0])
    };

    let report = Sweep::new(config, &Solo, &device, &array).run();
    assert!(report.aborted.is_none());
    assert_eq!(report.passes.len(), 2);

    let reader = PartitionedReader::open_for_read(&base, StagingMode::Staged).unwrap();
    let var = reader.variable("var_step0").unwrap();
    assert_eq!(var.shape, vec![4096]);
    assert_eq!(std::fs::metadata(base.join("data.0")).unwrap().len(), 4096);
    assert!(!dir.path().join("ckpt.bp.baseline").exists());
}

#[test]
fn test_missing_object_read_is_variable_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let reader =
        PartitionedReader::open_for_read(&dir.path().join("absent.bp"), StagingMode::Staged)
            .unwrap();
    let err = reader
        .read_sync("var_step0", Selection { offset: 0, len: 8 })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::VariableNotFound);
}

// ---- Failure policy ----

fn failing_config(object: &Path, policy: FailurePolicy) -> SweepConfig {
    // CUDA execution cannot run on the emulated device.
    SweepConfig {
        exec_policy: ExecutionPolicy::Cuda,
        failure_policy: policy,
        ..host_sweep_config(object, &[2.0, 8.0])
    }
}

#[test]
fn test_skip_policy_records_failures_and_continues() {
    let dir = tempfile::tempdir().unwrap();
    let array = smooth_array(&[1024], ScalarType::Double, 0.0);
    let device = DeviceManager::host(None);
    let config = failing_config(&dir.path().join("ckpt.bp"), FailurePolicy::SkipAndContinue);

    let report = Sweep::new(config, &Solo, &device, &array).run();

    assert!(report.aborted.is_none());
    assert_eq!(report.passes.len(), 3);
    assert!(!report.baseline().unwrap().is_failure());
    let failed: Vec<_> = report.compressed().collect();
    assert!(failed.iter().all(|p| p.is_failure()));
    assert_eq!(failed[0].label, "rate2");
    assert_eq!(failed[1].label, "rate8");
    assert!(failed[0].failure.as_ref().unwrap().contains("CodecExecutionUnavailable"));
    assert_eq!(device.live_buffers(), 0);

    let mut out = Vec::new();
    report.print(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("# no compression"));
    assert!(text.contains("rate8"));
}

#[test]
fn test_abort_policy_stops_at_first_failure() {
    let dir = tempfile::tempdir().unwrap();
    let array = smooth_array(&[1024], ScalarType::Double, 0.0);
    let device = DeviceManager::host(None);
    let config = failing_config(&dir.path().join("ckpt.bp"), FailurePolicy::Abort);

    let report = Sweep::new(config, &Solo, &device, &array).run();

    assert_eq!(report.passes.len(), 1);
    let err = report.aborted.as_ref().unwrap();
    assert_eq!(err.kind(), ErrorKind::CodecExecutionUnavailable);
    assert!(!dir.path().join("ckpt.bp.rate8").exists());
    assert_eq!(device.live_buffers(), 0);
}

#[test]
fn test_out_of_memory_fails_the_pass() {
    let dir = tempfile::tempdir().unwrap();
    let array = smooth_array(&[1024], ScalarType::Double, 0.0);
    // Room for the original only; the compressed buffer does not fit.
    let device = DeviceManager::host(Some(8192));
    let config = SweepConfig {
        failure_policy: FailurePolicy::SkipAndContinue,
        ..host_sweep_config(&dir.path().join("ckpt.bp"), &[8.0])
    };

    let report = Sweep::new(config, &Solo, &device, &array).run();

    assert!(!report.baseline().unwrap().is_failure());
    let pass = report.compressed().next().unwrap();
    assert!(pass.failure.as_ref().unwrap().contains("DeviceOutOfMemory"));
    assert_eq!(device.live_buffers(), 0);
}

// ---- Several participants ----

#[test]
fn test_two_participants_share_one_object() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("ckpt.bp");
    let arrays: Vec<Array> = (0..2)
        .map(|rank| smooth_array(&[500_000], ScalarType::Double, rank as f64))
        .collect();

    let results = run_group(2, |member| {
        let device = DeviceManager::host(None);
        let config = host_sweep_config(&base, &[]);
        let report = Sweep::new(config, member, &device, &arrays[member.rank()]).run();
        assert_eq!(device.live_buffers(), 0);
        let written = PartitionDescriptor::new(
            report.baseline().unwrap().stored_bytes,
            member.participants(),
            member.rank(),
        )
        .unwrap();
        (report, written.selection())
    });

    for (report, _) in &results {
        assert!(report.aborted.is_none());
        assert_eq!(report.participants, 2);
    }

    let object = dir.path().join("ckpt.bp.baseline");
    let reader = PartitionedReader::open_for_read(&object, StagingMode::Staged).unwrap();
    let var = reader.variable("var_step0").unwrap();
    assert_eq!(var.shape, vec![8_000_000]);
    for (rank, array) in arrays.iter().enumerate() {
        let block = reader.block_for_rank("var_step0", rank).unwrap();
        assert_eq!(block.start, rank as u64 * 4_000_000);
        assert_eq!(block.count, 4_000_000);
        let selection = Selection {
            offset: block.start,
            len: block.count,
        };
        // A rank reads back exactly the range it wrote.
        assert_eq!(selection, results[rank].1);
        let bytes = reader.read_sync("var_step0", selection).unwrap();
        assert_data_eq(array.as_bytes(), &bytes);
    }
}

#[test]
fn test_two_participants_compressed_pass() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("ckpt.bp");
    let output = dir.path().join("out.dat");
    let arrays: Vec<Array> = (0..2)
        .map(|rank| smooth_array(&[32, 32], ScalarType::Double, rank as f64))
        .collect();

    let reports = run_group(2, |member| {
        let device = DeviceManager::host(None);
        let config = SweepConfig {
            output: Some(output.clone()),
            ..host_sweep_config(&base, &[16.0])
        };
        Sweep::new(config, member, &device, &arrays[member.rank()]).run()
    });

    let root = &reports[0];
    assert!(root.aborted.is_none());
    let pass = root.compressed().next().unwrap();
    assert_eq!(pass.elements, 1024);
    assert!(pass.max_abs_error.unwrap() < 0.05);

    // Each participant's reconstruction lands at its rank offset.
    let written = std::fs::read(dir.path().join("out.dat.rate16")).unwrap();
    assert_eq!(written.len(), 2 * 8192);

    let reader = PartitionedReader::open_for_read(&dir.path().join("ckpt.bp.rate16"), StagingMode::Staged)
        .unwrap();
    let var = reader.variable("var_step0").unwrap();
    assert_eq!(var.shape, vec![2 * pass.stored_bytes]);
}

/// Rank 1's device only has room for the original array, so its compressed
/// buffer does not fit while rank 0's does.
fn one_rank_out_of_memory(
    object: &Path,
    policy: FailurePolicy,
) -> Vec<(zckpt::SweepReport, usize)> {
    let arrays: Vec<Array> = (0..2)
        .map(|rank| smooth_array(&[1024], ScalarType::Double, rank as f64))
        .collect();
    run_group(2, |member| {
        let device = match member.rank() {
            1 => DeviceManager::host(Some(8192)),
            _ => DeviceManager::host(None),
        };
        let config = SweepConfig {
            failure_policy: policy,
            ..host_sweep_config(object, &[8.0, 16.0])
        };
        let report = Sweep::new(config, member, &device, &arrays[member.rank()]).run();
        (report, device.live_buffers())
    })
}

#[test]
fn test_one_participant_out_of_memory_skips_pass_everywhere() {
    let dir = tempfile::tempdir().unwrap();
    let results =
        one_rank_out_of_memory(&dir.path().join("ckpt.bp"), FailurePolicy::SkipAndContinue);

    for (rank, (report, live)) in results.iter().enumerate() {
        assert!(report.aborted.is_none(), "rank {rank}");
        assert_eq!(report.passes.len(), 3, "rank {rank}");
        assert!(!report.baseline().unwrap().is_failure());
        assert!(report.compressed().all(|p| p.is_failure()), "rank {rank}");
        assert_eq!(*live, 0, "rank {rank}");
    }
    let failure = |rank: usize| results[rank].0.passes[1].failure.clone().unwrap();
    assert!(failure(0).contains("PeerFailed"));
    assert!(failure(1).contains("DeviceOutOfMemory"));
    assert!(!dir.path().join("ckpt.bp.rate8").exists());
}

#[test]
fn test_one_participant_out_of_memory_aborts_everywhere() {
    let dir = tempfile::tempdir().unwrap();
    let results = one_rank_out_of_memory(&dir.path().join("ckpt.bp"), FailurePolicy::Abort);

    let kinds: Vec<_> = results
        .iter()
        .map(|(report, _)| report.aborted.as_ref().unwrap().kind())
        .collect();
    assert_eq!(kinds, vec![ErrorKind::PeerFailed, ErrorKind::DeviceOutOfMemory]);
    for (report, live) in &results {
        assert_eq!(report.passes.len(), 1);
        assert_eq!(*live, 0);
    }
}
