//! Configuration environment variable integration tests.
//!
//! Every test here calls [`Config::from_env`], which reads all variables, so
//! the tests take [`ENV_LOCK`] to keep one test's invalid value from leaking
//! into another.


use std::sync::Mutex;

use zckpt::{Config, ErrorKind, ExecutionPolicy, FailurePolicy, ObjectNaming, StagingMode};

use test_utils::EnvVarGuard;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn locked() -> std::sync::MutexGuard<'static, ()> {
    ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

// ---- Every variable ----

#[test]
fn test_env_exec_policy() {
    let _lock = locked();
    let _guard = EnvVarGuard::new(&[("ZCKPT_EXEC_POLICY", "serial")]);
    let config = Config::from_env().unwrap();
    assert_eq!(config.exec_policy, ExecutionPolicy::Serial);
}

#[test]
fn test_env_staging() {
    let _lock = locked();
    let _guard = EnvVarGuard::new(&[("ZCKPT_STAGING", "DIRECT")]);
    let config = Config::from_env().unwrap();
    assert_eq!(config.staging, StagingMode::Direct);
}

#[test]
fn test_env_device() {
    let _lock = locked();
    let _guard = EnvVarGuard::new(&[("ZCKPT_DEVICE", "3")]);
    let config = Config::from_env().unwrap();
    assert_eq!(config.device_ordinal, 3);
}

#[test]
fn test_env_object_naming() {
    let _lock = locked();
    let _guard = EnvVarGuard::new(&[("ZCKPT_OBJECT_NAMING", "overwrite")]);
    let config = Config::from_env().unwrap();
    assert_eq!(config.object_naming, ObjectNaming::Overwrite);
}

#[test]
fn test_env_failure_policy() {
    let _lock = locked();
    let _guard = EnvVarGuard::new(&[("ZCKPT_ON_FAILURE", "skip")]);
    let config = Config::from_env().unwrap();
    assert_eq!(config.failure_policy, FailurePolicy::SkipAndContinue);
}

#[test]
fn test_env_task_size() {
    let _lock = locked();
    let _guard = EnvVarGuard::new(&[("ZCKPT_TASK_SIZE", "8388608")]);
    let config = Config::from_env().unwrap();
    assert_eq!(config.task_size, 8 * 1024 * 1024);
}

#[test]
fn test_env_host_device_capacity() {
    let _lock = locked();
    let _guard = EnvVarGuard::new(&[("ZCKPT_HOST_DEVICE_CAPACITY", "1048576")]);
    let config = Config::from_env().unwrap();
    assert_eq!(config.host_device_capacity, Some(1024 * 1024));
}

// ---- Invalid values ----

#[test]
fn test_invalid_exec_policy() {
    let _lock = locked();
    let _guard = EnvVarGuard::new(&[("ZCKPT_EXEC_POLICY", "openmp")]);
    let err = Config::from_env().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
    assert_eq!(err.kind().exit_code(), 2);
}

#[test]
fn test_invalid_staging() {
    let _lock = locked();
    let _guard = EnvVarGuard::new(&[("ZCKPT_STAGING", "sometimes")]);
    assert_eq!(Config::from_env().unwrap_err().kind(), ErrorKind::ConfigInvalid);
}

#[test]
fn test_invalid_object_naming() {
    let _lock = locked();
    let _guard = EnvVarGuard::new(&[("ZCKPT_OBJECT_NAMING", "append")]);
    assert_eq!(Config::from_env().unwrap_err().kind(), ErrorKind::ConfigInvalid);
}

#[test]
fn test_invalid_task_size_negative() {
    let _lock = locked();
    let _guard = EnvVarGuard::new(&[("ZCKPT_TASK_SIZE", "-1")]);
    assert_eq!(Config::from_env().unwrap_err().kind(), ErrorKind::ConfigInvalid);
}

#[test]
fn test_invalid_task_size_zero() {
    let _lock = locked();
    let _guard = EnvVarGuard::new(&[("ZCKPT_TASK_SIZE", "0")]);
    assert_eq!(Config::from_env().unwrap_err().kind(), ErrorKind::ConfigInvalid);
}

// ---- Empty values use defaults ----

#[test]
fn test_empty_env_values_use_defaults() {
    let _lock = locked();
    let _guard = EnvVarGuard::new(&[("ZCKPT_STAGING", ""), ("ZCKPT_TASK_SIZE", "  ")]);
    let config = Config::from_env().unwrap();
    assert_eq!(config.staging, StagingMode::Auto);
    assert_eq!(config.task_size, 4 * 1024 * 1024);
}

#[test]
fn test_unset_env_values_use_defaults() {
    let _lock = locked();
    let _guard = EnvVarGuard::remove(&["ZCKPT_EXEC_POLICY", "ZCKPT_ON_FAILURE"]);
    let config = Config::from_env().unwrap();
    assert_eq!(config.exec_policy, ExecutionPolicy::Cuda);
    assert_eq!(config.failure_policy, FailurePolicy::Abort);
}

// ---- Global singleton ----

#[test]
fn test_config_thread_safety() {
    let _lock = locked();
    let saved = Config::get();

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..100 {
                    let config = Config::get();
                    assert!(config.task_size > 0);
                }
            });
        }
        for i in 0..4 {
            scope.spawn(move || {
                for j in 0..100 {
                    Config::update(|c| c.task_size = 1 + i * 100 + j);
                }
            });
        }
    });

    Config::set(saved);
}

#[test]
fn test_config_set_get_roundtrip() {
    let _lock = locked();
    let saved = Config::get();

    let custom = Config {
        exec_policy: ExecutionPolicy::Serial,
        staging: StagingMode::Staged,
        device_ordinal: 2,
        object_naming: ObjectNaming::Overwrite,
        failure_policy: FailurePolicy::SkipAndContinue,
        task_size: 1234,
        host_device_capacity: Some(5678),
    };
    Config::set(custom.clone());
    assert_eq!(Config::get(), custom);

    Config::set(saved);
}
