use std::io;
use std::time::Duration;

use stager_core::format::HeaderError;
use stager_core::{ErrorClass, StageErrno, StagerConfig, StagerError};

type TestResult = Result<(), Box<dyn std::error::Error>>;

#[test]
fn error_classes_drive_retry_and_damage() {
    for errno in [
        StageErrno::Canceled,
        StageErrno::Interrupted,
        StageErrno::NoSpace,
        StageErrno::Permission,
        StageErrno::Unsupported,
        StageErrno::NoDevice,
    ] {
        assert_eq!(errno.class(), ErrorClass::Fatal, "{errno:?}");
    }
    for errno in [StageErrno::TimedOut, StageErrno::CommFailure, StageErrno::Busy, StageErrno::NotFound] {
        assert_eq!(errno.class(), ErrorClass::Transient, "{errno:?}");
    }
    for errno in [StageErrno::Io, StageErrno::HeaderFormat, StageErrno::ChecksumMismatch, StageErrno::Raw(1234)] {
        assert!(errno.class().is_damaging(), "{errno:?}");
    }
}

#[test]
fn host_errno_values_round_trip() {
    assert_eq!(StageErrno::from_errno(libc::ENODEV), StageErrno::NoDevice);
    assert_eq!(StageErrno::from_errno(libc::EPERM), StageErrno::Permission);
    assert_eq!(StageErrno::NoSpace.errno(), libc::ENOSPC);
    assert_eq!(StageErrno::HeaderFormat.errno(), libc::EIO);
    assert_eq!(StageErrno::Raw(999).errno(), 999);
}

#[test]
fn table_codes_are_stable() {
    assert_eq!(StageErrno::from_code(0), None);
    assert_eq!(StageErrno::from_code(StageErrno::ChecksumMismatch.to_code()), Some(StageErrno::ChecksumMismatch));
    assert_eq!(StageErrno::from_code(StageErrno::Raw(77).to_code()), Some(StageErrno::Raw(77)));
}

#[test]
fn io_errors_resolve_to_request_codes() {
    let raw = io::Error::from_raw_os_error(libc::ETIMEDOUT);
    assert_eq!(StageErrno::from(&raw), StageErrno::TimedOut);
    let kind = io::Error::new(io::ErrorKind::NotFound, "gone");
    assert_eq!(StageErrno::from(&kind), StageErrno::NotFound);
    let other = io::Error::other("weird");
    assert_eq!(StageErrno::from(&other), StageErrno::Io);

    let wrapped = StagerError::from(io::Error::from_raw_os_error(libc::ENOSPC)).with_context("cache write");
    assert_eq!(wrapped.errno(), StageErrno::NoSpace);
    assert!(wrapped.to_string().starts_with("cache write: "));
}

#[test]
fn pipeline_errors_resolve_to_request_codes() {
    assert_eq!(StagerError::from(HeaderError::BadMagic).errno(), StageErrno::HeaderFormat);
    assert_eq!(StagerError::Canceled.errno(), StageErrno::Canceled);
    assert_eq!(StagerError::from(StageErrno::Busy).errno(), StageErrno::Busy);
    assert_eq!(StagerError::Config("x".into()).errno(), StageErrno::InvalidArgument);
    assert_eq!(
        StagerError::ChecksumMismatch { expected: [1, 0, 0, 0], actual: [2, 0, 0, 0] }.errno(),
        StageErrno::ChecksumMismatch
    );
}

#[test]
fn config_reads_partial_toml() -> TestResult {
    let config = StagerConfig::from_toml_str(
        r#"
        max_active = 128

        [scheduler]
        tick_interval = 250
        attended = false

        [worker]
        write_block_size = 8192

        [stream]
        max_count = 10

        [paths]
        work_dir = "/var/stager"
        "#,
    )?;
    assert_eq!(config.max_active, 128);
    assert_eq!(config.scheduler.tick_interval, Duration::from_millis(250));
    assert!(!config.scheduler.attended);
    assert_eq!(config.worker.write_block_size, 8192);
    assert_eq!(config.worker.read_buffers, 4);
    assert_eq!(config.stream.max_count, 10);
    assert_eq!(
        config.paths.request_table().as_deref(),
        Some(std::path::Path::new("/var/stager/stager_reqs"))
    );
    Ok(())
}

#[test]
fn config_rejects_unusable_values() {
    for raw in [
        "max_active = 0",
        "[worker]\nread_buffers = 1",
        "[worker]\nwrite_block_size = 1000",
        "[media]\ndisk_archive_block_size = 0",
        "[lock]\nattempts = 0",
        "max_active = \"many\"",
    ] {
        assert!(
            matches!(StagerConfig::from_toml_str(raw), Err(StagerError::Config(_))),
            "{raw}"
        );
    }
}

#[test]
fn config_loads_from_file() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("stager.toml");
    std::fs::write(&path, "max_retries = 7\n")?;
    assert_eq!(StagerConfig::load(&path)?.max_retries, 7);

    let missing = StagerConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert_eq!(missing.errno(), StageErrno::NotFound);
    Ok(())
}
