use std::sync::{Arc, RwLock};

use stager_core::checksum::{ChecksumState, checksum_of, compare_values, simple_seed};
use stager_core::format::TAR_RECORD_SIZE;
use stager_core::{ChecksumAccumulator, ChecksumAlgorithm, ChecksumValue, StageErrno, StagerError};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

#[test]
fn incremental_updates_match_one_pass() {
    let data = sample(10_001);
    for algorithm in [ChecksumAlgorithm::Simple, ChecksumAlgorithm::Crc32, ChecksumAlgorithm::Sha256] {
        let expected = checksum_of(algorithm, &data, data.len() as u64, false);
        let mut state = ChecksumState::new(algorithm, data.len() as u64, false);
        // Uneven splits exercise the carried partial word.
        for chunk in data.chunks(333) {
            state.update(chunk);
        }
        assert_eq!(state.value(), expected, "{algorithm:?}");
    }
}

#[test]
fn simple_sum_is_seeded_with_on_media_size() {
    assert_eq!(simple_seed(1, false), (2 * TAR_RECORD_SIZE) as u64);
    assert_eq!(simple_seed(512, true), (3 * TAR_RECORD_SIZE) as u64);

    let empty = checksum_of(ChecksumAlgorithm::Simple, &[], 1000, false);
    assert_eq!(empty, ChecksumValue([0, 1536, 0, 0]));

    let value = checksum_of(ChecksumAlgorithm::Simple, &[0, 0, 0, 1, 0, 0, 0, 2], 0, false);
    // low = 512 + 1 + 2, high = (512 + 1) + (512 + 3)
    assert_eq!(value, ChecksumValue([0, 515, 0, 1028]));
}

#[test]
fn crc32_matches_the_reference() {
    let value = checksum_of(ChecksumAlgorithm::Crc32, b"123456789", 9, false);
    assert_eq!(value, ChecksumValue([0xcbf4_3926, 0, 0, 0]));
}

#[test]
fn resumed_state_continues_the_fold() {
    let data = sample(8192);
    let (head, tail) = data.split_at(4096);
    for algorithm in [ChecksumAlgorithm::Simple, ChecksumAlgorithm::Crc32] {
        let mut first = ChecksumState::new(algorithm, data.len() as u64, false);
        first.update(head);
        let mut resumed = ChecksumState::resume(algorithm, first.value(), head.len() as u64)
            .expect("resumable algorithm");
        resumed.update(tail);
        assert_eq!(resumed.value(), checksum_of(algorithm, &data, data.len() as u64, false));
    }
}

#[test]
fn some_states_cannot_resume() {
    let partial = ChecksumValue([1, 2, 3, 4]);
    assert!(ChecksumState::resume(ChecksumAlgorithm::Sha256, partial, 512).is_none());
    assert!(ChecksumState::resume(ChecksumAlgorithm::Simple, partial, 6).is_none());
}

#[test]
fn byte_swapped_simple_value_is_accepted() -> TestResult {
    let computed = checksum_of(ChecksumAlgorithm::Simple, &sample(64), 64, false);
    compare_values(ChecksumAlgorithm::Simple, computed, computed)?;
    compare_values(ChecksumAlgorithm::Simple, computed.byte_swapped(), computed)?;
    assert_eq!(computed.byte_swapped().byte_swapped(), computed);

    let crc = checksum_of(ChecksumAlgorithm::Crc32, &sample(64), 64, false);
    let err = compare_values(ChecksumAlgorithm::Crc32, crc.byte_swapped(), crc).unwrap_err();
    assert!(matches!(err, StagerError::ChecksumMismatch { .. }));
    assert_eq!(err.errno(), StageErrno::ChecksumMismatch);
    Ok(())
}

#[test]
fn accumulator_folds_fed_blocks() -> TestResult {
    let data = sample(4000);
    let accumulator = ChecksumAccumulator::spawn("test")?;
    accumulator.begin(ChecksumState::new(ChecksumAlgorithm::Crc32, data.len() as u64, false));

    for chunk in data.chunks(1024) {
        let mut block = vec![0u8; 1024];
        block[..chunk.len()].copy_from_slice(chunk);
        let cell = Arc::new(RwLock::new(block.into_boxed_slice()));
        accumulator.feed(cell, 0..chunk.len());
        accumulator.wait_for_block();
    }

    assert_eq!(accumulator.folded_bytes(), data.len() as u64);
    let expected = checksum_of(ChecksumAlgorithm::Crc32, &data, 0, false);
    assert_eq!(accumulator.value(), Some(expected));
    accumulator.compare(expected)?;
    assert!(accumulator.compare(ChecksumValue([1, 0, 0, 0])).is_err());

    let taken = accumulator.take().ok_or("state missing")?;
    assert_eq!(taken.value(), expected);
    assert_eq!(accumulator.value(), None);
    accumulator.compare(ChecksumValue::default())?;
    Ok(())
}

#[test]
fn algorithm_codes_are_stable() {
    for algorithm in [ChecksumAlgorithm::Simple, ChecksumAlgorithm::Crc32, ChecksumAlgorithm::Sha256] {
        assert_eq!(ChecksumAlgorithm::from_code(algorithm.to_code()), Some(algorithm));
    }
    assert_eq!(ChecksumAlgorithm::from_code(0), None);
}
