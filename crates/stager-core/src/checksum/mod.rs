//! Running checksums over staged data and their comparison with archive-time values.

mod accumulator;

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::format::{TAR_RECORD_SIZE, round_to_record};
use crate::telemetry;
use crate::telemetry::tags;
use crate::{Result, StagerError};

pub use accumulator::ChecksumAccumulator;

/// Algorithm recorded with the archive copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChecksumAlgorithm {
    /// Two running sums over big-endian words, seeded with the on-media size.
    Simple,
    Crc32,
    /// First 16 bytes of the SHA-256 digest.
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn to_code(self) -> u8 {
        match self {
            Self::Simple => 1,
            Self::Crc32 => 2,
            Self::Sha256 => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Simple),
            2 => Some(Self::Crc32),
            3 => Some(Self::Sha256),
            _ => None,
        }
    }
}

/// Four-word checksum value as recorded in the file's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ChecksumValue(pub [u32; 4]);

impl ChecksumValue {
    /// Byte-swaps every word. Applying it twice yields the original value.
    pub fn byte_swapped(self) -> Self {
        Self(self.0.map(u32::swap_bytes))
    }
}

impl fmt::Display for ChecksumValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{a:08x} {b:08x} {c:08x} {d:08x}")
    }
}

/// Seed of the simple algorithm for a file of `len` bytes on media.
///
/// The archiver summed the padded data plus its header record, and one more record when
/// the name needed a long-name header.
pub fn simple_seed(len: u64, long_name: bool) -> u64 {
    let record = TAR_RECORD_SIZE as u64;
    round_to_record(len) + record + if long_name { record } else { 0 }
}

/// Running checksum state of one file.
#[derive(Clone)]
pub enum ChecksumState {
    Simple {
        low: u64,
        high: u64,
        carry: [u8; 4],
        carry_len: usize,
    },
    Crc32(crc32fast::Hasher),
    Sha256(Sha256),
}

impl fmt::Debug for ChecksumState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ChecksumState")
            .field(&self.algorithm())
            .field(&self.value())
            .finish()
    }
}

impl ChecksumState {
    pub fn new(algorithm: ChecksumAlgorithm, len: u64, long_name: bool) -> Self {
        match algorithm {
            ChecksumAlgorithm::Simple => Self::Simple {
                low: simple_seed(len, long_name),
                high: 0,
                carry: [0; 4],
                carry_len: 0,
            },
            ChecksumAlgorithm::Crc32 => Self::Crc32(crc32fast::Hasher::new()),
            ChecksumAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
        }
    }

    /// Rebuilds a state from a partial value recorded on the request.
    ///
    /// Only algorithms whose value is their whole state can resume; `staged` is the byte
    /// count folded so far.
    pub fn resume(algorithm: ChecksumAlgorithm, partial: ChecksumValue, staged: u64) -> Option<Self> {
        let [a, b, c, d] = partial.0;
        match algorithm {
            ChecksumAlgorithm::Simple if staged % 4 == 0 => Some(Self::Simple {
                low: ((a as u64) << 32) | b as u64,
                high: ((c as u64) << 32) | d as u64,
                carry: [0; 4],
                carry_len: 0,
            }),
            ChecksumAlgorithm::Crc32 => {
                Some(Self::Crc32(crc32fast::Hasher::new_with_initial_len(a, staged)))
            }
            _ => None,
        }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        match self {
            Self::Simple { .. } => ChecksumAlgorithm::Simple,
            Self::Crc32(_) => ChecksumAlgorithm::Crc32,
            Self::Sha256(_) => ChecksumAlgorithm::Sha256,
        }
    }

    pub fn update(&mut self, mut data: &[u8]) {
        match self {
            Self::Simple {
                low,
                high,
                carry,
                carry_len,
            } => {
                if *carry_len > 0 {
                    let take = (4 - *carry_len).min(data.len());
                    carry[*carry_len..*carry_len + take].copy_from_slice(&data[..take]);
                    *carry_len += take;
                    data = &data[take..];
                    if *carry_len < 4 {
                        return;
                    }
                    fold_word(low, high, u32::from_be_bytes(*carry));
                    *carry_len = 0;
                }
                let mut words = data.chunks_exact(4);
                for word in &mut words {
                    fold_word(low, high, u32::from_be_bytes([word[0], word[1], word[2], word[3]]));
                }
                let rest = words.remainder();
                carry[..rest.len()].copy_from_slice(rest);
                *carry_len = rest.len();
            }
            Self::Crc32(hasher) => hasher.update(data),
            Self::Sha256(hasher) => hasher.update(data),
        }
    }

    /// Current value; trailing bytes of an incomplete word are zero padded.
    pub fn value(&self) -> ChecksumValue {
        match self {
            Self::Simple {
                low,
                high,
                carry,
                carry_len,
            } => {
                let (mut low, mut high) = (*low, *high);
                if *carry_len > 0 {
                    let mut word = [0u8; 4];
                    word[..*carry_len].copy_from_slice(&carry[..*carry_len]);
                    fold_word(&mut low, &mut high, u32::from_be_bytes(word));
                }
                ChecksumValue([
                    (low >> 32) as u32,
                    low as u32,
                    (high >> 32) as u32,
                    high as u32,
                ])
            }
            Self::Crc32(hasher) => ChecksumValue([hasher.clone().finalize(), 0, 0, 0]),
            Self::Sha256(hasher) => {
                let digest = hasher.clone().finalize();
                let mut words = [0u32; 4];
                for (idx, word) in words.iter_mut().enumerate() {
                    let at = idx * 4;
                    *word = u32::from_be_bytes([
                        digest[at],
                        digest[at + 1],
                        digest[at + 2],
                        digest[at + 3],
                    ]);
                }
                ChecksumValue(words)
            }
        }
    }
}

fn fold_word(low: &mut u64, high: &mut u64, word: u32) {
    *low = low.wrapping_add(word as u64);
    *high = high.wrapping_add(*low);
}

/// One-pass checksum of `data`.
pub fn checksum_of(algorithm: ChecksumAlgorithm, data: &[u8], len: u64, long_name: bool) -> ChecksumValue {
    let mut state = ChecksumState::new(algorithm, len, long_name);
    state.update(data);
    state.value()
}

/// Compares a computed value with the recorded one.
///
/// A mismatch of the simple algorithm is retried once against the byte-swapped value,
/// which is how archives written with the historical word-order bug recorded it.
pub fn compare_values(
    algorithm: ChecksumAlgorithm,
    recorded: ChecksumValue,
    computed: ChecksumValue,
) -> Result<()> {
    if recorded == computed {
        return Ok(());
    }
    if algorithm == ChecksumAlgorithm::Simple && recorded == computed.byte_swapped() {
        telemetry::increment_counter(
            tags::METRIC_CHECKSUM_REPAIRED_COUNT,
            1,
            &[("subsystem", "checksum"), ("op", "compare")],
        );
        return Ok(());
    }
    telemetry::increment_counter(
        tags::METRIC_CHECKSUM_MISMATCH_COUNT,
        1,
        &[("subsystem", "checksum"), ("op", "compare")],
    );
    Err(StagerError::ChecksumMismatch {
        expected: recorded.0,
        actual: computed.0,
    })
}
