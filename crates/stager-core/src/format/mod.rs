//! Archive record headers found in front of each file's data on media.

mod codec;
mod consts;
mod pax;
mod tar;

use thiserror::Error;

pub use codec::{HeaderCodec, HeaderFormat, HeaderStep, header_size, validate};
pub use consts::{LEGACY_SIZE_MAX, TAR_RECORD_SIZE, round_to_record};
pub use pax::ExtendedHeader;
pub use tar::{
    ClassicHeader, SizeCandidates, check_magic, parse_octal, size_candidates, verify_record,
};

/// Reasons an archive header is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("tar magic not found")]
    BadMagic,
    #[error("header checksum {stored:o} does not match computed {computed:o}")]
    BadChecksum { stored: u32, computed: u32 },
    #[error("header size field is not a number")]
    InvalidSizeField,
    #[error("header declares {found} bytes, request is for {expected}")]
    SizeMismatch { expected: u64, found: u64 },
    #[error("header needs {needed} bytes, only {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("malformed extended header: {0}")]
    MalformedExtended(&'static str),
}
