use serde::{Deserialize, Serialize};

use super::HeaderError;
use super::consts::{
    LEGACY_SIZE_MAX, SIZE_RANGE, TAR_RECORD_SIZE, TYPE_GNU_LONGNAME, TYPEFLAG_OFFSET,
    round_to_record,
};
use super::pax::ExtendedHeader;
use super::tar::{check_magic, parse_octal, size_candidates, verify_record};
use crate::buffer::{ScratchBuffer, ScratchPool};

/// Header layout expected in front of a file's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum HeaderFormat {
    /// Data starts immediately (continuation sections, silo objects).
    None,
    /// 512-byte tar record, optionally preceded by a GNU long-name record.
    #[default]
    Classic,
    /// POSIX extended header.
    Extended,
}

/// Length of the header at the start of `buffer`.
///
/// Only the fixed-size prefix is inspected, so one record is enough.
pub fn header_size(buffer: &[u8], format: HeaderFormat) -> Result<usize, HeaderError> {
    sized(buffer, format, true)
}

/// With `strict` unset the record checksum is not checked, only the magic.
fn sized(buffer: &[u8], format: HeaderFormat, strict: bool) -> Result<usize, HeaderError> {
    match format {
        HeaderFormat::None => Ok(0),
        HeaderFormat::Classic => {
            if strict {
                verify_record(buffer)?;
            } else {
                check_magic(buffer)?;
            }
            if buffer[TYPEFLAG_OFFSET] == TYPE_GNU_LONGNAME {
                let name_len =
                    parse_octal(&buffer[SIZE_RANGE]).ok_or(HeaderError::InvalidSizeField)?;
                Ok(2 * TAR_RECORD_SIZE + round_to_record(name_len) as usize)
            } else {
                Ok(TAR_RECORD_SIZE)
            }
        }
        HeaderFormat::Extended if strict => ExtendedHeader::total_len(buffer),
        HeaderFormat::Extended => ExtendedHeader::declared_len(buffer),
    }
}

/// Validates a complete header and returns its length.
///
/// With `verify` unset only the magic is required and the length is taken from the
/// prefix; the declared size is ignored because the local chunk legitimately differs
/// from the file size.
pub fn validate(
    buffer: &[u8],
    format: HeaderFormat,
    requested: u64,
    verify: bool,
) -> Result<usize, HeaderError> {
    let total = sized(buffer, format, verify)?;
    if buffer.len() < total {
        return Err(HeaderError::Truncated {
            needed: total,
            available: buffer.len(),
        });
    }

    match format {
        HeaderFormat::None => Ok(0),
        HeaderFormat::Classic => {
            if verify {
                let entry = &buffer[total - TAR_RECORD_SIZE..total];
                if total > TAR_RECORD_SIZE {
                    verify_record(entry)?;
                }
                check_classic_size(&entry[SIZE_RANGE], requested)?;
            }
            Ok(total)
        }
        HeaderFormat::Extended => {
            if verify {
                let found = ExtendedHeader::decode(&buffer[..total])?.size()?;
                if found != requested {
                    return Err(HeaderError::SizeMismatch {
                        expected: requested,
                        found,
                    });
                }
            }
            Ok(total)
        }
    }
}

fn check_classic_size(field: &[u8], requested: u64) -> Result<(), HeaderError> {
    let candidates = size_candidates(field)?;
    if candidates.contains(requested) {
        return Ok(());
    }
    // Old archivers stored only the low bits of sizes past the legacy field width.
    if requested > LEGACY_SIZE_MAX && candidates.contains(requested & LEGACY_SIZE_MAX) {
        return Ok(());
    }
    Err(HeaderError::SizeMismatch {
        expected: requested,
        found: candidates.first().unwrap_or(0),
    })
}

/// Progress of header recognition over successive ring blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderStep {
    /// The header continues in the next block.
    Incomplete,
    /// Header accepted; `residual` data bytes follow it in the last block fed.
    Validated { header_len: usize, residual: usize },
}

/// Incremental header validator for one file.
///
/// A header inside a single block is validated in place; one that spans blocks is copied
/// into a pooled scratch buffer first.
#[derive(Debug)]
pub struct HeaderCodec {
    format: HeaderFormat,
    requested: u64,
    verify: bool,
    pool: ScratchPool,
    scratch: Option<ScratchBuffer>,
    needed: Option<usize>,
}

impl HeaderCodec {
    pub fn new(pool: ScratchPool, format: HeaderFormat, requested: u64, verify: bool) -> Self {
        Self {
            format,
            requested,
            verify,
            pool,
            scratch: None,
            needed: None,
        }
    }

    pub fn format(&self) -> HeaderFormat {
        self.format
    }

    /// Feeds the next chunk of bytes starting at the header (first call) or continuing it.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<HeaderStep, HeaderError> {
        if self.format == HeaderFormat::None {
            return Ok(HeaderStep::Validated {
                header_len: 0,
                residual: chunk.len(),
            });
        }

        if self.scratch.is_none() && chunk.len() >= TAR_RECORD_SIZE {
            let needed = sized(chunk, self.format, self.verify)?;
            if chunk.len() >= needed {
                let header_len = validate(&chunk[..needed], self.format, self.requested, self.verify)?;
                return Ok(HeaderStep::Validated {
                    header_len,
                    residual: chunk.len() - header_len,
                });
            }
            self.needed = Some(needed);
        }

        let pool = &self.pool;
        let scratch = self.scratch.get_or_insert_with(|| pool.acquire());
        let mut used = 0;
        loop {
            let target = self.needed.unwrap_or(TAR_RECORD_SIZE);
            let take = target.saturating_sub(scratch.len()).min(chunk.len() - used);
            scratch.extend_from_slice(&chunk[used..used + take]);
            used += take;
            if scratch.len() < target {
                return Ok(HeaderStep::Incomplete);
            }
            if self.needed.is_none() {
                self.needed = Some(sized(&scratch[..], self.format, self.verify)?);
                continue;
            }
            let header_len = validate(&scratch[..], self.format, self.requested, self.verify)?;
            self.scratch = None;
            self.needed = None;
            return Ok(HeaderStep::Validated {
                header_len,
                residual: chunk.len() - used,
            });
        }
    }
}
