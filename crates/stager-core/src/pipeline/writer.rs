use std::io;

use crate::checksum::ChecksumAccumulator;
use crate::collab::CacheFile;
use crate::error::StageErrno;
use crate::sync::lock_unpoisoned;
use crate::telemetry::tags;

use super::{PipelineShared, PipelineState};

#[derive(Debug, Default)]
pub(super) struct WriteReport {
    pub(super) bytes: u64,
    pub(super) error: Option<StageErrno>,
}

/// Drains the write ring into `cache`, starting at `cache_offset`.
///
/// Each block is handed to the checksum thread before it is written and is only given back
/// to the ring once the fold has finished with it.
pub(super) fn write_file(
    shared: &PipelineShared,
    cache: &mut dyn CacheFile,
    cache_offset: u64,
    checksum: Option<&ChecksumAccumulator>,
) -> WriteReport {
    shared.write_ready.wait();
    let plan = *lock_unpoisoned(&shared.plan);
    let ring = &shared.write_ring;
    let mut report = WriteReport::default();
    let mut remaining = plan.bytes;

    shared.set_state(PipelineState::Writing);
    while remaining > 0 || plan.error.is_some() {
        if shared.cancel.is_canceled() {
            report.error = Some(StageErrno::Canceled);
            shared.interrupt();
            break;
        }
        let Some(slot) = ring.wait_for_data() else {
            report.error = Some(StageErrno::Canceled);
            break;
        };
        if let Some(errno) = slot.error() {
            ring.advance_read(slot);
            report.error = Some(errno);
            break;
        }

        let data = slot.bytes();
        let count = data.len().min(remaining.min(usize::MAX as u64) as usize);
        if let Some(acc) = checksum {
            acc.feed(slot.cell(), 0..count);
        }
        let result = write_all_at(cache, cache_offset + report.bytes, &data[..count]);
        if let Some(acc) = checksum {
            acc.wait_for_block();
        }
        ring.advance_read(slot);

        if let Err(err) = result {
            let errno = StageErrno::from(&err);
            tracing::warn!(
                target: tags::TARGET_PIPELINE,
                offset = cache_offset + report.bytes,
                error = %err,
                "cache write failed"
            );
            report.error = Some(errno);
            shared.interrupt();
            break;
        }
        report.bytes += count as u64;
        remaining -= count as u64;
    }
    report
}

fn write_all_at(cache: &mut dyn CacheFile, mut offset: u64, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        let written = cache.write_at(offset, data)?;
        if written == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "cache file accepted no bytes"));
        }
        offset += written as u64;
        data = &data[written..];
    }
    Ok(())
}
