use crate::buffer::RingBuffer;
use crate::error::StageErrno;
use crate::format::{HeaderCodec, HeaderFormat, HeaderStep, TAR_RECORD_SIZE};
use crate::media::{Media, MediaSource};
use crate::sync::lock_unpoisoned;
use crate::telemetry;
use crate::telemetry::tags;

use super::{MovePlan, PipelineShared, PipelineState, ReaderReport, StageJob};

pub(super) fn run_reader(shared: &PipelineShared) {
    loop {
        shared.read_ready.wait();
        if shared.is_shutdown() {
            return;
        }
        let Some(job) = lock_unpoisoned(&shared.job).clone() else {
            continue;
        };

        let report = read_file(shared, &job);
        shared.move_done.wait();
        *lock_unpoisoned(&shared.report) = report;
        shared.read_done.post();
    }
}

/// Where the first published block starts and what has to be recognized in it.
struct ReadPlan {
    first_block: u64,
    in_block: u64,
    codec: Option<HeaderCodec>,
}

fn plan_read(shared: &PipelineShared, job: &StageJob, block_size: u64, file_addressed: bool) -> ReadPlan {
    let record_start = job.section.offset * TAR_RECORD_SIZE as u64;
    let (start, codec) = match (job.header, job.known_header_len) {
        (HeaderFormat::None, _) => (record_start + job.data_skip, None),
        (_, Some(header_len)) => (record_start + header_len as u64 + job.data_skip, None),
        (format, None) => (
            record_start,
            Some(HeaderCodec::new(
                shared.scratch.clone(),
                format,
                job.requested,
                job.verify,
            )),
        ),
    };
    let block_off = start / block_size;
    ReadPlan {
        first_block: if file_addressed {
            block_off
        } else {
            job.section.position + block_off
        },
        in_block: start % block_size,
        codec,
    }
}

/// Reads the blocks of one file into the read ring.
///
/// Posts `move_ready` exactly once: as soon as the skip is known, or with the failure
/// when the file is abandoned before any data could move.
fn read_file(shared: &PipelineShared, job: &StageJob) -> ReaderReport {
    let ring = shared.read_ring();
    let mut guard = lock_unpoisoned(&shared.media);
    let Some(media) = guard.as_mut() else {
        post_failure(shared, &ring, StageErrno::NoDevice);
        return ReaderReport::default();
    };

    let block_size = media.block_size() as u64;
    if block_size == 0 {
        post_failure(shared, &ring, StageErrno::InvalidArgument);
        return ReaderReport::default();
    }
    let file_addressed = media.is_file_addressed();
    let ReadPlan {
        first_block,
        in_block,
        mut codec,
    } = plan_read(shared, job, block_size, file_addressed);

    shared.set_state(PipelineState::Positioning);
    if file_addressed {
        if let Err(err) = media.next_file(&job.section) {
            post_failure(shared, &ring, err.errno());
            return ReaderReport::default();
        }
    }

    let mut report = ReaderReport::default();
    let mut retries_left = job.retries;
    // Bytes to drop from the first published block; complete once the header is known.
    let mut skip = in_block;
    let mut published: u64 = 0;
    let mut block = first_block;
    let mut plan_posted = false;

    if let Some(index) = ring.find_block_by_number(first_block) {
        let len = ring.tag(index).map_or(0, |tag| tag.len) as u64;
        tracing::debug!(target: tags::TARGET_PIPELINE, id = %job.id, block, "header block already buffered");
        if let (Some(codec), Some(cell)) = (codec.as_mut(), ring.cell(index)) {
            shared.set_state(PipelineState::HeaderValidating);
            let data = match cell.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let at = (in_block as usize).min(len as usize);
            match codec.feed(&data[at..len as usize]) {
                Ok(HeaderStep::Validated { header_len, .. }) => {
                    report.header_len = Some(header_len);
                    skip = in_block + header_len as u64 + job.data_skip;
                }
                Ok(HeaderStep::Incomplete) => {}
                Err(err) => {
                    drop(data);
                    reject_header(shared, &ring, job, &err);
                    return report;
                }
            }
        }
        if report.header_len.is_some() {
            codec = None;
        }
        published = len;
        block += 1;
    }

    let mut failure = None;
    loop {
        if codec.is_none() && !plan_posted {
            post_plan(
                shared,
                MovePlan {
                    skip,
                    bytes: job.data_len,
                    error: None,
                },
            );
            plan_posted = true;
        }
        if plan_posted && published >= skip + job.data_len {
            break;
        }
        if shared.cancel.is_canceled() {
            failure = Some(StageErrno::Canceled);
            break;
        }

        if media.position() != block {
            shared.set_state(PipelineState::Positioning);
            if let Err(err) = media.seek(block, &shared.cancel) {
                failure = Some(err.errno());
                break;
            }
            if shared.cancel.is_canceled() {
                failure = Some(StageErrno::Canceled);
                break;
            }
        }

        let Some(mut slot) = ring.reserve_for_write() else {
            failure = Some(StageErrno::Canceled);
            break;
        };
        shared.set_state(PipelineState::Reading);
        let count = match read_block(shared, media, &mut slot, block, &mut retries_left) {
            Ok(0) => Err(StageErrno::Io),
            other => other,
        };
        report.retries_used = job.retries - retries_left;
        let count = match count {
            Ok(count) => count,
            Err(errno) => {
                drop(slot);
                failure = Some(errno);
                break;
            }
        };
        slot.set_len(count);
        slot.set_block(block);

        if let Some(active) = codec.as_mut() {
            shared.set_state(PipelineState::HeaderValidating);
            let at = if published == 0 { (in_block as usize).min(count) } else { 0 };
            match active.feed(&slot[at..count]) {
                Ok(HeaderStep::Validated { header_len, .. }) => {
                    report.header_len = Some(header_len);
                    skip = in_block + header_len as u64 + job.data_skip;
                    codec = None;
                }
                Ok(HeaderStep::Incomplete) => {}
                Err(err) => {
                    drop(slot);
                    reject_header(shared, &ring, job, &err);
                    return report;
                }
            }
        }
        published += count as u64;
        block += 1;
        ring.advance_write(slot);
    }

    if let Some(errno) = failure {
        tracing::warn!(
            target: tags::TARGET_PIPELINE,
            id = %job.id,
            block,
            error = %errno,
            "media read abandoned"
        );
        if !plan_posted {
            post_failure(shared, &ring, errno);
        } else if errno == StageErrno::Canceled {
            shared.interrupt();
        } else if let Some(mut slot) = ring.reserve_for_write() {
            slot.set_block(block);
            slot.set_error(errno);
            ring.advance_write(slot);
        }
    }
    report
}

/// Reads one block, retrying in place after repositioning while the budget allows.
fn read_block(
    shared: &PipelineShared,
    media: &mut Media,
    slot: &mut [u8],
    block: u64,
    retries_left: &mut u8,
) -> Result<usize, StageErrno> {
    loop {
        match media.read(slot) {
            Ok(count) => return Ok(count),
            Err(err) => {
                let errno = err.errno();
                if !errno.is_retryable_read() || *retries_left == 0 || shared.cancel.is_canceled() {
                    return Err(errno);
                }
                *retries_left -= 1;
                telemetry::increment_counter(
                    tags::METRIC_MEDIA_READ_RETRY_COUNT,
                    1,
                    &[("subsystem", "media"), ("op", "read")],
                );
                tracing::warn!(
                    target: tags::TARGET_PIPELINE,
                    block,
                    error = %errno,
                    retries_left = *retries_left,
                    "read error, repositioning"
                );
                media.seek(block, &shared.cancel).map_err(|err| err.errno())?;
            }
        }
    }
}

fn reject_header(
    shared: &PipelineShared,
    ring: &RingBuffer,
    job: &StageJob,
    err: &crate::format::HeaderError,
) {
    telemetry::increment_counter(
        tags::METRIC_HEADER_REJECT_COUNT,
        1,
        &[("subsystem", "pipeline"), ("op", "header")],
    );
    tracing::warn!(
        target: tags::TARGET_PIPELINE,
        id = %job.id,
        position = job.section.position,
        offset = job.section.offset,
        error = %err,
        "archive header rejected"
    );
    post_failure(shared, ring, StageErrno::HeaderFormat);
}

fn post_failure(shared: &PipelineShared, ring: &RingBuffer, errno: StageErrno) {
    ring.reset();
    post_plan(
        shared,
        MovePlan {
            skip: 0,
            bytes: 0,
            error: Some(errno),
        },
    );
}

fn post_plan(shared: &PipelineShared, plan: MovePlan) {
    *lock_unpoisoned(&shared.plan) = plan;
    shared.move_ready.post();
}
