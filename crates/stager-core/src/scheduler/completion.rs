//! Done-list processing: retry, copy switch, multivolume continuation, and the final
//! response to the filesystem.

use crate::context::StagerContext;
use crate::error::{ErrorClass, StageErrno};
use crate::request::StageRequest;
use crate::telemetry;
use crate::telemetry::tags;
use crate::types::{CopyFlags, RequestFlags, RequestId};

/// Tally of one done-list pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompletionOutcome {
    pub processed: usize,
    pub succeeded: usize,
    /// Terminal failures, duplicates and cancellations answered.
    pub failed: usize,
    /// Same copy tried again after a transient error.
    pub retried: usize,
    pub copy_switches: usize,
    pub continuations: usize,
    /// Requests sent to their worker to close a retained descriptor first.
    pub cleanups: usize,
}

/// Drains the done list.
///
/// Requests that need more work are resubmitted to the scheduler; everything else is
/// answered and freed.
pub fn check_requests(ctx: &StagerContext) -> CompletionOutcome {
    let mut outcome = CompletionOutcome::default();
    while let Some(index) = ctx.store.take_done() {
        outcome.processed += 1;
        let Some(request) = ctx.store.get(index) else {
            continue;
        };

        if request.flags.contains(RequestFlags::DUPLICATE) {
            respond(ctx, &request, Err(StageErrno::AlreadyExists));
            ctx.store.delete(index);
            outcome.failed += 1;
            continue;
        }
        if request.flags.contains(RequestFlags::CANCEL) {
            if request.flags.contains(RequestFlags::DCACHE) {
                send_to_cleanup(ctx, index);
                outcome.cleanups += 1;
            } else {
                finish(ctx, index, &request, Err(StageErrno::Canceled));
                outcome.failed += 1;
            }
            continue;
        }

        match request.error {
            Some(errno) => handle_error(ctx, index, &request, errno, &mut outcome),
            None if request.flags.contains(RequestFlags::MULTIVOL) => {
                continue_multivolume(ctx, index, &request, &mut outcome);
            }
            None => {
                finish(ctx, index, &request, Ok(()));
                outcome.succeeded += 1;
            }
        }
    }
    outcome
}

fn handle_error(
    ctx: &StagerContext,
    index: RequestId,
    request: &StageRequest,
    errno: StageErrno,
    outcome: &mut CompletionOutcome,
) {
    let class = errno.class();
    let no_retry = request.flags.contains(RequestFlags::NO_RETRY);

    if class == ErrorClass::Transient && request.retry > 0 && !no_retry {
        ctx.store.update(index, |request| {
            request.retry -= 1;
            request.error = None;
            request.stage_size = 0;
            request.flags.remove(RequestFlags::ACTIVE | RequestFlags::DONE);
            if request.write_off > request.section_base {
                request.flags.insert(RequestFlags::SKIP_HEADER);
            }
        });
        tracing::info!(target: tags::TARGET_SCHEDULER, slot = index, ino = request.id.ino, error = %errno, retry = request.retry - 1, "transient error, retrying");
        ctx.submit(index);
        outcome.retried += 1;
        return;
    }

    let damaged = ctx.store.damage_arcopy(index);
    let current = request.copy;
    let next = ctx.store.arcopy(index, current as usize + 1);
    let terminal = no_retry
        || class == ErrorClass::Fatal
        || request.is_continuation()
        || request.flags.contains(RequestFlags::EXTENDED)
        || next.is_none()
        || (!damaged && next == Some(current));

    if terminal {
        if request.flags.contains(RequestFlags::DCACHE) {
            send_to_cleanup(ctx, index);
            outcome.cleanups += 1;
            return;
        }
        telemetry::increment_counter(
            tags::METRIC_REQUEST_TERMINAL_ERROR_COUNT,
            1,
            &[("subsystem", "request"), ("op", "complete")],
        );
        tracing::warn!(
            target: tags::TARGET_SCHEDULER,
            slot = index,
            ino = request.id.ino,
            copy = current,
            damaged,
            error = %errno,
            "stage failed"
        );
        finish(ctx, index, request, Err(errno));
        outcome.failed += 1;
        return;
    }

    let Some(next) = next else {
        return;
    };
    let max_retries = ctx.store.max_retries();
    ctx.store.update(index, |request| {
        request.copy = next;
        request.flags.remove(
            RequestFlags::ACTIVE | RequestFlags::DONE | RequestFlags::SKIP_HEADER | RequestFlags::PAX_HEADER,
        );
        request.flags.insert(RequestFlags::RETRY);
        request.retry = max_retries;
        request.error = None;
        request.stage_size = 0;
        request.header_len = 0;
        request.vsn_cnt = 0;
        request.section_base = 0;
        let copy = request.current().clone();
        request.flags.set(RequestFlags::MULTIVOL, copy.is_multivolume());
        request.flags.set(
            RequestFlags::PAX_HEADER,
            copy.flags.contains(CopyFlags::PAX_HEADER),
        );
        if request.write_off > 0 || request.offset > 0 {
            request.flags.insert(RequestFlags::SKIP_HEADER);
        }
    });
    telemetry::increment_counter(
        tags::METRIC_REQUEST_COPY_SWITCH_COUNT,
        1,
        &[("subsystem", "request"), ("op", "copy_switch")],
    );
    tracing::info!(
        target: tags::TARGET_SCHEDULER,
        slot = index,
        ino = request.id.ino,
        from = current,
        to = next,
        damaged,
        error = %errno,
        "switching archive copy"
    );
    ctx.submit(index);
    outcome.copy_switches += 1;
}

/// Moves a multivolume request on to its next section, or hands the open descriptor to
/// the follow-on request once this request's sections are used up.
fn continue_multivolume(ctx: &StagerContext, index: RequestId, request: &StageRequest, outcome: &mut CompletionOutcome) {
    let se_ord = request.se_ord + 1;
    let section = ctx
        .store
        .extension_section(request.id, request.fseq, request.ext_ord, request.copy, se_ord);

    if let Some(section) = section {
        tracing::debug!(
            target: tags::TARGET_SCHEDULER,
            slot = index,
            ino = request.id.ino,
            se_ord,
            vsn = %section.vsn,
            position = section.position,
            "next section"
        );
        ctx.store.update(index, |request| {
            request.current_mut().section = section;
            request.se_ord = se_ord;
            request.section_base = request.write_off;
            request.stage_size = 0;
            request.header_len = 0;
            request.flags.remove(RequestFlags::ACTIVE | RequestFlags::DONE | RequestFlags::SKIP_HEADER);
        });
        telemetry::increment_counter(
            tags::METRIC_REQUEST_CONTINUATION_COUNT,
            1,
            &[("subsystem", "request"), ("op", "section")],
        );
        ctx.submit(index);
        outcome.continuations += 1;
        return;
    }

    let Some(follower) = ctx.store.find_next_extended(request) else {
        tracing::warn!(target: tags::TARGET_SCHEDULER, slot = index, ino = request.id.ino, se_ord, "multivolume chain ends early");
        let errno = StageErrno::Io;
        ctx.store.update(index, |request| request.error = Some(errno));
        if request.flags.contains(RequestFlags::DCACHE) {
            ctx.store.update(index, |request| request.flags.insert(RequestFlags::NO_RETRY));
            send_to_cleanup(ctx, index);
            outcome.cleanups += 1;
        } else {
            finish(ctx, index, request, Err(errno));
            outcome.failed += 1;
        }
        return;
    };

    ctx.store.update(follower, |next| {
        next.copy = request.copy;
        next.dcache = request.dcache;
        next.context = request.context;
        next.write_off = request.write_off;
        next.section_base = request.write_off;
        next.vsn_cnt = request.vsn_cnt;
        next.stage_size = 0;
        next.checksum = request.checksum;
        next.flags.set(RequestFlags::DCACHE, request.flags.contains(RequestFlags::DCACHE));
        next.flags.set(RequestFlags::CSUSE, request.flags.contains(RequestFlags::CSUSE));
        next.flags.insert(RequestFlags::MULTIVOL);
        next.flags.remove(RequestFlags::HELD);
    });
    ctx.store.delete(index);
    telemetry::increment_counter(
        tags::METRIC_REQUEST_CONTINUATION_COUNT,
        1,
        &[("subsystem", "request"), ("op", "extension")],
    );
    tracing::debug!(
        target: tags::TARGET_SCHEDULER,
        slot = index,
        follower,
        ino = request.id.ino,
        ext_ord = request.ext_ord + 1,
        "descriptor handed to follow-on request"
    );
    ctx.submit(follower);
    outcome.continuations += 1;
}

/// Routes a request back to the worker retaining its descriptor so the descriptor is
/// closed before the filesystem is answered.
fn send_to_cleanup(ctx: &StagerContext, index: RequestId) {
    ctx.store.update(index, |request| {
        request.flags.remove(RequestFlags::ACTIVE | RequestFlags::DONE);
        request.flags.insert(RequestFlags::DCACHE_CLOSE | RequestFlags::NO_RETRY);
    });
    tracing::debug!(target: tags::TARGET_SCHEDULER, slot = index, "closing retained descriptor");
    ctx.submit(index);
}

/// Answers the filesystem and frees the request with any follow-on requests still held
/// behind it.
fn finish(ctx: &StagerContext, index: RequestId, request: &StageRequest, result: Result<(), StageErrno>) {
    respond(ctx, request, result);
    if result.is_err() {
        let mut cursor = ctx.store.find_next_extended(request);
        while let Some(follower) = cursor {
            let Some(held) = ctx.store.delete(follower) else {
                break;
            };
            tracing::debug!(target: tags::TARGET_SCHEDULER, slot = follower, ext_ord = held.ext_ord, "held extension dropped");
            cursor = ctx.store.find_next_extended(&held);
        }
    }
    ctx.store.delete(index);
}

fn respond(ctx: &StagerContext, request: &StageRequest, result: Result<(), StageErrno>) {
    if let Err(err) = ctx.fs.respond(request.id, request.fseq, result) {
        tracing::error!(target: tags::TARGET_SCHEDULER, ino = request.id.ino, error = %err, "stage response failed");
    }
}
