use crate::buffer::{RingBuffer, WriteSlot};
use crate::error::StageErrno;
use crate::sync::lock_unpoisoned;
use crate::telemetry::tags;

use super::{MovePlan, PipelineShared, PipelineState};

pub(super) fn run_reblocker(shared: &PipelineShared) {
    loop {
        shared.move_ready.wait();
        if shared.is_shutdown() {
            return;
        }
        let plan = *lock_unpoisoned(&shared.plan);
        let read_ring = shared.read_ring();
        shared.write_ready.post();

        match plan.error {
            Some(errno) => push_error(&shared.write_ring, errno),
            None => {
                shared.set_state(PipelineState::Reblocking);
                move_blocks(shared, &read_ring, plan);
            }
        }
        shared.move_done.post();
    }
}

/// Copies `plan.bytes` after `plan.skip` from read-ring blocks into write-ring blocks.
fn move_blocks(shared: &PipelineShared, read_ring: &RingBuffer, plan: MovePlan) {
    let write_ring = &shared.write_ring;
    let mut skip = plan.skip;
    let mut remaining = plan.bytes;
    let mut out: Option<WriteSlot<'_>> = None;
    let mut filled = 0usize;

    while skip > 0 || remaining > 0 {
        if shared.cancel.is_canceled() {
            shared.interrupt();
            return;
        }
        let Some(input) = read_ring.wait_for_data() else {
            return;
        };
        if let Some(errno) = input.error() {
            read_ring.advance_read(input);
            if let Some(mut slot) = out.take() {
                slot.set_len(filled);
                write_ring.advance_write(slot);
            }
            tracing::debug!(target: tags::TARGET_PIPELINE, error = %errno, "forwarding read error");
            push_error(write_ring, errno);
            return;
        }

        let mut interrupted = false;
        {
            let bytes = input.bytes();
            let mut at = 0usize;
            if skip > 0 {
                let dropped = skip.min(bytes.len() as u64);
                at = dropped as usize;
                skip -= dropped;
            }
            while at < bytes.len() && remaining > 0 {
                if out.is_none() {
                    match write_ring.reserve_for_write() {
                        Some(slot) => {
                            out = Some(slot);
                            filled = 0;
                        }
                        None => {
                            interrupted = true;
                            break;
                        }
                    }
                }
                let Some(slot) = out.as_mut() else {
                    break;
                };
                let take = (bytes.len() - at)
                    .min(slot.capacity() - filled)
                    .min(remaining.min(usize::MAX as u64) as usize);
                slot[filled..filled + take].copy_from_slice(&bytes[at..at + take]);
                filled += take;
                at += take;
                remaining -= take as u64;

                if filled == slot.capacity() || remaining == 0 {
                    if let Some(mut full) = out.take() {
                        full.set_len(filled);
                        write_ring.advance_write(full);
                    }
                }
            }
        }
        read_ring.advance_read(input);
        if interrupted {
            return;
        }
    }
}

fn push_error(ring: &RingBuffer, errno: StageErrno) {
    if let Some(mut slot) = ring.reserve_for_write() {
        slot.set_len(0);
        slot.set_error(errno);
        ring.advance_write(slot);
    }
}
