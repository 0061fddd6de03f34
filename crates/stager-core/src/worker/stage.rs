use std::sync::{Arc, Mutex};
use std::time::Instant;

use super::ExitStatus;
use super::copy::{DriveWorker, Retained};
use crate::checksum::{ChecksumState, compare_values};
use crate::collab::CacheOpen;
use crate::error::StageErrno;
use crate::media::MediaSource;
use crate::pipeline::StageJob;
use crate::request::StageRequest;
use crate::stream::{Stream, StreamFlags, StreamId};
use crate::sync::lock_unpoisoned;
use crate::telemetry::tags;
use crate::types::{CacheHandle, MediaType, RequestFlags, RequestId, Vsn};

impl DriveWorker {
    /// Drains one bound stream.
    ///
    /// Returns the exit status when the drive can no longer be used.
    pub(super) fn process_stream(&mut self, id: StreamId) -> Result<(), ExitStatus> {
        let Some(stream) = self.ctx.streams.get(id) else {
            tracing::warn!(target: tags::TARGET_WORKER, pid = self.pid, stream = id, "bound stream vanished");
            return Ok(());
        };
        let (vsn, media, cleanup, unavailable, count) = {
            let stream = lock_unpoisoned(&stream);
            (
                stream.vsn.clone(),
                stream.media,
                stream.is_cleanup(),
                stream.flags.contains(StreamFlags::UNAVAIL),
                stream.count,
            )
        };
        self.ctx.telemetry.on_stream_bound(self.pid, &vsn, count);

        if cleanup || unavailable {
            self.close_members(&stream, unavailable);
            self.finish_stream(&stream);
            return Ok(());
        }

        if let Err(errno) = self.mount(&vsn, media) {
            tracing::warn!(target: tags::TARGET_WORKER, pid = self.pid, vsn = %vsn, error = %errno, "mount failed");
            self.fail_members(&stream, errno);
            self.finish_stream(&stream);
            if errno == StageErrno::NoDevice {
                return Err(ExitStatus::DeviceLost);
            }
            return Ok(());
        }

        let max_errors = self.ctx.config.worker.max_copy_stream_errors;
        let mut errors = 0usize;
        loop {
            let Some(index) = lock_unpoisoned(&stream).first() else {
                break;
            };
            self.ctx.store.update(index, |request| request.flags.insert(RequestFlags::ACTIVE));
            if self.stage_one(index) {
                errors += 1;
            }
            lock_unpoisoned(&stream).remove(&self.ctx.store, index);
            self.ctx.set_done(index);

            if max_errors > 0 && errors > max_errors {
                self.reject_remaining(&stream, errors);
                break;
            }
        }
        self.finish_stream(&stream);
        Ok(())
    }

    /// Marks the stream done. Requests spliced in after the last drain go back to the
    /// scheduler.
    fn finish_stream(&self, stream: &Arc<Mutex<Stream>>) {
        let leftovers = {
            let mut stream = lock_unpoisoned(stream);
            let mut leftovers = Vec::new();
            while let Some(index) = stream.remove_first(&self.ctx.store) {
                leftovers.push(index);
            }
            stream.flags.insert(StreamFlags::DONE);
            leftovers
        };
        for index in leftovers {
            self.ctx.store.update(index, |request| request.flags.remove(RequestFlags::ACTIVE));
            self.ctx.submit(index);
        }
        self.ctx.wake.post();
    }

    /// Mounts `vsn` unless it is already the attached medium.
    fn mount(&mut self, vsn: &Vsn, media: MediaType) -> Result<(), StageErrno> {
        if self.mounted.as_ref() == Some(vsn) && self.pipeline.has_media() {
            return Ok(());
        }
        if let Some(mut previous) = self.pipeline.detach() {
            if let Err(err) = previous.unload() {
                tracing::warn!(target: tags::TARGET_WORKER, pid = self.pid, error = %err, "unload failed");
            }
        }
        self.mounted = None;

        let volume = self
            .ctx
            .catalog
            .find_volume(vsn, media)
            .ok_or(StageErrno::NoDevice)?;
        let mut medium = self
            .ctx
            .media
            .open(&volume, self.drive)
            .map_err(|err| err.errno())?;
        let block_size = medium.load(vsn).map_err(|err| err.errno())?;
        tracing::info!(
            target: tags::TARGET_WORKER,
            pid = self.pid,
            vsn = %vsn,
            media = %media,
            block_size,
            "volume mounted"
        );
        self.pipeline.attach(medium);
        self.mounted = Some(vsn.clone());
        Ok(())
    }

    /// Closes the descriptors retained for a cleanup stream or a stream whose volume
    /// cannot be used, finishing every member.
    fn close_members(&mut self, stream: &Arc<Mutex<Stream>>, unavailable: bool) {
        loop {
            let Some(index) = lock_unpoisoned(stream).remove_first(&self.ctx.store) else {
                break;
            };
            let handle = self.ctx.store.with(index, |request| request.dcache).flatten();
            if let Some(errno) = self.release(handle) {
                tracing::warn!(target: tags::TARGET_WORKER, pid = self.pid, slot = index, error = %errno, "retained cache file close failed");
            }
            self.ctx.store.update(index, |request| {
                request.dcache = None;
                request.context = None;
                request.flags.remove(RequestFlags::DCACHE | RequestFlags::DCACHE_CLOSE);
                if unavailable && request.error.is_none() {
                    request.error = Some(StageErrno::NoDevice);
                }
            });
            self.ctx.set_done(index);
        }
    }

    fn fail_members(&mut self, stream: &Arc<Mutex<Stream>>, errno: StageErrno) {
        loop {
            let Some(index) = lock_unpoisoned(stream).remove_first(&self.ctx.store) else {
                break;
            };
            let handle = self.ctx.store.with(index, |request| request.dcache).flatten();
            self.release(handle);
            self.ctx.store.update(index, |request| {
                request.dcache = None;
                request.context = None;
                request.flags.remove(RequestFlags::DCACHE);
                request.error = Some(errno);
            });
            self.ctx.set_done(index);
        }
    }

    /// Sends the rest of a stream that keeps failing back for a fresh composition.
    fn reject_remaining(&self, stream: &Arc<Mutex<Stream>>, errors: usize) {
        let mut requeued = 0usize;
        loop {
            let Some(index) = lock_unpoisoned(stream).remove_first(&self.ctx.store) else {
                break;
            };
            self.ctx.store.update(index, |request| request.flags.remove(RequestFlags::ACTIVE));
            self.ctx.submit(index);
            requeued += 1;
        }
        tracing::warn!(
            target: tags::TARGET_WORKER,
            pid = self.pid,
            errors,
            requeued,
            "stream error budget exhausted"
        );
    }

    fn release(&mut self, handle: Option<CacheHandle>) -> Option<StageErrno> {
        let retained = self.retained.remove(&handle?)?;
        retained.file.close().err().map(|err| StageErrno::from(&err))
    }

    /// Stages the current section of one request. Returns true when the attempt failed;
    /// a request canceled before it started does not count.
    fn stage_one(&mut self, index: RequestId) -> bool {
        let started = Instant::now();
        let Some(request) = self.ctx.store.get(index) else {
            return false;
        };
        if request.flags.contains(RequestFlags::CANCEL) {
            self.release(request.dcache);
            self.ctx.store.update(index, |request| {
                request.dcache = None;
                request.context = None;
                request.flags.remove(RequestFlags::DCACHE);
                request.error = Some(StageErrno::Canceled);
            });
            return false;
        }

        let token = self.pipeline.cancel_token();
        token.reset();
        self.ctx.register_token(index, token.clone());
        if self
            .ctx
            .store
            .with(index, |request| request.flags.contains(RequestFlags::CANCEL))
            .unwrap_or(false)
        {
            token.cancel();
        }
        self.ctx.telemetry.on_file_started(self.pid, request.id);

        let (mut file, retained_sum) = match request.dcache.and_then(|handle| self.retained.remove(&handle)) {
            Some(retained) => (retained.file, retained.checksum),
            None => {
                let open = CacheOpen {
                    id: request.id,
                    fseq: request.fseq,
                    copy: request.copy,
                    offset: request.offset,
                    len: request.len,
                    uid: request.uid,
                    gid: request.gid,
                    directio: request.directio,
                };
                match self.ctx.fs.open_cache(&open) {
                    Ok(file) => (file, None),
                    Err(errno) => {
                        tracing::warn!(target: tags::TARGET_WORKER, pid = self.pid, ino = request.id.ino, error = %errno, "cache open failed");
                        self.ctx.store.update(index, |request| {
                            request.dcache = None;
                            request.context = None;
                            request.flags.remove(RequestFlags::DCACHE);
                            request.error = Some(errno);
                        });
                        self.ctx.clear_token(index);
                        self.ctx.telemetry.on_file_failed(self.pid, request.id, started.elapsed());
                        return true;
                    }
                }
            }
        };

        let checksum = running_checksum(&request, retained_sum);
        if request.flags.contains(RequestFlags::CSUSE) && checksum.is_none() {
            tracing::warn!(target: tags::TARGET_WORKER, pid = self.pid, ino = request.id.ino, "checksum state lost, verification disabled");
            self.ctx.store.update(index, |request| request.flags.remove(RequestFlags::CSUSE));
        }
        let compare = checksum.is_some();

        let job = build_job(&request);
        let file_addressed = self
            .pipeline
            .with_media(|media| media.is_file_addressed())
            .unwrap_or(false);
        self.pipeline
            .check_buffers(&job.section.vsn, job.section.position, file_addressed);
        tracing::debug!(
            target: tags::TARGET_WORKER,
            pid = self.pid,
            ino = request.id.ino,
            position = job.section.position,
            offset = job.section.offset,
            skip = job.data_skip,
            len = job.data_len,
            "staging section"
        );
        let outcome = self.pipeline.run(job, file.as_mut(), checksum);

        let (write_off, more, mut error) = self
            .ctx
            .store
            .update(index, |request| {
                request.write_off += outcome.bytes_written;
                request.stage_size += outcome.bytes_written;
                request.retry = request.retry.saturating_sub(outcome.retries_used);
                if let Some(header_len) = outcome.header_len {
                    request.header_len = header_len as u32;
                }
                request.error = outcome.error;
                let mut more = false;
                if outcome.error.is_none() && request.flags.contains(RequestFlags::MULTIVOL) {
                    request.vsn_cnt += 1;
                    more = request.vsn_cnt < request.current().n_vsns && request.write_off < request.len;
                    if !more {
                        request.flags.remove(RequestFlags::MULTIVOL);
                    }
                }
                if request.error.is_none() && !more && request.write_off < request.len {
                    request.error = Some(StageErrno::Io);
                }
                (request.write_off, more, request.error)
            })
            .unwrap_or((0, false, Some(StageErrno::Io)));
        if error == Some(StageErrno::Io) && outcome.error.is_none() {
            tracing::warn!(target: tags::TARGET_WORKER, pid = self.pid, ino = request.id.ino, write_off, "media ran out before the file did");
        }

        let mut close = match error {
            None => !more,
            Some(StageErrno::NoDevice | StageErrno::Interrupted | StageErrno::Canceled) => true,
            Some(_) => write_off == 0,
        };

        // A mismatch keeps the descriptor so another copy can overwrite it from offset 0.
        let mut running = outcome.checksum;
        let mut restart = false;
        if close && error.is_none() && compare {
            if let Some(state) = running.as_ref() {
                match self.ctx.fs.recorded_checksum(request.id, request.fseq) {
                    Ok(recorded) => {
                        if let Err(err) = compare_values(state.algorithm(), recorded, state.value()) {
                            tracing::warn!(target: tags::TARGET_WORKER, pid = self.pid, ino = request.id.ino, error = %err, "checksum mismatch");
                            error = Some(StageErrno::ChecksumMismatch);
                            restart = true;
                            close = false;
                            running = None;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(target: tags::TARGET_WORKER, pid = self.pid, ino = request.id.ino, error = %err, "recorded checksum unavailable");
                        error = Some(err.errno());
                    }
                }
            }
        }

        if close {
            if let Err(err) = file.close() {
                tracing::warn!(target: tags::TARGET_WORKER, pid = self.pid, ino = request.id.ino, error = %err, "cache close failed");
                error = error.or(Some(StageErrno::from(&err)));
            }
            self.ctx.store.update(index, |request| {
                request.dcache = None;
                request.context = None;
                request.flags.remove(RequestFlags::DCACHE);
                request.checksum.partial = None;
                request.error = error;
            });
        } else {
            let handle = CacheHandle(self.next_handle);
            self.next_handle += 1;
            let partial = running.as_ref().map(ChecksumState::value);
            self.retained.insert(
                handle,
                Retained {
                    file,
                    checksum: running,
                },
            );
            let pid = self.pid;
            self.ctx.store.update(index, |request| {
                request.dcache = Some(handle);
                request.context = Some(pid);
                request.flags.insert(RequestFlags::DCACHE);
                request.checksum.partial = partial;
                request.error = error;
                if restart {
                    request.write_off = 0;
                    request.section_base = 0;
                    request.stage_size = 0;
                }
            });
        }

        self.ctx.clear_token(index);
        match error {
            None => {
                self.ctx
                    .telemetry
                    .on_file_finished(self.pid, request.id, outcome.bytes_written, started.elapsed());
                false
            }
            Some(errno) => {
                tracing::info!(
                    target: tags::TARGET_WORKER,
                    pid = self.pid,
                    ino = request.id.ino,
                    error = %errno,
                    retained = !close,
                    "stage attempt failed"
                );
                self.ctx.telemetry.on_file_failed(self.pid, request.id, started.elapsed());
                true
            }
        }
    }
}

/// Checksum to continue folding into, when the request verifies one.
fn running_checksum(request: &StageRequest, retained: Option<ChecksumState>) -> Option<ChecksumState> {
    if !request.flags.contains(RequestFlags::CSUSE) {
        return None;
    }
    let algorithm = request.checksum.algorithm?;
    if retained.is_some() {
        return retained;
    }
    if request.write_off == 0 {
        return Some(ChecksumState::new(algorithm, request.len, request.checksum.long_name));
    }
    request
        .checksum
        .partial
        .and_then(|partial| ChecksumState::resume(algorithm, partial, request.write_off))
}

/// Describes the bytes of the current section the pipeline has to deliver.
fn build_job(request: &StageRequest) -> StageJob {
    let section = request.section().clone();
    let lead = if request.is_continuation() { 0 } else { request.offset };
    let consumed = request.write_off.saturating_sub(request.section_base);
    let remaining = request.len.saturating_sub(request.write_off);
    let data_len = if section.length == 0 {
        remaining
    } else {
        remaining.min(section.length.saturating_sub(lead + consumed))
    };
    let header_known = (consumed > 0 || request.flags.contains(RequestFlags::SKIP_HEADER))
        && request.header_len > 0;
    StageJob {
        id: request.id,
        header: request.header_format(),
        known_header_len: header_known.then_some(request.header_len as usize),
        verify: request.size_verifiable(),
        requested: request.len,
        data_skip: lead + consumed,
        data_len,
        cache_offset: request.offset + request.write_off,
        retries: request.retry,
        section,
    }
}
