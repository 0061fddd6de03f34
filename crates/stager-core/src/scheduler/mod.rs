//! Resource scheduler.
//!
//! Runs on one thread. Each pass drains newly submitted requests into streams, processes
//! the done list, reaps exited workers, then walks the work queue deciding for every
//! stream whether it can be bound to a drive worker now.

mod completion;
mod reload;
mod resources;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::Result;
use crate::context::StagerContext;
use crate::error::StageErrno;
use crate::request::StageRequest;
use crate::stream::{Stream, StreamComposer, StreamFlags, StreamId, StreamPriority, resolve_duplicate};
use crate::sync::lock_unpoisoned;
use crate::telemetry;
use crate::telemetry::tags;
use crate::types::{MediaType, Pid, RequestFlags, RequestId, Vsn};
use crate::worker::WorkerPool;

pub use completion::{CompletionOutcome, check_requests};
pub use reload::ReloadWatcher;

/// What one scheduler pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Streams created from newly submitted requests.
    pub composed: usize,
    /// Requests taken off the done list.
    pub completed: usize,
    pub exits: usize,
    /// Streams handed back to the queue after their worker died.
    pub requeued: usize,
    pub bound: usize,
    pub reaped: usize,
}

/// Matches streams to drive workers.
pub struct ResourceScheduler {
    ctx: Arc<StagerContext>,
    pool: WorkerPool,
    composer: StreamComposer,
    watchers: HashMap<StreamId, ReloadWatcher>,
}

impl ResourceScheduler {
    pub fn new(ctx: Arc<StagerContext>) -> Result<Self> {
        let pool = WorkerPool::new(Arc::clone(&ctx))?;
        let composer = StreamComposer::new(ctx.config.stream);
        Ok(Self {
            ctx,
            pool,
            composer,
            watchers: HashMap::new(),
        })
    }

    pub fn context(&self) -> &Arc<StagerContext> {
        &self.ctx
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Number of reload watchers still waiting on a volume.
    pub fn waiting_reloads(&self) -> usize {
        self.watchers.len()
    }

    /// One full pass.
    pub fn run_once(&mut self) -> TickReport {
        let mut report = TickReport::default();

        for index in self.ctx.drain_inbox() {
            self.insert_work(index);
        }
        for index in self.ctx.drain_cancels() {
            self.cancel_work(index);
        }
        if self.composer.pending_len() > 0 {
            let composition = self.composer.compose_pending(&self.ctx.store, &self.ctx.streams);
            report.composed = composition.streams.len();
            for index in composition.duplicates.iter().chain(&composition.canceled) {
                self.ctx.set_done(*index);
            }
        }

        report.completed = check_requests(&self.ctx).processed;

        for exit in self.pool.reap() {
            report.exits += 1;
            report.requeued += self.requeue_work(exit.pid);
        }

        let (bound, reaped) = self.schedule_tick();
        report.bound = bound;
        report.reaped = reaped;
        report
    }

    /// Walks the work queue once: reaps finished streams and binds startable ones.
    ///
    /// Returns the number of streams bound and reaped.
    pub fn schedule_tick(&mut self) -> (usize, usize) {
        telemetry::increment_counter(
            tags::METRIC_SCHEDULER_TICK_COUNT,
            1,
            &[("subsystem", "scheduler"), ("op", "tick")],
        );
        let mut bound = 0usize;
        let mut reaped = 0usize;

        for id in self.ctx.streams.ids() {
            let Some(handle) = self.ctx.streams.get(id) else {
                continue;
            };
            let snapshot = lock_unpoisoned(&handle).clone();

            if snapshot.is_active() && snapshot.flags.contains(StreamFlags::DONE) {
                self.reap_stream(id, snapshot.pid);
                reaped += 1;
                continue;
            }
            if snapshot.is_active() {
                continue;
            }
            if snapshot.flags.contains(StreamFlags::CLEAR) || snapshot.is_empty() {
                self.reap_stream(id, None);
                reaped += 1;
                continue;
            }
            if snapshot.flags.contains(StreamFlags::WAIT) {
                if !snapshot.flags.contains(StreamFlags::WAIT_DONE) {
                    continue;
                }
                self.stop_watcher(id);
                lock_unpoisoned(&handle)
                    .flags
                    .remove(StreamFlags::WAIT | StreamFlags::WAIT_DONE);
            }

            let priority = self.find_resources(id, &handle);
            lock_unpoisoned(&handle).priority = priority;
            if priority == StreamPriority::Start && self.start_copy(&handle) {
                bound += 1;
            }
        }

        let depth = self.ctx.streams.len();
        telemetry::set_gauge(
            tags::METRIC_SCHEDULER_STREAMS,
            depth as u64,
            &[("subsystem", "scheduler"), ("op", "tick")],
        );
        self.ctx.telemetry.on_queue_depth(depth);
        (bound, reaped)
    }

    /// Adds a submitted request to an open stream on its volume, or queues it for the
    /// next composition.
    fn insert_work(&mut self, index: RequestId) {
        let Some(request) = self.ctx.store.get(index) else {
            return;
        };
        if request.flags.contains(RequestFlags::HELD) {
            tracing::debug!(target: tags::TARGET_SCHEDULER, slot = index, ext_ord = request.ext_ord, "extension held for its predecessor");
            return;
        }
        if request.is_cleanup() || request.flags.contains(RequestFlags::DCACHE) {
            self.composer.push(index);
            return;
        }

        for id in self.ctx.streams.ids() {
            let Some(handle) = self.ctx.streams.get(id) else {
                continue;
            };
            let mut stream = lock_unpoisoned(&handle);
            if !stream.accepts(&self.ctx.store, &request) {
                continue;
            }
            if let Some(existing) = stream.find_duplicate(&self.ctx.store, &request) {
                let loser = resolve_duplicate(&self.ctx.store, existing, index);
                if loser == existing {
                    stream.remove(&self.ctx.store, existing);
                    stream.insert(&self.ctx.store, index);
                }
                drop(stream);
                self.ctx.set_done(loser);
                return;
            }
            stream.insert(&self.ctx.store, index);
            tracing::debug!(
                target: tags::TARGET_SCHEDULER,
                slot = index,
                stream = id,
                active = stream.is_active(),
                "request inserted into open stream"
            );
            return;
        }
        self.composer.push(index);
    }

    fn reap_stream(&mut self, id: StreamId, pid: Option<Pid>) {
        self.stop_watcher(id);
        self.ctx.streams.remove(id);
        if let Some(pid) = pid {
            self.pool.mark_idle(pid);
        }
        tracing::debug!(target: tags::TARGET_SCHEDULER, stream = id, "stream reaped");
    }

    fn stop_watcher(&mut self, id: StreamId) {
        if let Some(watcher) = self.watchers.remove(&id) {
            watcher.cancel();
        }
    }

    /// Frees the streams of a worker that died.
    ///
    /// A lead request holding a cache descriptor cannot be resumed, so it is finished as
    /// canceled; everything else goes back to the queue. Returns the streams requeued.
    pub fn requeue_work(&mut self, pid: Pid) -> usize {
        let store = &self.ctx.store;
        let mut finished = Vec::new();
        let mut requeued = 0usize;

        for id in self.ctx.streams.ids() {
            let Some(handle) = self.ctx.streams.get(id) else {
                continue;
            };
            let mut stream = lock_unpoisoned(&handle);
            if stream.pid != Some(pid) || stream.flags.contains(StreamFlags::DONE) {
                continue;
            }

            if let Some(first) = stream.first() {
                let lead_dcache = store
                    .with(first, |request| request.flags.contains(RequestFlags::DCACHE))
                    .unwrap_or(false);
                if lead_dcache {
                    store.update(first, |request| {
                        detach_descriptor(request);
                        request.flags.insert(RequestFlags::NO_RETRY);
                        request.error = Some(StageErrno::Canceled);
                    });
                    stream.remove(store, first);
                    finished.push(first);
                }
            }
            for member in stream.members(store) {
                store.update(member, |request| {
                    request.flags.remove(RequestFlags::ACTIVE);
                    if request.context == Some(pid) {
                        detach_descriptor(request);
                    }
                });
            }

            if stream.is_empty() {
                stream.flags.insert(StreamFlags::ACTIVE | StreamFlags::DONE);
            } else {
                stream.flags.remove(StreamFlags::ACTIVE | StreamFlags::LOADING);
                stream.pid = None;
                stream.context = None;
                stream.priority = StreamPriority::Start;
                requeued += 1;
            }
            tracing::warn!(
                target: tags::TARGET_SCHEDULER,
                pid,
                stream = id,
                remaining = stream.count,
                "stream of dead worker requeued"
            );
        }

        // Requests parked elsewhere may still point at the dead worker's descriptors.
        for index in store.ids() {
            store.update(index, |request| {
                if request.context == Some(pid) && !request.is_done() {
                    detach_descriptor(request);
                    if request.error.is_none() && request.write_off > 0 {
                        request.flags.insert(RequestFlags::NO_RETRY);
                        request.error = Some(StageErrno::Canceled);
                    }
                }
            });
        }

        for index in finished {
            self.ctx.set_done(index);
        }
        if requeued > 0 {
            telemetry::increment_counter(
                tags::METRIC_SCHEDULER_REQUEUE_COUNT,
                requeued as u64,
                &[("subsystem", "scheduler"), ("op", "requeue")],
            );
        }
        requeued
    }

    /// Fails every queued request with `NoDevice`; used when the daemon is going away
    /// after its workers have stopped.
    pub fn shutdown_work(&mut self) -> usize {
        let mut failed = 0usize;
        for id in self.ctx.streams.ids() {
            let Some(handle) = self.ctx.streams.get(id) else {
                continue;
            };
            let members = {
                let mut stream = lock_unpoisoned(&handle);
                stream.flags.insert(StreamFlags::ERROR);
                drain(&mut stream, &self.ctx)
            };
            for index in members {
                self.ctx.store.update(index, |request| {
                    detach_descriptor(request);
                    request.flags.insert(RequestFlags::NO_RETRY);
                    request.error = Some(StageErrno::NoDevice);
                });
                self.ctx.set_done(index);
                failed += 1;
            }
        }
        tracing::info!(target: tags::TARGET_SCHEDULER, failed, "shutdown work");
        failed
    }

    /// Pulls a canceled request out of the not-yet-active part of its stream.
    ///
    /// A request the worker is already staging is left alone; its cancellation token
    /// stops the pipeline.
    pub fn cancel_work(&mut self, index: RequestId) -> bool {
        let Some(request) = self.ctx.store.get(index) else {
            return false;
        };
        if request.is_active() || request.flags.contains(RequestFlags::DCACHE) {
            return false;
        }
        for id in self.ctx.streams.ids() {
            let Some(handle) = self.ctx.streams.get(id) else {
                continue;
            };
            let mut stream = lock_unpoisoned(&handle);
            if !matches_volume(&stream, request.vsn(), request.media()) {
                continue;
            }
            if stream.is_active() && stream.first() == Some(index) {
                return false;
            }
            if stream.remove(&self.ctx.store, index) {
                drop(stream);
                self.ctx.store.update(index, |request| request.error = Some(StageErrno::Canceled));
                self.ctx.set_done(index);
                tracing::info!(target: tags::TARGET_SCHEDULER, slot = index, stream = id, "queued request canceled");
                return true;
            }
        }
        false
    }

    /// Stops every worker and reload watcher.
    pub fn shutdown(&mut self) {
        for (_, watcher) in self.watchers.drain() {
            watcher.cancel();
        }
        self.pool.shutdown_all();
    }
}

fn matches_volume(stream: &Stream, vsn: &Vsn, media: MediaType) -> bool {
    stream.vsn == *vsn && stream.media == media
}

fn detach_descriptor(request: &mut StageRequest) {
    request.dcache = None;
    request.context = None;
    request.checksum.partial = None;
    request.flags.remove(RequestFlags::DCACHE | RequestFlags::ACTIVE);
}

/// Unlinks every member of `stream`.
fn drain(stream: &mut Stream, ctx: &StagerContext) -> Vec<RequestId> {
    let mut members = Vec::with_capacity(stream.count);
    while let Some(index) = stream.remove_first(&ctx.store) {
        members.push(index);
    }
    members
}

type StreamHandle = Arc<Mutex<Stream>>;
