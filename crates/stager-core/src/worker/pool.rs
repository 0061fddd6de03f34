use std::any::Any;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};

use super::copy::{CopyInstance, DriveWorker};
use super::{BindRequest, CopyInstanceFlags, ExitStatus, WorkerExit, WorkerRecord, WorkerTable};
use crate::context::StagerContext;
use crate::error::StageErrno;
use crate::pipeline::StagePipeline;
use crate::stream::StreamId;
use crate::sync::SharedLock;
use crate::telemetry;
use crate::telemetry::tags;
use crate::types::{LibraryId, MediaType, Pid, Vsn};
use crate::{Result, StagerError};

/// Lock owner id used by the scheduler when it hands a stream to a worker.
pub const SCHEDULER_PID: Pid = 1;
const FIRST_WORKER_PID: Pid = 100;

/// Drive workers of every library, owned by the scheduler thread.
pub struct WorkerPool {
    ctx: Arc<StagerContext>,
    copies: Vec<CopyInstance>,
    next_pid: Pid,
    exits_tx: Sender<WorkerExit>,
    exits_rx: Receiver<WorkerExit>,
    table: Option<WorkerTable>,
}

impl WorkerPool {
    /// Lays out one drive slot per configured library drive and recovers the worker table.
    pub fn new(ctx: Arc<StagerContext>) -> Result<Self> {
        let mut copies = Vec::new();
        for library in ctx.catalog.libraries() {
            for drive in 0..library.drives {
                copies.push(CopyInstance::new(library.id, drive));
            }
        }

        let table = match ctx.config.paths.worker_table() {
            Some(path) => {
                let layout: Vec<(LibraryId, u16)> = copies
                    .iter()
                    .map(|copy| (copy.library, copy.drive as u16))
                    .collect();
                let (table, recovered) = WorkerTable::open(&path, &layout)
                    .map_err(|err| err.with_context("worker table"))?;
                for (copy, record) in copies.iter_mut().zip(recovered) {
                    recover_copy(copy, record);
                }
                Some(table)
            }
            None => None,
        };

        let (exits_tx, exits_rx) = unbounded();
        let pool = Self {
            ctx,
            copies,
            next_pid: FIRST_WORKER_PID,
            exits_tx,
            exits_rx,
            table,
        };
        for index in 0..pool.copies.len() {
            pool.persist(index);
        }
        pool.flush();
        Ok(pool)
    }

    pub fn copies(&self) -> &[CopyInstance] {
        &self.copies
    }

    pub fn len(&self) -> usize {
        self.copies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.copies.is_empty()
    }

    pub fn find_by_pid(&self, pid: Pid) -> Option<usize> {
        self.copies.iter().position(|copy| copy.pid == Some(pid))
    }

    /// Workers of `library` bound to a stream.
    pub fn busy_count(&self, library: LibraryId) -> usize {
        self.copies
            .iter()
            .filter(|copy| copy.library == library && copy.is_busy())
            .count()
    }

    /// Running workers of `library`.
    pub fn created_count(&self, library: LibraryId) -> usize {
        self.copies
            .iter()
            .filter(|copy| copy.library == library && copy.is_created())
            .count()
    }

    pub fn idle_in_library(&self, library: LibraryId) -> Option<usize> {
        self.copies
            .iter()
            .position(|copy| copy.library == library && copy.is_idle())
    }

    pub fn not_created_in_library(&self, library: LibraryId) -> Option<usize> {
        self.copies
            .iter()
            .position(|copy| copy.library == library && !copy.is_created())
    }

    /// Worker already bound to `vsn`: at `position` on file-addressed media, anywhere on
    /// the volume for sequential media.
    pub fn busy_on(&self, vsn: &Vsn, media: MediaType, position: u64) -> Option<Pid> {
        self.copies
            .iter()
            .find(|copy| {
                copy.is_busy()
                    && copy.vsn.as_ref() == Some(vsn)
                    && copy.media == Some(media)
                    && (!media.is_file_addressed() || copy.position == position)
            })
            .and_then(|copy| copy.pid)
    }

    /// Starts the worker thread of drive slot `index`.
    pub fn spawn(&mut self, index: usize) -> Result<Pid> {
        let pid = self.next_pid;
        let copy = self
            .copies
            .get_mut(index)
            .ok_or(StagerError::InvalidFormat("worker slot out of range"))?;
        let name = format!("stager-drive-{}-{}", copy.library.0, copy.drive);
        let (sender, receiver) = unbounded::<BindRequest>();
        let ctx = Arc::clone(&self.ctx);
        let lock = Arc::clone(&copy.lock);
        let exits = self.exits_tx.clone();
        let drive = copy.drive;
        let thread_name = name.clone();

        let handle = thread::Builder::new().name(name).spawn(move || {
            let status = match catch_unwind(AssertUnwindSafe(|| {
                match StagePipeline::spawn(&thread_name, &ctx.config.worker, ctx.scratch.clone()) {
                    Ok(pipeline) => DriveWorker {
                        ctx: Arc::clone(&ctx),
                        pid,
                        drive,
                        lock,
                        pipeline,
                        mounted: None,
                        retained: HashMap::new(),
                        next_handle: 1,
                    }
                    .run(receiver),
                    Err(err) => ExitStatus::Abnormal(format!("pipeline start failed: {err}")),
                }
            })) {
                Ok(status) => status,
                Err(payload) => ExitStatus::Abnormal(panic_message(payload.as_ref())),
            };
            let _ = exits.send(WorkerExit { pid, status });
            ctx.wake.post();
        })?;

        self.next_pid += 1;
        copy.pid = Some(pid);
        copy.flags.insert(CopyInstanceFlags::CREATED | CopyInstanceFlags::IDLE);
        copy.sender = Some(sender);
        copy.handle = Some(handle);
        telemetry::increment_counter(
            tags::METRIC_WORKER_STARTED_COUNT,
            1,
            &[("subsystem", "worker"), ("op", "spawn")],
        );
        tracing::info!(
            target: tags::TARGET_WORKER,
            pid,
            library = copy.library.0,
            drive,
            "worker spawned"
        );
        self.persist(index);
        Ok(pid)
    }

    /// Hands `stream` to the worker of slot `index` and waits for it to take it.
    pub fn bind(
        &mut self,
        index: usize,
        stream: StreamId,
        vsn: &Vsn,
        media: MediaType,
        position: u64,
    ) -> Result<Pid> {
        let timeout = self.ctx.config.scheduler.bind_ack_timeout;
        let policy = self.ctx.config.lock;
        let copy = self
            .copies
            .get_mut(index)
            .ok_or(StagerError::InvalidFormat("worker slot out of range"))?;
        let (Some(pid), Some(sender)) = (copy.pid, copy.sender.clone()) else {
            return Err(StagerError::Stage(StageErrno::NoSuchProcess));
        };

        let (ack_tx, ack_rx) = bounded(1);
        {
            let _guard = copy.lock.lock_or_recover(SCHEDULER_PID, &policy);
            sender
                .send(BindRequest { stream, ack: ack_tx })
                .map_err(|_| StagerError::Stage(StageErrno::NoSuchProcess))?;
        }
        match ack_rx.recv_timeout(timeout) {
            Ok(()) => {}
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(target: tags::TARGET_WORKER, pid, stream, "bind not acknowledged");
                return Err(StagerError::Stage(StageErrno::TimedOut));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(StagerError::Stage(StageErrno::NoSuchProcess));
            }
        }

        copy.flags.remove(CopyInstanceFlags::IDLE);
        copy.vsn = Some(vsn.clone());
        copy.media = Some(media);
        copy.position = position;
        self.persist(index);
        Ok(pid)
    }

    /// Marks the worker `pid` free for another stream.
    pub fn mark_idle(&mut self, pid: Pid) {
        if let Some(index) = self.find_by_pid(pid) {
            self.copies[index].flags.insert(CopyInstanceFlags::IDLE);
            self.persist(index);
        }
    }

    /// Collects the exit notices of finished workers and frees their drive slots.
    pub fn reap(&mut self) -> Vec<WorkerExit> {
        let mut exits = Vec::new();
        while let Ok(exit) = self.exits_rx.try_recv() {
            if let Some(index) = self.find_by_pid(exit.pid) {
                let copy = &mut self.copies[index];
                if let Some(handle) = copy.handle.take() {
                    let _ = handle.join();
                }
                copy.reset();
                copy.flags.set(CopyInstanceFlags::FAILOVER, !exit.status.is_normal());
                if copy.lock.holder() == Some(exit.pid) {
                    copy.lock.force_reinitialize();
                    telemetry::increment_counter(
                        tags::METRIC_WORKER_LOCK_REINIT_COUNT,
                        1,
                        &[("subsystem", "worker"), ("op", "reap")],
                    );
                }
                self.persist(index);
            }
            if exit.status.is_normal() {
                tracing::debug!(target: tags::TARGET_WORKER, pid = exit.pid, "worker exited");
            } else {
                telemetry::increment_counter(
                    tags::METRIC_WORKER_EXIT_ABNORMAL_COUNT,
                    1,
                    &[("subsystem", "worker"), ("op", "exit")],
                );
                tracing::warn!(target: tags::TARGET_WORKER, pid = exit.pid, status = %exit.status, "worker exited abnormally");
            }
            exits.push(exit);
        }
        if !exits.is_empty() {
            self.flush();
        }
        exits
    }

    /// Closes every worker's queue and waits for the threads to finish.
    pub fn shutdown_all(&mut self) {
        for copy in &mut self.copies {
            copy.sender = None;
            copy.flags.insert(CopyInstanceFlags::SHUTDOWN);
        }
        for copy in &mut self.copies {
            if let Some(handle) = copy.handle.take() {
                let _ = handle.join();
            }
        }
        self.reap();
        for index in 0..self.copies.len() {
            self.copies[index].reset();
            self.persist(index);
        }
        self.flush();
    }

    fn persist(&self, index: usize) {
        let Some(table) = self.table.as_ref() else {
            return;
        };
        let record = self.copies[index].record();
        if let Err(err) = table.write(index, &record) {
            tracing::error!(target: tags::TARGET_WORKER, slot = index, error = %err, "worker table write failed");
        }
    }

    fn flush(&self) {
        if let Some(table) = self.table.as_ref() {
            if let Err(err) = table.flush() {
                tracing::error!(target: tags::TARGET_WORKER, error = %err, "worker table flush failed");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.copies.iter().any(|copy| copy.handle.is_some()) {
            self.shutdown_all();
        }
    }
}

/// Applies a recovered record: the worker is gone, so its pid is forgotten and a lock it
/// held is reinitialized.
fn recover_copy(copy: &mut CopyInstance, record: WorkerRecord) {
    copy.vsn = record.vsn;
    copy.media = record.media;
    copy.position = record.position;
    if record.flags.contains(CopyInstanceFlags::CREATED) {
        copy.flags.insert(CopyInstanceFlags::FAILOVER);
    }
    if let Some(owner) = record.lock_owner {
        let lock = SharedLock::with_owner(owner);
        if let Some(holder) = lock.force_reinitialize() {
            telemetry::increment_counter(
                tags::METRIC_WORKER_LOCK_REINIT_COUNT,
                1,
                &[("subsystem", "worker"), ("op", "recover")],
            );
            tracing::warn!(
                target: tags::TARGET_WORKER,
                library = copy.library.0,
                drive = copy.drive,
                holder,
                "worker lock held by a previous run, reinitialized"
            );
        }
        copy.lock = Arc::new(lock);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
