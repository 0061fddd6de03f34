use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::{BindRequest, CopyInstanceFlags, ExitStatus, WorkerRecord};
use crate::checksum::ChecksumState;
use crate::collab::CacheFile;
use crate::context::StagerContext;
use crate::media::MediaSource;
use crate::pipeline::StagePipeline;
use crate::sync::SharedLock;
use crate::telemetry::tags;
use crate::types::{CacheHandle, LibraryId, MediaType, Pid, Vsn};

/// One drive staging may use, and the worker bound to it.
#[derive(Debug)]
pub struct CopyInstance {
    pub library: LibraryId,
    pub drive: usize,
    pub pid: Option<Pid>,
    pub flags: CopyInstanceFlags,
    /// Volume of the last stream bound.
    pub vsn: Option<Vsn>,
    pub media: Option<MediaType>,
    pub position: u64,
    pub(super) lock: Arc<SharedLock>,
    pub(super) sender: Option<Sender<BindRequest>>,
    pub(super) handle: Option<JoinHandle<()>>,
}

impl CopyInstance {
    pub(super) fn new(library: LibraryId, drive: usize) -> Self {
        Self {
            library,
            drive,
            pid: None,
            flags: CopyInstanceFlags::empty(),
            vsn: None,
            media: None,
            position: 0,
            lock: Arc::new(SharedLock::new()),
            sender: None,
            handle: None,
        }
    }

    pub fn is_created(&self) -> bool {
        self.flags.contains(CopyInstanceFlags::CREATED)
    }

    pub fn is_idle(&self) -> bool {
        self.is_created() && self.flags.contains(CopyInstanceFlags::IDLE)
    }

    pub fn is_busy(&self) -> bool {
        self.is_created() && !self.flags.contains(CopyInstanceFlags::IDLE)
    }

    /// Holder of the worker's record lock.
    pub fn lock_holder(&self) -> Option<Pid> {
        self.lock.holder()
    }

    pub(super) fn record(&self) -> WorkerRecord {
        WorkerRecord {
            library: self.library,
            drive: self.drive as u16,
            pid: self.pid,
            flags: self.flags,
            position: self.position,
            lock_owner: self.lock.holder(),
            vsn: self.vsn.clone(),
            media: self.media,
        }
    }

    /// Forgets the worker thread; the drive can be started again.
    pub(super) fn reset(&mut self) {
        self.pid = None;
        self.flags.remove(CopyInstanceFlags::CREATED | CopyInstanceFlags::IDLE | CopyInstanceFlags::SHUTDOWN);
        self.sender = None;
    }
}

/// Cache file kept open between sections or attempts of one request.
pub(super) struct Retained {
    pub(super) file: Box<dyn CacheFile>,
    pub(super) checksum: Option<ChecksumState>,
}

/// State owned by a running worker thread.
pub(super) struct DriveWorker {
    pub(super) ctx: Arc<StagerContext>,
    pub(super) pid: Pid,
    pub(super) drive: usize,
    pub(super) lock: Arc<SharedLock>,
    pub(super) pipeline: StagePipeline,
    pub(super) mounted: Option<Vsn>,
    pub(super) retained: HashMap<CacheHandle, Retained>,
    pub(super) next_handle: u64,
}

impl DriveWorker {
    /// Waits for streams until idle with nothing retained, or until the pool goes away.
    pub(super) fn run(mut self, requests: Receiver<BindRequest>) -> ExitStatus {
        let idle_timeout = self.ctx.config.worker.idle_timeout;
        let policy = self.ctx.config.lock;
        tracing::info!(target: tags::TARGET_WORKER, pid = self.pid, drive = self.drive, "worker started");

        let status = loop {
            match requests.recv_timeout(idle_timeout) {
                Ok(bind) => {
                    let lock = Arc::clone(&self.lock);
                    let guard = lock.lock_or_recover(self.pid, &policy);
                    if bind.ack.send(()).is_err() {
                        tracing::warn!(target: tags::TARGET_WORKER, pid = self.pid, stream = bind.stream, "bind abandoned by scheduler");
                        continue;
                    }
                    let outcome = self.process_stream(bind.stream);
                    drop(guard);
                    if let Err(status) = outcome {
                        break status;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.retained.is_empty() {
                        break ExitStatus::Normal;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break ExitStatus::Normal,
            }
        };

        // Binds that raced the exit decision are refused by dropping their ack.
        while let Ok(bind) = requests.try_recv() {
            drop(bind);
        }
        self.close_retained();
        if let Some(mut media) = self.pipeline.detach() {
            if let Err(err) = media.unload() {
                tracing::warn!(target: tags::TARGET_WORKER, pid = self.pid, error = %err, "unload failed");
            }
        }
        tracing::info!(target: tags::TARGET_WORKER, pid = self.pid, status = %status, "worker exiting");
        status
    }

    fn close_retained(&mut self) {
        for (handle, retained) in self.retained.drain() {
            if let Err(err) = retained.file.close() {
                tracing::warn!(target: tags::TARGET_WORKER, pid = self.pid, handle = handle.0, error = %err, "close of retained cache file failed");
            }
        }
    }
}
