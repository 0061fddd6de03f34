use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::buffer::ScratchPool;
use crate::collab::{Catalog, FilesystemLink, MediaProvider};
use crate::config::StagerConfig;
use crate::request::RequestStore;
use crate::stream::StreamTable;
use crate::sync::{CancellationToken, Latch, lock_unpoisoned};
use crate::telemetry::stage::{DefaultStageTelemetry, StageTelemetry};
use crate::types::{FileId, FsId, RequestId};

/// Scratch buffers kept per context for headers that straddle ring blocks.
const SCRATCH_BUFFERS: usize = 16;

/// Tables and collaborators shared by the intake thread, the scheduler and every worker.
pub struct StagerContext {
    pub config: StagerConfig,
    pub store: RequestStore,
    pub streams: StreamTable,
    pub fs: Arc<dyn FilesystemLink>,
    pub catalog: Arc<dyn Catalog>,
    pub media: Arc<dyn MediaProvider>,
    pub telemetry: Arc<dyn StageTelemetry>,
    pub scratch: ScratchPool,
    /// Posted whenever the scheduler has something new to look at.
    pub wake: Latch,
    inbox: Mutex<VecDeque<RequestId>>,
    cancels: Mutex<Vec<RequestId>>,
    active_tokens: Mutex<HashMap<RequestId, CancellationToken>>,
}

impl StagerContext {
    pub fn new(
        config: StagerConfig,
        store: RequestStore,
        fs: Arc<dyn FilesystemLink>,
        catalog: Arc<dyn Catalog>,
        media: Arc<dyn MediaProvider>,
    ) -> Self {
        Self {
            config,
            store,
            streams: StreamTable::new(),
            fs,
            catalog,
            media,
            telemetry: Arc::new(DefaultStageTelemetry),
            scratch: ScratchPool::new(4096, SCRATCH_BUFFERS),
            wake: Latch::new(),
            inbox: Mutex::new(VecDeque::new()),
            cancels: Mutex::new(Vec::new()),
            active_tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn StageTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Queues a request for the scheduler and wakes it.
    pub fn submit(&self, index: RequestId) {
        lock_unpoisoned(&self.inbox).push_back(index);
        self.wake.post();
    }

    pub(crate) fn drain_inbox(&self) -> Vec<RequestId> {
        lock_unpoisoned(&self.inbox).drain(..).collect()
    }

    pub fn inbox_len(&self) -> usize {
        lock_unpoisoned(&self.inbox).len()
    }

    /// Hands a finished request to completion processing.
    pub fn set_done(&self, index: RequestId) {
        self.store.set_done(index);
        self.wake.post();
    }

    pub(crate) fn register_token(&self, index: RequestId, token: CancellationToken) {
        lock_unpoisoned(&self.active_tokens).insert(index, token);
    }

    pub(crate) fn clear_token(&self, index: RequestId) {
        lock_unpoisoned(&self.active_tokens).remove(&index);
    }

    /// Flags the request for `id` canceled and stops it if a worker is staging it.
    pub fn cancel_request(&self, id: FileId, fseq: FsId) -> Option<RequestId> {
        let index = self.store.cancel(id, fseq)?;
        if let Some(token) = lock_unpoisoned(&self.active_tokens).get(&index) {
            token.cancel();
        }
        lock_unpoisoned(&self.cancels).push(index);
        self.wake.post();
        Some(index)
    }

    pub(crate) fn drain_cancels(&self) -> Vec<RequestId> {
        std::mem::take(&mut *lock_unpoisoned(&self.cancels))
    }
}
