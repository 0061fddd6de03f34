//! Per-volume streams of stage requests.
//!
//! A stream is a chain of request slots linked through `StageRequest::next`. Requests
//! in a stream are drained from `first` in chain order; the worker owning an active
//! stream keeps the request it is staging at the head until it finishes.

mod compose;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::config::StreamLimits;
use crate::error::StageErrno;
use crate::request::{RequestStore, StageRequest};
use crate::sync::lock_unpoisoned;
use crate::types::{FsId, LibraryId, MediaType, Pid, RequestFlags, RequestId, Vsn, flag_set};

pub use compose::{Composition, StreamComposer};
pub(crate) use compose::resolve_duplicate;

pub type StreamId = u64;

flag_set! {
    /// Stream state bits.
    StreamFlags: u32 {
        /// Bound to a worker.
        ACTIVE = 0,
        /// Worker finished with it; reaped on the next pass.
        DONE = 1,
        LOADING = 2,
        /// Waiting for an operator to reload its volume.
        WAIT = 3,
        WAIT_DONE = 4,
        ERROR = 5,
        /// Volume unusable; the worker only closes retained descriptors.
        UNAVAIL = 6,
        FULL = 7,
        /// Nothing left to do; reaped without a worker.
        CLEAR = 8,
        /// Cleanup stream closing descriptors retained by one worker.
        DCACHE_CLOSE = 9,
        DISK_ARCHIVE = 10,
    }
}

/// Scheduling decision for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StreamPriority {
    Start,
    /// A worker is already on the same VSN and position, or no drive budget is left.
    Busy,
    #[default]
    NoResources,
    NoFilesystem,
    /// Staging is suspended by the operator.
    Idle,
    /// Waiting for a volume reload.
    Wait,
}

/// Ordered batch of requests on one volume.
#[derive(Clone, PartialEq, Eq)]
pub struct Stream {
    pub id: StreamId,
    pub vsn: Vsn,
    pub media: MediaType,
    first: Option<RequestId>,
    last: Option<RequestId>,
    pub count: usize,
    pub size: u64,
    pub priority: StreamPriority,
    pub flags: StreamFlags,
    pub limits: StreamLimits,
    /// Worker the stream is bound to.
    pub pid: Option<Pid>,
    /// Worker retaining a descriptor some member needs.
    pub context: Option<Pid>,
    pub seqnum: u64,
    pub error: Option<StageErrno>,
    pub library: Option<LibraryId>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("vsn", &self.vsn)
            .field("media", &self.media)
            .field("first", &self.first)
            .field("count", &self.count)
            .field("priority", &self.priority)
            .field("flags", &self.flags)
            .field("pid", &self.pid)
            .field("context", &self.context)
            .finish()
    }
}

impl Stream {
    pub fn new(id: StreamId, vsn: Vsn, media: MediaType, limits: StreamLimits) -> Self {
        let mut flags = StreamFlags::empty();
        flags.set(StreamFlags::DISK_ARCHIVE, media == MediaType::Disk);
        Self {
            id,
            vsn,
            media,
            first: None,
            last: None,
            count: 0,
            size: 0,
            priority: StreamPriority::default(),
            flags,
            limits,
            pid: None,
            context: None,
            seqnum: 0,
            error: None,
            library: None,
        }
    }

    /// Empty stream shaped for `request`: same volume, and for cleanup requests the
    /// worker context that holds the descriptor.
    pub fn for_request(id: StreamId, request: &StageRequest, limits: StreamLimits) -> Self {
        let mut stream = Self::new(id, request.vsn().clone(), request.media(), limits);
        if request.is_cleanup() {
            stream.flags.insert(StreamFlags::DCACHE_CLOSE);
        }
        if request.flags.contains(RequestFlags::DCACHE) || request.is_cleanup() {
            stream.context = request.context;
        }
        stream
    }

    pub fn first(&self) -> Option<RequestId> {
        self.first
    }

    pub fn last(&self) -> Option<RequestId> {
        self.last
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    pub fn is_active(&self) -> bool {
        self.flags.contains(StreamFlags::ACTIVE)
    }

    pub fn is_cleanup(&self) -> bool {
        self.flags.contains(StreamFlags::DCACHE_CLOSE)
    }

    /// Filesystem of the head request, used for the mount check.
    pub fn fseq(&self, store: &RequestStore) -> Option<FsId> {
        self.first.and_then(|first| store.with(first, |request| request.fseq))
    }

    /// Member slots in chain order.
    pub fn members(&self, store: &RequestStore) -> Vec<RequestId> {
        let mut out = Vec::with_capacity(self.count);
        let mut cursor = self.first;
        while let Some(index) = cursor {
            out.push(index);
            if out.len() > store.capacity() {
                tracing::error!(stream = self.id, "stream chain loops");
                break;
            }
            cursor = store.with(index, |request| request.next).flatten();
        }
        out
    }

    /// True when any member holds a retained cache descriptor.
    pub fn holds_dcache(&self, store: &RequestStore) -> bool {
        self.members(store).into_iter().any(|index| {
            store
                .with(index, |request| request.flags.contains(RequestFlags::DCACHE))
                .unwrap_or(false)
        })
    }

    pub fn is_full(&self) -> bool {
        self.flags.contains(StreamFlags::FULL)
    }

    /// Whether `request` may join this stream.
    pub fn accepts(&self, store: &RequestStore, request: &StageRequest) -> bool {
        !self.is_full()
            && !self.is_cleanup()
            && !request.is_cleanup()
            && !request.flags.contains(RequestFlags::DCACHE)
            && !self.flags.intersects(
                StreamFlags::DONE | StreamFlags::ERROR | StreamFlags::CLEAR | StreamFlags::UNAVAIL,
            )
            && self.vsn == *request.vsn()
            && self.media == request.media()
            && !self.holds_dcache(store)
    }

    /// Member whose data is the same as `request`'s.
    pub fn find_duplicate(&self, store: &RequestStore, request: &StageRequest) -> Option<RequestId> {
        let key = request.duplicate_key();
        self.members(store).into_iter().find(|index| {
            *index != request.sort
                && store
                    .with(*index, |member| {
                        member.duplicate_key() == key && !member.flags.contains(RequestFlags::DUPLICATE)
                    })
                    .unwrap_or(false)
        })
    }

    /// Links `index` after the last member.
    pub fn append(&mut self, store: &RequestStore, index: RequestId) {
        let Some(len) = store.update(index, |request| {
            request.next = None;
            request.len
        }) else {
            return;
        };
        match self.last {
            Some(last) => {
                store.update(last, |request| request.next = Some(index));
            }
            None => self.first = Some(index),
        }
        self.last = Some(index);
        self.account(len);
    }

    /// Splices `index` in position order.
    ///
    /// The head of an active stream is being staged, so the splice never goes in front of it.
    pub fn insert(&mut self, store: &RequestStore, index: RequestId) {
        let Some(key) = store.with(index, position_key) else {
            return;
        };
        let members = self.members(store);
        let skip = usize::from(self.is_active() && !members.is_empty());
        let mut previous = if skip == 1 { members.first().copied() } else { None };
        let mut before = None;
        for member in members.iter().skip(skip) {
            let member_key = store.with(*member, position_key);
            if member_key.is_some_and(|member_key| member_key > key) {
                before = Some(*member);
                break;
            }
            previous = Some(*member);
        }

        let Some(len) = store.update(index, |request| {
            request.next = before;
            request.len
        }) else {
            return;
        };
        match previous {
            Some(previous) => {
                store.update(previous, |request| request.next = Some(index));
            }
            None => self.first = Some(index),
        }
        if before.is_none() {
            self.last = Some(index);
        }
        self.account(len);
    }

    /// Unlinks the head request.
    pub fn remove_first(&mut self, store: &RequestStore) -> Option<RequestId> {
        let first = self.first?;
        self.remove(store, first);
        Some(first)
    }

    /// Unlinks `index` wherever it is in the chain.
    pub fn remove(&mut self, store: &RequestStore, index: RequestId) -> bool {
        let members = self.members(store);
        let Some(at) = members.iter().position(|member| *member == index) else {
            return false;
        };
        let next = store
            .update(index, |request| request.next.take())
            .flatten();
        let len = store.with(index, |request| request.len).unwrap_or(0);
        if at == 0 {
            self.first = next;
        } else {
            store.update(members[at - 1], |request| request.next = next);
        }
        if self.last == Some(index) {
            self.last = if at == 0 { None } else { Some(members[at - 1]) };
        }
        self.count = self.count.saturating_sub(1);
        self.size = self.size.saturating_sub(len);
        if self.first.is_none() {
            self.last = None;
        }
        true
    }

    fn account(&mut self, len: u64) {
        self.count += 1;
        self.size = self.size.saturating_add(len);
        // The count limit caps members; the size limit is only exceeded past its last byte.
        let over_count = self.limits.max_count > 0 && self.count >= self.limits.max_count;
        let over_size = self.limits.max_size > 0 && self.size > self.limits.max_size;
        if over_count || over_size {
            self.flags.insert(StreamFlags::FULL);
        }
    }
}

fn position_key(request: &StageRequest) -> (u64, u64, u64) {
    let section = request.section();
    (section.position, section.offset, request.arrival)
}

/// Work queue of streams in creation order.
#[derive(Debug, Default)]
pub struct StreamTable {
    streams: Mutex<BTreeMap<StreamId, Arc<Mutex<Stream>>>>,
    next_id: AtomicU64,
}

impl StreamTable {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> StreamId {
        self.next_id.fetch_add(1, Ordering::AcqRel)
    }

    pub fn insert(&self, stream: Stream) -> StreamId {
        let id = stream.id;
        lock_unpoisoned(&self.streams).insert(id, Arc::new(Mutex::new(stream)));
        id
    }

    pub fn get(&self, id: StreamId) -> Option<Arc<Mutex<Stream>>> {
        lock_unpoisoned(&self.streams).get(&id).cloned()
    }

    pub fn remove(&self, id: StreamId) -> Option<Arc<Mutex<Stream>>> {
        lock_unpoisoned(&self.streams).remove(&id)
    }

    pub fn ids(&self) -> Vec<StreamId> {
        lock_unpoisoned(&self.streams).keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.streams).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of a stream's current state.
    pub fn snapshot(&self, id: StreamId) -> Option<Stream> {
        self.get(id).map(|stream| lock_unpoisoned(&stream).clone())
    }
}
