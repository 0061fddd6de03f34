use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::record::{ChecksumSpec, RECORD_SIZE, StageRequest};
use crate::collab::StageDescriptor;
use crate::error::StageErrno;
use crate::io::{TableFile, TableLayout, TableOpen};
use crate::sync::{lock_unpoisoned, wait_timeout_unpoisoned};
use crate::telemetry;
use crate::telemetry::tags;
use crate::types::{
    ArchiveCopy, CopyFlags, FileId, FsId, MAX_ARCHIVE, MAX_VSN_SECTIONS, RequestFlags,
    RequestId, Section,
};
use crate::{Result, StagerError};

/// Footer magic of the request table file ("STRT").
pub const TABLE_MAGIC: u32 = 0x5354_5254;
pub const TABLE_VERSION: u16 = 1;

type ExtensionKey = (FileId, FsId, u32, u8);

#[derive(Debug, Default)]
struct DoneList {
    first: Option<RequestId>,
    last: Option<RequestId>,
    len: usize,
}

/// Arena of request records addressed by their permanent slot index.
///
/// Free slots are kept on a stack, finished requests on an intrusive done list threaded
/// through `StageRequest::next`. When backed by a table file every change is written
/// through to the mapped record. Lock order is done list, then extensions, then slot,
/// then table.
#[derive(Debug)]
pub struct RequestStore {
    slots: Vec<Mutex<Option<StageRequest>>>,
    free: Mutex<Vec<RequestId>>,
    done: Mutex<DoneList>,
    done_ready: Condvar,
    extensions: Mutex<HashMap<ExtensionKey, Vec<Section>>>,
    table: Option<Mutex<TableFile>>,
    arrivals: AtomicU64,
    active: AtomicUsize,
    max_retries: u8,
    recovered: Mutex<Vec<RequestId>>,
}

impl RequestStore {
    /// Creates a store that is not persisted.
    pub fn in_memory(capacity: usize, max_retries: u8) -> Self {
        Self::build(capacity, max_retries, None)
    }

    /// Opens the table file at `path`, recovering valid records of a previous run.
    pub fn open(path: &Path, capacity: usize, max_retries: u8) -> Result<Self> {
        let layout = TableLayout {
            magic: TABLE_MAGIC,
            version: TABLE_VERSION,
            record_size: RECORD_SIZE,
            count: capacity,
        };
        let (table, outcome) = TableFile::open(path, layout)?;
        let mut recovered = Vec::new();
        if outcome == TableOpen::Recovered {
            for index in 0..capacity {
                let raw = table.record(index);
                if raw.iter().all(|byte| *byte == 0) {
                    continue;
                }
                match StageRequest::from_bytes(raw) {
                    Some(request) if is_valid_record(&request, index) => recovered.push(request),
                    _ => {
                        telemetry::increment_counter(
                            tags::METRIC_TABLE_DISCARDED_COUNT,
                            1,
                            &[("subsystem", "request"), ("op", "recover")],
                        );
                        tracing::warn!(target: tags::TARGET_REQUEST, slot = index, "discarding invalid request record");
                    }
                }
            }
        }

        let store = Self::build(capacity, max_retries, Some(table));
        store.restore(recovered)?;
        Ok(store)
    }

    fn build(capacity: usize, max_retries: u8, table: Option<TableFile>) -> Self {
        Self {
            slots: (0..capacity).map(|_| Mutex::new(None)).collect(),
            free: Mutex::new((0..capacity).rev().collect()),
            done: Mutex::new(DoneList::default()),
            done_ready: Condvar::new(),
            extensions: Mutex::new(HashMap::new()),
            table: table.map(Mutex::new),
            arrivals: AtomicU64::new(0),
            active: AtomicUsize::new(0),
            max_retries,
            recovered: Mutex::new(Vec::new()),
        }
    }

    fn restore(&self, records: Vec<StageRequest>) -> Result<()> {
        let mut finished = Vec::new();
        let mut schedule = Vec::new();
        let mut latest = 0;
        {
            let mut free = lock_unpoisoned(&self.free);
            for mut request in records {
                let index = request.sort;
                free.retain(|slot| *slot != index);
                latest = latest.max(request.arrival + 1);
                request.next = None;
                request.flags.remove(RequestFlags::ACTIVE);
                request.context = None;

                if request.flags.contains(RequestFlags::DCACHE) || request.is_cleanup() {
                    // The descriptor died with the previous daemon.
                    request.dcache = None;
                    request.flags.remove(RequestFlags::DCACHE | RequestFlags::DCACHE_CLOSE);
                    request.flags.insert(RequestFlags::NO_RETRY);
                    request.error = Some(StageErrno::Canceled);
                    request.flags.remove(RequestFlags::DONE);
                    finished.push(index);
                } else if request.flags.contains(RequestFlags::HELD) {
                    // Answered or dropped together with the head of its chain.
                } else if needs_extension(&request) {
                    // Extension sections are not persisted, so the chain cannot resume.
                    if request.error.is_none() {
                        request.error = Some(StageErrno::Interrupted);
                    }
                    request.flags.insert(RequestFlags::NO_RETRY);
                    request.flags.remove(RequestFlags::DONE | RequestFlags::MULTIVOL);
                    finished.push(index);
                } else if request.is_done() {
                    request.flags.remove(RequestFlags::DONE);
                    finished.push(index);
                } else {
                    request.write_off = 0;
                    request.stage_size = 0;
                    request.section_base = 0;
                    schedule.push(index);
                }

                self.persist(index, Some(&request))?;
                *self.slot(index) = Some(request);
                self.active.fetch_add(1, Ordering::AcqRel);
            }
        }
        self.arrivals.store(latest, Ordering::Release);

        if !finished.is_empty() || !schedule.is_empty() {
            telemetry::increment_counter(
                tags::METRIC_TABLE_RECOVERED_COUNT,
                (finished.len() + schedule.len()) as u64,
                &[("subsystem", "request"), ("op", "recover")],
            );
            tracing::info!(
                target: tags::TARGET_REQUEST,
                requeued = schedule.len(),
                finished = finished.len(),
                "request table recovered"
            );
        }
        for index in finished {
            self.set_done(index);
        }
        schedule.sort_unstable();
        *lock_unpoisoned(&self.recovered) = schedule;
        self.publish_active();
        self.flush()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Requests currently holding a slot.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn max_retries(&self) -> u8 {
        self.max_retries
    }

    /// Requests restored from the table that must be scheduled again; drained by the caller.
    pub fn take_recovered(&self) -> Vec<RequestId> {
        std::mem::take(&mut *lock_unpoisoned(&self.recovered))
    }

    /// Builds a request from a filesystem descriptor and stores it.
    pub fn create(&self, descriptor: &StageDescriptor) -> Result<RequestId> {
        let mut request = request_from_descriptor(descriptor, self.max_retries)?;
        let Some(index) = lock_unpoisoned(&self.free).pop() else {
            tracing::warn!(target: tags::TARGET_REQUEST, ino = descriptor.id.ino, "request table full");
            return Err(StagerError::TableFull);
        };
        request.sort = index;
        request.arrival = self.arrivals.fetch_add(1, Ordering::AcqRel);

        {
            let mut extensions = lock_unpoisoned(&self.extensions);
            for (copy, placement) in descriptor.copies.iter().enumerate() {
                let Some(placement) = placement else {
                    continue;
                };
                if !placement.extension.is_empty() {
                    let sections = placement
                        .extension
                        .iter()
                        .take(MAX_VSN_SECTIONS - 1)
                        .cloned()
                        .collect();
                    extensions.insert((request.id, request.fseq, request.ext_ord, copy as u8), sections);
                }
            }
        }

        self.add(request)
    }

    /// Stores a prepared request in its slot.
    pub fn add(&self, request: StageRequest) -> Result<RequestId> {
        let index = request.sort;
        if index >= self.slots.len() {
            return Err(StagerError::InvalidFormat("request slot out of range"));
        }
        tracing::debug!(
            target: tags::TARGET_REQUEST,
            slot = index,
            ino = request.id.ino,
            vsn = %request.vsn(),
            position = request.section().position,
            copy = request.copy,
            "request added"
        );
        self.persist(index, Some(&request))?;
        *self.slot(index) = Some(request);
        self.active.fetch_add(1, Ordering::AcqRel);
        self.publish_active();
        Ok(index)
    }

    pub fn get(&self, index: RequestId) -> Option<StageRequest> {
        self.slots.get(index).and_then(|slot| lock_unpoisoned(slot).clone())
    }

    /// Reads a request without cloning it.
    pub fn with<R>(&self, index: RequestId, f: impl FnOnce(&StageRequest) -> R) -> Option<R> {
        let slot = self.slots.get(index)?;
        lock_unpoisoned(slot).as_ref().map(f)
    }

    /// Mutates a request under its lock and writes it through to the table.
    pub fn update<R>(&self, index: RequestId, f: impl FnOnce(&mut StageRequest) -> R) -> Option<R> {
        let slot = self.slots.get(index)?;
        let mut guard = lock_unpoisoned(slot);
        let request = guard.as_mut()?;
        let result = f(request);
        if let Err(err) = self.persist(index, Some(request)) {
            tracing::error!(target: tags::TARGET_REQUEST, slot = index, error = %err, "request table write failed");
        }
        Some(result)
    }

    /// Frees the slot of a finished request.
    pub fn delete(&self, index: RequestId) -> Option<StageRequest> {
        let request = self.slots.get(index).and_then(|slot| lock_unpoisoned(slot).take())?;
        {
            // A duplicate of the same file shares the chain's sections.
            let mut extensions = lock_unpoisoned(&self.extensions);
            let shared = !self
                .find(request.id, request.fseq, |other| other.ext_ord == request.ext_ord)
                .is_empty();
            if !shared {
                extensions.retain(|(id, fseq, ext_ord, _), _| {
                    !(*id == request.id && *fseq == request.fseq && *ext_ord == request.ext_ord)
                });
            }
        }
        if let Err(err) = self.persist(index, None) {
            tracing::error!(target: tags::TARGET_REQUEST, slot = index, error = %err, "request table write failed");
        }
        lock_unpoisoned(&self.free).push(index);
        self.active.fetch_sub(1, Ordering::AcqRel);
        self.publish_active();
        tracing::debug!(target: tags::TARGET_REQUEST, slot = index, ino = request.id.ino, "request deleted");
        Some(request)
    }

    /// Live request slots in slot order.
    pub fn ids(&self) -> Vec<RequestId> {
        (0..self.slots.len())
            .filter(|index| lock_unpoisoned(&self.slots[*index]).is_some())
            .collect()
    }

    /// Live requests for `id` in `fseq` matching `predicate`.
    pub fn find(
        &self,
        id: FileId,
        fseq: FsId,
        predicate: impl Fn(&StageRequest) -> bool,
    ) -> Vec<RequestId> {
        (0..self.slots.len())
            .filter(|index| {
                lock_unpoisoned(&self.slots[*index])
                    .as_ref()
                    .is_some_and(|request| request.id == id && request.fseq == fseq && predicate(request))
            })
            .collect()
    }

    /// Follow-on request carrying the next extension of `request`'s chain.
    pub fn find_next_extended(&self, request: &StageRequest) -> Option<RequestId> {
        let ext_ord = request.ext_ord + 1;
        self.find(request.id, request.fseq, |candidate| {
            candidate.ext_ord == ext_ord && candidate.flags.contains(RequestFlags::EXTENDED)
        })
        .into_iter()
        .next()
    }

    /// Marks the request the filesystem canceled and returns its slot.
    pub fn cancel(&self, id: FileId, fseq: FsId) -> Option<RequestId> {
        let index = self
            .find(id, fseq, |request| !request.flags.contains(RequestFlags::DUPLICATE))
            .into_iter()
            .min_by_key(|index| self.with(*index, |request| request.ext_ord).unwrap_or(u32::MAX))?;
        self.update(index, |request| {
            request.flags.insert(RequestFlags::CANCEL);
        })?;
        tracing::info!(target: tags::TARGET_REQUEST, slot = index, ino = id.ino, "request canceled");
        Some(index)
    }

    /// Section `se_ord` of the chain that `ext_ord` belongs to.
    ///
    /// Ordinal zero is the inline section; later ones come from the extension record.
    pub fn extension_section(
        &self,
        id: FileId,
        fseq: FsId,
        ext_ord: u32,
        copy: u8,
        se_ord: u16,
    ) -> Option<Section> {
        if se_ord == 0 {
            return None;
        }
        lock_unpoisoned(&self.extensions)
            .get(&(id, fseq, ext_ord, copy))
            .and_then(|sections| sections.get(se_ord as usize - 1).cloned())
    }

    /// Next usable copy of a request, searching cyclically from `start`.
    pub fn arcopy(&self, index: RequestId, start: usize) -> Option<u8> {
        self.with(index, |request| request.arcopy(start)).flatten()
    }

    /// Marks the current copy damaged when the request's error calls for it.
    pub fn damage_arcopy(&self, index: RequestId) -> bool {
        self.update(index, StageRequest::damage_arcopy).unwrap_or(false)
    }

    /// Appends a finished request to the done list and wakes the waiter.
    pub fn set_done(&self, index: RequestId) {
        let mut done = lock_unpoisoned(&self.done);
        let linked = self.update(index, |request| {
            request.next = None;
            request.flags.insert(RequestFlags::DONE);
        });
        if linked.is_none() {
            return;
        }
        match done.last {
            Some(last) => {
                self.update(last, |request| request.next = Some(index));
            }
            None => done.first = Some(index),
        }
        done.last = Some(index);
        done.len += 1;
        self.done_ready.notify_all();
    }

    /// Pops the oldest finished request, waiting up to `timeout` for one.
    pub fn wait_for_done(&self, timeout: Duration) -> Option<RequestId> {
        let deadline = Instant::now() + timeout;
        let mut done = lock_unpoisoned(&self.done);
        while done.first.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = wait_timeout_unpoisoned(&self.done_ready, done, deadline - now);
            done = guard;
        }
        self.pop_done(&mut done)
    }

    /// Pops the oldest finished request without waiting.
    pub fn take_done(&self) -> Option<RequestId> {
        let mut done = lock_unpoisoned(&self.done);
        self.pop_done(&mut done)
    }

    pub fn done_len(&self) -> usize {
        lock_unpoisoned(&self.done).len
    }

    fn pop_done(&self, done: &mut DoneList) -> Option<RequestId> {
        let index = done.first?;
        let next = self
            .update(index, |request| request.next.take())
            .flatten();
        done.first = next;
        if next.is_none() {
            done.last = None;
        }
        done.len = done.len.saturating_sub(1);
        Some(index)
    }

    pub fn flush(&self) -> Result<()> {
        match self.table.as_ref() {
            Some(table) => lock_unpoisoned(table).flush(),
            None => Ok(()),
        }
    }

    fn slot(&self, index: RequestId) -> MutexGuard<'_, Option<StageRequest>> {
        lock_unpoisoned(&self.slots[index])
    }

    fn persist(&self, index: RequestId, request: Option<&StageRequest>) -> Result<()> {
        let Some(table) = self.table.as_ref() else {
            return Ok(());
        };
        let mut table = lock_unpoisoned(table);
        match request {
            Some(request) => table.write_record(index, &request.to_bytes()),
            None => table.write_record(index, &[]),
        }
    }

    fn publish_active(&self) {
        telemetry::set_gauge(
            tags::METRIC_REQUEST_ACTIVE,
            self.active_count() as u64,
            &[("subsystem", "request"), ("op", "active")],
        );
    }
}

/// Whether finishing `request` still needs extension sections of its multivolume chain.
fn needs_extension(request: &StageRequest) -> bool {
    if request.is_done() {
        return request.flags.contains(RequestFlags::MULTIVOL);
    }
    request.current().is_multivolume()
        || request.is_continuation()
        || request.flags.intersects(RequestFlags::MULTIVOL | RequestFlags::EXTENDED)
}

fn is_valid_record(request: &StageRequest, index: RequestId) -> bool {
    request.sort == index && (request.copy as usize) < MAX_ARCHIVE && request.id.ino != 0
}

fn request_from_descriptor(descriptor: &StageDescriptor, max_retries: u8) -> Result<StageRequest> {
    let mut ar: [ArchiveCopy; MAX_ARCHIVE] = Default::default();
    for (slot, placement) in ar.iter_mut().zip(descriptor.copies.iter()) {
        if let Some(placement) = placement {
            *slot = placement.copy.clone();
        }
    }

    let mut request = StageRequest {
        id: descriptor.id,
        fseq: descriptor.fseq,
        offset: descriptor.offset,
        len: descriptor.len,
        ar,
        retry: max_retries,
        uid: descriptor.uid,
        gid: descriptor.gid,
        directio: descriptor.directio,
        ext_ord: descriptor.ext_ord,
        ..StageRequest::default()
    };

    let preferred = descriptor.copy as usize % MAX_ARCHIVE;
    request.copy = if request.ar[preferred].is_usable() && !request.ar[preferred].section.vsn.is_empty() {
        preferred as u8
    } else {
        request
            .arcopy(preferred)
            .ok_or(StagerError::InvalidFormat("request has no usable archive copy"))?
    };

    let copy = request.current().clone();
    request.flags.set(RequestFlags::MULTIVOL, copy.is_multivolume());
    request.flags.set(RequestFlags::PAX_HEADER, copy.flags.contains(CopyFlags::PAX_HEADER));
    request.flags.set(RequestFlags::STAGE_NEVER, descriptor.stage_never);
    request.flags.set(RequestFlags::STAGE_PARTIAL, descriptor.stage_partial);
    request.flags.set(RequestFlags::SKIP_HEADER, descriptor.offset > 0);
    if descriptor.ext_ord > 0 {
        request.flags.insert(RequestFlags::EXTENDED | RequestFlags::HELD);
        request.vsn_cnt = (descriptor.ext_ord as usize * MAX_VSN_SECTIONS) as u16;
    }
    if let Some(checksum) = descriptor.checksum {
        if descriptor.offset == 0 && !descriptor.stage_partial {
            request.flags.insert(RequestFlags::CSUSE);
            request.checksum = ChecksumSpec {
                algorithm: Some(checksum.algorithm),
                long_name: checksum.long_name,
                partial: None,
            };
        }
    }
    Ok(request)
}
