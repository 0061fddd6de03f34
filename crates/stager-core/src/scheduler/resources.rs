use std::sync::Arc;

use super::{ResourceScheduler, StreamHandle, detach_descriptor, drain};
use crate::collab::VolumeInfo;
use crate::error::StageErrno;
use crate::stream::{StreamFlags, StreamId, StreamPriority};
use crate::sync::lock_unpoisoned;
use crate::telemetry::tags;
use crate::types::{Pid, RequestFlags};

use super::reload::ReloadWatcher;

impl ResourceScheduler {
    /// Decides whether `handle` can be started now.
    ///
    /// Checks run in order: cleanup streams always start, then the filesystem must be
    /// mounted, staging must not be suspended, the volume must be known and usable, no
    /// worker may already be on the same spot, and a drive must be available.
    pub(super) fn find_resources(&mut self, id: StreamId, handle: &StreamHandle) -> StreamPriority {
        let stream = lock_unpoisoned(handle).clone();
        let ctx = Arc::clone(&self.ctx);
        let store = &ctx.store;
        let Some(first) = stream.first() else {
            return StreamPriority::NoResources;
        };
        if stream.is_cleanup() {
            return StreamPriority::Start;
        }
        if let Some(fseq) = stream.fseq(store) {
            if !self.ctx.fs.is_mounted(fseq) {
                return StreamPriority::NoFilesystem;
            }
        }
        if self.ctx.catalog.staging_suspended(stream.media) {
            return StreamPriority::Idle;
        }

        let holds_dcache = stream.holds_dcache(store);
        let volume = self
            .ctx
            .catalog
            .find_volume(&stream.vsn, stream.media)
            .filter(|volume| {
                self.ctx
                    .catalog
                    .library(volume.library)
                    .is_some_and(|library| library.on)
            });
        let Some(volume) = volume else {
            if holds_dcache {
                // The filesystem is blocked on the retained descriptor; answer it now.
                self.mark_unavailable(handle);
                return StreamPriority::Start;
            }
            return StreamPriority::NoResources;
        };
        lock_unpoisoned(handle).library = Some(volume.library);

        if volume.unavailable {
            if holds_dcache {
                self.mark_unavailable(handle);
                return StreamPriority::Start;
            }
            if !self.ctx.config.scheduler.attended {
                self.error_stream(handle, StageErrno::NoDevice);
                return StreamPriority::NoResources;
            }
            return self.wait_for_reload(id, handle, &volume);
        }
        if volume.bad_media {
            if holds_dcache {
                self.mark_unavailable(handle);
                return StreamPriority::Start;
            }
            self.error_stream(handle, StageErrno::NoSpace);
            return StreamPriority::NoResources;
        }

        let position = store.with(first, |request| request.section().position).unwrap_or(0);
        if let Some(pid) = self.pool.busy_on(&stream.vsn, stream.media, position) {
            tracing::debug!(target: tags::TARGET_SCHEDULER, stream = id, pid, vsn = %stream.vsn, position, "volume busy");
            return StreamPriority::Busy;
        }

        if volume.loaded
            || self.ctx.catalog.drive_free(volume.library)
            || self.pool.idle_in_library(volume.library).is_some()
        {
            StreamPriority::Start
        } else {
            StreamPriority::NoResources
        }
    }

    /// Binds a startable stream to a worker. Returns true when bound.
    pub(super) fn start_copy(&mut self, handle: &StreamHandle) -> bool {
        let stream = lock_unpoisoned(handle).clone();

        if let Some(pid) = stream.context {
            match self.pool.find_by_pid(pid) {
                Some(index) if self.pool.copies()[index].is_idle() => {
                    return self.bind(index, handle);
                }
                Some(_) => {
                    lock_unpoisoned(handle).priority = StreamPriority::Busy;
                    return false;
                }
                None => {
                    self.orphaned_context(handle, Some(pid));
                    if stream.is_cleanup() {
                        return false;
                    }
                    if stream.flags.contains(StreamFlags::UNAVAIL) {
                        self.error_stream(handle, StageErrno::NoDevice);
                        return false;
                    }
                }
            }
        } else if stream.is_cleanup() {
            self.orphaned_context(handle, None);
            return false;
        }

        let Some(library) = stream.library else {
            return false;
        };
        let allowed = self
            .ctx
            .catalog
            .library(library)
            .map_or(0, |library| library.drives);

        let index = match self.pool.idle_in_library(library) {
            Some(index) => index,
            None if self.pool.created_count(library) < allowed => {
                let Some(index) = self.pool.not_created_in_library(library) else {
                    lock_unpoisoned(handle).priority = StreamPriority::Busy;
                    return false;
                };
                if let Err(err) = self.pool.spawn(index) {
                    tracing::warn!(target: tags::TARGET_SCHEDULER, library = library.0, error = %err, "worker start failed");
                    lock_unpoisoned(handle).priority = StreamPriority::Busy;
                    return false;
                }
                index
            }
            None => {
                lock_unpoisoned(handle).priority = StreamPriority::Busy;
                return false;
            }
        };
        self.bind(index, handle)
    }

    fn bind(&mut self, index: usize, handle: &StreamHandle) -> bool {
        let (id, vsn, media, first) = {
            let stream = lock_unpoisoned(handle);
            (stream.id, stream.vsn.clone(), stream.media, stream.first())
        };
        let position = first
            .and_then(|first| {
                self.ctx
                    .store
                    .with(first, |request| request.section().position)
            })
            .unwrap_or(0);

        match self.pool.bind(index, id, &vsn, media, position) {
            Ok(pid) => {
                let mut stream = lock_unpoisoned(handle);
                stream.flags.insert(StreamFlags::ACTIVE);
                stream.pid = Some(pid);
                stream.priority = StreamPriority::Start;
                tracing::info!(
                    target: tags::TARGET_SCHEDULER,
                    stream = id,
                    pid,
                    vsn = %vsn,
                    position,
                    count = stream.count,
                    "stream bound"
                );
                true
            }
            Err(err) => {
                tracing::warn!(target: tags::TARGET_SCHEDULER, stream = id, vsn = %vsn, error = %err, "bind failed");
                lock_unpoisoned(handle).priority = StreamPriority::Busy;
                false
            }
        }
    }

    /// The worker pinned by the stream's retained descriptor is gone, and the descriptor
    /// with it.
    fn orphaned_context(&self, handle: &StreamHandle, pid: Option<Pid>) {
        let mut stream = lock_unpoisoned(handle);
        tracing::warn!(target: tags::TARGET_SCHEDULER, stream = stream.id, pid = ?pid, "retaining worker gone");
        if stream.is_cleanup() {
            let members = drain(&mut stream, &self.ctx);
            stream.flags.insert(StreamFlags::CLEAR);
            drop(stream);
            for index in members {
                self.ctx.store.update(index, |request| {
                    detach_descriptor(request);
                    request.flags.remove(RequestFlags::DCACHE_CLOSE);
                });
                self.ctx.set_done(index);
            }
            return;
        }
        stream.context = None;
        for index in stream.members(&self.ctx.store) {
            self.ctx.store.update(index, |request| {
                if request.context == pid {
                    detach_descriptor(request);
                }
            });
        }
    }

    /// The volume cannot be used but a member holds a descriptor: start the stream only
    /// to close it and answer the filesystem.
    fn mark_unavailable(&self, handle: &StreamHandle) {
        let mut stream = lock_unpoisoned(handle);
        stream.flags.insert(StreamFlags::UNAVAIL);
        tracing::warn!(target: tags::TARGET_SCHEDULER, stream = stream.id, vsn = %stream.vsn, "volume unavailable with descriptor retained");
    }

    /// Fails every member of the stream with `errno`.
    fn error_stream(&self, handle: &StreamHandle, errno: StageErrno) {
        let members = {
            let mut stream = lock_unpoisoned(handle);
            stream.flags.insert(StreamFlags::ERROR | StreamFlags::CLEAR);
            stream.error = Some(errno);
            tracing::warn!(target: tags::TARGET_SCHEDULER, stream = stream.id, vsn = %stream.vsn, error = %errno, "stream failed");
            drain(&mut stream, &self.ctx)
        };
        for index in members {
            self.ctx.store.update(index, |request| {
                request.flags.remove(RequestFlags::ACTIVE);
                request.error.get_or_insert(errno);
            });
            self.ctx.set_done(index);
        }
    }

    fn wait_for_reload(&mut self, id: StreamId, handle: &StreamHandle, volume: &VolumeInfo) -> StreamPriority {
        if !self.ctx.catalog.request_load(&volume.vsn, volume.media) {
            self.error_stream(handle, StageErrno::NoDevice);
            return StreamPriority::NoResources;
        }
        if !self.watchers.contains_key(&id) {
            match ReloadWatcher::spawn(Arc::clone(&self.ctx), id, volume.vsn.clone(), volume.media) {
                Ok(watcher) => {
                    self.watchers.insert(id, watcher);
                }
                Err(err) => {
                    tracing::warn!(target: tags::TARGET_SCHEDULER, stream = id, error = %err, "reload watcher start failed");
                    return StreamPriority::NoResources;
                }
            }
        }
        lock_unpoisoned(handle).flags.insert(StreamFlags::WAIT);
        tracing::info!(target: tags::TARGET_SCHEDULER, stream = id, vsn = %volume.vsn, "waiting for volume reload");
        StreamPriority::Wait
    }
}
