//! Three-stage staging pipeline of one drive worker.
//!
//! The reader fills the read ring with media blocks and validates the archive header, the
//! reblocker drops the header and any skipped bytes and repacks the data into cache-sized
//! blocks, and the cache writer (the worker thread itself) folds each block into the
//! running checksum and writes it to the cache file. The stages hand each file over with
//! five latches:
//!
//! ```text
//! worker --read_ready--> reader --move_ready--> reblocker --write_ready--> writer
//! reader <--move_done-- reblocker        worker <--read_done-- reader
//! ```
//!
//! `move_ready` and `write_ready` are posted exactly once per file, also when the file
//! fails before any data moves, so no stage is ever left waiting for a plan.

mod reader;
mod reblock;
mod writer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::Result;
use crate::buffer::{RingBuffer, ScratchPool};
use crate::checksum::{ChecksumAccumulator, ChecksumState};
use crate::collab::CacheFile;
use crate::config::WorkerOptions;
use crate::error::StageErrno;
use crate::format::HeaderFormat;
use crate::media::{Media, MediaSource};
use crate::sync::{CancellationToken, Latch, lock_unpoisoned};
use crate::telemetry::tags;
use crate::types::{FileId, Section, Vsn};

/// Block size of the read ring before a medium is attached.
const DEFAULT_READ_BLOCK: usize = 64 * 1024;

/// Observable stage of the file in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineState {
    #[default]
    Idle,
    Positioning,
    Reading,
    HeaderValidating,
    Reblocking,
    Writing,
    Done,
    Error,
}

/// Everything the stages need to move one section of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageJob {
    pub id: FileId,
    pub section: Section,
    /// Header expected at the start of the archive record.
    pub header: HeaderFormat,
    /// Header length learned by an earlier attempt; the header is skipped unread.
    pub known_header_len: Option<usize>,
    /// Compare the size declared by the header with `requested`.
    pub verify: bool,
    /// File size the header must declare when `verify` is set.
    pub requested: u64,
    /// Data bytes to drop after the header.
    pub data_skip: u64,
    /// Data bytes to deliver to the cache.
    pub data_len: u64,
    /// Cache file offset of the first delivered byte.
    pub cache_offset: u64,
    /// In-place read retries available to this attempt.
    pub retries: u8,
}

/// Result of [`StagePipeline::run`].
#[derive(Debug, Default)]
pub struct StageOutcome {
    pub bytes_written: u64,
    pub error: Option<StageErrno>,
    pub retries_used: u8,
    /// Header length seen on media, when the header was read.
    pub header_len: Option<usize>,
    /// Running checksum after the last written byte.
    pub checksum: Option<ChecksumState>,
}

#[derive(Debug, Clone, Copy, Default)]
struct MovePlan {
    /// Bytes to drop from the start of the first published block.
    skip: u64,
    bytes: u64,
    error: Option<StageErrno>,
}

#[derive(Debug, Clone, Copy, Default)]
struct ReaderReport {
    retries_used: u8,
    header_len: Option<usize>,
}

struct PipelineShared {
    read_ring: Mutex<Arc<RingBuffer>>,
    write_ring: RingBuffer,
    read_buffers: usize,
    media: Mutex<Option<Media>>,
    job: Mutex<Option<StageJob>>,
    plan: Mutex<MovePlan>,
    report: Mutex<ReaderReport>,
    last_volume: Mutex<Option<(Vsn, u64)>>,
    read_ready: Latch,
    move_ready: Latch,
    write_ready: Latch,
    move_done: Latch,
    read_done: Latch,
    cancel: CancellationToken,
    shutdown: AtomicBool,
    state: Mutex<PipelineState>,
    scratch: ScratchPool,
}

impl PipelineShared {
    fn read_ring(&self) -> Arc<RingBuffer> {
        Arc::clone(&lock_unpoisoned(&self.read_ring))
    }

    fn set_state(&self, state: PipelineState) {
        let mut current = lock_unpoisoned(&self.state);
        if *current != state {
            tracing::trace!(target: tags::TARGET_PIPELINE, from = ?*current, to = ?state, "pipeline state");
            *current = state;
        }
    }

    /// Wakes every stage blocked on either ring.
    fn interrupt(&self) {
        self.read_ring().interrupt();
        self.write_ring.interrupt();
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// Reader, reblocker and checksum threads of one worker, plus the rings between them.
pub struct StagePipeline {
    shared: Arc<PipelineShared>,
    checksum: ChecksumAccumulator,
    reader: Option<JoinHandle<()>>,
    reblocker: Option<JoinHandle<()>>,
}

impl StagePipeline {
    pub fn spawn(name: &str, options: &WorkerOptions, scratch: ScratchPool) -> Result<Self> {
        let shared = Arc::new(PipelineShared {
            read_ring: Mutex::new(Arc::new(RingBuffer::new(
                options.read_buffers,
                DEFAULT_READ_BLOCK,
            ))),
            write_ring: RingBuffer::new(options.write_buffers, options.write_block_size),
            read_buffers: options.read_buffers,
            media: Mutex::new(None),
            job: Mutex::new(None),
            plan: Mutex::new(MovePlan::default()),
            report: Mutex::new(ReaderReport::default()),
            last_volume: Mutex::new(None),
            read_ready: Latch::new(),
            move_ready: Latch::new(),
            write_ready: Latch::new(),
            move_done: Latch::new(),
            read_done: Latch::new(),
            cancel: CancellationToken::new(),
            shutdown: AtomicBool::new(false),
            state: Mutex::new(PipelineState::Idle),
            scratch,
        });

        let checksum = ChecksumAccumulator::spawn(name)?;
        let reader_shared = Arc::clone(&shared);
        let reader = thread::Builder::new()
            .name(format!("{name}-reader"))
            .spawn(move || reader::run_reader(&reader_shared))?;
        let reblock_shared = Arc::clone(&shared);
        let reblocker = thread::Builder::new()
            .name(format!("{name}-reblock"))
            .spawn(move || reblock::run_reblocker(&reblock_shared))?;

        Ok(Self {
            shared,
            checksum,
            reader: Some(reader),
            reblocker: Some(reblocker),
        })
    }

    /// Installs the mounted medium, resizing the read ring to its block size.
    pub fn attach(&self, media: Media) {
        let block_size = media.block_size().max(1);
        {
            let mut ring = lock_unpoisoned(&self.shared.read_ring);
            if ring.block_size() != block_size {
                *ring = Arc::new(RingBuffer::new(self.shared.read_buffers, block_size));
            } else {
                ring.reset();
            }
        }
        *lock_unpoisoned(&self.shared.last_volume) = None;
        *lock_unpoisoned(&self.shared.media) = Some(media);
    }

    pub fn detach(&self) -> Option<Media> {
        self.shared.read_ring().reset();
        *lock_unpoisoned(&self.shared.last_volume) = None;
        lock_unpoisoned(&self.shared.media).take()
    }

    pub fn has_media(&self) -> bool {
        lock_unpoisoned(&self.shared.media).is_some()
    }

    /// Runs `f` on the attached medium between files.
    pub fn with_media<R>(&self, f: impl FnOnce(&mut Media) -> R) -> Option<R> {
        lock_unpoisoned(&self.shared.media).as_mut().map(f)
    }

    /// Drops buffered blocks that cannot belong to the next file.
    ///
    /// Blocks survive only while the volume stays the same and, for file-addressed media,
    /// while the next file lives at the same position.
    pub fn check_buffers(&self, vsn: &Vsn, position: u64, file_addressed: bool) {
        let mut last = lock_unpoisoned(&self.shared.last_volume);
        let same = last
            .as_ref()
            .is_some_and(|(seen, at)| seen == vsn && (!file_addressed || *at == position));
        if !same {
            self.shared.read_ring().reset();
        }
        *last = Some((vsn.clone(), position));
    }

    /// Token observed by every stage at block boundaries.
    pub fn cancel_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    pub fn state(&self) -> PipelineState {
        *lock_unpoisoned(&self.shared.state)
    }

    pub fn checksum(&self) -> &ChecksumAccumulator {
        &self.checksum
    }

    /// Stages one section into `cache`, folding written bytes into `checksum` when given.
    ///
    /// Blocks the calling thread, which acts as the cache writer, until every stage has
    /// finished with the file.
    pub fn run(
        &self,
        job: StageJob,
        cache: &mut dyn CacheFile,
        checksum: Option<ChecksumState>,
    ) -> StageOutcome {
        let cache_offset = job.cache_offset;
        let folding = checksum.is_some();
        if let Some(state) = checksum {
            self.checksum.begin(state);
        }
        *lock_unpoisoned(&self.shared.report) = ReaderReport::default();
        *lock_unpoisoned(&self.shared.job) = Some(job);
        self.shared.set_state(PipelineState::Positioning);
        self.shared.read_ready.post();

        let accumulator = folding.then_some(&self.checksum);
        let written = writer::write_file(&self.shared, cache, cache_offset, accumulator);
        self.shared.read_done.wait();

        let report = *lock_unpoisoned(&self.shared.report);
        lock_unpoisoned(&self.shared.job).take();
        if written.error.is_some() {
            self.shared.read_ring().reset();
            self.shared.write_ring.reset();
        }
        let checksum = if folding { self.checksum.take() } else { None };

        let outcome = StageOutcome {
            bytes_written: written.bytes,
            error: written.error,
            retries_used: report.retries_used,
            header_len: report.header_len,
            checksum,
        };
        self.shared.set_state(if outcome.error.is_some() {
            PipelineState::Error
        } else {
            PipelineState::Done
        });
        outcome
    }
}

impl Drop for StagePipeline {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.cancel.cancel();
        self.shared.interrupt();
        self.shared.read_ready.post();
        self.shared.move_ready.post();
        self.shared.move_done.post();
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.reblocker.take() {
            let _ = handle.join();
        }
    }
}
