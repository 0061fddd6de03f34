use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::StageErrno;
use crate::sync::{lock_unpoisoned, wait_unpoisoned};
use crate::telemetry;
use crate::telemetry::tags;

/// Shared storage of one ring block.
pub type BlockCell = Arc<RwLock<Box<[u8]>>>;

/// Metadata attached to a ring block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockTag {
    /// Media block number the slot holds, used for reuse without reseeking.
    pub block: Option<u64>,
    /// Failure recorded by the producer instead of data.
    pub error: Option<StageErrno>,
    /// Valid bytes in the slot.
    pub len: usize,
}

/// Fixed-count circular buffer of equal-size blocks shared by one producer and one consumer.
///
/// The `in`/`out` cursors are byte offsets from the buffer base. One block is always kept
/// free, so `in == out` means empty and `in + block == out` means full.
#[derive(Debug)]
pub struct RingBuffer {
    block_size: usize,
    blocks: Vec<BlockCell>,
    state: Mutex<RingState>,
    space: Condvar,
    data: Condvar,
    metrics: RingMetricsInner,
}

#[derive(Debug)]
struct RingState {
    in_off: usize,
    out_off: usize,
    tags: Vec<BlockTag>,
    interrupted: bool,
}

impl RingBuffer {
    /// Creates a ring of `blocks` blocks of `block_size` bytes; at least two blocks are kept.
    pub fn new(blocks: usize, block_size: usize) -> Self {
        let count = blocks.max(2);
        let cells = (0..count)
            .map(|_| Arc::new(RwLock::new(vec![0u8; block_size].into_boxed_slice())))
            .collect();
        Self {
            block_size,
            blocks: cells,
            state: Mutex::new(RingState {
                in_off: 0,
                out_off: 0,
                tags: vec![BlockTag::default(); count],
                interrupted: false,
            }),
            space: Condvar::new(),
            data: Condvar::new(),
            metrics: RingMetricsInner::default(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    fn size(&self) -> usize {
        self.block_size * self.blocks.len()
    }

    fn index_of(&self, offset: usize) -> usize {
        offset / self.block_size
    }

    fn is_full(&self, state: &RingState) -> bool {
        (state.in_off + self.block_size) % self.size() == state.out_off
    }

    /// Number of blocks written and not yet consumed.
    pub fn filled_blocks(&self) -> usize {
        let state = lock_unpoisoned(&self.state);
        let size = self.size();
        ((state.in_off + size - state.out_off) % size) / self.block_size
    }

    /// Blocks until a block is free and returns it as the `in` slot.
    ///
    /// Returns `None` once the ring has been interrupted.
    pub fn reserve_for_write(&self) -> Option<WriteSlot<'_>> {
        let mut state = lock_unpoisoned(&self.state);
        if self.is_full(&state) && !state.interrupted {
            self.metrics.write_waits.fetch_add(1, Ordering::Relaxed);
            telemetry::increment_counter(
                tags::METRIC_RING_WRITE_WAIT_COUNT,
                1,
                &[("subsystem", "ring"), ("op", "reserve")],
            );
        }
        while self.is_full(&state) && !state.interrupted {
            state = wait_unpoisoned(&self.space, state);
        }
        if state.interrupted {
            return None;
        }
        let index = self.index_of(state.in_off);
        state.tags[index] = BlockTag::default();
        drop(state);

        let data = match self.blocks[index].write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Some(WriteSlot {
            index,
            data,
            tag: BlockTag::default(),
        })
    }

    /// Publishes the slot to the consumer side.
    pub fn advance_write(&self, slot: WriteSlot<'_>) {
        let WriteSlot { index, data, tag } = slot;
        drop(data);

        let mut state = lock_unpoisoned(&self.state);
        state.tags[index] = tag;
        // A reset or reposition while the slot was out invalidates it.
        if self.index_of(state.in_off) == index {
            state.in_off = (state.in_off + self.block_size) % self.size();
        }
        self.metrics.writes.fetch_add(1, Ordering::Relaxed);
        self.data.notify_all();
    }

    /// Blocks until a filled block exists and returns it with its tag.
    ///
    /// Returns `None` once the ring has been interrupted.
    pub fn wait_for_data(&self) -> Option<ReadSlot<'_>> {
        let mut state = lock_unpoisoned(&self.state);
        if state.in_off == state.out_off && !state.interrupted {
            self.metrics.read_waits.fetch_add(1, Ordering::Relaxed);
            telemetry::increment_counter(
                tags::METRIC_RING_READ_WAIT_COUNT,
                1,
                &[("subsystem", "ring"), ("op", "wait")],
            );
        }
        while state.in_off == state.out_off && !state.interrupted {
            state = wait_unpoisoned(&self.data, state);
        }
        if state.interrupted {
            return None;
        }
        let index = self.index_of(state.out_off);
        let tag = state.tags[index];
        drop(state);

        let data = match self.blocks[index].read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Some(ReadSlot {
            index,
            tag,
            cell: Arc::clone(&self.blocks[index]),
            data,
        })
    }

    /// Frees the consumed slot for the producer.
    pub fn advance_read(&self, slot: ReadSlot<'_>) {
        let index = slot.index;
        drop(slot);

        let mut state = lock_unpoisoned(&self.state);
        if self.index_of(state.out_off) == index && state.out_off != state.in_off {
            state.out_off = (state.out_off + self.block_size) % self.size();
        }
        self.metrics.reads.fetch_add(1, Ordering::Relaxed);
        self.space.notify_all();
    }

    pub fn set_block_tag(&self, index: usize, block: u64) {
        if let Some(tag) = lock_unpoisoned(&self.state).tags.get_mut(index) {
            tag.block = Some(block);
        }
    }

    pub fn block_tag(&self, index: usize) -> Option<u64> {
        lock_unpoisoned(&self.state)
            .tags
            .get(index)
            .and_then(|tag| tag.block)
    }

    pub fn set_error(&self, index: usize, error: StageErrno) {
        if let Some(tag) = lock_unpoisoned(&self.state).tags.get_mut(index) {
            tag.error = Some(error);
        }
    }

    /// Full tag of the slot at `index`.
    pub fn tag(&self, index: usize) -> Option<BlockTag> {
        lock_unpoisoned(&self.state).tags.get(index).copied()
    }

    /// Shared handle to the storage of the slot at `index`.
    pub fn cell(&self, index: usize) -> Option<BlockCell> {
        self.blocks.get(index).map(Arc::clone)
    }

    pub fn error(&self, index: usize) -> Option<StageErrno> {
        lock_unpoisoned(&self.state)
            .tags
            .get(index)
            .and_then(|tag| tag.error)
    }

    /// Looks for a slot already holding media block `block`.
    ///
    /// On a hit the cursors are moved so that slot is the only filled block and its index
    /// is returned. On a miss the whole ring is reset.
    pub fn find_block_by_number(&self, block: u64) -> Option<usize> {
        let mut state = lock_unpoisoned(&self.state);
        let hit = state
            .tags
            .iter()
            .position(|tag| tag.block == Some(block) && tag.error.is_none() && tag.len > 0);

        match hit {
            Some(index) => {
                state.out_off = index * self.block_size;
                state.in_off = ((index + 1) % self.blocks.len()) * self.block_size;
                state.interrupted = false;
                self.metrics.reuse_hits.fetch_add(1, Ordering::Relaxed);
                telemetry::increment_counter(
                    tags::METRIC_RING_REUSE_HIT_COUNT,
                    1,
                    &[("subsystem", "ring"), ("op", "find_block")],
                );
                tracing::trace!(target: tags::TARGET_RING, block, index, "ring block reused");
                self.data.notify_all();
                Some(index)
            }
            None => {
                Self::clear(&mut state);
                self.metrics.reuse_misses.fetch_add(1, Ordering::Relaxed);
                telemetry::increment_counter(
                    tags::METRIC_RING_REUSE_MISS_COUNT,
                    1,
                    &[("subsystem", "ring"), ("op", "find_block")],
                );
                self.space.notify_all();
                None
            }
        }
    }

    /// Wakes every waiter; waits return `None` until the next [`reset`](Self::reset).
    pub fn interrupt(&self) {
        let mut state = lock_unpoisoned(&self.state);
        state.interrupted = true;
        self.space.notify_all();
        self.data.notify_all();
    }

    pub fn is_interrupted(&self) -> bool {
        lock_unpoisoned(&self.state).interrupted
    }

    /// Drops all buffered data and tags.
    pub fn reset(&self) {
        let mut state = lock_unpoisoned(&self.state);
        Self::clear(&mut state);
        self.space.notify_all();
    }

    fn clear(state: &mut RingState) {
        state.in_off = 0;
        state.out_off = 0;
        state.interrupted = false;
        for tag in &mut state.tags {
            *tag = BlockTag::default();
        }
    }

    pub fn metrics(&self) -> RingMetrics {
        RingMetrics {
            writes: self.metrics.writes.load(Ordering::Relaxed),
            reads: self.metrics.reads.load(Ordering::Relaxed),
            write_waits: self.metrics.write_waits.load(Ordering::Relaxed),
            read_waits: self.metrics.read_waits.load(Ordering::Relaxed),
            reuse_hits: self.metrics.reuse_hits.load(Ordering::Relaxed),
            reuse_misses: self.metrics.reuse_misses.load(Ordering::Relaxed),
        }
    }
}

/// Counters describing ring traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RingMetrics {
    pub writes: u64,
    pub reads: u64,
    pub write_waits: u64,
    pub read_waits: u64,
    pub reuse_hits: u64,
    pub reuse_misses: u64,
}

#[derive(Debug, Default)]
struct RingMetricsInner {
    writes: AtomicU64,
    reads: AtomicU64,
    write_waits: AtomicU64,
    read_waits: AtomicU64,
    reuse_hits: AtomicU64,
    reuse_misses: AtomicU64,
}

/// Producer-owned block between `reserve_for_write` and `advance_write`.
#[derive(Debug)]
pub struct WriteSlot<'a> {
    index: usize,
    data: RwLockWriteGuard<'a, Box<[u8]>>,
    tag: BlockTag,
}

impl WriteSlot<'_> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Records how many bytes of the block are valid.
    pub fn set_len(&mut self, len: usize) {
        self.tag.len = len.min(self.data.len());
    }

    pub fn len(&self) -> usize {
        self.tag.len
    }

    pub fn is_empty(&self) -> bool {
        self.tag.len == 0
    }

    /// Size of the block storage.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn set_block(&mut self, block: u64) {
        self.tag.block = Some(block);
    }

    pub fn set_error(&mut self, error: StageErrno) {
        self.tag.error = Some(error);
    }
}

impl Deref for WriteSlot<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for WriteSlot<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

/// Consumer-owned block between `wait_for_data` and `advance_read`.
#[derive(Debug)]
pub struct ReadSlot<'a> {
    index: usize,
    tag: BlockTag,
    cell: BlockCell,
    data: RwLockReadGuard<'a, Box<[u8]>>,
}

impl ReadSlot<'_> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn tag(&self) -> BlockTag {
        self.tag
    }

    pub fn error(&self) -> Option<StageErrno> {
        self.tag.error
    }

    /// Valid bytes of the block.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.tag.len.min(self.data.len())]
    }

    /// Shared handle to the block storage for a concurrent reader such as the checksum thread.
    pub fn cell(&self) -> BlockCell {
        Arc::clone(&self.cell)
    }
}
