use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded};

use crate::telemetry;
use crate::telemetry::tags;

/// Recycler of growable scratch buffers.
///
/// Archive headers that straddle two ring blocks are copied into one of these before
/// validation. Buffers keep their capacity between uses, so a long extended header only
/// grows a buffer once per worker.
#[derive(Debug, Clone)]
pub struct ScratchPool {
    recycler: Sender<Vec<u8>>,
    receiver: Receiver<Vec<u8>>,
    initial_capacity: usize,
    metrics: Arc<ScratchMetricsInner>,
}

impl ScratchPool {
    pub fn new(initial_capacity: usize, max_buffers: usize) -> Self {
        let (recycler, receiver) = bounded(max_buffers.max(1));
        Self {
            recycler,
            receiver,
            initial_capacity,
            metrics: Arc::new(ScratchMetricsInner::default()),
        }
    }

    /// Takes an empty buffer, reusing a returned one when available.
    pub fn acquire(&self) -> ScratchBuffer {
        let buffer = match self.receiver.try_recv() {
            Ok(mut buffer) => {
                buffer.clear();
                self.metrics.recycled.fetch_add(1, Ordering::Relaxed);
                telemetry::increment_counter(
                    tags::METRIC_BUFFER_ACQUIRE_RECYCLED_COUNT,
                    1,
                    &[("subsystem", "buffer"), ("op", "acquire"), ("result", "recycled")],
                );
                buffer
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                self.metrics.created.fetch_add(1, Ordering::Relaxed);
                telemetry::increment_counter(
                    tags::METRIC_BUFFER_ACQUIRE_CREATED_COUNT,
                    1,
                    &[("subsystem", "buffer"), ("op", "acquire"), ("result", "created")],
                );
                Vec::with_capacity(self.initial_capacity)
            }
        };

        ScratchBuffer {
            buffer,
            recycler: self.recycler.clone(),
            metrics: Arc::clone(&self.metrics),
        }
    }

    pub fn metrics(&self) -> ScratchMetrics {
        ScratchMetrics {
            created: self.metrics.created.load(Ordering::Relaxed),
            recycled: self.metrics.recycled.load(Ordering::Relaxed),
            dropped: self.metrics.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for ScratchPool {
    fn default() -> Self {
        Self::new(2 * crate::format::TAR_RECORD_SIZE, 4)
    }
}

/// Counters describing scratch buffer reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScratchMetrics {
    pub created: usize,
    pub recycled: usize,
    /// Returned buffers discarded because the pool was full.
    pub dropped: usize,
}

#[derive(Debug, Default)]
struct ScratchMetricsInner {
    created: AtomicUsize,
    recycled: AtomicUsize,
    dropped: AtomicUsize,
}

/// Buffer on loan from a [`ScratchPool`]; returned on drop.
#[derive(Debug)]
pub struct ScratchBuffer {
    buffer: Vec<u8>,
    recycler: Sender<Vec<u8>>,
    metrics: Arc<ScratchMetricsInner>,
}

impl Deref for ScratchBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl DerefMut for ScratchBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

impl Drop for ScratchBuffer {
    fn drop(&mut self) {
        let buffer = std::mem::take(&mut self.buffer);
        if self.recycler.try_send(buffer).is_err() {
            self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
            telemetry::increment_counter(
                tags::METRIC_BUFFER_RECYCLE_DROPPED_COUNT,
                1,
                &[("subsystem", "buffer"), ("op", "recycle"), ("result", "dropped")],
            );
        }
    }
}
