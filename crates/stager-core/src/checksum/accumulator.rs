use std::ops::Range;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use super::{ChecksumState, ChecksumValue, compare_values};
use crate::Result;
use crate::buffer::BlockCell;
use crate::sync::{lock_unpoisoned, wait_unpoisoned};

/// Long-lived checksum thread of one pipeline.
///
/// The cache writer hands each block to [`feed`](Self::feed) before writing it and calls
/// [`wait_for_block`](Self::wait_for_block) before giving the block back to the ring, so
/// the fold never races with the block being refilled.
pub struct ChecksumAccumulator {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

struct Shared {
    state: Mutex<AccState>,
    fed: Condvar,
    folded: Condvar,
}

#[derive(Default)]
struct AccState {
    pending: Option<(BlockCell, Range<usize>)>,
    folding: bool,
    checksum: Option<ChecksumState>,
    folded_bytes: u64,
    shutdown: bool,
}

impl ChecksumAccumulator {
    pub fn spawn(name: &str) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(AccState::default()),
            fed: Condvar::new(),
            folded: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("{name}-checksum"))
            .spawn(move || run_fold_loop(&worker))?;
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Starts folding a new file, or resumes a retained one.
    pub fn begin(&self, state: ChecksumState) {
        let mut acc = self.wait_idle();
        acc.checksum = Some(state);
        acc.folded_bytes = 0;
    }

    /// Queues `range` of the block for folding and returns without waiting for it.
    pub fn feed(&self, cell: BlockCell, range: Range<usize>) {
        let mut acc = self.wait_idle();
        acc.pending = Some((cell, range));
        self.shared.fed.notify_all();
    }

    /// Blocks until the most recently fed block has been folded in.
    pub fn wait_for_block(&self) {
        drop(self.wait_idle());
    }

    /// Current value of the running checksum.
    pub fn value(&self) -> Option<ChecksumValue> {
        self.wait_idle().checksum.as_ref().map(ChecksumState::value)
    }

    pub fn folded_bytes(&self) -> u64 {
        self.wait_idle().folded_bytes
    }

    /// Detaches the running state, for retention with an open cache file.
    pub fn take(&self) -> Option<ChecksumState> {
        self.wait_idle().checksum.take()
    }

    /// Compares the folded value against the value recorded at archive time.
    pub fn compare(&self, recorded: ChecksumValue) -> Result<()> {
        let acc = self.wait_idle();
        match acc.checksum.as_ref() {
            Some(state) => compare_values(state.algorithm(), recorded, state.value()),
            None => Ok(()),
        }
    }

    fn wait_idle(&self) -> std::sync::MutexGuard<'_, AccState> {
        let mut acc = lock_unpoisoned(&self.shared.state);
        while acc.pending.is_some() || acc.folding {
            acc = wait_unpoisoned(&self.shared.folded, acc);
        }
        acc
    }
}

impl Drop for ChecksumAccumulator {
    fn drop(&mut self) {
        {
            let mut acc = lock_unpoisoned(&self.shared.state);
            acc.shutdown = true;
            self.shared.fed.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_fold_loop(shared: &Shared) {
    loop {
        let (cell, range, mut checksum) = {
            let mut acc = lock_unpoisoned(&shared.state);
            while acc.pending.is_none() && !acc.shutdown {
                acc = wait_unpoisoned(&shared.fed, acc);
            }
            let Some((cell, range)) = acc.pending.take() else {
                return;
            };
            acc.folding = true;
            (cell, range, acc.checksum.take())
        };

        let len = range.len() as u64;
        if let Some(state) = checksum.as_mut() {
            let block = match cell.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let end = range.end.min(block.len());
            let start = range.start.min(end);
            state.update(&block[start..end]);
        }

        let mut acc = lock_unpoisoned(&shared.state);
        acc.checksum = checksum;
        acc.folded_bytes += len;
        acc.folding = false;
        shared.folded.notify_all();
    }
}
