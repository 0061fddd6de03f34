use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, unbounded};

use super::MediaSource;
use crate::error::StageErrno;
use crate::sync::CancellationToken;
use crate::telemetry;
use crate::telemetry::tags;
use crate::types::{Section, Vsn};
use crate::{Result, StagerError};

/// Content-addressable store holding one object per archived section.
pub trait ObjectStore: Send + Sync {
    fn contains_volume(&self, vsn: &Vsn) -> bool;
    /// Reads up to `len` bytes of object `position` starting at `offset`; an empty result
    /// marks the end of the object.
    fn fetch(&self, vsn: &Vsn, position: u64, offset: u64, len: usize) -> io::Result<Bytes>;
}

struct FetchRequest {
    generation: u64,
    vsn: Vsn,
    position: u64,
    offset: u64,
    len: usize,
}

struct FetchReply {
    generation: u64,
    offset: u64,
    data: io::Result<Bytes>,
}

/// Silo volume read through a background fetch thread.
///
/// The foreground `read` hands range requests to the fetcher and blocks on its reply.
/// Bytes delivered beyond what a read asked for are kept as overrun for the next read,
/// and one range is prefetched while the caller consumes the current one.
pub struct SiloSource {
    requests: Option<Sender<FetchRequest>>,
    replies: Receiver<FetchReply>,
    fetcher: Option<JoinHandle<()>>,
    store: Arc<dyn ObjectStore>,
    block_size: usize,
    fetch_size: usize,
    vsn: Option<Vsn>,
    object: Option<u64>,
    offset: u64,
    overrun: Bytes,
    in_flight: bool,
    generation: u64,
    block: u64,
    eof: bool,
}

impl SiloSource {
    pub fn new(store: Arc<dyn ObjectStore>, block_size: usize, fetch_size: usize) -> Result<Self> {
        let (requests, inbox) = unbounded::<FetchRequest>();
        let (outbox, replies) = unbounded::<FetchReply>();
        let fetch_store = Arc::clone(&store);
        let fetcher = thread::Builder::new()
            .name("silo-fetch".to_string())
            .spawn(move || {
                for request in inbox {
                    let data = fetch_store.fetch(
                        &request.vsn,
                        request.position,
                        request.offset,
                        request.len,
                    );
                    let reply = FetchReply {
                        generation: request.generation,
                        offset: request.offset,
                        data,
                    };
                    if outbox.send(reply).is_err() {
                        break;
                    }
                }
            })?;
        Ok(Self {
            requests: Some(requests),
            replies,
            fetcher: Some(fetcher),
            store,
            block_size,
            fetch_size: fetch_size.max(block_size),
            vsn: None,
            object: None,
            offset: 0,
            overrun: Bytes::new(),
            in_flight: false,
            generation: 0,
            block: 0,
            eof: false,
        })
    }

    /// Bytes already fetched and not yet returned by `read`.
    pub fn overrun_len(&self) -> usize {
        self.overrun.len()
    }

    fn invalidate(&mut self) {
        self.generation += 1;
        self.overrun = Bytes::new();
        self.in_flight = false;
        self.eof = false;
    }

    fn request(&mut self, offset: u64, len: usize) -> Result<()> {
        let (Some(vsn), Some(position)) = (self.vsn.clone(), self.object) else {
            return Err(StagerError::Stage(StageErrno::Io).with_context("no silo object addressed"));
        };
        let Some(requests) = self.requests.as_ref() else {
            return Err(StagerError::Stage(StageErrno::NoDevice));
        };
        requests
            .send(FetchRequest {
                generation: self.generation,
                vsn,
                position,
                offset,
                len,
            })
            .map_err(|_| StagerError::Stage(StageErrno::NoDevice).with_context("silo fetcher stopped"))?;
        self.in_flight = true;
        Ok(())
    }

    fn wait_reply(&mut self) -> Result<()> {
        loop {
            let reply = self
                .replies
                .recv()
                .map_err(|_| StagerError::Stage(StageErrno::NoDevice).with_context("silo fetcher stopped"))?;
            if reply.generation != self.generation {
                continue;
            }
            self.in_flight = false;
            let data = reply.data.map_err(|err| {
                StagerError::from(err).with_context(format!("silo fetch at {}", reply.offset))
            })?;
            if reply.offset != self.offset {
                // Prefetched range no longer lines up with the read cursor.
                return self.request(self.offset, self.fetch_size);
            }
            if data.is_empty() {
                self.eof = true;
            }
            self.overrun = data;
            return Ok(());
        }
    }
}

impl Drop for SiloSource {
    fn drop(&mut self) {
        self.requests = None;
        if let Some(fetcher) = self.fetcher.take() {
            let _ = fetcher.join();
        }
    }
}

impl MediaSource for SiloSource {
    fn load(&mut self, vsn: &Vsn) -> Result<usize> {
        if !self.store.contains_volume(vsn) {
            return Err(StagerError::Stage(StageErrno::NoDevice).with_context(format!("silo volume {vsn}")));
        }
        if self.vsn.as_ref() != Some(vsn) {
            self.invalidate();
            self.vsn = Some(vsn.clone());
            self.object = None;
            telemetry::increment_counter(
                tags::METRIC_MEDIA_LOAD_COUNT,
                1,
                &[("subsystem", "media"), ("op", "load"), ("media", "silo")],
            );
        }
        Ok(self.block_size)
    }

    fn next_file(&mut self, section: &Section) -> Result<()> {
        if self.object == Some(section.position) {
            return Ok(());
        }
        self.invalidate();
        self.object = Some(section.position);
        self.offset = 0;
        self.block = 0;
        Ok(())
    }

    fn end_file(&mut self) -> Result<()> {
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let want = self.block_size.min(buf.len());
        let mut filled = 0;
        while filled < want {
            if !self.overrun.is_empty() {
                let take = self.overrun.len().min(want - filled);
                let chunk = self.overrun.split_to(take);
                buf[filled..filled + take].copy_from_slice(&chunk);
                filled += take;
                self.offset += take as u64;
                continue;
            }
            if self.eof {
                break;
            }
            if !self.in_flight {
                let len = self.fetch_size.max(want - filled);
                self.request(self.offset, len)?;
            }
            self.wait_reply()?;
        }

        if filled > 0 {
            self.block += 1;
        }
        if !self.eof && !self.in_flight && self.overrun.is_empty() {
            self.request(self.offset, self.fetch_size)?;
        }
        telemetry::increment_counter(
            tags::METRIC_MEDIA_READ_BYTES,
            filled as u64,
            &[("subsystem", "media"), ("op", "read"), ("media", "silo")],
        );
        Ok(filled)
    }

    fn seek(&mut self, block: u64, cancel: &CancellationToken) -> Result<u64> {
        if cancel.is_canceled() {
            return Ok(self.block);
        }
        self.invalidate();
        self.offset = block * self.block_size as u64;
        self.block = block;
        Ok(block)
    }

    fn position(&self) -> u64 {
        self.block
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn unload(&mut self) -> Result<()> {
        self.invalidate();
        self.vsn = None;
        self.object = None;
        self.offset = 0;
        self.block = 0;
        Ok(())
    }
}
