use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::context::StagerContext;
use crate::stream::{StreamFlags, StreamId};
use crate::sync::{CancellationToken, Latch, lock_unpoisoned};
use crate::telemetry::tags;
use crate::types::{MediaType, Vsn};

/// One-shot thread waiting for an operator to bring a volume back.
///
/// When the catalog reports the volume available again the stream gets `WAIT_DONE`
/// and the scheduler is woken.
#[derive(Debug)]
pub struct ReloadWatcher {
    token: CancellationToken,
    stop: Arc<Latch>,
    handle: Option<JoinHandle<()>>,
}

impl ReloadWatcher {
    pub fn spawn(ctx: Arc<StagerContext>, stream: StreamId, vsn: Vsn, media: MediaType) -> std::io::Result<Self> {
        let token = CancellationToken::new();
        let stop = Arc::new(Latch::new());
        let watcher_token = token.clone();
        let watcher_stop = Arc::clone(&stop);
        let interval = ctx.config.scheduler.reload_poll_interval;

        let handle = thread::Builder::new()
            .name(format!("stager-reload-{vsn}"))
            .spawn(move || {
                loop {
                    if watcher_token.is_canceled() {
                        return;
                    }
                    let back = ctx
                        .catalog
                        .find_volume(&vsn, media)
                        .is_some_and(|volume| !volume.unavailable);
                    if back {
                        break;
                    }
                    watcher_stop.wait_timeout(interval);
                }
                if let Some(handle) = ctx.streams.get(stream) {
                    lock_unpoisoned(&handle).flags.insert(StreamFlags::WAIT_DONE);
                }
                tracing::info!(target: tags::TARGET_SCHEDULER, stream, vsn = %vsn, "volume reloaded");
                ctx.wake.post();
            })?;

        Ok(Self {
            token,
            stop,
            handle: Some(handle),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stops the watcher and waits for its thread.
    pub fn cancel(mut self) {
        self.token.cancel();
        self.stop.post();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ReloadWatcher {
    fn drop(&mut self) {
        self.token.cancel();
        self.stop.post();
    }
}
