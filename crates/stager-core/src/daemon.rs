//! Control daemon: an intake thread reading the filesystem and a scheduler thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::collab::{Catalog, FilesystemLink, IntakeEvent, MediaProvider, StageDescriptor};
use crate::config::StagerConfig;
use crate::context::StagerContext;
use crate::request::RequestStore;
use crate::scheduler::{ResourceScheduler, check_requests};
use crate::telemetry::stage::StageTelemetry;
use crate::telemetry::tags;
use crate::types::RequestFlags;
use crate::{Result, StagerError};

const INTAKE_POLL: Duration = Duration::from_millis(250);
const IDLE_POLL: Duration = Duration::from_millis(10);

/// What happens to queued requests when the daemon stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownMode {
    /// Leave them in the request table for the next run.
    #[default]
    Preserve,
    /// Answer every queued request with `NoDevice`.
    FailQueued,
}

/// Running staging daemon.
pub struct Stager {
    ctx: Arc<StagerContext>,
    stop: Arc<AtomicBool>,
    fail_queued: Arc<AtomicBool>,
    intake: Option<JoinHandle<()>>,
    scheduler: Option<JoinHandle<()>>,
}

impl Stager {
    /// Opens the request table, recovers a previous run and starts both threads.
    pub fn start(
        config: StagerConfig,
        fs: Arc<dyn FilesystemLink>,
        catalog: Arc<dyn Catalog>,
        media: Arc<dyn MediaProvider>,
        telemetry: Option<Arc<dyn StageTelemetry>>,
    ) -> Result<Self> {
        config.validate()?;
        let store = match config.paths.request_table() {
            Some(path) => RequestStore::open(&path, config.max_active, config.max_retries)
                .map_err(|err| err.with_context("request table"))?,
            None => RequestStore::in_memory(config.max_active, config.max_retries),
        };
        let mut ctx = StagerContext::new(config, store, fs, catalog, media);
        if let Some(telemetry) = telemetry {
            ctx = ctx.with_telemetry(telemetry);
        }
        let ctx = Arc::new(ctx);

        let mut scheduler = ResourceScheduler::new(Arc::clone(&ctx))?;
        for index in ctx.store.take_recovered() {
            ctx.submit(index);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let fail_queued = Arc::new(AtomicBool::new(false));

        let intake = {
            let ctx = Arc::clone(&ctx);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("stager-intake".to_string())
                .spawn(move || run_intake(&ctx, &stop))?
        };

        let scheduler_thread = {
            let ctx = Arc::clone(&ctx);
            let stop = Arc::clone(&stop);
            let fail_queued = Arc::clone(&fail_queued);
            thread::Builder::new()
                .name("stager-scheduler".to_string())
                .spawn(move || {
                    let tick = ctx.config.scheduler.tick_interval;
                    while !stop.load(Ordering::Acquire) {
                        scheduler.run_once();
                        ctx.wake.wait_timeout(tick);
                    }
                    scheduler.shutdown();
                    if fail_queued.load(Ordering::Acquire) {
                        scheduler.shutdown_work();
                        check_requests(&ctx);
                    }
                    if let Err(err) = ctx.store.flush() {
                        tracing::error!(target: tags::TARGET_SCHEDULER, error = %err, "request table flush failed");
                    }
                    tracing::info!(target: tags::TARGET_SCHEDULER, active = ctx.store.active_count(), "scheduler stopped");
                })?
        };

        tracing::info!(
            target: tags::TARGET_SCHEDULER,
            capacity = ctx.store.capacity(),
            active = ctx.store.active_count(),
            "stager started"
        );
        Ok(Self {
            ctx,
            stop,
            fail_queued,
            intake: Some(intake),
            scheduler: Some(scheduler_thread),
        })
    }

    pub fn context(&self) -> &Arc<StagerContext> {
        &self.ctx
    }

    /// Waits until the request table is empty. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.ctx.store.active_count() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(IDLE_POLL);
        }
        true
    }

    /// Stops both threads and every worker.
    pub fn shutdown(mut self, mode: ShutdownMode) -> Result<()> {
        self.stop_threads(mode)
    }

    fn stop_threads(&mut self, mode: ShutdownMode) -> Result<()> {
        self.fail_queued
            .store(mode == ShutdownMode::FailQueued, Ordering::Release);
        self.stop.store(true, Ordering::Release);
        self.ctx.wake.post();

        let mut panicked = false;
        for handle in [self.intake.take(), self.scheduler.take()].into_iter().flatten() {
            panicked |= handle.join().is_err();
        }
        if panicked {
            return Err(StagerError::Other(anyhow::anyhow!("stager thread panicked")));
        }
        Ok(())
    }
}

impl Drop for Stager {
    fn drop(&mut self) {
        if self.intake.is_some() || self.scheduler.is_some() {
            let _ = self.stop_threads(ShutdownMode::Preserve);
        }
    }
}

fn run_intake(ctx: &StagerContext, stop: &AtomicBool) {
    while !stop.load(Ordering::Acquire) {
        match ctx.fs.next_event(INTAKE_POLL) {
            Ok(Some(IntakeEvent::Stage(descriptor))) => accept(ctx, &descriptor),
            Ok(Some(IntakeEvent::Cancel { id, fseq })) => {
                if ctx.cancel_request(id, fseq).is_none() {
                    tracing::debug!(target: tags::TARGET_REQUEST, ino = id.ino, "cancel for unknown request");
                }
            }
            Ok(None) => {}
            Err(err) => {
                tracing::error!(target: tags::TARGET_REQUEST, error = %err, "filesystem intake failed");
                thread::sleep(INTAKE_POLL);
            }
        }
    }
}

/// Stores a new request and hands it to the scheduler; a request that cannot be stored
/// is answered at once.
fn accept(ctx: &StagerContext, descriptor: &StageDescriptor) {
    match ctx.store.create(descriptor) {
        Ok(index) => {
            let held = ctx
                .store
                .with(index, |request| request.flags.contains(RequestFlags::HELD))
                .unwrap_or(false);
            if !held {
                ctx.submit(index);
            }
        }
        Err(err) => {
            tracing::warn!(target: tags::TARGET_REQUEST, ino = descriptor.id.ino, error = %err, "stage request refused");
            if let Err(err) = ctx.fs.respond(descriptor.id, descriptor.fseq, Err(err.errno())) {
                tracing::error!(target: tags::TARGET_REQUEST, ino = descriptor.id.ino, error = %err, "stage response failed");
            }
        }
    }
}
