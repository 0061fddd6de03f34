mod support;

use std::sync::Arc;

use stager_core::config::StagerConfig;
use stager_core::local::StageResponse;
use stager_core::request::RequestStore;
use stager_core::stream::{StreamFlags, StreamId};
use stager_core::types::{CacheHandle, RequestFlags};
use stager_core::{
    FileId, MediaType, ResourceScheduler, Section, StageErrno, StagerContext, StreamPriority,
    TickReport, check_requests,
};
use support::{FSEQ, Site, TestResult, archived, descriptor, tape_descriptor, vsn};

const DEAD_PID: u32 = 77;

fn context(site: &Site) -> StagerContext {
    let mut config: StagerConfig = site.config();
    config.paths.work_dir = None;
    StagerContext::new(
        config,
        RequestStore::in_memory(16, 3),
        site.fs.clone(),
        site.catalog.clone(),
        Arc::new(site.provider.clone()),
    )
}

fn scheduler(site: &Site) -> stager_core::Result<ResourceScheduler> {
    ResourceScheduler::new(Arc::new(context(site)))
}

/// Marks the only stream as bound to `pid` with its lead request in the worker's hands.
fn bind_to(scheduler: &ResourceScheduler, pid: u32) -> Result<StreamId, Box<dyn std::error::Error>> {
    let ctx = scheduler.context();
    let id = *ctx.streams.ids().first().ok_or("no stream")?;
    let handle = ctx.streams.get(id).ok_or("stream missing")?;
    let mut stream = handle.lock().map_err(|_| "stream lock poisoned")?;
    stream.pid = Some(pid);
    stream.context = Some(pid);
    stream.flags.insert(StreamFlags::ACTIVE);
    let lead = stream.first().ok_or("empty stream")?;
    ctx.store.update(lead, |request| {
        request.flags.insert(RequestFlags::ACTIVE);
        request.context = Some(pid);
    });
    Ok(id)
}

fn priorities(scheduler: &ResourceScheduler) -> Vec<StreamPriority> {
    let streams = &scheduler.context().streams;
    streams
        .ids()
        .into_iter()
        .filter_map(|id| streams.snapshot(id))
        .map(|stream| stream.priority)
        .collect()
}

fn submit(scheduler: &ResourceScheduler, ino: u32, position: u64) -> stager_core::Result<usize> {
    let ctx = scheduler.context();
    let index = ctx.store.create(&tape_descriptor(ino, 100, &vsn("TAPE01"), position))?;
    ctx.submit(index);
    Ok(index)
}

fn response_for(site: &Site, ino: u32) -> Option<StageResponse> {
    site.fs
        .responses()
        .into_iter()
        .find(|response| response.id == FileId::new(ino, 1))
}

#[test]
fn suspended_media_keeps_streams_idle() -> TestResult {
    let site = Site::new(1)?;
    site.write_tape(&vsn("TAPE01"), MediaType::Tape, &[(4, archived("a", 100, &[0; 100]))])?;
    site.catalog.suspend(MediaType::Tape, true);
    let mut scheduler = scheduler(&site)?;

    submit(&scheduler, 1, 4)?;
    let report = scheduler.run_once();
    assert_eq!(
        report,
        TickReport {
            composed: 1,
            ..TickReport::default()
        }
    );
    assert_eq!(priorities(&scheduler), vec![StreamPriority::Idle]);
    assert!(scheduler.pool().copies().iter().all(|copy| !copy.is_created() && !copy.is_busy()));
    scheduler.shutdown();
    Ok(())
}

#[test]
fn unmounted_filesystem_blocks_start() -> TestResult {
    let site = Site::new(1)?;
    site.write_tape(&vsn("TAPE01"), MediaType::Tape, &[(4, archived("a", 100, &[0; 100]))])?;
    site.fs.set_mounted(FSEQ, false);
    let mut scheduler = scheduler(&site)?;

    submit(&scheduler, 1, 4)?;
    assert_eq!(scheduler.run_once().bound, 0);
    assert_eq!(priorities(&scheduler), vec![StreamPriority::NoFilesystem]);
    scheduler.shutdown();
    Ok(())
}

#[test]
fn unknown_volume_waits_for_resources() -> TestResult {
    let site = Site::new(1)?;
    let mut scheduler = scheduler(&site)?;

    submit(&scheduler, 1, 4)?;
    assert_eq!(scheduler.run_once().bound, 0);
    assert_eq!(priorities(&scheduler), vec![StreamPriority::NoResources]);
    assert!(site.fs.responses().is_empty());
    scheduler.shutdown();
    Ok(())
}

#[test]
fn late_request_joins_open_stream_in_position_order() -> TestResult {
    let site = Site::new(1)?;
    site.write_tape(&vsn("TAPE01"), MediaType::Tape, &[(4, archived("a", 100, &[0; 100]))])?;
    site.catalog.suspend(MediaType::Tape, true);
    let mut scheduler = scheduler(&site)?;

    let later = submit(&scheduler, 1, 10)?;
    scheduler.run_once();
    let earlier = submit(&scheduler, 2, 5)?;
    let report = scheduler.run_once();
    assert_eq!(report.composed, 0);

    let streams = &scheduler.context().streams;
    let ids = streams.ids();
    assert_eq!(ids.len(), 1);
    let stream = streams.snapshot(ids[0]).ok_or("stream missing")?;
    assert_eq!(stream.members(&scheduler.context().store), vec![earlier, later]);
    scheduler.shutdown();
    Ok(())
}

#[test]
fn duplicate_of_queued_request_is_answered_existing() -> TestResult {
    let site = Site::new(1)?;
    site.write_tape(&vsn("TAPE01"), MediaType::Tape, &[(4, archived("a", 100, &[0; 100]))])?;
    site.catalog.suspend(MediaType::Tape, true);
    let mut scheduler = scheduler(&site)?;

    let original = submit(&scheduler, 1, 4)?;
    scheduler.run_once();
    let duplicate = submit(&scheduler, 1, 4)?;
    let report = scheduler.run_once();
    assert_eq!(report.completed, 1);

    let response = response_for(&site, 1).ok_or("no response")?;
    assert_eq!(response.result, Err(StageErrno::AlreadyExists));
    assert!(scheduler.context().store.get(duplicate).is_none());
    assert!(scheduler.context().store.get(original).is_some());
    scheduler.shutdown();
    Ok(())
}

#[test]
fn canceled_queued_request_is_answered() -> TestResult {
    let site = Site::new(1)?;
    site.write_tape(&vsn("TAPE01"), MediaType::Tape, &[(4, archived("a", 100, &[0; 100]))])?;
    site.catalog.suspend(MediaType::Tape, true);
    let mut scheduler = scheduler(&site)?;

    let kept = submit(&scheduler, 1, 4)?;
    let canceled = submit(&scheduler, 2, 8)?;
    scheduler.run_once();

    let ctx = Arc::clone(scheduler.context());
    assert_eq!(ctx.cancel_request(FileId::new(2, 1), FSEQ), Some(canceled));
    let report = scheduler.run_once();
    assert_eq!(report.completed, 1);

    let response = response_for(&site, 2).ok_or("no response")?;
    assert_eq!(response.result, Err(StageErrno::Canceled));
    let ids = ctx.streams.ids();
    let stream = ctx.streams.snapshot(ids[0]).ok_or("stream missing")?;
    assert_eq!(stream.members(&ctx.store), vec![kept]);
    assert!(response_for(&site, 1).is_none());
    scheduler.shutdown();
    Ok(())
}

#[test]
fn requeue_for_unknown_worker_is_a_no_op() -> TestResult {
    let site = Site::new(1)?;
    let mut scheduler = scheduler(&site)?;
    submit(&scheduler, 1, 4)?;
    scheduler.run_once();
    assert_eq!(scheduler.requeue_work(4242), 0);
    assert_eq!(scheduler.context().streams.len(), 1);
    scheduler.shutdown();
    Ok(())
}

#[test]
fn shutdown_work_fails_everything_queued() -> TestResult {
    let site = Site::new(1)?;
    site.catalog.suspend(MediaType::Tape, true);
    let mut scheduler = scheduler(&site)?;
    submit(&scheduler, 1, 4)?;
    submit(&scheduler, 2, 9)?;
    scheduler.run_once();

    assert_eq!(scheduler.shutdown_work(), 2);
    scheduler.run_once();
    let results: Vec<_> = site.fs.responses().into_iter().map(|response| response.result).collect();
    assert_eq!(results, vec![Err(StageErrno::NoDevice), Err(StageErrno::NoDevice)]);
    scheduler.shutdown();
    Ok(())
}

#[test]
fn dead_worker_returns_its_stream_to_start() -> TestResult {
    let site = Site::new(1)?;
    site.write_tape(&vsn("TAPE01"), MediaType::Tape, &[(4, archived("a", 100, &[0; 100]))])?;
    site.catalog.suspend(MediaType::Tape, true);
    let mut scheduler = scheduler(&site)?;
    let first = submit(&scheduler, 1, 4)?;
    let second = submit(&scheduler, 2, 9)?;
    scheduler.run_once();
    let id = bind_to(&scheduler, DEAD_PID)?;

    assert_eq!(scheduler.requeue_work(DEAD_PID), 1);
    let ctx = Arc::clone(scheduler.context());
    let stream = ctx.streams.snapshot(id).ok_or("stream missing")?;
    assert_eq!(stream.priority, StreamPriority::Start);
    assert_eq!(stream.pid, None);
    assert!(!stream.is_active());
    assert_eq!(stream.members(&ctx.store), vec![first, second]);
    for index in [first, second] {
        let request = ctx.store.get(index).ok_or("request missing")?;
        assert!(!request.flags.contains(RequestFlags::ACTIVE));
        assert_eq!(request.context, None);
    }
    assert_eq!(scheduler.run_once().completed, 0);
    assert!(site.fs.responses().is_empty());
    scheduler.shutdown();
    Ok(())
}

#[test]
fn dead_worker_holding_a_cache_descriptor_cancels_the_lead() -> TestResult {
    let site = Site::new(1)?;
    site.write_tape(&vsn("TAPE01"), MediaType::Tape, &[(4, archived("a", 100, &[0; 100]))])?;
    site.catalog.suspend(MediaType::Tape, true);
    let mut scheduler = scheduler(&site)?;
    let lead = submit(&scheduler, 1, 4)?;
    let next = submit(&scheduler, 2, 9)?;
    scheduler.run_once();
    let id = bind_to(&scheduler, DEAD_PID)?;
    scheduler.context().store.update(lead, |request| {
        request.flags.insert(RequestFlags::DCACHE);
        request.dcache = Some(CacheHandle(5));
    });

    assert_eq!(scheduler.requeue_work(DEAD_PID), 1);
    let report = scheduler.run_once();
    assert_eq!(report.completed, 1);

    let response = response_for(&site, 1).ok_or("no response")?;
    assert_eq!(response.result, Err(StageErrno::Canceled));
    let ctx = scheduler.context();
    assert!(ctx.store.get(lead).is_none());
    let stream = ctx.streams.snapshot(id).ok_or("stream missing")?;
    assert_eq!(stream.members(&ctx.store), vec![next]);
    assert!(response_for(&site, 2).is_none());
    scheduler.shutdown();
    Ok(())
}

#[test]
fn transient_error_retries_the_same_copy() -> TestResult {
    let site = Site::new(1)?;
    let ctx = context(&site);
    let index = ctx.store.create(&descriptor(
        3,
        4096,
        &[
            (0, MediaType::Tape, Section::new(vsn("TAPE01"), 4, 0, 0)),
            (1, MediaType::Disk, Section::new(vsn("DISK01"), 2, 0, 0)),
        ],
    ))?;
    let retries = ctx.store.with(index, |request| request.retry).ok_or("request missing")?;
    ctx.store.update(index, |request| {
        request.flags.insert(RequestFlags::ACTIVE);
        request.write_off = 1024;
        request.error = Some(StageErrno::TimedOut);
    });
    ctx.set_done(index);

    let outcome = check_requests(&ctx);
    assert_eq!(outcome.retried, 1);
    assert_eq!(outcome.copy_switches, 0);
    assert_eq!(ctx.inbox_len(), 1);
    let request = ctx.store.get(index).ok_or("request missing")?;
    assert_eq!(request.copy, 0);
    assert_eq!(request.retry, retries - 1);
    assert_eq!(request.error, None);
    assert!(request.flags.contains(RequestFlags::SKIP_HEADER));
    assert!(!request.flags.intersects(RequestFlags::ACTIVE | RequestFlags::DONE));
    assert!(site.fs.responses().is_empty());
    Ok(())
}
