use std::time::Duration;

use crate::telemetry;
use crate::telemetry::tags;
use crate::types::{FileId, Pid, Vsn};

/// Telemetry contract for drive workers.
///
/// Workers call these hooks at stream and file boundaries so the metrics backend can
/// be swapped in tests without touching the staging code.
pub trait StageTelemetry: Send + Sync {
    fn on_stream_bound(&self, pid: Pid, vsn: &Vsn, requests: usize);
    fn on_file_started(&self, pid: Pid, id: FileId);
    fn on_file_finished(&self, pid: Pid, id: FileId, bytes: u64, elapsed: Duration);
    fn on_file_failed(&self, pid: Pid, id: FileId, elapsed: Duration);
    fn on_queue_depth(&self, depth: usize);
}

/// Default telemetry implementation that reports to the in-process registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultStageTelemetry;

impl StageTelemetry for DefaultStageTelemetry {
    fn on_stream_bound(&self, pid: Pid, vsn: &Vsn, requests: usize) {
        telemetry::increment_counter(
            tags::METRIC_SCHEDULER_BIND_COUNT,
            1,
            &[("subsystem", "worker"), ("op", "bind")],
        );
        tracing::debug!(
            target: tags::TARGET_WORKER,
            pid,
            vsn = %vsn,
            requests,
            "stream bound to worker"
        );
    }

    fn on_file_started(&self, _pid: Pid, _id: FileId) {
        telemetry::add_gauge(
            tags::METRIC_PIPELINE_ACTIVE_COUNT,
            1,
            &[("subsystem", "pipeline"), ("op", "file_start")],
        );
    }

    fn on_file_finished(&self, pid: Pid, id: FileId, bytes: u64, elapsed: Duration) {
        let elapsed_us = elapsed.as_micros().min(u64::MAX as u128) as u64;

        telemetry::increment_counter(
            tags::METRIC_PIPELINE_FILE_OK_COUNT,
            1,
            &[("subsystem", "pipeline"), ("op", "file"), ("result", "ok")],
        );
        telemetry::increment_counter(
            tags::METRIC_PIPELINE_BYTES_WRITTEN,
            bytes,
            &[("subsystem", "pipeline"), ("op", "write")],
        );
        telemetry::record_histogram(
            tags::METRIC_PIPELINE_FILE_LATENCY_US,
            elapsed_us,
            &[("subsystem", "pipeline"), ("op", "file"), ("result", "ok")],
        );
        telemetry::sub_gauge_saturating(
            tags::METRIC_PIPELINE_ACTIVE_COUNT,
            1,
            &[("subsystem", "pipeline"), ("op", "file_finish")],
        );
        tracing::debug!(
            target: tags::TARGET_PIPELINE,
            pid,
            ino = id.ino,
            bytes,
            elapsed_us,
            "file staged"
        );
    }

    fn on_file_failed(&self, pid: Pid, id: FileId, elapsed: Duration) {
        let elapsed_us = elapsed.as_micros().min(u64::MAX as u128) as u64;

        telemetry::increment_counter(
            tags::METRIC_PIPELINE_FILE_ERROR_COUNT,
            1,
            &[("subsystem", "pipeline"), ("op", "file"), ("result", "error")],
        );
        telemetry::record_histogram(
            tags::METRIC_PIPELINE_FILE_LATENCY_US,
            elapsed_us,
            &[("subsystem", "pipeline"), ("op", "file"), ("result", "error")],
        );
        telemetry::sub_gauge_saturating(
            tags::METRIC_PIPELINE_ACTIVE_COUNT,
            1,
            &[("subsystem", "pipeline"), ("op", "file_failed")],
        );
        tracing::debug!(
            target: tags::TARGET_PIPELINE,
            pid,
            ino = id.ino,
            elapsed_us,
            "file stage failed"
        );
    }

    fn on_queue_depth(&self, depth: usize) {
        telemetry::set_gauge(
            tags::METRIC_SCHEDULER_QUEUE_DEPTH,
            depth as u64,
            &[("subsystem", "scheduler"), ("op", "queue_depth")],
        );
    }
}
