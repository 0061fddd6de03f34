/// Tracing target for ring buffer events.
pub const TARGET_RING: &str = "stager.ring";
/// Tracing target for media positioning and reads.
pub const TARGET_MEDIA: &str = "stager.media";
/// Tracing target for pipeline stages.
pub const TARGET_PIPELINE: &str = "stager.pipeline";
/// Tracing target for scheduling decisions.
pub const TARGET_SCHEDULER: &str = "stager.scheduler";
/// Tracing target for request table changes.
pub const TARGET_REQUEST: &str = "stager.request";
/// Tracing target for drive worker lifecycle.
pub const TARGET_WORKER: &str = "stager.worker";

pub const METRIC_RING_WRITE_WAIT_COUNT: &str = "stager.ring.write_wait.count";
pub const METRIC_RING_READ_WAIT_COUNT: &str = "stager.ring.read_wait.count";
pub const METRIC_RING_REUSE_HIT_COUNT: &str = "stager.ring.reuse.hit.count";
pub const METRIC_RING_REUSE_MISS_COUNT: &str = "stager.ring.reuse.miss.count";

pub const METRIC_BUFFER_ACQUIRE_CREATED_COUNT: &str = "stager.buffer.acquire.created.count";
pub const METRIC_BUFFER_ACQUIRE_RECYCLED_COUNT: &str = "stager.buffer.acquire.recycled.count";
pub const METRIC_BUFFER_RECYCLE_DROPPED_COUNT: &str = "stager.buffer.recycle.dropped.count";

pub const METRIC_MEDIA_READ_BYTES: &str = "stager.media.read.bytes";
pub const METRIC_MEDIA_READ_RETRY_COUNT: &str = "stager.media.read.retry.count";
pub const METRIC_MEDIA_SEEK_COUNT: &str = "stager.media.seek.count";
pub const METRIC_MEDIA_SEEK_LATENCY_US: &str = "stager.media.seek.latency_us";
pub const METRIC_MEDIA_LOAD_COUNT: &str = "stager.media.load.count";

pub const METRIC_HEADER_REJECT_COUNT: &str = "stager.header.reject.count";
pub const METRIC_CHECKSUM_MISMATCH_COUNT: &str = "stager.checksum.mismatch.count";
pub const METRIC_CHECKSUM_REPAIRED_COUNT: &str = "stager.checksum.repaired.count";

pub const METRIC_PIPELINE_BYTES_WRITTEN: &str = "stager.pipeline.bytes_written";
pub const METRIC_PIPELINE_FILE_LATENCY_US: &str = "stager.pipeline.file.latency_us";
pub const METRIC_PIPELINE_FILE_OK_COUNT: &str = "stager.pipeline.file.ok.count";
pub const METRIC_PIPELINE_FILE_ERROR_COUNT: &str = "stager.pipeline.file.error.count";
pub const METRIC_PIPELINE_ACTIVE_COUNT: &str = "stager.pipeline.active.count";

pub const METRIC_SCHEDULER_TICK_COUNT: &str = "stager.scheduler.tick.count";
pub const METRIC_SCHEDULER_BIND_COUNT: &str = "stager.scheduler.bind.count";
pub const METRIC_SCHEDULER_REQUEUE_COUNT: &str = "stager.scheduler.requeue.count";
pub const METRIC_SCHEDULER_STREAMS: &str = "stager.scheduler.streams";
pub const METRIC_SCHEDULER_QUEUE_DEPTH: &str = "stager.scheduler.queue.depth";

pub const METRIC_REQUEST_ACTIVE: &str = "stager.request.active";
pub const METRIC_REQUEST_COPY_SWITCH_COUNT: &str = "stager.request.copy_switch.count";
pub const METRIC_REQUEST_TERMINAL_ERROR_COUNT: &str = "stager.request.terminal_error.count";
pub const METRIC_REQUEST_CONTINUATION_COUNT: &str = "stager.request.continuation.count";

pub const METRIC_WORKER_STARTED_COUNT: &str = "stager.worker.started.count";
pub const METRIC_WORKER_EXIT_ABNORMAL_COUNT: &str = "stager.worker.exit.abnormal.count";
pub const METRIC_WORKER_LOCK_REINIT_COUNT: &str = "stager.worker.lock_reinit.count";

pub const METRIC_TABLE_OPEN_LATENCY_US: &str = "stager.table.open.latency_us";
pub const METRIC_TABLE_RECOVERED_COUNT: &str = "stager.table.recovered.count";
pub const METRIC_TABLE_DISCARDED_COUNT: &str = "stager.table.discarded.count";
