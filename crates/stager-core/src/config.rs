use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Result, StagerError};

/// Top-level staging daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagerConfig {
    /// Capacity of the request table.
    pub max_active: usize,
    /// In-pipeline read retries granted to each request.
    pub max_retries: u8,
    pub stream: StreamLimits,
    pub scheduler: SchedulerOptions,
    pub worker: WorkerOptions,
    pub lock: LockRetryPolicy,
    pub media: MediaOptions,
    pub paths: PathOptions,
}

impl Default for StagerConfig {
    fn default() -> Self {
        Self {
            max_active: 4000,
            max_retries: 3,
            stream: StreamLimits::default(),
            scheduler: SchedulerOptions::default(),
            worker: WorkerOptions::default(),
            lock: LockRetryPolicy::default(),
            media: MediaOptions::default(),
            paths: PathOptions::default(),
        }
    }
}

impl StagerConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|err| StagerError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| StagerError::from(err).with_context(format!("{}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_active == 0 {
            return Err(StagerError::Config("max_active must be positive".into()));
        }
        if self.worker.read_buffers < 2 || self.worker.write_buffers < 2 {
            return Err(StagerError::Config(
                "ring buffers need at least two blocks".into(),
            ));
        }
        if self.worker.write_block_size == 0 || self.worker.write_block_size % 512 != 0 {
            return Err(StagerError::Config(
                "write_block_size must be a non-zero multiple of 512".into(),
            ));
        }
        if self.media.disk_archive_block_size == 0 {
            return Err(StagerError::Config(
                "disk_archive_block_size must be positive".into(),
            ));
        }
        if self.lock.attempts == 0 {
            return Err(StagerError::Config("lock.attempts must be positive".into()));
        }
        Ok(())
    }
}

/// Limits that close a stream to further additions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamLimits {
    /// Maximum requests per stream; reaching it closes the stream.
    pub max_count: usize,
    /// Byte budget per stream, zero for no limit. The stream closes once a member takes it past the budget.
    pub max_size: u64,
}

impl Default for StreamLimits {
    fn default() -> Self {
        Self {
            max_count: 1000,
            max_size: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerOptions {
    /// Periodic re-evaluation interval when no request arrives.
    #[serde(with = "duration_ms")]
    pub tick_interval: Duration,
    /// Longest wait for a worker to acknowledge a bound stream.
    #[serde(with = "duration_ms")]
    pub bind_ack_timeout: Duration,
    /// Poll interval of reload watchers.
    #[serde(with = "duration_ms")]
    pub reload_poll_interval: Duration,
    /// Operator is present to load volumes that are not in a library.
    pub attended: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            bind_ack_timeout: Duration::from_secs(30),
            reload_poll_interval: Duration::from_secs(5),
            attended: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    /// Worker exits after this long without work and with no retained descriptors.
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
    /// Blocks in the read-side ring.
    pub read_buffers: usize,
    /// Blocks in the write-side ring.
    pub write_buffers: usize,
    /// Cache write granularity.
    pub write_block_size: usize,
    /// Errors tolerated in one stream before its remaining requests are rejected.
    pub max_copy_stream_errors: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            read_buffers: 4,
            write_buffers: 4,
            write_block_size: 256 * 1024,
            max_copy_stream_errors: 5,
        }
    }
}

/// Backoff applied when a shared record lock is contended.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockRetryPolicy {
    pub attempts: u32,
    #[serde(with = "duration_ms")]
    pub initial_backoff: Duration,
    #[serde(with = "duration_ms")]
    pub max_backoff: Duration,
}

impl Default for LockRetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl LockRetryPolicy {
    pub(crate) fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaOptions {
    /// Block size used for disk-archive files.
    pub disk_archive_block_size: usize,
    /// Positioning attempts on sequential devices.
    pub seek_attempts: u32,
    pub optical_retry: ReadRetryPolicy,
    /// Largest range requested from a silo per fetch.
    pub silo_fetch_size: usize,
}

impl Default for MediaOptions {
    fn default() -> Self {
        Self {
            disk_archive_block_size: 64 * 1024,
            seek_attempts: 2,
            optical_retry: ReadRetryPolicy::default(),
            silo_fetch_size: 1024 * 1024,
        }
    }
}

/// Shrinking-window read recovery for optical media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadRetryPolicy {
    /// Smallest read attempted before the error is surfaced.
    pub min_read: usize,
    pub max_attempts: u32,
    /// Reposition to the failing block before each retry.
    pub reposition: bool,
}

impl Default for ReadRetryPolicy {
    fn default() -> Self {
        Self {
            min_read: 2048,
            max_attempts: 8,
            reposition: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathOptions {
    /// Directory holding the request and worker tables.
    pub work_dir: Option<PathBuf>,
}

impl PathOptions {
    pub fn request_table(&self) -> Option<PathBuf> {
        self.work_dir.as_ref().map(|dir| dir.join("stager_reqs"))
    }

    pub fn worker_table(&self) -> Option<PathBuf> {
        self.work_dir.as_ref().map(|dir| dir.join("stager_copies"))
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
