//! Per-drive workers.
//!
//! Each library drive staging may use is represented by a [`CopyInstance`]. Its worker
//! thread is started lazily when the scheduler first binds a stream to it, owns a
//! [`StagePipeline`](crate::pipeline::StagePipeline), and exits after an idle period
//! once it no longer retains any cache descriptor.

mod copy;
mod pool;
mod stage;
mod table;

use std::fmt;

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};

use crate::stream::StreamId;
use crate::types::{Pid, flag_set};

pub use copy::CopyInstance;
pub use pool::{SCHEDULER_PID, WorkerPool};
pub use table::{WORKER_RECORD_SIZE, WORKER_TABLE_MAGIC, WORKER_TABLE_VERSION, WorkerRecord, WorkerTable};

flag_set! {
    /// Lifecycle bits of a drive worker.
    CopyInstanceFlags: u32 {
        /// A worker thread is running for this drive.
        CREATED = 0,
        /// Running and not bound to a stream.
        IDLE = 1,
        /// Told to exit once its current stream finishes.
        SHUTDOWN = 2,
        /// The last worker on this drive exited abnormally.
        FAILOVER = 3,
    }
}

/// Stream handed to a worker; `ack` is signaled once the worker has taken it.
#[derive(Debug)]
pub struct BindRequest {
    pub stream: StreamId,
    pub ack: Sender<()>,
}

/// Why a worker thread stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    /// Idle timeout or shutdown.
    Normal,
    /// The drive reported the device gone while mounting.
    DeviceLost,
    Abnormal(String),
}

impl ExitStatus {
    pub fn is_normal(&self) -> bool {
        matches!(self, Self::Normal)
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => f.write_str("normal"),
            Self::DeviceLost => f.write_str("device lost"),
            Self::Abnormal(reason) => write!(f, "abnormal: {reason}"),
        }
    }
}

/// Exit notice sent by every worker thread as its last act.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub pid: Pid,
    pub status: ExitStatus,
}
