pub mod buffer;
pub mod checksum;
pub mod collab;
pub mod config;
pub mod context;
pub mod daemon;
pub mod error;
pub mod format;
pub mod io;
pub mod local;
pub mod media;
pub mod pipeline;
pub mod request;
pub mod scheduler;
pub mod stream;
pub mod sync;
pub mod telemetry;
pub mod types;
pub mod worker;

pub use buffer::{RingBuffer, RingMetrics, ScratchPool};
pub use checksum::{ChecksumAccumulator, ChecksumAlgorithm, ChecksumValue};
pub use collab::{
    CacheFile, CacheOpen, Catalog, CopyPlacement, FilesystemLink, IntakeEvent, LibraryInfo,
    MediaProvider, StageDescriptor, VolumeInfo,
};
pub use config::StagerConfig;
pub use context::StagerContext;
pub use daemon::{ShutdownMode, Stager};
pub use error::{ErrorClass, StageErrno, StagerError};
pub use format::{HeaderCodec, HeaderFormat};
pub use media::{Media, MediaSource};
pub use pipeline::{StageJob, StageOutcome, StagePipeline};
pub use request::{RequestStore, StageRequest};
pub use scheduler::{CompletionOutcome, ResourceScheduler, TickReport, check_requests};
pub use stream::{Stream, StreamComposer, StreamPriority};
pub use telemetry::stage::{DefaultStageTelemetry, StageTelemetry};
pub use types::{ArchiveCopy, FileId, FsId, LibraryId, MediaType, Result, Section, Vsn};
pub use worker::WorkerPool;
