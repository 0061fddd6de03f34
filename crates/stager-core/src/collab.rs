//! Interfaces of the collaborators the staging engine is driven by.
//!
//! The filesystem submits requests and receives responses, the catalog answers volume and
//! drive questions, and the media provider opens a backend for a mounted volume. Local
//! implementations live in [`crate::local`].

use std::io;
use std::time::Duration;

use crate::Result;
use crate::checksum::{ChecksumAlgorithm, ChecksumValue};
use crate::error::StageErrno;
use crate::media::Media;
use crate::types::{ArchiveCopy, FileId, FsId, LibraryId, MAX_ARCHIVE, MediaType, Section, Vsn};

/// Placement of one archive copy as described by the filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CopyPlacement {
    pub copy: ArchiveCopy,
    /// Sections of a multivolume copy past the inline one, at most
    /// [`MAX_VSN_SECTIONS`](crate::types::MAX_VSN_SECTIONS) per extension.
    pub extension: Vec<Section>,
}

impl CopyPlacement {
    pub fn single(copy: ArchiveCopy) -> Self {
        Self {
            copy,
            extension: Vec::new(),
        }
    }
}

/// Checksum the file was archived with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumRequest {
    pub algorithm: ChecksumAlgorithm,
    /// The archived header carried a long-name record.
    pub long_name: bool,
}

/// One stage request as submitted by the filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StageDescriptor {
    pub id: FileId,
    pub fseq: FsId,
    /// Logical byte offset of the range to stage.
    pub offset: u64,
    pub len: u64,
    /// Copy the filesystem prefers.
    pub copy: u8,
    pub copies: [Option<CopyPlacement>; MAX_ARCHIVE],
    pub checksum: Option<ChecksumRequest>,
    pub uid: u32,
    pub gid: u32,
    pub directio: bool,
    pub stage_never: bool,
    pub stage_partial: bool,
    /// Continuation request carrying extension `ext_ord` of a long multivolume copy.
    pub ext_ord: u32,
}

/// Input delivered by [`FilesystemLink::next_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeEvent {
    Stage(StageDescriptor),
    Cancel { id: FileId, fseq: FsId },
}

/// Parameters of a cache file opened for staging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOpen {
    pub id: FileId,
    pub fseq: FsId,
    pub copy: u8,
    pub offset: u64,
    pub len: u64,
    pub uid: u32,
    pub gid: u32,
    pub directio: bool,
}

/// Cache file receiving staged data.
pub trait CacheFile: Send {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<usize>;
    fn close(self: Box<Self>) -> io::Result<()>;
}

/// Filesystem side of staging.
pub trait FilesystemLink: Send + Sync {
    /// Waits up to `timeout` for the next request or cancellation.
    fn next_event(&self, timeout: Duration) -> Result<Option<IntakeEvent>>;
    /// Final response of one request; sent exactly once per request.
    fn respond(&self, id: FileId, fseq: FsId, outcome: std::result::Result<(), StageErrno>) -> Result<()>;
    fn open_cache(&self, open: &CacheOpen) -> std::result::Result<Box<dyn CacheFile>, StageErrno>;
    /// Checksum recorded for the file when it was archived.
    fn recorded_checksum(&self, id: FileId, fseq: FsId) -> Result<ChecksumValue>;
    fn is_mounted(&self, fseq: FsId) -> bool;
    fn file_exists(&self, _id: FileId, _fseq: FsId) -> bool {
        true
    }
}

/// Catalog state of one volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub vsn: Vsn,
    pub media: MediaType,
    pub library: LibraryId,
    /// Mounted in a drive.
    pub loaded: bool,
    /// Exported or offline; an operator has to bring it back.
    pub unavailable: bool,
    pub bad_media: bool,
}

/// Library entry with its configured drive budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LibraryInfo {
    pub id: LibraryId,
    /// Drives staging may use in this library.
    pub drives: usize,
    pub on: bool,
}

/// Volume and drive catalog.
pub trait Catalog: Send + Sync {
    fn find_volume(&self, vsn: &Vsn, media: MediaType) -> Option<VolumeInfo>;
    fn libraries(&self) -> Vec<LibraryInfo>;
    fn library(&self, id: LibraryId) -> Option<LibraryInfo> {
        self.libraries().into_iter().find(|library| library.id == id)
    }
    fn drive_free(&self, library: LibraryId) -> bool;
    fn staging_suspended(&self, _media: MediaType) -> bool {
        false
    }
    /// Asks the operator to load `vsn`; returns false when the request was refused.
    fn request_load(&self, vsn: &Vsn, media: MediaType) -> bool;
}

/// Opens a backend for a volume mounted on a drive.
pub trait MediaProvider: Send + Sync {
    fn open(&self, volume: &VolumeInfo, drive: usize) -> Result<Media>;
}
