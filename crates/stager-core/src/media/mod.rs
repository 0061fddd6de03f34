//! Mounted media backends.
//!
//! Every backend implements [`MediaSource`]; the worker holds the closed [`Media`] enum
//! and never inspects which variant it is driving outside of construction.

mod disk_archive;
mod sequential;
mod silo;

use crate::Result;
use crate::sync::CancellationToken;
use crate::types::{Section, Vsn};

pub use disk_archive::{DiskArchive, archive_file_path};
pub use sequential::{BlockDevice, SequentialDevice};
pub use silo::{ObjectStore, SiloSource};

/// Capabilities of a mounted medium, addressed in media blocks.
pub trait MediaSource: Send {
    /// Mounts `vsn` and returns the media block size.
    fn load(&mut self, vsn: &Vsn) -> Result<usize>;
    /// Addresses the backing file or object of `section`; a no-op on sequential devices.
    fn next_file(&mut self, section: &Section) -> Result<()>;
    fn end_file(&mut self) -> Result<()>;
    /// Reads up to one block into `buf`; zero means end of data.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    /// Positions at `block`. A cancellation observed while positioning returns the
    /// current position instead of an error.
    fn seek(&mut self, block: u64, cancel: &CancellationToken) -> Result<u64>;
    fn position(&self) -> u64;
    fn block_size(&self) -> usize;
    fn unload(&mut self) -> Result<()>;
}

/// Mounted medium of a drive worker.
pub enum Media {
    Sequential(SequentialDevice),
    DiskArchive(DiskArchive),
    Silo(SiloSource),
}

impl Media {
    /// Disk archives and silos address one backing file per section.
    pub fn is_file_addressed(&self) -> bool {
        match self {
            Self::Sequential(_) => false,
            Self::DiskArchive(_) | Self::Silo(_) => true,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Sequential(_) => "sequential",
            Self::DiskArchive(_) => "disk-archive",
            Self::Silo(_) => "silo",
        }
    }
}

impl std::fmt::Debug for Media {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Media")
            .field("kind", &self.label())
            .field("position", &self.position())
            .field("block_size", &self.block_size())
            .finish()
    }
}

impl MediaSource for Media {
    fn load(&mut self, vsn: &Vsn) -> Result<usize> {
        match self {
            Self::Sequential(device) => device.load(vsn),
            Self::DiskArchive(archive) => archive.load(vsn),
            Self::Silo(silo) => silo.load(vsn),
        }
    }

    fn next_file(&mut self, section: &Section) -> Result<()> {
        match self {
            Self::Sequential(device) => device.next_file(section),
            Self::DiskArchive(archive) => archive.next_file(section),
            Self::Silo(silo) => silo.next_file(section),
        }
    }

    fn end_file(&mut self) -> Result<()> {
        match self {
            Self::Sequential(device) => device.end_file(),
            Self::DiskArchive(archive) => archive.end_file(),
            Self::Silo(silo) => silo.end_file(),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self {
            Self::Sequential(device) => device.read(buf),
            Self::DiskArchive(archive) => archive.read(buf),
            Self::Silo(silo) => silo.read(buf),
        }
    }

    fn seek(&mut self, block: u64, cancel: &CancellationToken) -> Result<u64> {
        match self {
            Self::Sequential(device) => device.seek(block, cancel),
            Self::DiskArchive(archive) => archive.seek(block, cancel),
            Self::Silo(silo) => silo.seek(block, cancel),
        }
    }

    fn position(&self) -> u64 {
        match self {
            Self::Sequential(device) => device.position(),
            Self::DiskArchive(archive) => archive.position(),
            Self::Silo(silo) => silo.position(),
        }
    }

    fn block_size(&self) -> usize {
        match self {
            Self::Sequential(device) => device.block_size(),
            Self::DiskArchive(archive) => archive.block_size(),
            Self::Silo(silo) => silo.block_size(),
        }
    }

    fn unload(&mut self) -> Result<()> {
        match self {
            Self::Sequential(device) => device.unload(),
            Self::DiskArchive(archive) => archive.unload(),
            Self::Silo(silo) => silo.unload(),
        }
    }
}
