#![allow(dead_code)]

use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use stager_core::config::StagerConfig;
use stager_core::format::{ClassicHeader, TAR_RECORD_SIZE, round_to_record};
use stager_core::local::{FileBlockDevice, LocalCatalog, LocalFilesystem, LocalMediaProvider};
use stager_core::media::archive_file_path;
use stager_core::{
    ArchiveCopy, CopyPlacement, FileId, FsId, LibraryId, MediaType, Section, StageDescriptor,
    Stager, Vsn,
};
use tempfile::TempDir;

pub const LIBRARY: LibraryId = LibraryId(1);
pub const FSEQ: FsId = FsId(1);
pub const TAPE_BLOCK: usize = 512;
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(20);

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Temporary cache, media tree and catalog wired to the local collaborators.
pub struct Site {
    pub dir: TempDir,
    pub fs: Arc<LocalFilesystem>,
    pub catalog: Arc<LocalCatalog>,
    pub provider: LocalMediaProvider,
}

impl Site {
    pub fn new(drives: usize) -> std::io::Result<Self> {
        let dir = tempfile::tempdir()?;
        let fs = Arc::new(LocalFilesystem::new(dir.path().join("cache"))?);
        let catalog = Arc::new(LocalCatalog::new());
        catalog.add_library(LIBRARY, drives);
        let provider = LocalMediaProvider::under(&dir.path().join("media"), Default::default())
            .with_tape_block_size(TAPE_BLOCK);
        for root in [&provider.tape_root, &provider.disk_root, &provider.silo_root] {
            fs::create_dir_all(root)?;
        }
        Ok(Self {
            dir,
            fs,
            catalog,
            provider,
        })
    }

    pub fn work_dir(&self) -> PathBuf {
        self.dir.path().join("work")
    }

    /// Configuration with short timers and tables under the work directory.
    pub fn config(&self) -> StagerConfig {
        let mut config = StagerConfig::default();
        config.max_active = 64;
        config.scheduler.tick_interval = Duration::from_millis(20);
        config.scheduler.reload_poll_interval = Duration::from_millis(20);
        config.worker.idle_timeout = Duration::from_millis(500);
        config.worker.write_block_size = 4096;
        config.paths.work_dir = Some(self.work_dir());
        config
    }

    pub fn start(&self) -> stager_core::Result<Stager> {
        self.start_with(self.config())
    }

    pub fn start_with(&self, config: StagerConfig) -> stager_core::Result<Stager> {
        Stager::start(
            config,
            self.fs.clone(),
            self.catalog.clone(),
            Arc::new(self.provider.clone()),
            None,
        )
    }

    /// Writes `records` into the tape image of `vsn` at their block positions.
    pub fn write_tape(&self, vsn: &Vsn, media: MediaType, records: &[(u64, Vec<u8>)]) -> std::io::Result<()> {
        let path = FileBlockDevice::image_path(&self.provider.tape_root, vsn);
        let mut image = fs::OpenOptions::new().create(true).truncate(false).write(true).open(path)?;
        for (position, bytes) in records {
            image.seek(SeekFrom::Start(position * TAPE_BLOCK as u64))?;
            image.write_all(bytes)?;
        }
        image.flush()?;
        self.catalog.add_volume(vsn.clone(), media, LIBRARY);
        Ok(())
    }

    /// Writes one archive file of a disk-archive volume.
    pub fn write_disk_archive(&self, vsn: &Vsn, position: u64, bytes: &[u8]) -> std::io::Result<()> {
        let path = archive_file_path(&self.provider.disk_root, vsn, position);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, bytes)?;
        self.catalog.add_volume(vsn.clone(), MediaType::Disk, LIBRARY);
        Ok(())
    }

    /// Writes one silo object; silo objects carry no header.
    pub fn write_silo_object(&self, vsn: &Vsn, position: u64, bytes: &[u8]) -> std::io::Result<()> {
        let dir = self.provider.silo_root.join(vsn.as_str());
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(position.to_string()), bytes)?;
        self.catalog.add_volume(vsn.clone(), MediaType::Silo, LIBRARY);
        Ok(())
    }
}

pub fn vsn(label: &str) -> Vsn {
    Vsn::new(label).expect("valid vsn")
}

/// Deterministic file contents.
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// Classic header declaring `declared` bytes followed by `data`, padded to whole records.
pub fn archived(name: &str, declared: u64, data: &[u8]) -> Vec<u8> {
    let mut out = ClassicHeader::regular(name, declared).encode();
    out.extend_from_slice(data);
    out.resize(out.len() - data.len() + round_to_record(data.len() as u64) as usize, 0);
    out
}

pub fn records_for(len: usize) -> u64 {
    (TAR_RECORD_SIZE as u64 + round_to_record(len as u64)) / TAR_RECORD_SIZE as u64
}

pub fn descriptor(ino: u32, len: u64, copies: &[(u8, MediaType, Section)]) -> StageDescriptor {
    let mut descriptor = StageDescriptor {
        id: FileId::new(ino, 1),
        fseq: FSEQ,
        len,
        ..StageDescriptor::default()
    };
    for (copy, media, section) in copies {
        descriptor.copies[*copy as usize] = Some(CopyPlacement::single(ArchiveCopy::new(*media, section.clone())));
    }
    descriptor
}

pub fn tape_descriptor(ino: u32, len: u64, vsn: &Vsn, position: u64) -> StageDescriptor {
    descriptor(ino, len, &[(0, MediaType::Tape, Section::new(vsn.clone(), position, 0, 0))])
}

/// Tape copy split over `sections`, the first one inline and the rest as its extension.
pub fn multivolume_descriptor(ino: u32, len: u64, sections: &[Section]) -> StageDescriptor {
    let (first, rest) = sections.split_first().expect("at least one section");
    let mut copy = ArchiveCopy::new(MediaType::Tape, first.clone());
    copy.n_vsns = sections.len() as u16;
    let mut descriptor = descriptor(ino, len, &[]);
    descriptor.copies[0] = Some(CopyPlacement {
        copy,
        extension: rest.to_vec(),
    });
    descriptor
}
