use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use super::MediaSource;
use crate::error::StageErrno;
use crate::sync::CancellationToken;
use crate::telemetry;
use crate::telemetry::tags;
use crate::types::{Section, Vsn};
use crate::{Result, StagerError};

/// Path of the archive file holding `position` on a disk-archive volume.
pub fn archive_file_path(root: &Path, vsn: &Vsn, position: u64) -> PathBuf {
    root.join(vsn.as_str())
        .join(format!("d{}", position / 1000))
        .join(format!("f{position}"))
}

/// Disk-archive volume: one directory per VSN, one tar file per section position.
pub struct DiskArchive {
    root: PathBuf,
    block_size: usize,
    vsn: Option<Vsn>,
    open: Option<(u64, File)>,
    block: u64,
}

impl DiskArchive {
    pub fn new(root: impl Into<PathBuf>, block_size: usize) -> Self {
        Self {
            root: root.into(),
            block_size,
            vsn: None,
            open: None,
            block: 0,
        }
    }

    /// Position of the archive file currently open.
    pub fn open_position(&self) -> Option<u64> {
        self.open.as_ref().map(|(position, _)| *position)
    }

    fn file(&mut self) -> Result<&mut File> {
        match self.open.as_mut() {
            Some((_, file)) => Ok(file),
            None => Err(StagerError::Stage(StageErrno::Io).with_context("no archive file open")),
        }
    }
}

impl MediaSource for DiskArchive {
    fn load(&mut self, vsn: &Vsn) -> Result<usize> {
        let dir = self.root.join(vsn.as_str());
        if !dir.is_dir() {
            return Err(StagerError::Stage(StageErrno::NoDevice)
                .with_context(format!("disk volume {}", dir.display())));
        }
        if self.vsn.as_ref() != Some(vsn) {
            self.open = None;
            self.vsn = Some(vsn.clone());
            telemetry::increment_counter(
                tags::METRIC_MEDIA_LOAD_COUNT,
                1,
                &[("subsystem", "media"), ("op", "load"), ("media", "disk")],
            );
        }
        Ok(self.block_size)
    }

    fn next_file(&mut self, section: &Section) -> Result<()> {
        if self.open_position() == Some(section.position) {
            return Ok(());
        }
        let Some(vsn) = self.vsn.as_ref() else {
            return Err(StagerError::Stage(StageErrno::NoDevice));
        };
        let path = archive_file_path(&self.root, vsn, section.position);
        let file = File::open(&path).map_err(|err| {
            let errno = match err.kind() {
                ErrorKind::NotFound => StageErrno::Io,
                _ => StageErrno::from(&err),
            };
            StagerError::Stage(errno).with_context(format!("open {}", path.display()))
        })?;
        tracing::debug!(
            target: tags::TARGET_MEDIA,
            vsn = %vsn,
            position = section.position,
            path = %path.display(),
            "archive file opened"
        );
        self.open = Some((section.position, file));
        self.block = 0;
        Ok(())
    }

    fn end_file(&mut self) -> Result<()> {
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let want = self.block_size.min(buf.len());
        let file = self.file()?;
        let mut filled = 0;
        while filled < want {
            match file.read(&mut buf[filled..want]) {
                Ok(0) => break,
                Ok(read) => filled += read,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        if filled > 0 {
            self.block += 1;
        }
        telemetry::increment_counter(
            tags::METRIC_MEDIA_READ_BYTES,
            filled as u64,
            &[("subsystem", "media"), ("op", "read"), ("media", "disk")],
        );
        Ok(filled)
    }

    fn seek(&mut self, block: u64, cancel: &CancellationToken) -> Result<u64> {
        if cancel.is_canceled() {
            return Ok(self.block);
        }
        let offset = block * self.block_size as u64;
        self.file()?.seek(SeekFrom::Start(offset))?;
        self.block = block;
        telemetry::increment_counter(
            tags::METRIC_MEDIA_SEEK_COUNT,
            1,
            &[("subsystem", "media"), ("op", "seek"), ("media", "disk")],
        );
        Ok(block)
    }

    fn position(&self) -> u64 {
        self.block
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn unload(&mut self) -> Result<()> {
        self.open = None;
        self.vsn = None;
        self.block = 0;
        Ok(())
    }
}
