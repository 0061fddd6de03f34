use std::io;
use std::time::Instant;

use super::MediaSource;
use crate::config::{MediaOptions, ReadRetryPolicy};
use crate::error::StageErrno;
use crate::sync::CancellationToken;
use crate::telemetry;
use crate::telemetry::tags;
use crate::types::{MediaType, Section, Vsn};
use crate::{Result, StagerError};

/// Raw block device under a sequential medium.
///
/// `read` transfers bytes from the current position; `locate` positions at a media
/// block; `skip` moves forward within the current block, which optical recovery needs to
/// resume after a partially read block.
pub trait BlockDevice: Send {
    /// Mounts `vsn` and returns the device block size.
    fn mount(&mut self, vsn: &Vsn) -> io::Result<usize>;
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn locate(&mut self, block: u64) -> io::Result<()>;
    fn skip(&mut self, bytes: u64) -> io::Result<()>;
    fn unmount(&mut self) -> io::Result<()>;
}

/// Tape or optical drive.
pub struct SequentialDevice {
    device: Box<dyn BlockDevice>,
    media: MediaType,
    block_size: usize,
    position: u64,
    seek_attempts: u32,
    optical: ReadRetryPolicy,
    mounted: Option<Vsn>,
}

impl SequentialDevice {
    pub fn new(device: Box<dyn BlockDevice>, media: MediaType, options: &MediaOptions) -> Self {
        Self {
            device,
            media,
            block_size: 0,
            position: 0,
            seek_attempts: options.seek_attempts.max(1),
            optical: options.optical_retry,
            mounted: None,
        }
    }

    pub fn media(&self) -> MediaType {
        self.media
    }

    pub fn mounted(&self) -> Option<&Vsn> {
        self.mounted.as_ref()
    }

    /// Reads with the shrinking-window recovery used on optical media.
    ///
    /// A failing read is retried with half the window, repositioned to the failing byte,
    /// until the window drops below the configured minimum or the attempts run out.
    fn read_with_recovery(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let block = self.position;
        let mut filled = 0;
        let mut window = buf.len();
        let mut attempts = 0;

        while filled < buf.len() {
            let want = window.min(buf.len() - filled);
            match self.device.read(&mut buf[filled..filled + want]) {
                Ok(0) => break,
                Ok(read) => filled += read,
                Err(err) => {
                    let next = window / 2;
                    if attempts >= self.optical.max_attempts || next < self.optical.min_read {
                        return Err(err);
                    }
                    attempts += 1;
                    window = next;
                    telemetry::increment_counter(
                        tags::METRIC_MEDIA_READ_RETRY_COUNT,
                        1,
                        &[("subsystem", "media"), ("op", "read"), ("media", "optical")],
                    );
                    tracing::debug!(
                        target: tags::TARGET_MEDIA,
                        block,
                        filled,
                        window,
                        attempts,
                        error = %err,
                        "optical read failed, shrinking window"
                    );
                    if self.optical.reposition {
                        self.device.locate(block)?;
                        if filled > 0 {
                            self.device.skip(filled as u64)?;
                        }
                    }
                }
            }
        }
        Ok(filled)
    }
}

impl MediaSource for SequentialDevice {
    fn load(&mut self, vsn: &Vsn) -> Result<usize> {
        if self.mounted.as_ref() == Some(vsn) {
            return Ok(self.block_size);
        }
        if self.mounted.is_some() {
            self.unload()?;
        }
        let block_size = self
            .device
            .mount(vsn)
            .map_err(|err| StagerError::from(err).with_context(format!("mount {vsn}")))?;
        if block_size == 0 {
            return Err(StagerError::Stage(StageErrno::NoDevice).with_context(format!("mount {vsn}")));
        }
        self.block_size = block_size;
        self.position = 0;
        self.mounted = Some(vsn.clone());
        telemetry::increment_counter(
            tags::METRIC_MEDIA_LOAD_COUNT,
            1,
            &[("subsystem", "media"), ("op", "load"), ("media", self.media.label())],
        );
        tracing::info!(target: tags::TARGET_MEDIA, vsn = %vsn, media = %self.media, block_size, "volume mounted");
        Ok(block_size)
    }

    fn next_file(&mut self, _section: &Section) -> Result<()> {
        Ok(())
    }

    fn end_file(&mut self) -> Result<()> {
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.mounted.is_none() {
            return Err(StagerError::Stage(StageErrno::NoDevice));
        }
        let want = self.block_size.min(buf.len());
        let read = match self.media {
            MediaType::Optical => self.read_with_recovery(&mut buf[..want]),
            _ => self.device.read(&mut buf[..want]),
        }?;
        if read > 0 {
            self.position += 1;
        }
        telemetry::increment_counter(
            tags::METRIC_MEDIA_READ_BYTES,
            read as u64,
            &[("subsystem", "media"), ("op", "read"), ("media", self.media.label())],
        );
        Ok(read)
    }

    fn seek(&mut self, block: u64, cancel: &CancellationToken) -> Result<u64> {
        let started_at = Instant::now();
        let mut last_error = None;
        for attempt in 0..self.seek_attempts {
            if cancel.is_canceled() {
                tracing::debug!(target: tags::TARGET_MEDIA, block, "positioning canceled");
                return Ok(self.position);
            }
            match self.device.locate(block) {
                Ok(()) => {
                    self.position = block;
                    telemetry::increment_counter(
                        tags::METRIC_MEDIA_SEEK_COUNT,
                        1,
                        &[("subsystem", "media"), ("op", "seek")],
                    );
                    telemetry::record_histogram(
                        tags::METRIC_MEDIA_SEEK_LATENCY_US,
                        telemetry::elapsed_us(started_at),
                        &[("subsystem", "media"), ("op", "seek")],
                    );
                    return Ok(block);
                }
                Err(err) => {
                    tracing::warn!(
                        target: tags::TARGET_MEDIA,
                        block,
                        attempt,
                        error = %err,
                        "positioning failed"
                    );
                    last_error = Some(err);
                }
            }
        }
        let errno = match last_error.as_ref().map(StageErrno::from) {
            Some(StageErrno::NoDevice) => StageErrno::NoDevice,
            _ => StageErrno::Io,
        };
        Err(StagerError::Stage(errno).with_context(format!("position to block {block}")))
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn unload(&mut self) -> Result<()> {
        if let Some(vsn) = self.mounted.take() {
            self.device.unmount()?;
            tracing::info!(target: tags::TARGET_MEDIA, vsn = %vsn, "volume unloaded");
        }
        self.position = 0;
        Ok(())
    }
}
