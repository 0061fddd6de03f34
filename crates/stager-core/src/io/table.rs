use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use memmap2::{MmapMut, MmapOptions};

use crate::telemetry;
use crate::telemetry::tags;
use crate::{Result, StagerError};

/// Size of the validation footer stored after the last record.
pub const FOOTER_SIZE: usize = 32;

/// Expected shape of a table file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableLayout {
    pub magic: u32,
    pub version: u16,
    pub record_size: usize,
    pub count: usize,
}

impl TableLayout {
    /// Total file size: the records followed by the footer.
    pub fn file_size(&self) -> u64 {
        (self.record_size * self.count + FOOTER_SIZE) as u64
    }
}

/// Trailing footer `{ magic, version, created, count, size }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableFooter {
    pub magic: u32,
    pub version: u16,
    pub created: u64,
    pub count: u32,
    pub size: u64,
}

impl TableFooter {
    pub fn to_bytes(&self) -> [u8; FOOTER_SIZE] {
        let mut out = [0u8; FOOTER_SIZE];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..6].copy_from_slice(&self.version.to_le_bytes());
        out[8..16].copy_from_slice(&self.created.to_le_bytes());
        out[16..20].copy_from_slice(&self.count.to_le_bytes());
        out[24..32].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FOOTER_SIZE {
            return Err(StagerError::InvalidFormat("table footer is truncated"));
        }
        let u32_at = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let u64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(raw)
        };
        Ok(Self {
            magic: u32_at(0),
            version: u16::from_le_bytes([bytes[4], bytes[5]]),
            created: u64_at(8),
            count: u32_at(16),
            size: u64_at(24),
        })
    }

    fn matches(&self, layout: &TableLayout) -> bool {
        self.magic == layout.magic
            && self.version == layout.version
            && self.count as usize == layout.count
            && self.size == layout.file_size()
    }
}

/// How a table file was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableOpen {
    /// A new zeroed table was written.
    Created,
    /// The footer of an existing table matched; its records may be recovered.
    Recovered,
}

/// Fixed-size record array mapped from a file and written through on every update.
#[derive(Debug)]
pub struct TableFile {
    path: PathBuf,
    layout: TableLayout,
    map: MmapMut,
    footer: TableFooter,
}

impl TableFile {
    /// Maps `path`, keeping its content only when the footer matches `layout`.
    pub fn open(path: &Path, layout: TableLayout) -> Result<(Self, TableOpen)> {
        let started_at = Instant::now();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|err| StagerError::from(err).with_context(parent.display().to_string()))?;
        }
        let existing = match std::fs::metadata(path) {
            Ok(meta) => Some(meta.len()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(StagerError::from(err).with_context(path.display().to_string())),
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|err| StagerError::from(err).with_context(path.display().to_string()))?;

        let mut outcome = TableOpen::Created;
        if existing == Some(layout.file_size()) {
            let map = map_file(&file)?;
            let footer = TableFooter::from_bytes(&map[map.len() - FOOTER_SIZE..])?;
            if footer.matches(&layout) {
                outcome = TableOpen::Recovered;
                tracing::info!(
                    path = %path.display(),
                    records = layout.count,
                    created = footer.created,
                    "table footer valid, recovering"
                );
                telemetry::record_histogram(
                    tags::METRIC_TABLE_OPEN_LATENCY_US,
                    telemetry::elapsed_us(started_at),
                    &[("subsystem", "table"), ("op", "open"), ("result", "recovered")],
                );
                return Ok((
                    Self {
                        path: path.to_path_buf(),
                        layout,
                        map,
                        footer,
                    },
                    outcome,
                ));
            }
            tracing::warn!(
                path = %path.display(),
                magic = footer.magic,
                version = footer.version,
                count = footer.count,
                "table footer mismatch, discarding table"
            );
        } else if let Some(len) = existing {
            tracing::warn!(
                path = %path.display(),
                len,
                expected = layout.file_size(),
                "table size mismatch, discarding table"
            );
        }

        file.set_len(0)?;
        file.set_len(layout.file_size())?;
        let mut map = map_file(&file)?;
        let footer = TableFooter {
            magic: layout.magic,
            version: layout.version,
            created: unix_now(),
            count: layout.count as u32,
            size: layout.file_size(),
        };
        let at = map.len() - FOOTER_SIZE;
        map[at..].copy_from_slice(&footer.to_bytes());
        map.flush()?;

        telemetry::record_histogram(
            tags::METRIC_TABLE_OPEN_LATENCY_US,
            telemetry::elapsed_us(started_at),
            &[("subsystem", "table"), ("op", "open"), ("result", "created")],
        );
        Ok((
            Self {
                path: path.to_path_buf(),
                layout,
                map,
                footer,
            },
            outcome,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> TableLayout {
        self.layout
    }

    pub fn footer(&self) -> TableFooter {
        self.footer
    }

    /// Bytes of record `index`; empty when out of range.
    pub fn record(&self, index: usize) -> &[u8] {
        if index >= self.layout.count {
            return &[];
        }
        let start = index * self.layout.record_size;
        &self.map[start..start + self.layout.record_size]
    }

    /// Overwrites record `index` with `bytes`, zero-filling the remainder.
    pub fn write_record(&mut self, index: usize, bytes: &[u8]) -> Result<()> {
        if index >= self.layout.count {
            return Err(StagerError::InvalidFormat("table record index out of range"));
        }
        let size = self.layout.record_size;
        let start = index * size;
        let len = bytes.len().min(size);
        let slot = &mut self.map[start..start + size];
        slot[..len].copy_from_slice(&bytes[..len]);
        slot[len..].fill(0);
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }
}

fn map_file(file: &File) -> Result<MmapMut> {
    // SAFETY: the table file is owned by this daemon for its whole lifetime; no other
    // process truncates it while mapped.
    let map = unsafe { MmapOptions::new().map_mut(file)? };
    Ok(map)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
