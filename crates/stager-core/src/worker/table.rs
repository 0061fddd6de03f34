use std::path::Path;
use std::sync::Mutex;

use super::CopyInstanceFlags;
use crate::Result;
use crate::io::{TableFile, TableLayout, TableOpen};
use crate::sync::lock_unpoisoned;
use crate::telemetry;
use crate::telemetry::tags;
use crate::types::{LibraryId, MAX_VSN_LEN, MediaType, Pid, Vsn};

/// Footer magic of the worker table file ("STCP").
pub const WORKER_TABLE_MAGIC: u32 = 0x5354_4350;
pub const WORKER_TABLE_VERSION: u16 = 1;
/// Size of one persisted worker record.
pub const WORKER_RECORD_SIZE: usize = 64;

const RECORD_MAGIC: u32 = 0x5354_574b;
const VSN_AT: usize = 32;

/// Persisted state of one drive worker.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WorkerRecord {
    pub library: LibraryId,
    pub drive: u16,
    pub pid: Option<Pid>,
    pub flags: CopyInstanceFlags,
    pub position: u64,
    /// Owner word of the worker's record lock.
    pub lock_owner: Option<Pid>,
    pub vsn: Option<Vsn>,
    pub media: Option<MediaType>,
}

impl WorkerRecord {
    pub fn to_bytes(&self) -> [u8; WORKER_RECORD_SIZE] {
        let mut out = [0u8; WORKER_RECORD_SIZE];
        out[0..4].copy_from_slice(&RECORD_MAGIC.to_le_bytes());
        out[4..6].copy_from_slice(&self.library.0.to_le_bytes());
        out[6..8].copy_from_slice(&self.drive.to_le_bytes());
        out[8..12].copy_from_slice(&self.pid.unwrap_or(0).to_le_bytes());
        out[12..16].copy_from_slice(&self.flags.bits().to_le_bytes());
        out[16..24].copy_from_slice(&self.position.to_le_bytes());
        out[24..28].copy_from_slice(&self.lock_owner.unwrap_or(0).to_le_bytes());
        out[28] = self.media.map_or(0, MediaType::to_code);
        if let Some(vsn) = &self.vsn {
            out[VSN_AT..VSN_AT + MAX_VSN_LEN + 1].copy_from_slice(&vsn.to_fixed());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < WORKER_RECORD_SIZE {
            return None;
        }
        let u32_at = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        if u32_at(0) != RECORD_MAGIC {
            return None;
        }
        let mut position = [0u8; 8];
        position.copy_from_slice(&bytes[16..24]);
        let vsn = Vsn::from_fixed(&bytes[VSN_AT..VSN_AT + MAX_VSN_LEN + 1]);
        Some(Self {
            library: LibraryId(u16::from_le_bytes([bytes[4], bytes[5]])),
            drive: u16::from_le_bytes([bytes[6], bytes[7]]),
            pid: Some(u32_at(8)).filter(|pid| *pid != 0),
            flags: CopyInstanceFlags::from_bits(u32_at(12)),
            position: u64::from_le_bytes(position),
            lock_owner: Some(u32_at(24)).filter(|owner| *owner != 0),
            vsn: (!vsn.is_empty()).then_some(vsn),
            media: MediaType::from_code(bytes[28]),
        })
    }
}

/// Worker table file, one record per configured drive in library order.
#[derive(Debug)]
pub struct WorkerTable {
    file: Mutex<TableFile>,
}

impl WorkerTable {
    /// Opens the table at `path` for the drives in `layout`, given as `(library, drive)`.
    ///
    /// Records of a previous run are returned only when the footer matches and every
    /// record still describes the drive at its slot; otherwise the table starts empty.
    pub fn open(path: &Path, layout: &[(LibraryId, u16)]) -> Result<(Self, Vec<WorkerRecord>)> {
        let (mut file, outcome) = TableFile::open(
            path,
            TableLayout {
                magic: WORKER_TABLE_MAGIC,
                version: WORKER_TABLE_VERSION,
                record_size: WORKER_RECORD_SIZE,
                count: layout.len(),
            },
        )?;

        let mut recovered = Vec::new();
        if outcome == TableOpen::Recovered {
            for (index, (library, drive)) in layout.iter().enumerate() {
                match WorkerRecord::from_bytes(file.record(index)) {
                    Some(record) if record.library == *library && record.drive == *drive => {
                        recovered.push(record);
                    }
                    _ => {
                        telemetry::increment_counter(
                            tags::METRIC_TABLE_DISCARDED_COUNT,
                            1,
                            &[("subsystem", "worker"), ("op", "recover")],
                        );
                        tracing::warn!(
                            target: tags::TARGET_WORKER,
                            slot = index,
                            library = library.0,
                            drive,
                            "worker table does not match the drive configuration, discarding"
                        );
                        recovered.clear();
                        break;
                    }
                }
            }
        }

        for (index, (library, drive)) in layout.iter().enumerate() {
            let record = recovered.get(index).cloned().unwrap_or(WorkerRecord {
                library: *library,
                drive: *drive,
                ..WorkerRecord::default()
            });
            file.write_record(index, &record.to_bytes())?;
        }
        file.flush()?;
        Ok((
            Self {
                file: Mutex::new(file),
            },
            recovered,
        ))
    }

    pub fn write(&self, index: usize, record: &WorkerRecord) -> Result<()> {
        let mut file = lock_unpoisoned(&self.file);
        file.write_record(index, &record.to_bytes())
    }

    pub fn read(&self, index: usize) -> Option<WorkerRecord> {
        WorkerRecord::from_bytes(lock_unpoisoned(&self.file).record(index))
    }

    pub fn flush(&self) -> Result<()> {
        lock_unpoisoned(&self.file).flush()
    }
}
