use crate::checksum::{ChecksumAlgorithm, ChecksumValue};
use crate::error::StageErrno;
use crate::format::HeaderFormat;
use crate::types::{
    ArchiveCopy, CacheHandle, CopyFlags, FileId, FsId, MAX_ARCHIVE, MediaType, Pid,
    RequestFlags, RequestId, Section, Vsn,
};

/// Size of one persisted request record.
pub const RECORD_SIZE: usize = 512;
/// Per-record magic ("STRQ").
pub const RECORD_MAGIC: u32 = 0x5354_5251;

const COPY_BASE: usize = 136;
const COPY_SIZE: usize = 72;
const NO_LINK: u32 = u32::MAX;
const NO_HANDLE: u64 = u64::MAX;

/// Checksum bookkeeping of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChecksumSpec {
    pub algorithm: Option<ChecksumAlgorithm>,
    pub long_name: bool,
    /// Value folded so far when a descriptor was retained.
    pub partial: Option<ChecksumValue>,
}

/// In-flight stage request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StageRequest {
    pub sort: RequestId,
    pub next: Option<RequestId>,
    pub flags: RequestFlags,
    pub id: FileId,
    pub fseq: FsId,
    pub offset: u64,
    pub len: u64,
    /// Bytes moved in the current attempt.
    pub stage_size: u64,
    /// Bytes already written to the cache file.
    pub write_off: u64,
    /// `write_off` when the current section started.
    pub section_base: u64,
    pub copy: u8,
    pub ar: [ArchiveCopy; MAX_ARCHIVE],
    pub retry: u8,
    pub error: Option<StageErrno>,
    pub checksum: ChecksumSpec,
    pub dcache: Option<CacheHandle>,
    /// Worker holding the retained cache descriptor.
    pub context: Option<Pid>,
    pub vsn_cnt: u16,
    pub se_ord: u16,
    pub ext_ord: u32,
    pub uid: u32,
    pub gid: u32,
    pub directio: bool,
    /// Length of the header validated on the current copy, zero until known.
    pub header_len: u32,
    pub arrival: u64,
}

impl StageRequest {
    pub fn current(&self) -> &ArchiveCopy {
        &self.ar[self.copy as usize % MAX_ARCHIVE]
    }

    pub fn current_mut(&mut self) -> &mut ArchiveCopy {
        &mut self.ar[self.copy as usize % MAX_ARCHIVE]
    }

    pub fn section(&self) -> &Section {
        &self.current().section
    }

    pub fn vsn(&self) -> &Vsn {
        &self.current().section.vsn
    }

    pub fn media(&self) -> MediaType {
        self.current().media
    }

    pub fn is_active(&self) -> bool {
        self.flags.contains(RequestFlags::ACTIVE)
    }

    pub fn is_done(&self) -> bool {
        self.flags.contains(RequestFlags::DONE)
    }

    /// Cleanup requests only exist to close a descriptor retained by a worker.
    pub fn is_cleanup(&self) -> bool {
        self.flags.contains(RequestFlags::DCACHE_CLOSE)
    }

    /// True on any section after the first one of the chain.
    pub fn is_continuation(&self) -> bool {
        self.se_ord > 0 || self.ext_ord > 0
    }

    /// Header expected in front of the current section.
    pub fn header_format(&self) -> HeaderFormat {
        let copy = self.current();
        if self.is_continuation() || copy.media == MediaType::Silo {
            HeaderFormat::None
        } else if copy.flags.contains(CopyFlags::PAX_HEADER)
            || self.flags.contains(RequestFlags::PAX_HEADER)
        {
            HeaderFormat::Extended
        } else {
            HeaderFormat::Classic
        }
    }

    /// Whether the header's size field can be compared against the request length.
    pub fn size_verifiable(&self) -> bool {
        self.offset == 0
            && !self.flags.intersects(
                RequestFlags::MULTIVOL
                    | RequestFlags::STAGE_NEVER
                    | RequestFlags::STAGE_PARTIAL
                    | RequestFlags::SKIP_HEADER,
            )
    }

    /// Next usable copy, searching cyclically from `start`.
    pub fn arcopy(&self, start: usize) -> Option<u8> {
        (0..MAX_ARCHIVE)
            .map(|step| (start + step) % MAX_ARCHIVE)
            .find(|idx| self.ar[*idx].is_usable() && !self.ar[*idx].section.vsn.is_empty())
            .map(|idx| idx as u8)
    }

    /// Marks the current copy damaged when the recorded error is of a damaging class.
    pub fn damage_arcopy(&mut self) -> bool {
        match self.error {
            Some(error) if error.class().is_damaging() => {
                self.current_mut().flags.insert(CopyFlags::DAMAGED);
                true
            }
            _ => false,
        }
    }

    /// Key used to detect two requests for the same data.
    pub fn duplicate_key(&self) -> (FileId, FsId, u64, u64, u64) {
        let section = self.section();
        (self.id, self.fseq, self.offset, section.position, section.offset)
    }

    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        put_u32(&mut out, 0, RECORD_MAGIC);
        put_u32(&mut out, 4, self.sort as u32);
        put_u32(&mut out, 8, self.next.map_or(NO_LINK, |next| next as u32));
        put_u32(&mut out, 12, self.flags.bits());
        put_u32(&mut out, 16, self.id.ino);
        put_u32(&mut out, 20, self.id.r#gen);
        put_u32(&mut out, 24, self.fseq.0);
        out[28] = self.copy;
        out[29] = self.retry;
        out[30] = self.checksum.algorithm.map_or(0, ChecksumAlgorithm::to_code);
        out[31] = (self.checksum.long_name as u8) | ((self.checksum.partial.is_some() as u8) << 1);
        put_u32(&mut out, 32, self.error.map_or(0, StageErrno::to_code));
        put_u32(&mut out, 36, self.context.unwrap_or(0));
        put_u64(&mut out, 40, self.offset);
        put_u64(&mut out, 48, self.len);
        put_u64(&mut out, 56, self.stage_size);
        put_u64(&mut out, 64, self.write_off);
        put_u64(&mut out, 72, self.section_base);
        put_u64(&mut out, 80, self.dcache.map_or(NO_HANDLE, |handle| handle.0));
        out[88..90].copy_from_slice(&self.vsn_cnt.to_le_bytes());
        out[90..92].copy_from_slice(&self.se_ord.to_le_bytes());
        put_u32(&mut out, 92, self.ext_ord);
        put_u32(&mut out, 96, self.uid);
        put_u32(&mut out, 100, self.gid);
        out[104] = self.directio as u8;
        put_u32(&mut out, 108, self.header_len);
        put_u64(&mut out, 112, self.arrival);
        let partial = self.checksum.partial.unwrap_or_default();
        for (idx, word) in partial.0.iter().enumerate() {
            put_u32(&mut out, 120 + idx * 4, *word);
        }
        for (idx, copy) in self.ar.iter().enumerate() {
            encode_copy(&mut out[COPY_BASE + idx * COPY_SIZE..COPY_BASE + (idx + 1) * COPY_SIZE], copy);
        }
        out
    }

    /// Decodes a record, returning `None` when the magic is absent.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < RECORD_SIZE || get_u32(bytes, 0) != RECORD_MAGIC {
            return None;
        }
        let next = get_u32(bytes, 8);
        let context = get_u32(bytes, 36);
        let dcache = get_u64(bytes, 80);
        let mut partial = [0u32; 4];
        for (idx, word) in partial.iter_mut().enumerate() {
            *word = get_u32(bytes, 120 + idx * 4);
        }
        let mut ar: [ArchiveCopy; MAX_ARCHIVE] = Default::default();
        for (idx, copy) in ar.iter_mut().enumerate() {
            *copy = decode_copy(&bytes[COPY_BASE + idx * COPY_SIZE..COPY_BASE + (idx + 1) * COPY_SIZE]);
        }
        Some(Self {
            sort: get_u32(bytes, 4) as RequestId,
            next: (next != NO_LINK).then_some(next as RequestId),
            flags: RequestFlags::from_bits(get_u32(bytes, 12)),
            id: FileId::new(get_u32(bytes, 16), get_u32(bytes, 20)),
            fseq: FsId(get_u32(bytes, 24)),
            copy: bytes[28],
            retry: bytes[29],
            checksum: ChecksumSpec {
                algorithm: ChecksumAlgorithm::from_code(bytes[30]),
                long_name: bytes[31] & 1 != 0,
                partial: (bytes[31] & 2 != 0).then_some(ChecksumValue(partial)),
            },
            error: StageErrno::from_code(get_u32(bytes, 32)),
            context: (context != 0).then_some(context),
            offset: get_u64(bytes, 40),
            len: get_u64(bytes, 48),
            stage_size: get_u64(bytes, 56),
            write_off: get_u64(bytes, 64),
            section_base: get_u64(bytes, 72),
            dcache: (dcache != NO_HANDLE).then_some(CacheHandle(dcache)),
            vsn_cnt: u16::from_le_bytes([bytes[88], bytes[89]]),
            se_ord: u16::from_le_bytes([bytes[90], bytes[91]]),
            ext_ord: get_u32(bytes, 92),
            uid: get_u32(bytes, 96),
            gid: get_u32(bytes, 100),
            directio: bytes[104] != 0,
            header_len: get_u32(bytes, 108),
            arrival: get_u64(bytes, 112),
            ar,
        })
    }
}

fn encode_copy(out: &mut [u8], copy: &ArchiveCopy) {
    out[0] = if copy.section.vsn.is_empty() { 0 } else { copy.media.to_code() };
    out[2..4].copy_from_slice(&copy.n_vsns.to_le_bytes());
    put_u32(out, 4, copy.flags.bits());
    put_u32(out, 8, copy.ext_ord);
    put_u64(out, 12, copy.section.position);
    put_u64(out, 20, copy.section.offset);
    put_u64(out, 28, copy.section.length);
    out[36..68].copy_from_slice(&copy.section.vsn.to_fixed());
}

fn decode_copy(bytes: &[u8]) -> ArchiveCopy {
    let Some(media) = MediaType::from_code(bytes[0]) else {
        return ArchiveCopy::default();
    };
    ArchiveCopy {
        media,
        n_vsns: u16::from_le_bytes([bytes[2], bytes[3]]),
        flags: CopyFlags::from_bits(get_u32(bytes, 4)),
        ext_ord: get_u32(bytes, 8),
        section: Section {
            position: get_u64(bytes, 12),
            offset: get_u64(bytes, 20),
            length: get_u64(bytes, 28),
            vsn: Vsn::from_fixed(&bytes[36..68]),
        },
    }
}

fn put_u32(out: &mut [u8], at: usize, value: u32) {
    out[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(out: &mut [u8], at: usize, value: u64) {
    out[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

fn get_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn get_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}
