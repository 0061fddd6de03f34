use super::HeaderError;
use super::consts::{
    CHKSUM_RANGE, GID_RANGE, LINKNAME_RANGE, MAGIC_RANGE, MODE_RANGE, MTIME_RANGE, NAME_RANGE,
    OCTAL_SIZE_MAX, SIZE_RANGE, TAR_MAGIC, TAR_RECORD_SIZE, TYPE_GNU_LONGNAME, TYPE_REGULAR,
    TYPEFLAG_OFFSET, UID_RANGE, VERSION_RANGE, round_to_record,
};

const GNU_LONGLINK_NAME: &str = "././@LongLink";

/// Fixed 512-byte tar record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassicHeader {
    pub name: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: u64,
    pub typeflag: u8,
    pub linkname: String,
}

impl ClassicHeader {
    pub fn regular(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            mode: 0o644,
            uid: 0,
            gid: 0,
            size,
            mtime: 0,
            typeflag: TYPE_REGULAR,
            linkname: String::new(),
        }
    }

    /// Encodes this header as a single record; names longer than the field are truncated.
    pub fn to_bytes(&self) -> [u8; TAR_RECORD_SIZE] {
        let mut bytes = [0u8; TAR_RECORD_SIZE];
        copy_truncated(&mut bytes[NAME_RANGE], self.name.as_bytes());
        write_octal(&mut bytes[MODE_RANGE], self.mode as u64);
        write_octal(&mut bytes[UID_RANGE], self.uid as u64);
        write_octal(&mut bytes[GID_RANGE], self.gid as u64);
        write_size(&mut bytes[SIZE_RANGE], self.size);
        write_octal(&mut bytes[MTIME_RANGE], self.mtime);
        bytes[TYPEFLAG_OFFSET] = self.typeflag;
        copy_truncated(&mut bytes[LINKNAME_RANGE], self.linkname.as_bytes());
        bytes[MAGIC_RANGE].copy_from_slice(b"ustar\0");
        bytes[VERSION_RANGE].copy_from_slice(b"00");
        seal_checksum(&mut bytes);
        bytes
    }

    /// Encodes the full archive header, prefixing a GNU long-name record when the
    /// name does not fit the fixed field.
    pub fn encode(&self) -> Vec<u8> {
        if self.name.len() <= NAME_RANGE.len() {
            return self.to_bytes().to_vec();
        }

        let name_len = self.name.len() as u64 + 1;
        let longlink = Self {
            name: GNU_LONGLINK_NAME.to_string(),
            mode: 0,
            uid: 0,
            gid: 0,
            size: name_len,
            mtime: 0,
            typeflag: TYPE_GNU_LONGNAME,
            linkname: String::new(),
        };
        let mut out = Vec::with_capacity(2 * TAR_RECORD_SIZE + round_to_record(name_len) as usize);
        out.extend_from_slice(&longlink.to_bytes());
        out.extend_from_slice(self.name.as_bytes());
        out.resize(TAR_RECORD_SIZE + round_to_record(name_len) as usize, 0);
        out.extend_from_slice(&self.to_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HeaderError> {
        verify_record(bytes)?;
        let size = size_candidates(&bytes[SIZE_RANGE])?
            .first()
            .ok_or(HeaderError::InvalidSizeField)?;
        Ok(Self {
            name: read_string(&bytes[NAME_RANGE]),
            mode: parse_octal(&bytes[MODE_RANGE]).unwrap_or(0) as u32,
            uid: parse_octal(&bytes[UID_RANGE]).unwrap_or(0) as u32,
            gid: parse_octal(&bytes[GID_RANGE]).unwrap_or(0) as u32,
            size,
            mtime: parse_octal(&bytes[MTIME_RANGE]).unwrap_or(0),
            typeflag: bytes[TYPEFLAG_OFFSET],
            linkname: read_string(&bytes[LINKNAME_RANGE]),
        })
    }
}

/// Sizes a size field may legitimately encode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeCandidates {
    pub octal: Option<u64>,
    pub extended: Option<u64>,
}

impl SizeCandidates {
    pub fn first(&self) -> Option<u64> {
        self.octal.or(self.extended)
    }

    pub fn contains(&self, value: u64) -> bool {
        self.octal == Some(value) || self.extended == Some(value)
    }
}

/// Checks that one full record carrying the tar magic is present.
pub fn check_magic(bytes: &[u8]) -> Result<(), HeaderError> {
    if bytes.len() < TAR_RECORD_SIZE {
        return Err(HeaderError::Truncated {
            needed: TAR_RECORD_SIZE,
            available: bytes.len(),
        });
    }
    if &bytes[MAGIC_RANGE.start..MAGIC_RANGE.start + TAR_MAGIC.len()] != TAR_MAGIC {
        return Err(HeaderError::BadMagic);
    }
    Ok(())
}

/// Checks the magic and the header checksum of one record.
pub fn verify_record(bytes: &[u8]) -> Result<(), HeaderError> {
    check_magic(bytes)?;

    let stored = parse_octal(&bytes[CHKSUM_RANGE]).ok_or(HeaderError::BadChecksum {
        stored: 0,
        computed: 0,
    })?;
    let (unsigned, signed) = record_checksum(&bytes[..TAR_RECORD_SIZE]);
    if stored != unsigned as u64 && stored as i64 != signed as i64 {
        return Err(HeaderError::BadChecksum {
            stored: stored as u32,
            computed: unsigned,
        });
    }
    Ok(())
}

/// Decodes a size field both as octal and as the base-256 extension.
pub fn size_candidates(field: &[u8]) -> Result<SizeCandidates, HeaderError> {
    let candidates = SizeCandidates {
        octal: parse_octal(field),
        extended: parse_base256(field),
    };
    if candidates.first().is_none() {
        return Err(HeaderError::InvalidSizeField);
    }
    Ok(candidates)
}

/// Parses a space or NUL terminated octal field.
pub fn parse_octal(field: &[u8]) -> Option<u64> {
    let start = field.iter().position(|b| *b != b' ' && *b != 0)?;
    let digits = &field[start..];
    let end = digits
        .iter()
        .position(|b| *b == b' ' || *b == 0)
        .unwrap_or(digits.len());
    if end == 0 || digits[end..].iter().any(|b| *b != b' ' && *b != 0) {
        return None;
    }

    let mut value: u64 = 0;
    for digit in &digits[..end] {
        if !(b'0'..=b'7').contains(digit) {
            return None;
        }
        value = value.checked_mul(8)?.checked_add((digit - b'0') as u64)?;
    }
    Some(value)
}

fn parse_base256(field: &[u8]) -> Option<u64> {
    let (first, rest) = field.split_first()?;
    if first & 0x80 == 0 || first & 0x40 != 0 {
        return None;
    }
    let mut value = (first & 0x3f) as u64;
    for byte in rest {
        value = value.checked_mul(256)?.checked_add(*byte as u64)?;
    }
    Some(value)
}

fn write_octal(field: &mut [u8], value: u64) {
    let digits = field.len() - 1;
    let text = format!("{value:0digits$o}");
    let text = &text.as_bytes()[text.len().saturating_sub(digits)..];
    field[..digits].copy_from_slice(text);
    field[digits] = 0;
}

fn write_size(field: &mut [u8], size: u64) {
    if size <= OCTAL_SIZE_MAX {
        write_octal(field, size);
        return;
    }
    field.fill(0);
    field[0] = 0x80;
    let be = size.to_be_bytes();
    let start = field.len() - be.len();
    field[start..].copy_from_slice(&be);
}

fn record_checksum(record: &[u8]) -> (u32, i32) {
    let mut unsigned = 0u32;
    let mut signed = 0i32;
    for (idx, byte) in record.iter().enumerate() {
        let byte = if CHKSUM_RANGE.contains(&idx) { b' ' } else { *byte };
        unsigned += byte as u32;
        signed += byte as i8 as i32;
    }
    (unsigned, signed)
}

fn seal_checksum(bytes: &mut [u8; TAR_RECORD_SIZE]) {
    let (sum, _) = record_checksum(bytes);
    let text = format!("{sum:06o}");
    bytes[CHKSUM_RANGE.start..CHKSUM_RANGE.start + 6].copy_from_slice(text.as_bytes());
    bytes[CHKSUM_RANGE.start + 6] = 0;
    bytes[CHKSUM_RANGE.start + 7] = b' ';
}

fn copy_truncated(field: &mut [u8], value: &[u8]) {
    let len = value.len().min(field.len());
    field[..len].copy_from_slice(&value[..len]);
}

fn read_string(field: &[u8]) -> String {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}
