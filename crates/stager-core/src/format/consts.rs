/// Size of one tar record; archive offsets are counted in these units.
pub const TAR_RECORD_SIZE: usize = 512;
/// Magic prefix shared by POSIX and GNU tar headers.
pub const TAR_MAGIC: &[u8; 5] = b"ustar";
/// Largest size the legacy 11-digit octal size field can hold.
pub const LEGACY_SIZE_MAX: u64 = 0o7777777777;
/// Largest size encodable as 11 octal digits.
pub const OCTAL_SIZE_MAX: u64 = 0o77777777777;

pub const NAME_RANGE: std::ops::Range<usize> = 0..100;
pub const MODE_RANGE: std::ops::Range<usize> = 100..108;
pub const UID_RANGE: std::ops::Range<usize> = 108..116;
pub const GID_RANGE: std::ops::Range<usize> = 116..124;
pub const SIZE_RANGE: std::ops::Range<usize> = 124..136;
pub const MTIME_RANGE: std::ops::Range<usize> = 136..148;
pub const CHKSUM_RANGE: std::ops::Range<usize> = 148..156;
pub const TYPEFLAG_OFFSET: usize = 156;
pub const LINKNAME_RANGE: std::ops::Range<usize> = 157..257;
pub const MAGIC_RANGE: std::ops::Range<usize> = 257..263;
pub const VERSION_RANGE: std::ops::Range<usize> = 263..265;

pub const TYPE_REGULAR: u8 = b'0';
/// GNU long-name record preceding the real header.
pub const TYPE_GNU_LONGNAME: u8 = b'L';
/// POSIX extended header for the next entry.
pub const TYPE_PAX_EXTENDED: u8 = b'x';

/// Rounds `len` up to a whole number of tar records.
pub const fn round_to_record(len: u64) -> u64 {
    len.div_ceil(TAR_RECORD_SIZE as u64) * TAR_RECORD_SIZE as u64
}
