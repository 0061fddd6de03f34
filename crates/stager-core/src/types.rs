use std::fmt;

use serde::{Deserialize, Serialize};

use crate::StagerError;

pub type Result<T> = std::result::Result<T, StagerError>;

/// Number of archive copies a file may have.
pub const MAX_ARCHIVE: usize = 4;
/// Sections held by one extension record before the chain moves to the next one.
pub const MAX_VSN_SECTIONS: usize = 8;
/// Longest volume serial number accepted.
pub const MAX_VSN_LEN: usize = 31;

/// Permanent slot index of a request in the request table.
pub type RequestId = usize;

/// Synthetic process id of a drive worker.
pub type Pid = u32;

/// Identity of a file inside its filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct FileId {
    pub ino: u32,
    pub r#gen: u32,
}

impl FileId {
    pub const fn new(ino: u32, r#gen: u32) -> Self {
        Self { ino, r#gen }
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.ino, self.r#gen)
    }
}

/// Equipment ordinal of the filesystem owning a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct FsId(pub u32);

/// Handle of a cache file kept open by the worker that staged into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheHandle(pub u64);

/// Library equipment ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct LibraryId(pub u16);

/// Volume serial number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Vsn(String);

impl Vsn {
    pub fn new(label: impl Into<String>) -> Result<Self> {
        let label = label.into();
        if label.is_empty() || label.len() > MAX_VSN_LEN || !label.is_ascii() {
            return Err(StagerError::InvalidFormat("volume serial number"));
        }
        Ok(Self(label))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn to_fixed(&self) -> [u8; MAX_VSN_LEN + 1] {
        let mut raw = [0u8; MAX_VSN_LEN + 1];
        let bytes = self.0.as_bytes();
        let len = bytes.len().min(MAX_VSN_LEN);
        raw[..len].copy_from_slice(&bytes[..len]);
        raw
    }

    pub(crate) fn from_fixed(raw: &[u8]) -> Self {
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        Self(String::from_utf8_lossy(&raw[..end]).into_owned())
    }
}

impl fmt::Display for Vsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Physical medium family of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum MediaType {
    #[default]
    Tape,
    Optical,
    Disk,
    Silo,
}

impl MediaType {
    pub fn to_code(self) -> u8 {
        match self {
            Self::Tape => 1,
            Self::Optical => 2,
            Self::Disk => 3,
            Self::Silo => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Tape),
            2 => Some(Self::Optical),
            3 => Some(Self::Disk),
            4 => Some(Self::Silo),
            _ => None,
        }
    }

    /// Disk-archive and silo volumes are addressed by file, not by block position.
    pub fn is_file_addressed(self) -> bool {
        matches!(self, Self::Disk | Self::Silo)
    }
}

impl MediaType {
    /// Lowercase name used in logs and metric labels.
    pub fn label(self) -> &'static str {
        match self {
            Self::Tape => "tape",
            Self::Optical => "optical",
            Self::Disk => "disk",
            Self::Silo => "silo",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

macro_rules! flag_set {
    ($(#[$meta:meta])* $name:ident : $repr:ty { $($(#[$fmeta:meta])* $flag:ident = $bit:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        pub struct $name($repr);

        impl $name {
            $($(#[$fmeta])* pub const $flag: Self = Self(1 << $bit);)+

            pub const fn empty() -> Self {
                Self(0)
            }

            pub const fn bits(self) -> $repr {
                self.0
            }

            pub const fn from_bits(bits: $repr) -> Self {
                Self(bits)
            }

            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub const fn intersects(self, other: Self) -> bool {
                self.0 & other.0 != 0
            }

            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }

            pub fn set(&mut self, other: Self, value: bool) {
                if value {
                    self.insert(other);
                } else {
                    self.remove(other);
                }
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let mut names = Vec::new();
                $(if self.contains(Self::$flag) {
                    names.push(stringify!($flag));
                })+
                write!(f, "{}({})", stringify!($name), names.join("|"))
            }
        }
    };
}

pub(crate) use flag_set;

flag_set! {
    /// Per-request state bits.
    RequestFlags: u32 {
        ACTIVE = 0,
        DONE = 1,
        CANCEL = 2,
        DUPLICATE = 3,
        /// The selected copy spans more volumes than have been staged so far.
        MULTIVOL = 4,
        /// Follow-on request carrying the next extension of a long multivolume copy.
        EXTENDED = 5,
        RETRY = 6,
        NO_RETRY = 7,
        /// A cache descriptor is retained by the worker in `context`.
        DCACHE = 8,
        /// Request only exists to close a retained cache descriptor.
        DCACHE_CLOSE = 9,
        /// The archive header on media is skipped instead of validated.
        SKIP_HEADER = 10,
        PAX_HEADER = 11,
        CSUSE = 12,
        VERIFY = 13,
        STAGE_NEVER = 14,
        STAGE_PARTIAL = 15,
        /// Waiting for its predecessor in an extension chain.
        HELD = 16,
    }
}

flag_set! {
    /// Per-copy archive state bits.
    CopyFlags: u32 {
        ARCHIVED = 0,
        STALE = 1,
        DAMAGED = 2,
        VERIFY = 3,
        DISK_ARCHIVE = 4,
        PAX_HEADER = 5,
    }
}

/// Physical placement of one contiguous run of a file on one volume.
///
/// `offset` counts 512-byte records from `position` to the archive record that holds
/// the data; when the record carries a header, the header starts there.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Section {
    pub position: u64,
    pub offset: u64,
    pub length: u64,
    pub vsn: Vsn,
}

impl Section {
    pub fn new(vsn: Vsn, position: u64, offset: u64, length: u64) -> Self {
        Self {
            position,
            offset,
            length,
            vsn,
        }
    }
}

/// Placement of one archive copy of a file.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ArchiveCopy {
    pub media: MediaType,
    pub n_vsns: u16,
    pub flags: CopyFlags,
    pub ext_ord: u32,
    pub section: Section,
}

impl ArchiveCopy {
    pub fn new(media: MediaType, section: Section) -> Self {
        Self {
            media,
            n_vsns: 1,
            flags: CopyFlags::ARCHIVED,
            ext_ord: 0,
            section,
        }
    }

    /// True when this copy may be staged from.
    pub fn is_usable(&self) -> bool {
        self.flags.intersects(CopyFlags::ARCHIVED | CopyFlags::VERIFY)
            && !self.flags.intersects(CopyFlags::STALE | CopyFlags::DAMAGED)
    }

    pub fn is_multivolume(&self) -> bool {
        self.n_vsns > 1
    }
}
