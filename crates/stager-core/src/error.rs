use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::format::HeaderError;

#[derive(Debug, Error)]
pub enum StagerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid format: {0}")]
    InvalidFormat(&'static str),
    #[error("archive header error: {0}")]
    Header(#[from] HeaderError),
    #[error("checksum mismatch (expected {expected:08x?}, actual {actual:08x?})")]
    ChecksumMismatch { expected: [u32; 4], actual: [u32; 4] },
    #[error("stage failed: {0}")]
    Stage(StageErrno),
    #[error("lock abandoned by holder {holder}")]
    LockAbandoned { holder: u32 },
    #[error("request table is full")]
    TableFull,
    #[error("operation canceled")]
    Canceled,
    #[error("configuration error: {0}")]
    Config(String),
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<StagerError>,
    },
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl StagerError {
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Resolves this error to the per-request code stored in the request table.
    pub fn errno(&self) -> StageErrno {
        match self {
            Self::Io(err) => StageErrno::from(err),
            Self::Header(_) => StageErrno::HeaderFormat,
            Self::ChecksumMismatch { .. } => StageErrno::ChecksumMismatch,
            Self::Stage(errno) => *errno,
            Self::Canceled => StageErrno::Canceled,
            Self::LockAbandoned { .. } => StageErrno::NoSuchProcess,
            Self::TableFull => StageErrno::NoSpace,
            Self::Context { source, .. } => source.errno(),
            Self::InvalidFormat(_) | Self::Config(_) => StageErrno::InvalidArgument,
            Self::Other(_) => StageErrno::Io,
        }
    }
}

impl From<StageErrno> for StagerError {
    fn from(errno: StageErrno) -> Self {
        Self::Stage(errno)
    }
}

/// Request-level failure code.
///
/// Every pipeline failure is resolved to one of these before it is recorded on the
/// request; the scheduler decides retry versus terminal failure from it and the
/// filesystem receives it in the final response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageErrno {
    Io,
    NoDevice,
    NoSpace,
    Canceled,
    Interrupted,
    Permission,
    Unsupported,
    TimedOut,
    CommFailure,
    Busy,
    NotFound,
    AlreadyExists,
    InvalidArgument,
    HeaderFormat,
    ChecksumMismatch,
    NoSuchProcess,
    Raw(i32),
}

impl StageErrno {
    /// Host errno value reported to the filesystem.
    pub fn errno(self) -> i32 {
        match self {
            Self::Io | Self::HeaderFormat | Self::ChecksumMismatch => libc::EIO,
            Self::NoDevice => libc::ENODEV,
            Self::NoSpace => libc::ENOSPC,
            Self::Canceled => libc::ECANCELED,
            Self::Interrupted => libc::EINTR,
            Self::Permission => libc::EACCES,
            Self::Unsupported => libc::ENOTSUP,
            Self::TimedOut => libc::ETIMEDOUT,
            Self::CommFailure => libc::ECOMM,
            Self::Busy => libc::EBUSY,
            Self::NotFound => libc::ENOENT,
            Self::AlreadyExists => libc::EEXIST,
            Self::InvalidArgument => libc::EINVAL,
            Self::NoSuchProcess => libc::ESRCH,
            Self::Raw(code) => code,
        }
    }

    pub fn from_errno(code: i32) -> Self {
        match code {
            libc::EIO => Self::Io,
            libc::ENODEV => Self::NoDevice,
            libc::ENOSPC => Self::NoSpace,
            libc::ECANCELED => Self::Canceled,
            libc::EINTR => Self::Interrupted,
            libc::EACCES | libc::EPERM => Self::Permission,
            libc::ENOTSUP => Self::Unsupported,
            libc::ETIMEDOUT | libc::ETIME => Self::TimedOut,
            libc::ECOMM => Self::CommFailure,
            libc::EBUSY => Self::Busy,
            libc::ENOENT => Self::NotFound,
            libc::EEXIST => Self::AlreadyExists,
            libc::EINVAL => Self::InvalidArgument,
            libc::ESRCH => Self::NoSuchProcess,
            other => Self::Raw(other),
        }
    }

    /// Stable code used in the persisted request table.
    pub fn to_code(self) -> u32 {
        match self {
            Self::Io => 1,
            Self::NoDevice => 2,
            Self::NoSpace => 3,
            Self::Canceled => 4,
            Self::Interrupted => 5,
            Self::Permission => 6,
            Self::Unsupported => 7,
            Self::TimedOut => 8,
            Self::CommFailure => 9,
            Self::Busy => 10,
            Self::NotFound => 11,
            Self::AlreadyExists => 12,
            Self::InvalidArgument => 13,
            Self::HeaderFormat => 14,
            Self::ChecksumMismatch => 15,
            Self::NoSuchProcess => 16,
            Self::Raw(code) => 0x8000_0000 | (code as u32 & 0x7fff_ffff),
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        let errno = match code {
            0 => return None,
            1 => Self::Io,
            2 => Self::NoDevice,
            3 => Self::NoSpace,
            4 => Self::Canceled,
            5 => Self::Interrupted,
            6 => Self::Permission,
            7 => Self::Unsupported,
            8 => Self::TimedOut,
            9 => Self::CommFailure,
            10 => Self::Busy,
            11 => Self::NotFound,
            12 => Self::AlreadyExists,
            13 => Self::InvalidArgument,
            14 => Self::HeaderFormat,
            15 => Self::ChecksumMismatch,
            16 => Self::NoSuchProcess,
            raw if raw & 0x8000_0000 != 0 => Self::Raw((raw & 0x7fff_ffff) as i32),
            _ => Self::Raw(code as i32),
        };
        Some(errno)
    }

    pub fn class(self) -> ErrorClass {
        ErrorClass::classify(self)
    }
}

impl std::fmt::Display for StageErrno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HeaderFormat => f.write_str("archive header does not match request"),
            Self::ChecksumMismatch => f.write_str("staged data checksum mismatch"),
            Self::Raw(code) => write!(f, "errno {code}"),
            other => write!(
                f,
                "{}",
                std::io::Error::from_raw_os_error(other.errno())
            ),
        }
    }
}

impl std::error::Error for StageErrno {}

impl From<&std::io::Error> for StageErrno {
    fn from(err: &std::io::Error) -> Self {
        if let Some(code) = err.raw_os_error() {
            return Self::from_errno(code);
        }
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound,
            std::io::ErrorKind::PermissionDenied => Self::Permission,
            std::io::ErrorKind::AlreadyExists => Self::AlreadyExists,
            std::io::ErrorKind::TimedOut => Self::TimedOut,
            std::io::ErrorKind::Interrupted => Self::Interrupted,
            std::io::ErrorKind::InvalidInput => Self::InvalidArgument,
            std::io::ErrorKind::Unsupported => Self::Unsupported,
            _ => Self::Io,
        }
    }
}

/// Error taxonomy used by the scheduler to pick retry, copy switch or terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Media hiccup: retried in the pipeline, the copy is not damaged.
    Transient,
    /// Request-fatal: surfaced immediately, no retry, no damage marking.
    Fatal,
    /// The copy is marked damaged and another copy is searched.
    Damaging,
}

impl ErrorClass {
    pub fn classify(errno: StageErrno) -> Self {
        match errno {
            StageErrno::Canceled
            | StageErrno::Interrupted
            | StageErrno::NoSpace
            | StageErrno::Permission
            | StageErrno::Unsupported
            | StageErrno::NoDevice => Self::Fatal,
            StageErrno::TimedOut
            | StageErrno::CommFailure
            | StageErrno::Busy
            | StageErrno::NotFound => Self::Transient,
            _ => Self::Damaging,
        }
    }

    pub fn is_damaging(self) -> bool {
        matches!(self, Self::Damaging)
    }
}

impl StageErrno {
    /// Errors the reader may retry in place after repositioning.
    pub fn is_retryable_read(self) -> bool {
        matches!(self, Self::Io | Self::TimedOut | Self::Busy)
    }
}
