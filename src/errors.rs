//! Error types shared across the driver.
//!
//! The volume engine reports failures through [`XfsError`], one variant per
//! failure class the operation surface can produce. Errors are converted to
//! negative errno values only at the FUSE boundary, through
//! [`XfsError::errno`].

use core::fmt;

/// `CanFail` is a return type for operations that are allowed to fail, and
/// don't need to return anything.
pub type CanFail<E> = Result<(), E>;

/// Result type used throughout the volume engine.
pub type IOResult<T> = Result<T, XfsError>;

/// Failure classes of the volume engine operation surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XfsError {
    /// A path component was not found.
    NoEntry,

    /// A path component that must be a directory is not one.
    NotDirectory,

    /// The operation does not apply to directories.
    IsDirectory,

    /// Name collision on create.
    Exists,

    /// rmdir / rename over a directory that still has live entries.
    NotEmpty,

    /// Mutation attempted on a read-only mount.
    ReadOnly,

    /// Block or inode allocation failed.
    NoSpace,

    /// The link count would exceed the on-disk maximum.
    TooManyLinks,

    /// A name component exceeds 255 bytes.
    NameTooLong,

    /// Bad argument (empty name, wrong file type for the operation, ...).
    Invalid,

    /// Disk read/write failed, or an on-disk structure is corrupt.
    Io,

    /// Feature not implemented (extended attributes, ...).
    NotSupported,

    /// The mount was shut down after an aborted transaction; every
    /// subsequent operation fails permanently.
    Shutdown,
}

impl XfsError {
    /// Maps the error to the POSIX errno the FUSE layer replies with.
    pub fn errno(self) -> i32 {
        match self {
            Self::NoEntry => libc::ENOENT,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::Exists => libc::EEXIST,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::ReadOnly => libc::EROFS,
            Self::NoSpace => libc::ENOSPC,
            Self::TooManyLinks => libc::EMLINK,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::Invalid => libc::EINVAL,
            Self::Io | Self::Shutdown => libc::EIO,
            Self::NotSupported => libc::ENOTSUP,
        }
    }
}

impl fmt::Display for XfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::NoEntry => "no such file or directory",
            Self::NotDirectory => "not a directory",
            Self::IsDirectory => "is a directory",
            Self::Exists => "file exists",
            Self::NotEmpty => "directory not empty",
            Self::ReadOnly => "read-only filesystem",
            Self::NoSpace => "no space left on device",
            Self::TooManyLinks => "too many links",
            Self::NameTooLong => "file name too long",
            Self::Invalid => "invalid argument",
            Self::Io => "input/output error",
            Self::NotSupported => "operation not supported",
            Self::Shutdown => "filesystem shut down",
        };
        f.write_str(msg)
    }
}

impl From<std::io::Error> for XfsError {
    fn from(_: std::io::Error) -> Self {
        Self::Io
    }
}

/// Mount-time failures.
///
/// These are raised while probing and validating the superblock, before a
/// volume exists; past that point everything is an [`XfsError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MountError {
    /// The device could not be opened or read.
    Device,

    /// The superblock failed validation (magic, version, geometry).
    BadSuperblock,

    /// The superblock checksum does not match its contents.
    BadChecksum,

    /// mkfs did not complete on this filesystem.
    InProgress,

    /// The filesystem uses an external log device.
    ExternalLog,

    /// The filesystem has a real-time section.
    RealTime,
}

impl fmt::Display for MountError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Device => "cannot open or read the device",
            Self::BadSuperblock => "not a valid XFS superblock",
            Self::BadChecksum => "superblock checksum mismatch",
            Self::InProgress => "filesystem creation is in progress",
            Self::ExternalLog => "filesystem has an external log",
            Self::RealTime => "filesystem has a real-time section",
        };
        f.write_str(msg)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(XfsError::NoEntry.errno(), libc::ENOENT);
        assert_eq!(XfsError::ReadOnly.errno(), libc::EROFS);
        assert_eq!(XfsError::Shutdown.errno(), libc::EIO);
        assert_eq!(XfsError::NotSupported.errno(), libc::ENOTSUP);
    }
}
