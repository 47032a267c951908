//! Userspace XFS filesystem driver.
//!
//! `fzxfs` opens a block device or image file containing an XFS filesystem
//! (V4 or V5 on-disk format) and projects it as a POSIX directory tree. The
//! crate is split between the volume engine ([`fs::xfs`]), which parses the
//! on-disk structures and executes mutations as atomic transactions, and a
//! thin FUSE front-end ([`fuse`]) that marshals kernel callbacks into engine
//! operations.
//!
//! The engine is synchronous: every operation runs to completion (or error)
//! against the buffer cache, and the front-end serializes entry into the
//! engine behind a single lock.

pub mod errors;
pub mod fs;
pub mod fuse;
pub mod io;
