//! Device access and block buffering.
//!
//! The volume engine never touches the backing file directly: all metadata
//! and data go through the [`buffer::BufCache`], which reads and writes
//! sector-aligned blocks on a [`device::BlockDevice`].

pub mod buffer;
pub mod device;

/// Log2 of the basic block (sector) size. Disk addresses (`daddr`) used by
/// the engine count basic blocks.
pub const BB_SHIFT: u32 = 9;

/// The basic block size, in bytes.
pub const BB_SIZE: usize = 1 << BB_SHIFT;
