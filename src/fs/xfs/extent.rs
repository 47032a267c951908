//! Extent records and the data-fork readers.
//!
//! An extent maps a contiguous run of file blocks to physical blocks. On
//! disk a record packs into 128 bits:
//!
//! ```text
//! bit 127      : unwritten flag
//! bits 73..126 : file offset, in blocks (54 bits)
//! bits 21..72  : start block (52 bits)
//! bits 0..20   : block count (21 bits)
//! ```
//!
//! Small forks keep their records inline in the inode (`Extents` shape);
//! larger forks grow a B-tree whose in-inode root points at long-format
//! leaf blocks. The readers below expose both shapes as a flat list ordered
//! by file offset. Gaps between extents are holes and read back as zeros,
//! as do extents still flagged unwritten.

use bytemuck::{Pod, Zeroable};

use crate::errors::{IOResult, XfsError};
use crate::fs::xfs::cksum;
use crate::fs::xfs::inode::{DataFork, Inode, InodeRef};
use crate::fs::xfs::XfsFs;

/// Sentinel start block for a hole (no backing storage; reads as zeros).
pub const HOLESTARTBLOCK: u64 = u64::MAX - 1;

/// B-tree fork leaf/node block magic, V4 (`BMAP`).
pub const XFS_BMAP_MAGIC: u32 = 0x424d4150;
/// B-tree fork leaf/node block magic, V5 (`BMA3`).
pub const XFS_BMAP_CRC_MAGIC: u32 = 0x424d4133;

/// Header size of a V4 long-format B-tree block.
const BTREE_LBLOCK_LEN: usize = 24;
/// Header size of a V5 long-format B-tree block.
const BTREE_LBLOCK_CRC_LEN: usize = 72;
/// Byte offset of the CRC slot in a V5 long-format B-tree block.
const BTREE_LBLOCK_CRC_OFF: usize = 64;

/// Sibling pointer value meaning "none" in long-format blocks.
pub const NULLFSBLOCK: u64 = u64::MAX;

const MASK54: u64 = (1 << 54) - 1;
const MASK43: u64 = (1 << 43) - 1;
const MASK21: u64 = (1 << 21) - 1;

/// An unpacked extent record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExtentRec {
    /// File offset of the first covered block.
    pub startoff: u64,
    /// Physical start block, or [`HOLESTARTBLOCK`].
    pub startblock: u64,
    /// Number of covered blocks.
    pub blockcount: u64,
    /// Allocated but never written; reads as zeros.
    pub unwritten: bool,
}

impl ExtentRec {
    /// On-disk size of a packed record.
    pub const DISK_SIZE: usize = 16;

    /// Unpacks the 128-bit on-disk form.
    pub fn unpack(raw: [u8; 16]) -> Self {
        let l0 = u64::from_be_bytes(raw[..8].try_into().unwrap());
        let l1 = u64::from_be_bytes(raw[8..].try_into().unwrap());

        Self {
            startoff: (l0 >> 9) & MASK54,
            startblock: ((l0 & 0x1ff) << 43) | (l1 >> 21),
            blockcount: l1 & MASK21,
            unwritten: l0 >> 63 != 0,
        }
    }

    /// Packs into the 128-bit on-disk form.
    pub fn pack(&self) -> [u8; 16] {
        let l0 = (u64::from(self.unwritten) << 63)
            | ((self.startoff & MASK54) << 9)
            | (self.startblock >> 43);
        let l1 = ((self.startblock & MASK43) << 21) | (self.blockcount & MASK21);

        let mut raw = [0u8; 16];
        raw[..8].copy_from_slice(&l0.to_be_bytes());
        raw[8..].copy_from_slice(&l1.to_be_bytes());
        raw
    }

    /// Tells whether the record covers file block `blk`.
    pub fn contains(&self, blk: u64) -> bool {
        self.startoff <= blk && blk < self.startoff + self.blockcount
    }

    /// Tells whether the record is a hole.
    pub fn is_hole(&self) -> bool {
        self.startblock == HOLESTARTBLOCK
    }
}

/// Header of a long-format (absolute pointer) B-tree block.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct BtLBlockHdr {
    bb_magic: u32,
    bb_level: u16,
    bb_numrecs: u16,
    bb_leftsib: u64,
    bb_rightsib: u64,
}

/// Finds the extent covering file block `blk` in a list ordered by
/// `startoff`.
pub fn lookup_extent(extents: &[ExtentRec], blk: u64) -> Option<ExtentRec> {
    let idx = extents
        .binary_search_by(|ext| {
            if ext.contains(blk) {
                core::cmp::Ordering::Equal
            } else if ext.startoff > blk {
                core::cmp::Ordering::Greater
            } else {
                core::cmp::Ordering::Less
            }
        })
        .ok()?;
    extents.get(idx).copied()
}

/// Walks one level of a B-tree fork, collecting leaf records in order and
/// recording every visited tree block.
fn walk_btree_block(
    fs: &XfsFs,
    fsbno: u64,
    extents: &mut Vec<ExtentRec>,
    tree_blocks: &mut Vec<u64>,
) -> IOResult<()> {
    let sb = fs.sb();
    let buf = fs.read_fsb(fsbno, 1)?;
    let buf = buf.read();
    let block = buf.data();

    tree_blocks.push(fsbno);
    let hdr: BtLBlockHdr = *bytemuck::from_bytes(&block[..core::mem::size_of::<BtLBlockHdr>()]);
    let expected = if sb.has_crc() {
        XFS_BMAP_CRC_MAGIC
    } else {
        XFS_BMAP_MAGIC
    };
    if u32::from_be(hdr.bb_magic) != expected {
        log::error!("bad bmap btree magic {:#x} in block {fsbno:#x}", u32::from_be(hdr.bb_magic));
        return Err(XfsError::Io);
    }
    if sb.has_crc() && !cksum::verify_cksum(block, BTREE_LBLOCK_CRC_OFF) {
        log::error!("bmap btree block {fsbno:#x} failed its CRC check");
        return Err(XfsError::Io);
    }

    let hdr_len = if sb.has_crc() {
        BTREE_LBLOCK_CRC_LEN
    } else {
        BTREE_LBLOCK_LEN
    };
    let level = u16::from_be(hdr.bb_level);
    let numrecs = usize::from(u16::from_be(hdr.bb_numrecs));

    if level == 0 {
        for i in 0..numrecs {
            let off = hdr_len + i * ExtentRec::DISK_SIZE;
            extents.push(ExtentRec::unpack(
                block[off..off + ExtentRec::DISK_SIZE].try_into().unwrap(),
            ));
        }
        return Ok(());
    }

    // Interior node: keys then pointers, each array sized to the block's
    // maximum record capacity.
    let maxrecs = (block.len() - hdr_len) / 16;
    let ptrs_base = hdr_len + maxrecs * 8;
    let mut children = Vec::with_capacity(numrecs);
    for i in 0..numrecs {
        let off = ptrs_base + i * 8;
        children.push(u64::from_be_bytes(block[off..off + 8].try_into().unwrap()));
    }
    drop(buf);

    for child in children {
        walk_btree_block(fs, child, extents, tree_blocks)?;
    }
    Ok(())
}

/// Enumerates the extents of an inode's data fork, ordered by file offset.
///
/// The fork must be in the `Extents` or `Btree` shape.
pub fn fork_extents(fs: &XfsFs, inode: &Inode) -> IOResult<Vec<ExtentRec>> {
    Ok(fork_extents_and_blocks(fs, inode)?.0)
}

/// Like [`fork_extents`], additionally returning the B-tree's own block
/// numbers (empty for an inline extent list).
pub fn fork_extents_and_blocks(fs: &XfsFs, inode: &Inode) -> IOResult<(Vec<ExtentRec>, Vec<u64>)> {
    match &inode.fork {
        DataFork::Extents(list) => Ok((list.clone(), Vec::new())),
        DataFork::Btree(root) => {
            // In-inode root: 4-byte header, then keys and pointers split at
            // the root's capacity.
            if root.len() < 4 {
                return Err(XfsError::Io);
            }
            let level = u16::from_be_bytes(root[..2].try_into().unwrap());
            let numrecs = usize::from(u16::from_be_bytes(root[2..4].try_into().unwrap()));
            if level == 0 || numrecs == 0 {
                log::error!("inode {:#x} has a degenerate btree root", inode.ino);
                return Err(XfsError::Io);
            }
            let maxrecs = (root.len() - 4) / 16;
            if numrecs > maxrecs {
                log::error!("inode {:#x} btree root overflows its fork", inode.ino);
                return Err(XfsError::Io);
            }
            let ptrs_base = 4 + maxrecs * 8;

            let mut extents = Vec::new();
            let mut tree_blocks = Vec::new();
            for i in 0..numrecs {
                let off = ptrs_base + i * 8;
                let child = u64::from_be_bytes(root[off..off + 8].try_into().unwrap());
                walk_btree_block(fs, child, &mut extents, &mut tree_blocks)?;
            }
            extents.sort_unstable_by_key(|ext| ext.startoff);
            Ok((extents, tree_blocks))
        }
        _ => Err(XfsError::Invalid),
    }
}

/// Converts a B-tree fork back to the inline extents shape before a
/// mutation, freeing the tree's own blocks (deferred to `bmap_finish`).
///
/// Fails with `NoSpace` when the extent list no longer fits the inode
/// literal area; such forks stay read-only here.
pub fn to_extents_fork(
    fs: &XfsFs,
    tp: &mut crate::fs::xfs::trans::Transaction,
    ip: &InodeRef,
) -> crate::errors::CanFail<XfsError> {
    let (extents, tree_blocks) = {
        let inode = ip.read();
        if !matches!(inode.fork, DataFork::Btree(_)) {
            return Ok(());
        }
        fork_extents_and_blocks(fs, &inode)?
    };

    let sb = fs.sb();
    {
        let mut inode = ip.write();
        if extents.len() * ExtentRec::DISK_SIZE > inode.dfork_size(sb) {
            log::warn!(
                "inode {:#x} carries {} extents, too many to mutate inline",
                inode.ino,
                extents.len()
            );
            return Err(XfsError::NoSpace);
        }
        inode.nblocks -= tree_blocks.len() as u64;
        inode.fork = DataFork::Extents(extents);
    }
    for blk in tree_blocks {
        tp.defer_free(blk, 1);
    }
    tp.log_inode(ip);
    Ok(())
}

/// Reads `buf.len()` bytes at byte offset `offset` from the blocks mapped
/// by `extents`, zero-filling holes and unwritten ranges. The caller clamps
/// the range against the file size.
pub fn read_extents(fs: &XfsFs, extents: &[ExtentRec], offset: u64, buf: &mut [u8]) -> IOResult<()> {
    let sb = fs.sb();
    let blocksize = u64::from(sb.blocksize);
    buf.fill(0);
    let end = offset + buf.len() as u64;

    for ext in extents {
        let ext_start = ext.startoff * blocksize;
        let ext_end = ext_start + ext.blockcount * blocksize;
        if ext_end <= offset || ext_start >= end {
            continue;
        }
        if ext.unwritten || ext.is_hole() {
            continue;
        }

        // Clip the extent to the requested range, then copy block by block
        // through the buffer cache.
        let copy_start = ext_start.max(offset);
        let copy_end = ext_end.min(end);
        let mut pos = copy_start;
        while pos < copy_end {
            let blk_index = (pos - ext_start) / blocksize;
            let blk_off = (pos - ext_start) % blocksize;
            let chunk = (blocksize - blk_off).min(copy_end - pos) as usize;

            let fsbno = ext.startblock + blk_index;
            let blk = fs.read_fsb(fsbno, 1)?;
            let blk = blk.read();
            let dst = (pos - offset) as usize;
            buf[dst..dst + chunk]
                .copy_from_slice(&blk.data()[blk_off as usize..blk_off as usize + chunk]);
            pos += chunk as u64;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pack_unpack_roundtrip() {
        let recs = [
            ExtentRec {
                startoff: 0,
                startblock: 12,
                blockcount: 1,
                unwritten: false,
            },
            ExtentRec {
                startoff: (1 << 54) - 1,
                startblock: (1 << 52) - 1,
                blockcount: (1 << 21) - 1,
                unwritten: true,
            },
            ExtentRec {
                startoff: 0x1234_5678,
                startblock: 0x9_8765_4321,
                blockcount: 42,
                unwritten: false,
            },
        ];
        for rec in recs {
            assert_eq!(ExtentRec::unpack(rec.pack()), rec);
        }
    }

    #[test]
    fn pack_known_bytes() {
        // startoff 1, startblock 2, blockcount 3, written:
        // l0 = 1 << 9 = 0x200, l1 = (2 << 21) | 3.
        let rec = ExtentRec {
            startoff: 1,
            startblock: 2,
            blockcount: 3,
            unwritten: false,
        };
        let raw = rec.pack();
        assert_eq!(u64::from_be_bytes(raw[..8].try_into().unwrap()), 0x200);
        assert_eq!(
            u64::from_be_bytes(raw[8..].try_into().unwrap()),
            (2 << 21) | 3
        );
    }

    #[test]
    fn lookup_by_offset() {
        let extents = vec![
            ExtentRec {
                startoff: 0,
                startblock: 100,
                blockcount: 4,
                unwritten: false,
            },
            ExtentRec {
                startoff: 8,
                startblock: 200,
                blockcount: 2,
                unwritten: false,
            },
        ];

        assert_eq!(lookup_extent(&extents, 2).unwrap().startblock, 100);
        assert_eq!(lookup_extent(&extents, 9).unwrap().startblock, 200);
        // File blocks 4..8 are a hole.
        assert!(lookup_extent(&extents, 5).is_none());
        assert!(lookup_extent(&extents, 10).is_none());
    }
}
