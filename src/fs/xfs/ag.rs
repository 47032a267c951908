//! Allocation group headers and their B-trees.
//!
//! Each allocation group (AG) starts with four sectors: a copy of the
//! superblock, the free-space header (AGF), the inode header (AGI) and the
//! free-list (AGFL). The AGF anchors two free-space B-trees (indexed by
//! start block and by extent size), the AGI anchors the inode B-tree. The
//! AG is the locality unit for every allocation decision.
//!
//! Raw structs below mirror the on-disk layout; all integer fields are
//! big-endian and are converted at the accessor layer.

use bytemuck::{Pod, Zeroable};

use crate::errors::{IOResult, XfsError};
use crate::fs::xfs::cksum;
use crate::fs::xfs::sb::Superblock;
use crate::io::BB_SHIFT;

/// AGF magic (`XAGF`).
pub const XFS_AGF_MAGIC: u32 = 0x58414746;
/// AGI magic (`XAGI`).
pub const XFS_AGI_MAGIC: u32 = 0x58414749;

/// Byte offset of the AGF CRC slot.
pub const XFS_AGF_CRC_OFF: usize = 216;
/// Byte offset of the AGI CRC slot.
pub const XFS_AGI_CRC_OFF: usize = 312;

/// Free-space B-tree keyed by start block, V4 magic (`ABTB`).
pub const XFS_ABTB_MAGIC: u32 = 0x41425442;
/// Free-space B-tree keyed by start block, V5 magic (`AB3B`).
pub const XFS_ABTB_CRC_MAGIC: u32 = 0x41423342;
/// Free-space B-tree keyed by extent size, V4 magic (`ABTC`).
pub const XFS_ABTC_MAGIC: u32 = 0x41425443;
/// Free-space B-tree keyed by extent size, V5 magic (`AB3C`).
pub const XFS_ABTC_CRC_MAGIC: u32 = 0x41423343;
/// Inode B-tree, V4 magic (`IABT`).
pub const XFS_IBT_MAGIC: u32 = 0x49414254;
/// Inode B-tree, V5 magic (`IAB3`).
pub const XFS_IBT_CRC_MAGIC: u32 = 0x49414233;

/// Number of slots in the AGI unlinked-inode hash table.
pub const XFS_AGI_UNLINKED_BUCKETS: usize = 64;

/// On-disk AG free-space header.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct DiskAgf {
    pub agf_magicnum: u32,
    pub agf_versionnum: u32,
    pub agf_seqno: u32,
    pub agf_length: u32,
    /// Root blocks of the by-block, by-size and rmap B-trees.
    pub agf_roots: [u32; 3],
    /// Heights of the same three trees.
    pub agf_levels: [u32; 3],
    pub agf_flfirst: u32,
    pub agf_fllast: u32,
    pub agf_flcount: u32,
    pub agf_freeblks: u32,
    pub agf_longest: u32,
    pub agf_btreeblks: u32,
    pub agf_uuid: [u8; 16],
    pub agf_rmap_blocks: u32,
    pub agf_refcount_blocks: u32,
    pub agf_refcount_root: u32,
    pub agf_refcount_level: u32,
    pub agf_spare64: [u64; 14],
    pub agf_lsn: u64,
    pub agf_crc: u32,
    pub agf_spare2: u32,
}

/// Index of the by-block tree in `agf_roots`/`agf_levels`.
pub const AGF_BTREE_BNO: usize = 0;
/// Index of the by-size tree in `agf_roots`/`agf_levels`.
pub const AGF_BTREE_CNT: usize = 1;

impl DiskAgf {
    pub fn seqno(&self) -> u32 {
        u32::from_be(self.agf_seqno)
    }

    pub fn length(&self) -> u32 {
        u32::from_be(self.agf_length)
    }

    pub fn root(&self, which: usize) -> u32 {
        u32::from_be(self.agf_roots[which])
    }

    pub fn level(&self, which: usize) -> u32 {
        u32::from_be(self.agf_levels[which])
    }

    pub fn freeblks(&self) -> u32 {
        u32::from_be(self.agf_freeblks)
    }

    pub fn set_freeblks(&mut self, v: u32) {
        self.agf_freeblks = v.to_be();
    }

    pub fn longest(&self) -> u32 {
        u32::from_be(self.agf_longest)
    }

    pub fn set_longest(&mut self, v: u32) {
        self.agf_longest = v.to_be();
    }

    /// Validates magic, version and sequence number against the AG this
    /// header was read for.
    pub fn validate(&self, sb: &Superblock, agno: u32) -> IOResult<()> {
        if u32::from_be(self.agf_magicnum) != XFS_AGF_MAGIC
            || u32::from_be(self.agf_versionnum) != 1
            || self.seqno() != agno
            || self.length() > sb.agblocks
        {
            log::error!("corrupt AGF header in AG {agno}");
            return Err(XfsError::Io);
        }
        Ok(())
    }
}

/// On-disk AG inode header.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct DiskAgi {
    pub agi_magicnum: u32,
    pub agi_versionnum: u32,
    pub agi_seqno: u32,
    pub agi_length: u32,
    pub agi_count: u32,
    pub agi_root: u32,
    pub agi_level: u32,
    pub agi_freecount: u32,
    pub agi_newino: u32,
    pub agi_dirino: u32,
    /// Heads of the unlinked-inode lists, hashed by inode number.
    pub agi_unlinked: [u32; XFS_AGI_UNLINKED_BUCKETS],
    pub agi_uuid: [u8; 16],
    pub agi_crc: u32,
    pub agi_pad32: u32,
    pub agi_lsn: u64,
    pub agi_free_root: u32,
    pub agi_free_level: u32,
    pub agi_iblocks: u32,
    pub agi_fblocks: u32,
}

impl DiskAgi {
    pub fn seqno(&self) -> u32 {
        u32::from_be(self.agi_seqno)
    }

    pub fn count(&self) -> u32 {
        u32::from_be(self.agi_count)
    }

    pub fn set_count(&mut self, v: u32) {
        self.agi_count = v.to_be();
    }

    pub fn root(&self) -> u32 {
        u32::from_be(self.agi_root)
    }

    pub fn level(&self) -> u32 {
        u32::from_be(self.agi_level)
    }

    pub fn freecount(&self) -> u32 {
        u32::from_be(self.agi_freecount)
    }

    pub fn set_freecount(&mut self, v: u32) {
        self.agi_freecount = v.to_be();
    }

    pub fn set_newino(&mut self, agino: u32) {
        self.agi_newino = agino.to_be();
    }

    pub fn validate(&self, sb: &Superblock, agno: u32) -> IOResult<()> {
        if u32::from_be(self.agi_magicnum) != XFS_AGI_MAGIC
            || u32::from_be(self.agi_versionnum) != 1
            || self.seqno() != agno
            || u32::from_be(self.agi_length) > sb.agblocks
        {
            log::error!("corrupt AGI header in AG {agno}");
            return Err(XfsError::Io);
        }
        Ok(())
    }
}

/// Disk address of the first sector of an AG.
pub fn ag_daddr(sb: &Superblock, agno: u32) -> u64 {
    (u64::from(agno) * u64::from(sb.agblocks)) << (sb.blocklog - BB_SHIFT as u8)
}

/// Basic blocks per sector.
fn sect_bb(sb: &Superblock) -> u64 {
    u64::from(sb.sectsize) >> BB_SHIFT
}

/// Disk address of the AGF sector of an AG.
pub fn agf_daddr(sb: &Superblock, agno: u32) -> u64 {
    ag_daddr(sb, agno) + sect_bb(sb)
}

/// Disk address of the AGI sector of an AG.
pub fn agi_daddr(sb: &Superblock, agno: u32) -> u64 {
    ag_daddr(sb, agno) + 2 * sect_bb(sb)
}

/// Sector length of an AG header, in basic blocks.
pub fn hdr_bblen(sb: &Superblock) -> u32 {
    (u32::from(sb.sectsize)) >> BB_SHIFT
}

/// Header of a short-form (AG-relative pointer) B-tree block.
///
/// V4 blocks carry only this header; V5 blocks extend it with block number,
/// LSN, UUID, owner and CRC.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct BtBlockHdr {
    pub bb_magic: u32,
    pub bb_level: u16,
    pub bb_numrecs: u16,
    pub bb_leftsib: u32,
    pub bb_rightsib: u32,
}

/// Size of the V4 short-form B-tree block header.
pub const BTREE_SBLOCK_LEN: usize = 16;
/// Size of the V5 short-form B-tree block header.
pub const BTREE_SBLOCK_CRC_LEN: usize = 56;
/// Byte offset of the CRC slot of a V5 short-form B-tree block.
pub const BTREE_SBLOCK_CRC_OFF: usize = 52;

/// Sibling pointer value meaning "none".
pub const NULLAGBLOCK: u32 = u32::MAX;

impl BtBlockHdr {
    pub fn magic(&self) -> u32 {
        u32::from_be(self.bb_magic)
    }

    pub fn level(&self) -> u16 {
        u16::from_be(self.bb_level)
    }

    pub fn numrecs(&self) -> u16 {
        u16::from_be(self.bb_numrecs)
    }

    pub fn set_numrecs(&mut self, v: u16) {
        self.bb_numrecs = v.to_be();
    }

    pub fn rightsib(&self) -> u32 {
        u32::from_be(self.bb_rightsib)
    }
}

/// Byte offset of the first record in a short-form B-tree block.
pub fn btree_sblock_hdr_len(sb: &Superblock) -> usize {
    if sb.has_crc() {
        BTREE_SBLOCK_CRC_LEN
    } else {
        BTREE_SBLOCK_LEN
    }
}

/// Checks the header of a short-form B-tree block: magic (V4 or V5 variant)
/// and, on V5, the block CRC.
pub fn check_btree_sblock(
    sb: &Superblock,
    block: &[u8],
    magic_v4: u32,
    magic_v5: u32,
) -> IOResult<BtBlockHdr> {
    let hdr: BtBlockHdr = *bytemuck::from_bytes(&block[..core::mem::size_of::<BtBlockHdr>()]);
    let expected = if sb.has_crc() { magic_v5 } else { magic_v4 };
    if hdr.magic() != expected {
        log::error!(
            "bad btree block magic {:#x}, expected {expected:#x}",
            hdr.magic()
        );
        return Err(XfsError::Io);
    }
    if sb.has_crc() && !cksum::verify_cksum(block, BTREE_SBLOCK_CRC_OFF) {
        log::error!("btree block checksum mismatch");
        return Err(XfsError::Io);
    }
    Ok(hdr)
}

/// A record of either free-space B-tree: a free extent of `blockcount`
/// blocks starting at AG-relative block `startblock`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct AllocRec {
    pub ar_startblock: u32,
    pub ar_blockcount: u32,
}

impl AllocRec {
    pub fn new(startblock: u32, blockcount: u32) -> Self {
        Self {
            ar_startblock: startblock.to_be(),
            ar_blockcount: blockcount.to_be(),
        }
    }

    pub fn startblock(&self) -> u32 {
        u32::from_be(self.ar_startblock)
    }

    pub fn blockcount(&self) -> u32 {
        u32::from_be(self.ar_blockcount)
    }
}

/// A record of the inode B-tree: one chunk of 64 inodes with its free-slot
/// bitmap (bit set = slot free).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct InobtRec {
    pub ir_startino: u32,
    pub ir_freecount: u32,
    pub ir_free: u64,
}

impl InobtRec {
    pub fn new(startino: u32, freecount: u32, free: u64) -> Self {
        Self {
            ir_startino: startino.to_be(),
            ir_freecount: freecount.to_be(),
            ir_free: free.to_be(),
        }
    }

    pub fn startino(&self) -> u32 {
        u32::from_be(self.ir_startino)
    }

    pub fn freecount(&self) -> u32 {
        u32::from_be(self.ir_freecount)
    }

    pub fn set_freecount(&mut self, v: u32) {
        self.ir_freecount = v.to_be();
    }

    pub fn free_mask(&self) -> u64 {
        u64::from_be(self.ir_free)
    }

    pub fn set_free_mask(&mut self, v: u64) {
        self.ir_free = v.to_be();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn struct_sizes() {
        assert_eq!(core::mem::size_of::<AllocRec>(), 8);
        assert_eq!(core::mem::size_of::<InobtRec>(), 16);
        assert_eq!(core::mem::size_of::<BtBlockHdr>(), BTREE_SBLOCK_LEN);
        // Fixed on-disk offsets of the CRC slots.
        assert_eq!(core::mem::offset_of!(DiskAgf, agf_crc), XFS_AGF_CRC_OFF);
        assert_eq!(core::mem::offset_of!(DiskAgi, agi_crc), XFS_AGI_CRC_OFF);
    }

    #[test]
    fn alloc_rec_endianness() {
        let rec = AllocRec::new(0x1234, 8);
        assert_eq!(rec.startblock(), 0x1234);
        assert_eq!(rec.blockcount(), 8);
        let bytes = bytemuck::bytes_of(&rec);
        assert_eq!(bytes, &[0, 0, 0x12, 0x34, 0, 0, 0, 8]);
    }

    #[test]
    fn inobt_rec_mask() {
        let mut rec = InobtRec::new(64, 64, u64::MAX);
        assert_eq!(rec.freecount(), 64);
        rec.set_free_mask(rec.free_mask() & !1);
        rec.set_freecount(63);
        assert_eq!(rec.free_mask() & 1, 0);
        assert_eq!(rec.freecount(), 63);
    }
}
