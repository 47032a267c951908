//! Test-only mkfs: formats a minimal XFS image in memory.
//!
//! The image is one 128-block allocation group with 4 KiB blocks, 512-byte
//! inodes, an internal log region and a single inode chunk holding the
//! root directory (and optionally one regular file). Both the V4 and V5
//! (CRC, FTYPE, bigtime) flavors can be produced, so mount, readdir and
//! mutation round-trips run without external fixtures.

use bytemuck::Zeroable;

use crate::fs::xfs::ag::{
    AllocRec, BtBlockHdr, DiskAgf, DiskAgi, InobtRec, AGF_BTREE_BNO, AGF_BTREE_CNT, NULLAGBLOCK,
    XFS_ABTB_CRC_MAGIC, XFS_ABTB_MAGIC, XFS_ABTC_CRC_MAGIC, XFS_ABTC_MAGIC, XFS_AGF_CRC_OFF,
    XFS_AGF_MAGIC, XFS_AGI_CRC_OFF, XFS_AGI_MAGIC, XFS_IBT_CRC_MAGIC, XFS_IBT_MAGIC,
};
use crate::fs::xfs::cksum;
use crate::fs::xfs::dir::SfDir;
use crate::fs::xfs::inode::{
    DataFork, Inode, Timestamp, DIFLAG2_BIGTIME, NULLAGINO, S_IFDIR, S_IFREG, XFS_DINODE_MAGIC,
};
use crate::fs::xfs::sb::{DiskSb, Superblock, XFS_SB_CRC_OFF, XFS_SB_MAGIC, XFS_SB_SIZE};
use crate::fs::xfs::extent::ExtentRec;
use crate::fs::xfs::XfsFs;
use crate::io::device::BlockDevice;

const BLOCKSIZE: usize = 4096;
const AGBLOCKS: u64 = 128;
const INODESIZE: usize = 512;
const ROOT_INO: u64 = 64;
const FILE_INO: u64 = 65;
/// First block of the inode chunk.
const ICHUNK_BLK: u64 = 8;
/// Block holding the optional file's data.
const FILE_BLK: u64 = 16;
/// First block of the internal log.
const LOG_START: u64 = 112;

/// Builder for the in-memory image.
pub(crate) struct TestImage {
    v5: bool,
    file: Option<(&'static str, &'static [u8])>,
}

impl Default for TestImage {
    /// The default image carries one regular file in the root directory.
    fn default() -> Self {
        Self::new().with_file("hello.txt", b"Hello XFS\n")
    }
}

impl TestImage {
    pub fn new() -> Self {
        Self {
            v5: false,
            file: None,
        }
    }

    pub fn v5(mut self, v5: bool) -> Self {
        self.v5 = v5;
        self
    }

    pub fn with_file(mut self, name: &'static str, content: &'static [u8]) -> Self {
        self.file = Some((name, content));
        self
    }

    pub fn empty(mut self) -> Self {
        self.file = None;
        self
    }

    pub fn mount_ro(self) -> XfsFs {
        XfsFs::mount(BlockDevice::from_image(self.build(), true), true).unwrap()
    }

    pub fn mount_rw(self) -> XfsFs {
        XfsFs::mount(BlockDevice::from_image(self.build(), false), false).unwrap()
    }

    /// Lays the whole filesystem out.
    pub fn build(&self) -> Vec<u8> {
        let mut img = vec![0u8; AGBLOCKS as usize * BLOCKSIZE];
        let file_blocks = u64::from(self.file.is_some());
        let used_inodes = 1 + file_blocks; // root + optional file

        // Free space: blocks 4..8 (between the AG btree roots and the
        // inode chunk) and past the chunk up to the log, minus the file
        // data block.
        let mut free: Vec<AllocRec> = vec![AllocRec::new(4, 4)];
        if self.file.is_some() {
            free.push(AllocRec::new(
                (FILE_BLK + 1) as u32,
                (LOG_START - FILE_BLK - 1) as u32,
            ));
        } else {
            free.push(AllocRec::new(FILE_BLK as u32, (LOG_START - FILE_BLK) as u32));
        }
        let fdblocks: u64 = free.iter().map(|r| u64::from(r.blockcount())).sum();

        self.write_sb(&mut img, fdblocks, used_inodes);
        let sb = Superblock::parse(&img[..512]).unwrap();

        self.write_agf(&mut img, &sb, fdblocks);
        self.write_agi(&mut img, &sb, used_inodes);
        self.write_freespace(&mut img, &sb, &free);
        self.write_inobt(&mut img, &sb, used_inodes);
        self.write_inodes(&mut img, &sb);
        if let Some((_, content)) = self.file {
            let off = FILE_BLK as usize * BLOCKSIZE;
            img[off..off + content.len()].copy_from_slice(content);
        }
        img
    }

    fn write_sb(&self, img: &mut [u8], fdblocks: u64, used_inodes: u64) {
        let mut raw = DiskSb::zeroed();
        raw.sb_magicnum = XFS_SB_MAGIC.to_be();
        raw.sb_blocksize = (BLOCKSIZE as u32).to_be();
        raw.sb_dblocks = AGBLOCKS.to_be();
        raw.sb_uuid = *b"fzxfs-test-uuid!";
        raw.sb_logstart = LOG_START.to_be();
        raw.sb_rootino = ROOT_INO.to_be();
        raw.sb_agblocks = (AGBLOCKS as u32).to_be();
        raw.sb_agcount = 1u32.to_be();
        raw.sb_logblocks = 16u32.to_be();
        raw.sb_versionnum = if self.v5 {
            5u16.to_be()
        } else {
            (4u16 | 0x8000).to_be()
        };
        raw.sb_sectsize = 512u16.to_be();
        raw.sb_inodesize = (INODESIZE as u16).to_be();
        raw.sb_inopblock = ((BLOCKSIZE / INODESIZE) as u16).to_be();
        raw.sb_fname[..4].copy_from_slice(b"test");
        raw.sb_blocklog = 12;
        raw.sb_sectlog = 9;
        raw.sb_inodelog = 9;
        raw.sb_inopblog = 3;
        raw.sb_agblklog = 7;
        raw.sb_inprogress = 0;
        raw.sb_imax_pct = 100;
        raw.sb_icount = 64u64.to_be();
        raw.sb_ifree = (64 - used_inodes).to_be();
        raw.sb_fdblocks = fdblocks.to_be();
        raw.sb_inoalignmt = 2u32.to_be();
        if self.v5 {
            // FTYPE and bigtime.
            raw.sb_features_incompat = (0x1u32 | 0x8).to_be();
        } else {
            raw.sb_features2 = 0x200u32.to_be();
        }

        img[..XFS_SB_SIZE].copy_from_slice(bytemuck::bytes_of(&raw));
        if self.v5 {
            cksum::update_cksum(&mut img[..512], XFS_SB_CRC_OFF);
        }
    }

    fn write_agf(&self, img: &mut [u8], sb: &Superblock, fdblocks: u64) {
        let mut agf = DiskAgf::zeroed();
        agf.agf_magicnum = XFS_AGF_MAGIC.to_be();
        agf.agf_versionnum = 1u32.to_be();
        agf.agf_seqno = 0;
        agf.agf_length = (AGBLOCKS as u32).to_be();
        agf.agf_roots[AGF_BTREE_BNO] = 1u32.to_be();
        agf.agf_roots[AGF_BTREE_CNT] = 2u32.to_be();
        agf.agf_levels[AGF_BTREE_BNO] = 1u32.to_be();
        agf.agf_levels[AGF_BTREE_CNT] = 1u32.to_be();
        agf.agf_freeblks = (fdblocks as u32).to_be();
        agf.agf_longest = ((LOG_START - FILE_BLK - u64::from(self.file.is_some()) as u64) as u32).to_be();
        agf.agf_uuid = sb.uuid;

        let sector = &mut img[512..1024];
        sector[..core::mem::size_of::<DiskAgf>()].copy_from_slice(bytemuck::bytes_of(&agf));
        if self.v5 {
            cksum::update_cksum(sector, XFS_AGF_CRC_OFF);
        }
    }

    fn write_agi(&self, img: &mut [u8], sb: &Superblock, used_inodes: u64) {
        let mut agi = DiskAgi::zeroed();
        agi.agi_magicnum = XFS_AGI_MAGIC.to_be();
        agi.agi_versionnum = 1u32.to_be();
        agi.agi_seqno = 0;
        agi.agi_length = (AGBLOCKS as u32).to_be();
        agi.agi_count = 64u32.to_be();
        agi.agi_root = 3u32.to_be();
        agi.agi_level = 1u32.to_be();
        agi.agi_freecount = ((64 - used_inodes) as u32).to_be();
        agi.agi_newino = ((ICHUNK_BLK as u32) << 3).to_be();
        agi.agi_dirino = NULLAGINO.to_be();
        agi.agi_unlinked = [NULLAGINO.to_be(); 64];
        agi.agi_uuid = sb.uuid;

        let sector = &mut img[1024..1536];
        sector[..core::mem::size_of::<DiskAgi>()].copy_from_slice(bytemuck::bytes_of(&agi));
        if self.v5 {
            cksum::update_cksum(sector, XFS_AGI_CRC_OFF);
        }
    }

    /// Writes a single-leaf short-form btree block.
    fn write_btree_leaf<T: bytemuck::Pod>(
        &self,
        img: &mut [u8],
        sb: &Superblock,
        agbno: u64,
        magic_v4: u32,
        magic_v5: u32,
        recs: &[T],
    ) {
        let off = agbno as usize * BLOCKSIZE;
        let block = &mut img[off..off + BLOCKSIZE];

        let mut hdr = BtBlockHdr::zeroed();
        hdr.bb_magic = if self.v5 { magic_v5 } else { magic_v4 }.to_be();
        hdr.bb_level = 0;
        hdr.bb_numrecs = (recs.len() as u16).to_be();
        hdr.bb_leftsib = NULLAGBLOCK.to_be();
        hdr.bb_rightsib = NULLAGBLOCK.to_be();
        block[..core::mem::size_of::<BtBlockHdr>()].copy_from_slice(bytemuck::bytes_of(&hdr));

        let mut pos = crate::fs::xfs::ag::btree_sblock_hdr_len(sb);
        if self.v5 {
            // Self-describing fields: block number, UUID, owner.
            let daddr = (agbno as u64) << (12 - 9);
            block[16..24].copy_from_slice(&daddr.to_be_bytes());
            block[32..48].copy_from_slice(&sb.uuid);
            block[48..52].copy_from_slice(&0u32.to_be_bytes());
        }
        for rec in recs {
            let size = core::mem::size_of::<T>();
            block[pos..pos + size].copy_from_slice(bytemuck::bytes_of(rec));
            pos += size;
        }
        if self.v5 {
            cksum::update_cksum(block, crate::fs::xfs::ag::BTREE_SBLOCK_CRC_OFF);
        }
    }

    fn write_freespace(&self, img: &mut [u8], sb: &Superblock, free: &[AllocRec]) {
        self.write_btree_leaf(img, sb, 1, XFS_ABTB_MAGIC, XFS_ABTB_CRC_MAGIC, free);
        let mut by_size = free.to_vec();
        by_size.sort_by_key(|r| (r.blockcount(), r.startblock()));
        self.write_btree_leaf(img, sb, 2, XFS_ABTC_MAGIC, XFS_ABTC_CRC_MAGIC, &by_size);
    }

    fn write_inobt(&self, img: &mut [u8], sb: &Superblock, used_inodes: u64) {
        let mut mask = u64::MAX;
        mask &= !1; // root
        if self.file.is_some() {
            mask &= !2;
        }
        let rec = InobtRec::new((ICHUNK_BLK as u32) << 3, (64 - used_inodes) as u32, mask);
        self.write_btree_leaf(img, sb, 3, XFS_IBT_MAGIC, XFS_IBT_CRC_MAGIC, &[rec]);
    }

    fn write_inodes(&self, img: &mut [u8], sb: &Superblock) {
        // Empty cores over the whole chunk first.
        let version = if self.v5 { 3u8 } else { 2u8 };
        for slot_idx in 0..64u64 {
            let off = ICHUNK_BLK as usize * BLOCKSIZE + slot_idx as usize * INODESIZE;
            let slot = &mut img[off..off + INODESIZE];
            slot[..2].copy_from_slice(&XFS_DINODE_MAGIC.to_be_bytes());
            slot[4] = version;
            slot[96..100].copy_from_slice(&NULLAGINO.to_be_bytes());
            if self.v5 {
                let ino = ROOT_INO + slot_idx;
                slot[152..160].copy_from_slice(&ino.to_be_bytes());
                slot[160..176].copy_from_slice(&sb.uuid);
                cksum::update_cksum(slot, crate::fs::xfs::inode::DINODE_CRC_OFF);
            }
        }

        let now = Timestamp {
            sec: 1_700_000_000,
            nsec: 0,
        };
        let flags2 = if self.v5 { DIFLAG2_BIGTIME } else { 0 };

        // Root directory, short form.
        let mut ents = Vec::new();
        if let Some((name, _)) = self.file {
            ents.push(crate::fs::xfs::dir::SfEntry {
                offset: sf_first_offset(sb) as u16,
                name: name.as_bytes().to_vec(),
                ino: FILE_INO,
                ftype: crate::fs::xfs::inode::FileType::Regular.to_dir_ftype(),
            });
        }
        let sf = SfDir {
            parent: ROOT_INO,
            ents,
        };
        let sf_data = sf.encode(sb);
        let root = Inode {
            ino: ROOT_INO,
            version,
            mode: S_IFDIR | 0o755,
            uid: 0,
            gid: 0,
            nlink: 2,
            projid: 0,
            flushiter: 0,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            size: sf_data.len() as u64,
            nblocks: 0,
            extsize: 0,
            forkoff: 0,
            aformat: 2,
            flags: 0,
            flags2,
            gen: 1,
            next_unlinked: NULLAGINO,
            changecount: 0,
            fork: DataFork::Local(sf_data),
            attr_raw: Vec::new(),
            anextents: 0,
            btree_nextents: 0,
        };
        encode_slot(img, sb, &root);

        if let Some((_, content)) = self.file {
            let file = Inode {
                ino: FILE_INO,
                version,
                mode: S_IFREG | 0o644,
                uid: 0,
                gid: 0,
                nlink: 1,
                projid: 0,
                flushiter: 0,
                atime: now,
                mtime: now,
                ctime: now,
                crtime: now,
                size: content.len() as u64,
                nblocks: 1,
                extsize: 0,
                forkoff: 0,
                aformat: 2,
                flags: 0,
                flags2,
                gen: 1,
                next_unlinked: NULLAGINO,
                changecount: 0,
                fork: DataFork::Extents(vec![ExtentRec {
                    startoff: 0,
                    startblock: FILE_BLK,
                    blockcount: 1,
                    unwritten: false,
                }]),
                attr_raw: Vec::new(),
                anextents: 0,
                btree_nextents: 0,
            };
            encode_slot(img, sb, &file);
        }
    }
}

/// Offset of the first real short-form entry in a would-be data block.
fn sf_first_offset(sb: &Superblock) -> usize {
    let hdr = if sb.has_crc() { 64 } else { 16 };
    hdr + crate::fs::xfs::dir::entsize(sb, 1) + crate::fs::xfs::dir::entsize(sb, 2)
}

fn encode_slot(img: &mut [u8], sb: &Superblock, inode: &Inode) {
    let (_, agbno, off) = sb.ino_split(inode.ino);
    let pos = agbno as usize * BLOCKSIZE + off as usize * INODESIZE;
    inode.encode(sb, &mut img[pos..pos + INODESIZE]);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn image_mounts_both_flavors() {
        TestImage::default().mount_ro();
        TestImage::new().v5(true).with_file("a", b"x").mount_ro();
        TestImage::new().empty().mount_rw();
    }
}
