//! Superblock parsing and filesystem geometry.
//!
//! The superblock lives in the first sector of the volume and fixes every
//! geometric parameter of the filesystem: block and sector sizes, allocation
//! group layout, inode size and packing, directory block size, and the
//! feature set (V4 vs V5, FTYPE directory entries, big timestamps, metadata
//! CRCs). All on-disk integers are big-endian.
//!
//! [`Superblock`] is the parsed, native-endian view used by the rest of the
//! engine; [`DiskSb`] is the raw on-disk layout, kept around for the
//! counter write-back performed on unmount.

use bytemuck::{Pod, Zeroable};

use crate::errors::MountError;
use crate::fs::xfs::cksum;
use crate::io::BB_SHIFT;

/// Superblock magic number (`XFSB`).
pub const XFS_SB_MAGIC: u32 = 0x58465342;

/// Disk address of the superblock.
pub const XFS_SB_DADDR: u64 = 0;

/// Byte offset of the superblock CRC slot.
pub const XFS_SB_CRC_OFF: usize = 224;

/// Version field low nibble for a V4 filesystem.
const XFS_SB_VERSION_4: u16 = 4;
/// Version field low nibble for a V5 filesystem.
const XFS_SB_VERSION_5: u16 = 5;
/// V4 version flag: the `sb_features2` field is valid.
const XFS_SB_VERSION_MOREBITS: u16 = 0x8000;

/// `sb_features2`: directory entries carry a file type byte (V4).
const XFS_SB_VERSION2_FTYPE: u32 = 0x0000_0200;

/// `sb_features_incompat`: directory entries carry a file type byte (V5).
const XFS_SB_FEAT_INCOMPAT_FTYPE: u32 = 0x1;
/// `sb_features_incompat`: sparse inode chunks.
const XFS_SB_FEAT_INCOMPAT_SPINODES: u32 = 0x2;
/// `sb_features_incompat`: 64-bit nanosecond timestamps.
const XFS_SB_FEAT_INCOMPAT_BIGTIME: u32 = 0x8;
/// `sb_features_incompat`: filesystem needs repair.
const XFS_SB_FEAT_INCOMPAT_NEEDSREPAIR: u32 = 0x10;

/// Incompatible features this driver understands.
const XFS_SB_FEAT_INCOMPAT_KNOWN: u32 = XFS_SB_FEAT_INCOMPAT_FTYPE | XFS_SB_FEAT_INCOMPAT_BIGTIME;

/// Inodes per allocation chunk; chunks are allocated and freed whole.
pub const XFS_INODES_PER_CHUNK: u32 = 64;

/// Maximum link count of a V2+ inode.
pub const XFS_MAXLINK: u32 = (1 << 31) - 1;
/// Maximum link count of a V1 inode.
pub const XFS_MAXLINK_1: u32 = 65535;

/// On-disk superblock layout. All multi-byte fields are big-endian.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct DiskSb {
    pub sb_magicnum: u32,
    pub sb_blocksize: u32,
    pub sb_dblocks: u64,
    pub sb_rblocks: u64,
    pub sb_rextents: u64,
    pub sb_uuid: [u8; 16],
    pub sb_logstart: u64,
    pub sb_rootino: u64,
    pub sb_rbmino: u64,
    pub sb_rsumino: u64,
    pub sb_rextsize: u32,
    pub sb_agblocks: u32,
    pub sb_agcount: u32,
    pub sb_rbmblocks: u32,
    pub sb_logblocks: u32,
    pub sb_versionnum: u16,
    pub sb_sectsize: u16,
    pub sb_inodesize: u16,
    pub sb_inopblock: u16,
    pub sb_fname: [u8; 12],
    pub sb_blocklog: u8,
    pub sb_sectlog: u8,
    pub sb_inodelog: u8,
    pub sb_inopblog: u8,
    pub sb_agblklog: u8,
    pub sb_rextslog: u8,
    pub sb_inprogress: u8,
    pub sb_imax_pct: u8,
    pub sb_icount: u64,
    pub sb_ifree: u64,
    pub sb_fdblocks: u64,
    pub sb_frextents: u64,
    pub sb_uquotino: u64,
    pub sb_gquotino: u64,
    pub sb_qflags: u16,
    pub sb_flags: u8,
    pub sb_shared_vn: u8,
    pub sb_inoalignmt: u32,
    pub sb_unit: u32,
    pub sb_width: u32,
    pub sb_dirblklog: u8,
    pub sb_logsectlog: u8,
    pub sb_logsectsize: u16,
    pub sb_logsunit: u32,
    pub sb_features2: u32,
    /// Mirror of `sb_features2`, kept in sync by mkfs against an old
    /// zeroing bug.
    pub sb_bad_features2: u32,
    pub sb_features_compat: u32,
    pub sb_features_ro_compat: u32,
    pub sb_features_incompat: u32,
    pub sb_features_log_incompat: u32,
    pub sb_crc: u32,
    pub sb_spino_align: u32,
    pub sb_pquotino: u64,
    pub sb_lsn: u64,
    pub sb_meta_uuid: [u8; 16],
}

/// Size of the on-disk superblock structure.
pub const XFS_SB_SIZE: usize = core::mem::size_of::<DiskSb>();

/// Parsed, native-endian superblock.
#[derive(Clone, Debug)]
pub struct Superblock {
    pub blocksize: u32,
    pub blocklog: u8,
    pub sectsize: u16,
    pub sectlog: u8,
    pub dblocks: u64,
    pub agblocks: u32,
    pub agblklog: u8,
    pub agcount: u32,
    pub inodesize: u16,
    pub inodelog: u8,
    pub inopblock: u16,
    pub inopblog: u8,
    pub inoalignmt: u32,
    pub rootino: u64,
    pub dirblklog: u8,
    pub uuid: [u8; 16],
    pub fname: [u8; 12],
    pub versionnum: u16,
    pub features2: u32,
    pub features_incompat: u32,
    pub imax_pct: u8,

    /// Allocated inode count. Mutated through transaction commit only.
    pub icount: u64,
    /// Free inode count. Mutated through transaction commit only.
    pub ifree: u64,
    /// Free data block count. Mutated through transaction commit only.
    pub fdblocks: u64,
}

impl Superblock {
    /// Parses and validates the first sector of a volume.
    pub fn parse(sector: &[u8]) -> Result<Self, MountError> {
        if sector.len() < XFS_SB_SIZE {
            return Err(MountError::BadSuperblock);
        }
        let raw: &DiskSb = bytemuck::from_bytes(&sector[..XFS_SB_SIZE]);

        if u32::from_be(raw.sb_magicnum) != XFS_SB_MAGIC {
            return Err(MountError::BadSuperblock);
        }

        let versionnum = u16::from_be(raw.sb_versionnum);
        let version = versionnum & 0xf;
        if version != XFS_SB_VERSION_4 && version != XFS_SB_VERSION_5 {
            log::error!("unsupported superblock version {version}");
            return Err(MountError::BadSuperblock);
        }

        let sb = Self {
            blocksize: u32::from_be(raw.sb_blocksize),
            blocklog: raw.sb_blocklog,
            sectsize: u16::from_be(raw.sb_sectsize),
            sectlog: raw.sb_sectlog,
            dblocks: u64::from_be(raw.sb_dblocks),
            agblocks: u32::from_be(raw.sb_agblocks),
            agblklog: raw.sb_agblklog,
            agcount: u32::from_be(raw.sb_agcount),
            inodesize: u16::from_be(raw.sb_inodesize),
            inodelog: raw.sb_inodelog,
            inopblock: u16::from_be(raw.sb_inopblock),
            inopblog: raw.sb_inopblog,
            inoalignmt: u32::from_be(raw.sb_inoalignmt),
            rootino: u64::from_be(raw.sb_rootino),
            dirblklog: raw.sb_dirblklog,
            uuid: raw.sb_uuid,
            fname: raw.sb_fname,
            versionnum,
            features2: u32::from_be(raw.sb_features2),
            features_incompat: u32::from_be(raw.sb_features_incompat),
            imax_pct: raw.sb_imax_pct,
            icount: u64::from_be(raw.sb_icount),
            ifree: u64::from_be(raw.sb_ifree),
            fdblocks: u64::from_be(raw.sb_fdblocks),
        };

        // Geometry sanity. Block size must be a power of two within the
        // supported range, and every derived log field must agree with its
        // linear counterpart.
        if !sb.blocksize.is_power_of_two()
            || !(512..=65536).contains(&sb.blocksize)
            || u32::from(sb.blocklog) != sb.blocksize.trailing_zeros()
        {
            return Err(MountError::BadSuperblock);
        }
        if !sb.sectsize.is_power_of_two() || u32::from(sb.sectlog) != sb.sectsize.trailing_zeros() {
            return Err(MountError::BadSuperblock);
        }
        if !sb.inodesize.is_power_of_two()
            || !(256..=2048).contains(&sb.inodesize)
            || u32::from(sb.inodelog) != sb.inodesize.trailing_zeros()
            || u32::from(sb.inopblock) != sb.blocksize / u32::from(sb.inodesize)
            || u32::from(sb.inopblog) != u32::from(sb.inopblock).trailing_zeros()
        {
            return Err(MountError::BadSuperblock);
        }
        if sb.agcount == 0
            || sb.agblocks == 0
            || sb.rootino == 0
            || u64::from(sb.agcount) * u64::from(sb.agblocks) < sb.dblocks
            || u64::from(sb.agcount - 1) * u64::from(sb.agblocks) >= sb.dblocks
        {
            return Err(MountError::BadSuperblock);
        }
        // `agblklog` is the rounded-up log of `agblocks`.
        if (1u64 << sb.agblklog) < u64::from(sb.agblocks)
            || (sb.agblklog > 0 && (1u64 << (sb.agblklog - 1)) >= u64::from(sb.agblocks))
        {
            return Err(MountError::BadSuperblock);
        }

        if raw.sb_inprogress != 0 {
            return Err(MountError::InProgress);
        }
        if u64::from_be(raw.sb_logstart) == 0 {
            return Err(MountError::ExternalLog);
        }
        if u64::from_be(raw.sb_rextents) != 0 || u64::from_be(raw.sb_rblocks) != 0 {
            return Err(MountError::RealTime);
        }

        if sb.is_v5() {
            let incompat = sb.features_incompat;
            if incompat & XFS_SB_FEAT_INCOMPAT_NEEDSREPAIR != 0 {
                log::error!("filesystem is marked as needing repair");
                return Err(MountError::BadSuperblock);
            }
            if incompat & XFS_SB_FEAT_INCOMPAT_SPINODES != 0 {
                log::error!("sparse inode chunks are not supported");
                return Err(MountError::BadSuperblock);
            }
            if incompat & !XFS_SB_FEAT_INCOMPAT_KNOWN & !XFS_SB_FEAT_INCOMPAT_SPINODES != 0 {
                log::error!(
                    "unknown incompatible features {:#x}",
                    incompat & !XFS_SB_FEAT_INCOMPAT_KNOWN
                );
                return Err(MountError::BadSuperblock);
            }
            if !cksum::verify_cksum(&sector[..usize::from(sb.sectsize)], XFS_SB_CRC_OFF) {
                return Err(MountError::BadChecksum);
            }
        }

        Ok(sb)
    }

    /// Tells whether this is a V5 (CRC-enabled) filesystem.
    pub fn is_v5(&self) -> bool {
        self.versionnum & 0xf == XFS_SB_VERSION_5
    }

    /// Tells whether metadata blocks carry CRC32C checksums.
    pub fn has_crc(&self) -> bool {
        self.is_v5()
    }

    /// Tells whether directory entries carry a file type byte.
    pub fn has_ftype(&self) -> bool {
        if self.is_v5() {
            self.features_incompat & XFS_SB_FEAT_INCOMPAT_FTYPE != 0
        } else {
            self.versionnum & XFS_SB_VERSION_MOREBITS != 0
                && self.features2 & XFS_SB_VERSION2_FTYPE != 0
        }
    }

    /// Tells whether inode timestamps use the 64-bit nanosecond encoding.
    pub fn has_bigtime(&self) -> bool {
        self.is_v5() && self.features_incompat & XFS_SB_FEAT_INCOMPAT_BIGTIME != 0
    }

    /// Maximum link count for inodes of this filesystem.
    pub fn max_link(&self) -> u32 {
        XFS_MAXLINK
    }

    /// Basic blocks per filesystem block.
    pub fn bb_per_blk(&self) -> u32 {
        1 << (u32::from(self.blocklog) - BB_SHIFT)
    }

    /// Directory block size in bytes (a power-of-two multiple of the
    /// filesystem block size).
    pub fn dirblksize(&self) -> u32 {
        self.blocksize << self.dirblklog
    }

    /// Filesystem blocks per directory block.
    pub fn fsb_per_dirblk(&self) -> u32 {
        1 << self.dirblklog
    }

    /// Splits an absolute filesystem block number into (AG, AG-relative
    /// block).
    pub fn fsb_to_agbno(&self, fsbno: u64) -> (u32, u32) {
        let agno = (fsbno >> self.agblklog) as u32;
        let agbno = (fsbno & ((1u64 << self.agblklog) - 1)) as u32;
        (agno, agbno)
    }

    /// Builds an absolute filesystem block number from (AG, AG-relative
    /// block).
    pub fn agbno_to_fsb(&self, agno: u32, agbno: u32) -> u64 {
        (u64::from(agno) << self.agblklog) | u64::from(agbno)
    }

    /// Disk address of an AG-relative block.
    pub fn agbno_to_daddr(&self, agno: u32, agbno: u32) -> u64 {
        (u64::from(agno) * u64::from(self.agblocks) + u64::from(agbno))
            << (self.blocklog - BB_SHIFT as u8)
    }

    /// Disk address of an absolute filesystem block number.
    pub fn fsb_to_daddr(&self, fsbno: u64) -> u64 {
        let (agno, agbno) = self.fsb_to_agbno(fsbno);
        self.agbno_to_daddr(agno, agbno)
    }

    /// Splits an inode number into (AG, AG-relative block, index within
    /// block).
    pub fn ino_split(&self, ino: u64) -> (u32, u32, u32) {
        let agno = (ino >> (self.agblklog + self.inopblog)) as u32;
        let agbno = ((ino >> self.inopblog) & ((1u64 << self.agblklog) - 1)) as u32;
        let off = (ino & ((1u64 << self.inopblog) - 1)) as u32;
        (agno, agbno, off)
    }

    /// Builds an inode number from (AG, AG-relative block, index within
    /// block).
    pub fn ino_make(&self, agno: u32, agbno: u32, off: u32) -> u64 {
        (u64::from(agno) << (self.agblklog + self.inopblog))
            | (u64::from(agbno) << self.inopblog)
            | u64::from(off)
    }

    /// AG-relative inode number (block + index), as stored in AGI fields.
    pub fn ino_to_agino(&self, ino: u64) -> u32 {
        (ino & ((1u64 << (self.agblklog + self.inopblog)) - 1)) as u32
    }

    /// Converts a byte count to filesystem blocks, rounding up.
    pub fn b_to_fsb(&self, bytes: u64) -> u64 {
        (bytes + u64::from(self.blocksize) - 1) >> self.blocklog
    }

    /// Converts a byte count to filesystem blocks, truncating.
    pub fn b_to_fsbt(&self, bytes: u64) -> u64 {
        bytes >> self.blocklog
    }

    /// Filesystem blocks covered by one inode chunk.
    pub fn blocks_per_ichunk(&self) -> u32 {
        (XFS_INODES_PER_CHUNK / u32::from(self.inopblock)).max(1)
    }

    /// Maximum inode count allowed by `sb_imax_pct`.
    pub fn max_icount(&self) -> u64 {
        (self.dblocks * u64::from(self.imax_pct) / 100) << self.inopblog
    }

    /// Applies live counters to a raw superblock sector (used when the
    /// sector is written back on unmount).
    pub fn patch_counters(&self, sector: &mut [u8], icount: u64, ifree: u64, fdblocks: u64) {
        let raw: &mut DiskSb = bytemuck::from_bytes_mut(&mut sector[..XFS_SB_SIZE]);
        raw.sb_icount = icount.to_be();
        raw.sb_ifree = ifree.to_be();
        raw.sb_fdblocks = fdblocks.to_be();
        if self.is_v5() {
            let sectsize = usize::from(self.sectsize);
            cksum::update_cksum(&mut sector[..sectsize], XFS_SB_CRC_OFF);
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    /// Builds a minimal valid V4 superblock sector: 4 KiB blocks, one AG of
    /// 64 blocks, 512-byte inodes.
    pub(crate) fn sample_sb_sector() -> Vec<u8> {
        let mut raw = DiskSb::zeroed();
        raw.sb_magicnum = XFS_SB_MAGIC.to_be();
        raw.sb_blocksize = 4096u32.to_be();
        raw.sb_dblocks = 64u64.to_be();
        raw.sb_uuid = *b"0123456789abcdef";
        raw.sb_logstart = 48u64.to_be();
        raw.sb_rootino = 64u64.to_be();
        raw.sb_agblocks = 64u32.to_be();
        raw.sb_agcount = 1u32.to_be();
        raw.sb_logblocks = 16u32.to_be();
        raw.sb_versionnum = (XFS_SB_VERSION_4 | XFS_SB_VERSION_MOREBITS).to_be();
        raw.sb_sectsize = 512u16.to_be();
        raw.sb_inodesize = 512u16.to_be();
        raw.sb_inopblock = 8u16.to_be();
        raw.sb_fname[..4].copy_from_slice(b"test");
        raw.sb_blocklog = 12;
        raw.sb_sectlog = 9;
        raw.sb_inodelog = 9;
        raw.sb_inopblog = 3;
        raw.sb_agblklog = 6;
        raw.sb_imax_pct = 25;
        raw.sb_icount = 64u64.to_be();
        raw.sb_ifree = 61u64.to_be();
        raw.sb_fdblocks = 30u64.to_be();
        raw.sb_features2 = XFS_SB_VERSION2_FTYPE.to_be();

        let mut sector = vec![0u8; 512];
        sector[..XFS_SB_SIZE].copy_from_slice(bytemuck::bytes_of(&raw));
        sector
    }

    #[test]
    fn parse_valid_v4() {
        let sb = Superblock::parse(&sample_sb_sector()).unwrap();
        assert_eq!(sb.blocksize, 4096);
        assert_eq!(sb.rootino, 64);
        assert!(!sb.is_v5());
        assert!(sb.has_ftype());
        assert!(!sb.has_bigtime());
    }

    #[test]
    fn reject_bad_magic() {
        let mut sector = sample_sb_sector();
        sector[0] = b'Y';
        assert!(matches!(
            Superblock::parse(&sector),
            Err(MountError::BadSuperblock)
        ));
    }

    #[test]
    fn reject_external_log() {
        let mut sector = sample_sb_sector();
        let raw: &mut DiskSb = bytemuck::from_bytes_mut(&mut sector[..XFS_SB_SIZE]);
        raw.sb_logstart = 0;
        assert!(matches!(
            Superblock::parse(&sector),
            Err(MountError::ExternalLog)
        ));
    }

    #[test]
    fn reject_realtime() {
        let mut sector = sample_sb_sector();
        let raw: &mut DiskSb = bytemuck::from_bytes_mut(&mut sector[..XFS_SB_SIZE]);
        raw.sb_rextents = 4u64.to_be();
        assert!(matches!(
            Superblock::parse(&sector),
            Err(MountError::RealTime)
        ));
    }

    #[test]
    fn reject_inprogress() {
        let mut sector = sample_sb_sector();
        let raw: &mut DiskSb = bytemuck::from_bytes_mut(&mut sector[..XFS_SB_SIZE]);
        raw.sb_inprogress = 1;
        assert!(matches!(
            Superblock::parse(&sector),
            Err(MountError::InProgress)
        ));
    }

    #[test]
    fn ino_split_roundtrip() {
        let sb = Superblock::parse(&sample_sb_sector()).unwrap();
        // Root inode 64 = block 8, index 0 in AG 0.
        assert_eq!(sb.ino_split(64), (0, 8, 0));
        assert_eq!(sb.ino_make(0, 8, 0), 64);
        let (agno, agbno, off) = sb.ino_split(67);
        assert_eq!((agno, agbno, off), (0, 8, 3));
        assert_eq!(sb.ino_make(agno, agbno, off), 67);
    }

    #[test]
    fn geometry_conversions() {
        let sb = Superblock::parse(&sample_sb_sector()).unwrap();
        assert_eq!(sb.bb_per_blk(), 8);
        assert_eq!(sb.fsb_to_daddr(10), 80);
        assert_eq!(sb.b_to_fsb(1), 1);
        assert_eq!(sb.b_to_fsb(4096), 1);
        assert_eq!(sb.b_to_fsb(4097), 2);
        assert_eq!(sb.b_to_fsbt(4097), 1);
        assert_eq!(sb.dirblksize(), 4096);
    }
}
