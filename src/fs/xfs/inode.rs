//! Inode decoding, encoding and the in-memory inode cache.
//!
//! On-disk inodes come in three versions: V1 and V2 share a 96-byte core,
//! V3 (V5 filesystems) extends it to 176 bytes with a CRC, a self-describing
//! inode number, the filesystem UUID and optional big timestamps. The bytes
//! after the core hold the data fork (and, past `di_forkoff`, the attribute
//! fork, which this driver preserves but does not interpret).
//!
//! In-memory inodes are reference counted: [`InodeRef`] is a scoped guard,
//! cloning acquires a reference and dropping releases it, so every exit path
//! balances automatically. A transaction that must keep an inode alive past
//! its caller takes its own clone.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use hashbrown::HashMap;
use spin::{Mutex, RwLock};

use crate::errors::{IOResult, XfsError};
use crate::fs::xfs::cksum;
use crate::fs::xfs::extent::ExtentRec;
use crate::fs::xfs::sb::Superblock;

/// Inode magic number (`IN`).
pub const XFS_DINODE_MAGIC: u16 = 0x494e;

/// Byte offset of `di_next_unlinked` inside the on-disk inode.
pub const DINODE_UNLINKED_OFF: usize = 96;
/// Byte offset of the V3 inode CRC slot.
pub const DINODE_CRC_OFF: usize = 100;
/// Size of the V1/V2 on-disk inode header (core plus `next_unlinked`).
pub const DINODE_V2_HDR_SIZE: usize = 100;
/// Size of the V3 on-disk inode header (core, CRC and V3 fields).
pub const DINODE_V3_HDR_SIZE: usize = 176;

/// `next_unlinked` value meaning "not on an unlinked list".
pub const NULLAGINO: u32 = u32::MAX;

/// `di_flags2` bit: timestamps use the 64-bit nanosecond encoding.
pub const DIFLAG2_BIGTIME: u64 = 1 << 3;

/// Shapes of a fork, as stored in `di_format`/`di_aformat`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DinodeFmt {
    /// Device numbers (character/block specials).
    Dev,
    /// Inline data: short-form directory, short symlink target.
    Local,
    /// In-inode array of extent records.
    Extents,
    /// B-tree root; leaves hold the extent records.
    Btree,
    /// Mount-point pseudo inode; never traversed.
    Uuid,
}

impl DinodeFmt {
    pub fn from_raw(raw: u8) -> IOResult<Self> {
        match raw {
            0 => Ok(Self::Dev),
            1 => Ok(Self::Local),
            2 => Ok(Self::Extents),
            3 => Ok(Self::Btree),
            4 => Ok(Self::Uuid),
            _ => {
                log::error!("unknown inode fork format {raw}");
                Err(XfsError::Io)
            }
        }
    }

    pub fn to_raw(self) -> u8 {
        match self {
            Self::Dev => 0,
            Self::Local => 1,
            Self::Extents => 2,
            Self::Btree => 3,
            Self::Uuid => 4,
        }
    }
}

/// File type bits of `di_mode`.
pub const S_IFMT: u16 = 0o170000;
pub const S_IFIFO: u16 = 0o010000;
pub const S_IFCHR: u16 = 0o020000;
pub const S_IFDIR: u16 = 0o040000;
pub const S_IFBLK: u16 = 0o060000;
pub const S_IFREG: u16 = 0o100000;
pub const S_IFLNK: u16 = 0o120000;
pub const S_IFSOCK: u16 = 0o140000;

/// File types representable by an inode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    Fifo,
    CharDev,
    Directory,
    BlockDev,
    Regular,
    Symlink,
    Socket,
}

impl FileType {
    /// Extracts the type from an inode mode.
    pub fn from_mode(mode: u16) -> IOResult<Self> {
        match mode & S_IFMT {
            S_IFIFO => Ok(Self::Fifo),
            S_IFCHR => Ok(Self::CharDev),
            S_IFDIR => Ok(Self::Directory),
            S_IFBLK => Ok(Self::BlockDev),
            S_IFREG => Ok(Self::Regular),
            S_IFLNK => Ok(Self::Symlink),
            S_IFSOCK => Ok(Self::Socket),
            _ => Err(XfsError::Io),
        }
    }

    /// The `XFS_DIR3_FT_*` code stored in FTYPE directory entries.
    pub fn to_dir_ftype(self) -> u8 {
        match self {
            Self::Regular => 1,
            Self::Directory => 2,
            Self::CharDev => 3,
            Self::BlockDev => 4,
            Self::Fifo => 5,
            Self::Socket => 6,
            Self::Symlink => 7,
        }
    }

    /// Decodes an FTYPE directory entry code; unknown codes map to `None`.
    pub fn from_dir_ftype(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Regular),
            2 => Some(Self::Directory),
            3 => Some(Self::CharDev),
            4 => Some(Self::BlockDev),
            5 => Some(Self::Fifo),
            6 => Some(Self::Socket),
            7 => Some(Self::Symlink),
            _ => None,
        }
    }
}

/// An inode timestamp, seconds and nanoseconds since the Unix epoch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Timestamp {
    pub sec: i64,
    pub nsec: u32,
}

/// Offset applied to the seconds field by the bigtime encoding: bigtime
/// counts nanoseconds from the earliest representable classic timestamp
/// (`i32::MIN` seconds).
const BIGTIME_EPOCH_OFF: i64 = 1 << 31;
const NSEC_PER_SEC: u64 = 1_000_000_000;

impl Timestamp {
    /// Decodes the 8 on-disk bytes of a timestamp.
    pub fn decode(raw: [u8; 8], bigtime: bool) -> Self {
        if bigtime {
            let ns = u64::from_be_bytes(raw);
            Self {
                sec: (ns / NSEC_PER_SEC) as i64 - BIGTIME_EPOCH_OFF,
                nsec: (ns % NSEC_PER_SEC) as u32,
            }
        } else {
            let sec = i32::from_be_bytes(raw[..4].try_into().unwrap());
            let nsec = u32::from_be_bytes(raw[4..].try_into().unwrap());
            Self {
                sec: i64::from(sec),
                nsec,
            }
        }
    }

    /// Encodes the timestamp into its 8 on-disk bytes.
    pub fn encode(self, bigtime: bool) -> [u8; 8] {
        if bigtime {
            let ns = ((self.sec + BIGTIME_EPOCH_OFF) as u64) * NSEC_PER_SEC + u64::from(self.nsec);
            ns.to_be_bytes()
        } else {
            let mut raw = [0u8; 8];
            raw[..4].copy_from_slice(&(self.sec as i32).to_be_bytes());
            raw[4..].copy_from_slice(&self.nsec.to_be_bytes());
            raw
        }
    }

    /// The current wall-clock time.
    pub fn now() -> Self {
        match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
            Ok(d) => Self {
                sec: d.as_secs() as i64,
                nsec: d.subsec_nanos(),
            },
            Err(_) => Self::default(),
        }
    }
}

/// The 96-byte core shared by every inode version. Big-endian fields.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct DiskDinodeCore {
    pub di_magic: u16,
    pub di_mode: u16,
    pub di_version: u8,
    pub di_format: u8,
    pub di_onlink: u16,
    pub di_uid: u32,
    pub di_gid: u32,
    pub di_nlink: u32,
    pub di_projid_lo: u16,
    pub di_projid_hi: u16,
    pub di_pad: [u8; 6],
    pub di_flushiter: u16,
    pub di_atime: [u8; 8],
    pub di_mtime: [u8; 8],
    pub di_ctime: [u8; 8],
    pub di_size: u64,
    pub di_nblocks: u64,
    pub di_extsize: u32,
    pub di_nextents: u32,
    pub di_anextents: u16,
    pub di_forkoff: u8,
    pub di_aformat: i8,
    pub di_dmevmask: u32,
    pub di_dmstate: u16,
    pub di_flags: u16,
    pub di_gen: u32,
}

/// The V3 extension, at byte 104 of the on-disk inode (after
/// `next_unlinked` and the CRC slot).
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct DiskDinodeV3 {
    pub di_changecount: u64,
    pub di_lsn: u64,
    pub di_flags2: u64,
    pub di_cowextsize: u32,
    pub di_pad2: [u8; 12],
    pub di_crtime: [u8; 8],
    pub di_ino: u64,
    pub di_uuid: [u8; 16],
}

/// Contents of an inode's data fork.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DataFork {
    /// Inline bytes: short-form directory data or a short symlink target.
    Local(Vec<u8>),
    /// Device major/minor encoding for specials.
    Dev(u32),
    /// Extent list, ordered by file offset.
    Extents(Vec<ExtentRec>),
    /// Raw B-tree root; decoded on demand by the extent reader.
    Btree(Vec<u8>),
    /// Mount-point pseudo inode.
    Uuid,
}

impl DataFork {
    pub fn format(&self) -> DinodeFmt {
        match self {
            Self::Local(_) => DinodeFmt::Local,
            Self::Dev(_) => DinodeFmt::Dev,
            Self::Extents(_) => DinodeFmt::Extents,
            Self::Btree(_) => DinodeFmt::Btree,
            Self::Uuid => DinodeFmt::Uuid,
        }
    }
}

/// The in-memory representation of an inode.
#[derive(Clone, Debug)]
pub struct Inode {
    pub ino: u64,
    pub version: u8,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub projid: u32,
    pub flushiter: u16,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    /// Creation time; V3 inodes only, mirrors `ctime` elsewhere.
    pub crtime: Timestamp,
    pub size: u64,
    pub nblocks: u64,
    pub extsize: u32,
    pub forkoff: u8,
    pub aformat: i8,
    pub flags: u16,
    pub flags2: u64,
    pub gen: u32,
    pub next_unlinked: u32,
    pub changecount: u64,
    pub fork: DataFork,
    /// Preserved attribute-fork bytes (`di_forkoff != 0`), written back
    /// verbatim.
    pub attr_raw: Vec<u8>,
    pub anextents: u16,
    /// Extent count of an unmodified B-tree fork, preserved from decode
    /// so encode round-trips it. Mutated forks use the extents shape and
    /// this field is unused.
    pub btree_nextents: u32,
}

impl Inode {
    pub fn file_type(&self) -> IOResult<FileType> {
        FileType::from_mode(self.mode)
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_reg(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    /// Tells whether this inode uses the bigtime timestamp encoding.
    pub fn has_bigtime(&self) -> bool {
        self.version == 3 && self.flags2 & DIFLAG2_BIGTIME != 0
    }

    /// Size of the on-disk header preceding the literal area.
    pub fn hdr_size(&self) -> usize {
        if self.version == 3 {
            DINODE_V3_HDR_SIZE
        } else {
            DINODE_V2_HDR_SIZE
        }
    }

    /// Size of the literal area available to the data fork.
    pub fn dfork_size(&self, sb: &Superblock) -> usize {
        if self.forkoff != 0 {
            usize::from(self.forkoff) << 3
        } else {
            usize::from(sb.inodesize) - self.hdr_size()
        }
    }

    /// Tells whether the data fork still fits the inode literal area.
    ///
    /// Extent lists grow through allocation; a list that no longer fits
    /// would corrupt the neighbouring fork on encode, so mutators check
    /// after every insertion.
    pub fn fork_fits(&self, sb: &Superblock) -> bool {
        match &self.fork {
            DataFork::Extents(list) => {
                list.len() * ExtentRec::DISK_SIZE <= self.dfork_size(sb)
            }
            DataFork::Local(data) => data.len() <= self.dfork_size(sb),
            _ => true,
        }
    }

    /// Bumps `mtime` and/or `ctime` to the current time.
    pub fn touch(&mut self, mod_time: bool, chg_time: bool) {
        let now = Timestamp::now();
        if mod_time {
            self.mtime = now;
        }
        if chg_time {
            self.ctime = now;
        }
    }

    /// Decodes the on-disk inode record at `slot` (of `sb.inodesize` bytes).
    ///
    /// `ino` is the absolute inode number the record was read for; V3
    /// records carry it on disk and the two must agree.
    pub fn decode(sb: &Superblock, ino: u64, slot: &[u8]) -> IOResult<Self> {
        debug_assert_eq!(slot.len(), usize::from(sb.inodesize));
        let core: &DiskDinodeCore = bytemuck::from_bytes(&slot[..core::mem::size_of::<DiskDinodeCore>()]);

        if u16::from_be(core.di_magic) != XFS_DINODE_MAGIC {
            log::error!("bad inode magic for inode {ino:#x}");
            return Err(XfsError::Io);
        }
        let version = core.di_version;
        if !(1..=3).contains(&version) {
            log::error!("bad inode version {version} for inode {ino:#x}");
            return Err(XfsError::Io);
        }

        let next_unlinked = u32::from_be_bytes(
            slot[DINODE_UNLINKED_OFF..DINODE_UNLINKED_OFF + 4]
                .try_into()
                .unwrap(),
        );

        let (flags2, changecount, crtime_raw) = if version == 3 {
            if !cksum::verify_cksum(slot, DINODE_CRC_OFF) {
                log::error!("inode {ino:#x} failed its CRC check");
                return Err(XfsError::Io);
            }
            let v3: &DiskDinodeV3 =
                bytemuck::from_bytes(&slot[104..DINODE_V3_HDR_SIZE]);
            if u64::from_be(v3.di_ino) != ino {
                log::error!("inode {ino:#x} carries mismatched inode number");
                return Err(XfsError::Io);
            }
            if v3.di_uuid != sb.uuid {
                log::error!("inode {ino:#x} carries a foreign UUID");
                return Err(XfsError::Io);
            }
            (
                u64::from_be(v3.di_flags2),
                u64::from_be(v3.di_changecount),
                v3.di_crtime,
            )
        } else {
            (0, 0, [0u8; 8])
        };

        let bigtime = version == 3 && flags2 & DIFLAG2_BIGTIME != 0;
        let nlink = if version == 1 {
            u32::from(u16::from_be(core.di_onlink))
        } else {
            u32::from_be(core.di_nlink)
        };

        let mode = u16::from_be(core.di_mode);
        let format = DinodeFmt::from_raw(core.di_format)?;
        let size = u64::from_be(core.di_size);
        let nextents = u32::from_be(core.di_nextents);
        let forkoff = core.di_forkoff;

        let hdr = if version == 3 {
            DINODE_V3_HDR_SIZE
        } else {
            DINODE_V2_HDR_SIZE
        };
        let literal = &slot[hdr..];
        let dfork_len = if forkoff != 0 {
            usize::from(forkoff) << 3
        } else {
            literal.len()
        };
        if dfork_len > literal.len() {
            log::error!("inode {ino:#x} fork offset past the literal area");
            return Err(XfsError::Io);
        }
        let dfork = &literal[..dfork_len];

        // A directory never uses the UUID (mount point) shape; device
        // inodes never use anything else.
        let fork = match format {
            DinodeFmt::Dev => {
                DataFork::Dev(u32::from_be_bytes(dfork[..4].try_into().unwrap()))
            }
            DinodeFmt::Local => {
                if size as usize > dfork_len {
                    log::error!("inode {ino:#x} inline data larger than its fork");
                    return Err(XfsError::Io);
                }
                DataFork::Local(dfork[..size as usize].to_vec())
            }
            DinodeFmt::Extents => {
                let count = nextents as usize;
                if count * ExtentRec::DISK_SIZE > dfork_len {
                    log::error!("inode {ino:#x} extent list larger than its fork");
                    return Err(XfsError::Io);
                }
                let mut extents = Vec::with_capacity(count);
                for i in 0..count {
                    let rec = ExtentRec::unpack(
                        dfork[i * ExtentRec::DISK_SIZE..(i + 1) * ExtentRec::DISK_SIZE]
                            .try_into()
                            .unwrap(),
                    );
                    extents.push(rec);
                }
                DataFork::Extents(extents)
            }
            DinodeFmt::Btree => DataFork::Btree(dfork.to_vec()),
            DinodeFmt::Uuid => DataFork::Uuid,
        };
        if matches!(fork, DataFork::Uuid) && mode & S_IFMT == S_IFDIR {
            log::error!("directory inode {ino:#x} with a UUID fork");
            return Err(XfsError::Io);
        }

        Ok(Self {
            ino,
            version,
            mode,
            uid: u32::from_be(core.di_uid),
            gid: u32::from_be(core.di_gid),
            nlink,
            projid: (u32::from(u16::from_be(core.di_projid_hi)) << 16)
                | u32::from(u16::from_be(core.di_projid_lo)),
            flushiter: u16::from_be(core.di_flushiter),
            atime: Timestamp::decode(core.di_atime, bigtime),
            mtime: Timestamp::decode(core.di_mtime, bigtime),
            ctime: Timestamp::decode(core.di_ctime, bigtime),
            crtime: Timestamp::decode(crtime_raw, bigtime),
            size,
            nblocks: u64::from_be(core.di_nblocks),
            extsize: u32::from_be(core.di_extsize),
            forkoff,
            aformat: core.di_aformat,
            flags: u16::from_be(core.di_flags),
            flags2,
            gen: u32::from_be(core.di_gen),
            next_unlinked,
            changecount,
            fork,
            attr_raw: literal[dfork_len..].to_vec(),
            anextents: u16::from_be(core.di_anextents),
            btree_nextents: nextents,
        })
    }

    /// Encodes the inode into its on-disk record at `slot`, recomputing the
    /// V3 CRC.
    pub fn encode(&self, sb: &Superblock, slot: &mut [u8]) {
        debug_assert_eq!(slot.len(), usize::from(sb.inodesize));
        slot.fill(0);

        let bigtime = self.has_bigtime();
        let nextents = match &self.fork {
            DataFork::Extents(list) => list.len() as u32,
            DataFork::Btree(_) => self.btree_nextents,
            _ => 0,
        };

        let core = DiskDinodeCore {
            di_magic: XFS_DINODE_MAGIC.to_be(),
            di_mode: self.mode.to_be(),
            di_version: self.version,
            di_format: self.fork.format().to_raw(),
            di_onlink: if self.version == 1 {
                (self.nlink as u16).to_be()
            } else {
                0
            },
            di_uid: self.uid.to_be(),
            di_gid: self.gid.to_be(),
            di_nlink: if self.version == 1 {
                0
            } else {
                self.nlink.to_be()
            },
            di_projid_lo: ((self.projid & 0xffff) as u16).to_be(),
            di_projid_hi: ((self.projid >> 16) as u16).to_be(),
            di_pad: [0; 6],
            di_flushiter: self.flushiter.to_be(),
            di_atime: self.atime.encode(bigtime),
            di_mtime: self.mtime.encode(bigtime),
            di_ctime: self.ctime.encode(bigtime),
            di_size: self.size.to_be(),
            di_nblocks: self.nblocks.to_be(),
            di_extsize: self.extsize.to_be(),
            di_nextents: nextents.to_be(),
            di_anextents: self.anextents.to_be(),
            di_forkoff: self.forkoff,
            di_aformat: self.aformat,
            di_dmevmask: 0,
            di_dmstate: 0,
            di_flags: self.flags.to_be(),
            di_gen: self.gen.to_be(),
        };
        slot[..core::mem::size_of::<DiskDinodeCore>()].copy_from_slice(bytemuck::bytes_of(&core));
        slot[DINODE_UNLINKED_OFF..DINODE_UNLINKED_OFF + 4]
            .copy_from_slice(&self.next_unlinked.to_be_bytes());

        if self.version == 3 {
            let v3 = DiskDinodeV3 {
                di_changecount: self.changecount.to_be(),
                di_lsn: 0,
                di_flags2: self.flags2.to_be(),
                di_cowextsize: 0,
                di_pad2: [0; 12],
                di_crtime: self.crtime.encode(bigtime),
                di_ino: self.ino.to_be(),
                di_uuid: sb.uuid,
            };
            slot[104..DINODE_V3_HDR_SIZE].copy_from_slice(bytemuck::bytes_of(&v3));
        }

        let hdr = self.hdr_size();
        let dfork_len = self.dfork_size(sb);
        let (dfork, afork) = slot[hdr..].split_at_mut(dfork_len);
        match &self.fork {
            DataFork::Dev(dev) => dfork[..4].copy_from_slice(&dev.to_be_bytes()),
            DataFork::Local(data) => dfork[..data.len()].copy_from_slice(data),
            DataFork::Extents(list) => {
                for (i, rec) in list.iter().enumerate() {
                    dfork[i * ExtentRec::DISK_SIZE..(i + 1) * ExtentRec::DISK_SIZE]
                        .copy_from_slice(&rec.pack());
                }
            }
            DataFork::Btree(raw) => dfork[..raw.len()].copy_from_slice(raw),
            DataFork::Uuid => {}
        }
        afork[..self.attr_raw.len()].copy_from_slice(&self.attr_raw);

        if self.version == 3 {
            cksum::update_cksum(slot, DINODE_CRC_OFF);
        }
    }

}

/// Shared, lockable handle on a cached inode. Cloning acquires a reference;
/// dropping releases it.
pub type InodeRef = Arc<RwLock<Inode>>;

/// The per-volume inode cache.
///
/// `refcount(ino)` is the number of [`InodeRef`] clones outstanding, i.e.
/// `Arc::strong_count - 1` (the cache holds one). Entries with no
/// outstanding references may be evicted once the cache grows.
pub struct InodeCache {
    map: Mutex<HashMap<u64, InodeRef>>,
}

/// Cached inode count above which unreferenced entries are evicted.
const ICACHE_HIGH_WATER: usize = 1024;

impl InodeCache {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached handle for `ino`, if any.
    pub fn lookup(&self, ino: u64) -> Option<InodeRef> {
        self.map.lock().get(&ino).cloned()
    }

    /// Inserts a freshly decoded inode and returns its handle.
    pub fn insert(&self, inode: Inode) -> InodeRef {
        let mut map = self.map.lock();
        if map.len() >= ICACHE_HIGH_WATER {
            map.retain(|_, v| Arc::strong_count(v) > 1);
        }
        let ino = inode.ino;
        let handle = Arc::new(RwLock::new(inode));
        map.insert(ino, handle.clone());
        handle
    }

    /// Registers an externally built handle (a freshly created inode, once
    /// its transaction has committed).
    pub fn insert_handle(&self, handle: &InodeRef) {
        let ino = handle.read().ino;
        self.map.lock().insert(ino, handle.clone());
    }

    /// Drops a freed inode from the cache.
    pub fn remove(&self, ino: u64) {
        self.map.lock().remove(&ino);
    }

    /// Number of outstanding references on `ino` (excluding the cache's
    /// own), or `None` if not cached.
    pub fn refcount(&self, ino: u64) -> Option<usize> {
        self.map
            .lock()
            .get(&ino)
            .map(|handle| Arc::strong_count(handle) - 1)
    }
}

impl Default for InodeCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fs::xfs::sb::test::sample_sb_sector;

    fn sample_sb() -> Superblock {
        Superblock::parse(&sample_sb_sector()).unwrap()
    }

    fn sample_inode(sb: &Superblock) -> Inode {
        Inode {
            ino: 67,
            version: 2,
            mode: S_IFREG | 0o644,
            uid: 1000,
            gid: 1000,
            nlink: 1,
            projid: 0,
            flushiter: 0,
            atime: Timestamp { sec: 1700000000, nsec: 500 },
            mtime: Timestamp { sec: 1700000001, nsec: 501 },
            ctime: Timestamp { sec: 1700000002, nsec: 502 },
            crtime: Timestamp::default(),
            size: 3,
            nblocks: 1,
            extsize: 0,
            forkoff: 0,
            aformat: 2,
            flags: 0,
            flags2: 0,
            gen: 7,
            next_unlinked: NULLAGINO,
            changecount: 0,
            fork: DataFork::Extents(vec![ExtentRec {
                startoff: 0,
                startblock: 12,
                blockcount: 1,
                unwritten: false,
            }]),
            attr_raw: Vec::new(),
            anextents: 0,
            btree_nextents: 0,
        }
    }

    #[test]
    fn encode_decode_v2() {
        let sb = sample_sb();
        let ino = sample_inode(&sb);

        let mut slot = vec![0u8; usize::from(sb.inodesize)];
        ino.encode(&sb, &mut slot);
        let back = Inode::decode(&sb, 67, &slot).unwrap();

        assert_eq!(back.mode, ino.mode);
        assert_eq!(back.nlink, 1);
        assert_eq!(back.size, 3);
        assert_eq!(back.atime, ino.atime);
        assert_eq!(back.mtime, ino.mtime);
        assert_eq!(back.gen, 7);
        assert_eq!(back.fork, ino.fork);
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let sb = sample_sb();
        let slot = vec![0u8; usize::from(sb.inodesize)];
        assert_eq!(Inode::decode(&sb, 67, &slot).unwrap_err(), XfsError::Io);
    }

    #[test]
    fn bigtime_roundtrip() {
        let ts = Timestamp { sec: 1700000000, nsec: 123456789 };
        assert_eq!(Timestamp::decode(ts.encode(true), true), ts);
        assert_eq!(Timestamp::decode(ts.encode(false), false), ts);

        // Pre-epoch classic timestamps survive as well.
        let old = Timestamp { sec: -5, nsec: 1 };
        assert_eq!(Timestamp::decode(old.encode(true), true), old);
        assert_eq!(Timestamp::decode(old.encode(false), false), old);
    }

    #[test]
    fn file_types() {
        assert_eq!(FileType::from_mode(S_IFDIR | 0o755).unwrap(), FileType::Directory);
        assert_eq!(FileType::from_mode(S_IFLNK | 0o777).unwrap(), FileType::Symlink);
        assert_eq!(
            FileType::from_dir_ftype(FileType::Socket.to_dir_ftype()),
            Some(FileType::Socket)
        );
        assert_eq!(FileType::from_dir_ftype(0), None);
        assert!(FileType::from_mode(0).is_err());
    }

    #[test]
    fn cache_refcounts() {
        let sb = sample_sb();
        let cache = InodeCache::new();
        let handle = cache.insert(sample_inode(&sb));
        assert_eq!(cache.refcount(67), Some(1));

        let second = cache.lookup(67).unwrap();
        assert!(Arc::ptr_eq(&handle, &second));
        assert_eq!(cache.refcount(67), Some(2));

        drop(second);
        drop(handle);
        assert_eq!(cache.refcount(67), Some(0));
    }
}
