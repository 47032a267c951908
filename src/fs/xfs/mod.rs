//! The XFS volume engine.
//!
//! [`XfsFs`] binds one block device to its parsed superblock, allocation
//! groups, buffer cache and inode cache, and is the handle every operation
//! takes. Reading goes path walker -> inode cache -> extent reader ->
//! buffer cache; writing goes through [`trans::Transaction`], which logs
//! changed metadata and writes it back on commit.
//!
//! The engine is single-threaded by contract: callers (the FUSE shim)
//! serialize entry. After an aborted transaction the mount is shut down and
//! every subsequent operation fails.

pub mod ag;
pub mod alloc;
pub mod cksum;
pub mod dir;
pub mod extent;
pub mod inode;
pub mod ops;
pub mod path;
pub mod sb;
pub mod trans;

#[cfg(test)]
pub(crate) mod test_img;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use spin::{Mutex, MutexGuard};

use crate::errors::{CanFail, IOResult, MountError, XfsError};
use crate::fs::xfs::inode::{Inode, InodeCache, InodeRef};
use crate::fs::xfs::sb::Superblock;
use crate::io::buffer::{BufCache, BufRef};
use crate::io::device::BlockDevice;
use crate::io::BB_SHIFT;

/// The mutable superblock counters, updated only through transaction
/// commit and written back on unmount.
#[derive(Clone, Copy, Debug)]
pub struct SbCounters {
    pub icount: u64,
    pub ifree: u64,
    pub fdblocks: u64,
}

/// Data returned by `statfs`.
#[derive(Clone, Copy, Debug)]
pub struct StatFs {
    pub blocksize: u32,
    pub blocks: u64,
    pub bfree: u64,
    pub files: u64,
    pub ffree: u64,
    pub namelen: u32,
    pub fsid: [u8; 16],
}

/// A mounted XFS volume.
pub struct XfsFs {
    dev: Arc<BlockDevice>,
    bufs: BufCache,
    sb: Superblock,
    counters: Mutex<SbCounters>,
    icache: InodeCache,
    read_only: bool,
    shutdown: AtomicBool,
}

impl XfsFs {
    /// Mounts the filesystem on `dev`.
    ///
    /// The superblock is read from the first sector and fully validated
    /// (see [`Superblock::parse`]); filesystems with an unfinished mkfs, an
    /// external log or a real-time section are rejected.
    pub fn mount(dev: BlockDevice, read_only: bool) -> Result<Self, MountError> {
        let read_only = read_only || dev.is_read_only();
        let sector = Self::read_sb_sector(&dev)?;
        let sb = Superblock::parse(&sector)?;

        let fs_bb = sb.dblocks << (sb.blocklog - BB_SHIFT as u8);
        if fs_bb > dev.size_bb() {
            log::error!(
                "device too small: filesystem spans {fs_bb} sectors, device has {}",
                dev.size_bb()
            );
            return Err(MountError::BadSuperblock);
        }

        let counters = SbCounters {
            icount: sb.icount,
            ifree: sb.ifree,
            fdblocks: sb.fdblocks,
        };

        log::info!(
            "mounted {} filesystem \"{}\" ({} blocks of {}, {} AGs{})",
            if sb.is_v5() { "V5" } else { "V4" },
            String::from_utf8_lossy(&sb.fname)
                .trim_end_matches('\0')
                .to_string(),
            sb.dblocks,
            sb.blocksize,
            sb.agcount,
            if read_only { ", read-only" } else { "" },
        );

        let dev = Arc::new(dev);
        Ok(Self {
            bufs: BufCache::new(dev.clone()),
            dev,
            sb,
            counters: Mutex::new(counters),
            icache: InodeCache::new(),
            read_only,
            shutdown: AtomicBool::new(false),
        })
    }

    /// Reads the (variable-size) superblock sector.
    fn read_sb_sector(dev: &BlockDevice) -> Result<Vec<u8>, MountError> {
        let mut first = vec![0u8; crate::io::BB_SIZE];
        dev.read_daddr(0, &mut first).map_err(|_| MountError::Device)?;

        let sectsize = u16::from_be_bytes([first[102], first[103]]);
        if !sectsize.is_power_of_two() || sectsize < 512 {
            // Leave the detailed diagnosis to the parser.
            return Ok(first);
        }
        if usize::from(sectsize) <= first.len() {
            return Ok(first);
        }
        let mut sector = vec![0u8; usize::from(sectsize)];
        dev.read_daddr(0, &mut sector)
            .map_err(|_| MountError::Device)?;
        Ok(sector)
    }

    /// The immutable, parsed superblock.
    pub fn sb(&self) -> &Superblock {
        &self.sb
    }

    /// The live superblock counters.
    pub fn counters(&self) -> MutexGuard<'_, SbCounters> {
        self.counters.lock()
    }

    pub(crate) fn bufs(&self) -> &BufCache {
        &self.bufs
    }

    /// The backing device.
    pub fn device(&self) -> &BlockDevice {
        &self.dev
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Marks the mount shut down; every later operation fails.
    pub(crate) fn force_shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            log::error!("filesystem shut down; remount to recover");
        }
    }

    /// Gate for mutating operations.
    pub(crate) fn check_writable(&self) -> CanFail<XfsError> {
        if self.read_only {
            return Err(XfsError::ReadOnly);
        }
        if self.is_shutdown() {
            return Err(XfsError::Shutdown);
        }
        Ok(())
    }

    /// Reads `count` filesystem blocks starting at `fsbno` through the
    /// buffer cache.
    pub fn read_fsb(&self, fsbno: u64, count: u32) -> IOResult<BufRef> {
        let (agno, agbno) = self.sb.fsb_to_agbno(fsbno);
        if agno >= self.sb.agcount || agbno >= self.sb.agblocks {
            log::error!("block number {fsbno:#x} out of bounds");
            return Err(XfsError::Io);
        }
        self.bufs
            .read(self.sb.fsb_to_daddr(fsbno), count * self.sb.bb_per_blk())
    }

    /// Fetches an inode, returning a counted handle. Repeated fetches of a
    /// live inode return the same handle.
    pub fn iget(&self, ino: u64) -> IOResult<InodeRef> {
        if let Some(handle) = self.icache.lookup(ino) {
            return Ok(handle);
        }

        let (agno, agbno, off) = self.sb.ino_split(ino);
        if agno >= self.sb.agcount
            || agbno >= self.sb.agblocks
            || off >= u32::from(self.sb.inopblock)
        {
            log::error!("inode number {ino:#x} out of bounds");
            return Err(XfsError::Io);
        }

        let buf = self.read_fsb(self.sb.agbno_to_fsb(agno, agbno), 1)?;
        let guard = buf.read();
        let isize = usize::from(self.sb.inodesize);
        let slot = &guard.data()[off as usize * isize..(off as usize + 1) * isize];
        let inode = Inode::decode(&self.sb, ino, slot)?;
        drop(guard);

        Ok(self.icache.insert(inode))
    }

    /// Encodes an inode back into its cluster buffer and marks the buffer
    /// dirty. Returns the cluster buffer for the commit write-out.
    pub(crate) fn write_inode(&self, inode: &Inode) -> IOResult<BufRef> {
        let (agno, agbno, off) = self.sb.ino_split(inode.ino);
        let buf = self.read_fsb(self.sb.agbno_to_fsb(agno, agbno), 1)?;
        {
            let mut guard = buf.write();
            let isize = usize::from(self.sb.inodesize);
            let slot = &mut guard.data_mut()[off as usize * isize..(off as usize + 1) * isize];
            inode.encode(&self.sb, slot);
            guard.mark_dirty();
        }
        Ok(buf)
    }

    /// Registers a freshly created inode's handle once its transaction has
    /// committed.
    pub(crate) fn cache_inode(&self, handle: &InodeRef) {
        self.icache.insert_handle(handle);
    }

    /// Drops a freed inode from the cache.
    pub(crate) fn forget_inode(&self, ino: u64) {
        self.icache.remove(ino);
    }

    /// Outstanding references on a cached inode (diagnostic).
    pub fn inode_refcount(&self, ino: u64) -> Option<usize> {
        self.icache.refcount(ino)
    }

    /// Filesystem statistics from the superblock.
    pub fn statfs(&self) -> StatFs {
        let counters = self.counters();
        StatFs {
            blocksize: self.sb.blocksize,
            blocks: self.sb.dblocks,
            bfree: counters.fdblocks,
            files: counters.icount,
            ffree: counters.ifree,
            namelen: dir::MAX_NAME_LEN as u32,
            fsid: self.sb.uuid,
        }
    }

    /// Writes all dirty state back: the buffer cache first, then the
    /// superblock counters.
    pub fn sync(&self) -> CanFail<XfsError> {
        if self.read_only || self.is_shutdown() {
            return Ok(());
        }
        self.bufs.flush()?;

        let sect_bb = u32::from(self.sb.sectsize) >> BB_SHIFT;
        let buf = self.bufs.read(sb::XFS_SB_DADDR, sect_bb)?;
        {
            let mut guard = buf.write();
            let counters = *self.counters();
            self.sb.patch_counters(
                guard.data_mut(),
                counters.icount,
                counters.ifree,
                counters.fdblocks,
            );
        }
        self.bufs.write_buf(&buf)
    }

    /// Unmounts: flushes dirty buffers and writes the superblock back when
    /// the mount was writable.
    pub fn unmount(self) -> CanFail<XfsError> {
        if !self.read_only && !self.is_shutdown() {
            self.sync()?;
        }
        log::info!("unmounted");
        Ok(())
    }

    /// Volume label, for the probe options.
    pub fn label(&self) -> String {
        String::from_utf8_lossy(&self.sb.fname)
            .trim_end_matches('\0')
            .to_string()
    }

    /// Volume UUID.
    pub fn uuid(&self) -> uuid::Uuid {
        uuid::Uuid::from_bytes(self.sb.uuid)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fs::xfs::test_img::TestImage;

    #[test]
    fn mount_and_statfs() {
        let fs = TestImage::default().mount_ro();
        let st = fs.statfs();
        assert_eq!(st.blocksize, 4096);
        assert!(st.bfree > 0);
        assert!(st.files >= 64);
        assert_eq!(st.namelen, 255);
    }

    #[test]
    fn iget_root_dir() {
        let fs = TestImage::default().mount_ro();
        let root = fs.iget(fs.sb().rootino).unwrap();
        let inode = root.read();
        assert!(inode.is_dir());
        assert_eq!(inode.nlink, 2);
    }

    #[test]
    fn iget_same_handle() {
        let fs = TestImage::default().mount_ro();
        let a = fs.iget(fs.sb().rootino).unwrap();
        let b = fs.iget(fs.sb().rootino).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(fs.inode_refcount(fs.sb().rootino), Some(2));
    }

    #[test]
    fn iget_bad_ino() {
        let fs = TestImage::default().mount_ro();
        assert_eq!(fs.iget(1 << 40).unwrap_err(), XfsError::Io);
    }

    #[test]
    fn v5_mount() {
        let fs = TestImage::new().v5(true).mount_ro();
        assert!(fs.sb().is_v5());
        assert!(fs.sb().has_ftype());
        let root = fs.iget(fs.sb().rootino).unwrap();
        assert!(root.read().is_dir());
        assert_eq!(root.read().version, 3);
    }
}
