//! The FUSE front-end.
//!
//! [`XfsFuse`] is a thin shim between the kernel's filesystem callbacks and
//! the volume engine: it maps FUSE node ids to inode numbers, marshals
//! arguments, and converts engine errors to negative errnos. The FUSE
//! session dispatches requests one at a time through `&mut self`, which is
//! the serialization the engine requires.
//!
//! Extended attributes are stubbed: listing returns an empty set, reads
//! report no such attribute, writes report not supported.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};

use crate::errors::XfsError;
use crate::fs::xfs::inode::{DataFork, FileType, Inode, InodeRef, Timestamp};
use crate::fs::xfs::{dir, ops, XfsFs};
use crate::io::BB_SHIFT;

/// Kernel cache validity for attributes and entries.
const TTL: Duration = Duration::from_secs(1);

/// The FUSE node id of the filesystem root.
const FUSE_ROOT_ID: u64 = 1;

/// The mounted filesystem, wrapped for FUSE dispatch.
pub struct XfsFuse {
    fs: XfsFs,
}

impl XfsFuse {
    pub fn new(fs: XfsFs) -> Self {
        Self { fs }
    }

    /// Maps a FUSE node id to an inode number.
    fn ino_of(&self, nodeid: u64) -> u64 {
        if nodeid == FUSE_ROOT_ID {
            self.fs.sb().rootino
        } else {
            nodeid
        }
    }

    fn iget(&self, nodeid: u64) -> Result<InodeRef, XfsError> {
        self.fs.iget(self.ino_of(nodeid))
    }

    fn attr_of(&self, inode: &Inode) -> FileAttr {
        let kind = match inode.file_type() {
            Ok(t) => fuse_kind(t),
            Err(_) => fuser::FileType::RegularFile,
        };
        let rdev = match &inode.fork {
            DataFork::Dev(dev) => *dev,
            _ => 0,
        };

        FileAttr {
            ino: inode.ino,
            size: inode.size,
            blocks: inode.nblocks << (self.fs.sb().blocklog - BB_SHIFT as u8),
            atime: systime(inode.atime),
            mtime: systime(inode.mtime),
            ctime: systime(inode.ctime),
            crtime: systime(inode.crtime),
            kind,
            perm: inode.mode & 0o7777,
            nlink: inode.nlink,
            uid: inode.uid,
            gid: inode.gid,
            rdev,
            blksize: self.fs.sb().blocksize,
            flags: 0,
        }
    }

    fn entry_reply(&self, handle: &InodeRef, reply: ReplyEntry) {
        let inode = handle.read();
        reply.entry(&TTL, &self.attr_of(&inode), inode.gen.into());
    }
}

fn fuse_kind(t: FileType) -> fuser::FileType {
    match t {
        FileType::Regular => fuser::FileType::RegularFile,
        FileType::Directory => fuser::FileType::Directory,
        FileType::Symlink => fuser::FileType::Symlink,
        FileType::CharDev => fuser::FileType::CharDevice,
        FileType::BlockDev => fuser::FileType::BlockDevice,
        FileType::Fifo => fuser::FileType::NamedPipe,
        FileType::Socket => fuser::FileType::Socket,
    }
}

fn systime(ts: Timestamp) -> SystemTime {
    if ts.sec >= 0 {
        UNIX_EPOCH + Duration::new(ts.sec as u64, ts.nsec)
    } else {
        UNIX_EPOCH - Duration::new(ts.sec.unsigned_abs(), 0) + Duration::from_nanos(ts.nsec.into())
    }
}

fn timestamp(t: SystemTime) -> Timestamp {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => Timestamp {
            sec: d.as_secs() as i64,
            nsec: d.subsec_nanos(),
        },
        Err(err) => Timestamp {
            sec: -(err.duration().as_secs() as i64),
            nsec: 0,
        },
    }
}

fn time_or_now(t: TimeOrNow) -> Timestamp {
    match t {
        TimeOrNow::SpecificTime(t) => timestamp(t),
        TimeOrNow::Now => Timestamp::now(),
    }
}

impl Filesystem for XfsFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        Ok(())
    }

    fn destroy(&mut self) {
        if let Err(err) = self.fs.sync() {
            log::error!("final sync failed: {err}");
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let result = self.iget(parent).and_then(|dir_ip| {
            let (ino, _) = dir::lookup(&self.fs, &dir_ip.read(), name.as_bytes())?;
            self.fs.iget(ino)
        });
        match result {
            Ok(handle) => self.entry_reply(&handle, reply),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.iget(ino) {
            Ok(handle) => reply.attr(&TTL, &self.attr_of(&handle.read())),
            Err(err) => reply.error(err.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let result = self.iget(ino).and_then(|handle| {
            if let Some(mode) = mode {
                ops::setattr_mode(&self.fs, &handle, mode as u16)?;
            }
            if uid.is_some() || gid.is_some() {
                ops::setattr_owner(&self.fs, &handle, uid, gid)?;
            }
            if let Some(size) = size {
                ops::truncate(&self.fs, &handle, size)?;
            }
            if atime.is_some() || mtime.is_some() {
                ops::setattr_times(
                    &self.fs,
                    &handle,
                    atime.map(time_or_now),
                    mtime.map(time_or_now),
                )?;
            }
            Ok(handle)
        });
        match result {
            Ok(handle) => reply.attr(&TTL, &self.attr_of(&handle.read())),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let result = self
            .iget(ino)
            .and_then(|handle| ops::read_link(&self.fs, &handle));
        match result {
            Ok(target) => reply.data(&target),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let mode = (mode & !umask) as u16;
        let result = self.iget(parent).and_then(|dir_ip| {
            ops::create(
                &self.fs,
                &dir_ip,
                name.as_bytes(),
                mode,
                rdev,
                req.uid(),
                req.gid(),
            )
        });
        match result {
            Ok(handle) => self.entry_reply(&handle, reply),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let mode = (mode & !umask) as u16;
        let result = self.iget(parent).and_then(|dir_ip| {
            ops::mkdir(
                &self.fs,
                &dir_ip,
                name.as_bytes(),
                mode,
                req.uid(),
                req.gid(),
            )
        });
        match result {
            Ok(handle) => self.entry_reply(&handle, reply),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self
            .iget(parent)
            .and_then(|dir_ip| ops::unlink(&self.fs, &dir_ip, name.as_bytes()));
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self
            .iget(parent)
            .and_then(|dir_ip| ops::rmdir(&self.fs, &dir_ip, name.as_bytes()));
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let result = self.iget(parent).and_then(|dir_ip| {
            ops::symlink(
                &self.fs,
                &dir_ip,
                link_name.as_bytes(),
                target.as_os_str().as_bytes(),
                req.uid(),
                req.gid(),
            )
        });
        match result {
            Ok(handle) => self.entry_reply(&handle, reply),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let result = self.iget(parent).and_then(|src_dir| {
            let dst_dir = self.iget(newparent)?;
            ops::rename(
                &self.fs,
                &src_dir,
                name.as_bytes(),
                &dst_dir,
                newname.as_bytes(),
            )
        });
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let result = self.iget(ino).and_then(|target| {
            let dir_ip = self.iget(newparent)?;
            ops::link(&self.fs, &target, &dir_ip, newname.as_bytes())?;
            Ok(target)
        });
        match result {
            Ok(handle) => self.entry_reply(&handle, reply),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let result = self.iget(ino).and_then(|handle| {
            let mut buf = vec![0u8; size as usize];
            let n = ops::read_file(&self.fs, &handle, offset as u64, &mut buf)?;
            buf.truncate(n);
            Ok(buf)
        });
        match result {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(err.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let result = self
            .iget(ino)
            .and_then(|handle| ops::write_file(&self.fs, &handle, offset as u64, data));
        match result {
            Ok(written) => reply.written(written as u32),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        // Logged buffers are written at transaction commit.
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        // Commit already writes through; nothing is deferred.
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let handle = match self.iget(ino) {
            Ok(handle) => handle,
            Err(err) => return reply.error(err.errno()),
        };
        let inode = handle.read();
        let result = dir::readdir(&self.fs, &inode, offset as u32, |entry| {
            let kind = entry
                .ftype
                .map(fuse_kind)
                .unwrap_or(fuser::FileType::RegularFile);
            // Resume after this entry: dataptrs are at least two units
            // apart, so +1 never collides with the next one.
            reply.add(
                entry.ino,
                i64::from(entry.dataptr) + 1,
                kind,
                OsStr::from_bytes(&entry.name),
            )
        });
        match result {
            Ok(_) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let st = self.fs.statfs();
        reply.statfs(
            st.blocks,
            st.bfree,
            st.bfree,
            st.files,
            st.ffree,
            st.blocksize,
            st.namelen,
            st.blocksize,
        );
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(XfsError::NotSupported.errno());
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _size: u32,
        reply: ReplyXattr,
    ) {
        reply.error(libc::ENODATA);
    }

    fn listxattr(&mut self, _req: &Request<'_>, _ino: u64, size: u32, reply: ReplyXattr) {
        if size == 0 {
            reply.size(0);
        } else {
            reply.data(&[]);
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, _ino: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::ENODATA);
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let mode = (mode & !umask) as u16;
        let result = self.iget(parent).and_then(|dir_ip| {
            ops::create(
                &self.fs,
                &dir_ip,
                name.as_bytes(),
                mode,
                0,
                req.uid(),
                req.gid(),
            )
        });
        match result {
            Ok(handle) => {
                let inode = handle.read();
                reply.created(&TTL, &self.attr_of(&inode), inode.gen.into(), 0, 0);
            }
            Err(err) => reply.error(err.errno()),
        }
    }
}
