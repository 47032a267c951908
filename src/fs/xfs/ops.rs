//! The POSIX-facing operation surface of the volume engine.
//!
//! Every mutating operation follows the same skeleton: check the mount is
//! writable, look up and join the inodes involved, reserve, mutate through
//! the directory and allocator layers, log, finish deferred frees, commit.
//! Any failure after joining cancels the transaction, which rolls every
//! touched structure back.
//!
//! Inode handles are guards: functions taking `&InodeRef` never release the
//! caller's reference, and handles created here (new inodes) enter the
//! inode cache only once the creating transaction has committed.

use crate::errors::{CanFail, IOResult, XfsError};
use crate::fs::xfs::alloc;
use crate::fs::xfs::dir;
use crate::fs::xfs::extent::{self, ExtentRec};
use crate::fs::xfs::inode::{
    DataFork, FileType, Inode, InodeRef, Timestamp, DIFLAG2_BIGTIME, NULLAGINO, S_IFDIR, S_IFLNK,
    S_IFMT,
};
use crate::fs::xfs::trans::{TransType, Transaction};
use crate::fs::xfs::XfsFs;

/// Longest symlink target stored.
pub const MAX_SYMLINK_LEN: usize = 1024;

/// Largest number of blocks written per transaction.
const WRITE_CHUNK_BLOCKS: u64 = 16;

/// `setuid`/`setgid` mode bits, cleared on ownership changes.
const MODE_SUID: u16 = 0o4000;
const MODE_SGID: u16 = 0o2000;

/// Block reservation covering directory growth (a data block, a leaf
/// block and slack for a format promotion).
fn dir_space_res(fs: &XfsFs) -> u64 {
    4 * u64::from(fs.sb().fsb_per_dirblk())
}

/// Block reservation covering a possible inode-chunk allocation.
fn ichunk_res(fs: &XfsFs) -> u64 {
    u64::from(fs.sb().blocks_per_ichunk())
}

/// Builds the in-memory core of a freshly allocated inode.
fn init_inode(fs: &XfsFs, ino: u64, gen: u32, mode: u16, nlink: u32, uid: u32, gid: u32, rdev: u32) -> IOResult<Inode> {
    let sb = fs.sb();
    let now = Timestamp::now();
    let ftype = FileType::from_mode(mode).map_err(|_| XfsError::Invalid)?;
    let fork = match ftype {
        FileType::CharDev | FileType::BlockDev | FileType::Fifo | FileType::Socket => {
            DataFork::Dev(rdev)
        }
        _ => DataFork::Extents(Vec::new()),
    };

    Ok(Inode {
        ino,
        version: if sb.is_v5() { 3 } else { 2 },
        mode,
        uid,
        gid,
        nlink,
        projid: 0,
        flushiter: 0,
        atime: now,
        mtime: now,
        ctime: now,
        crtime: now,
        size: 0,
        nblocks: 0,
        extsize: 0,
        forkoff: 0,
        aformat: 2,
        flags: 0,
        flags2: if sb.has_bigtime() { DIFLAG2_BIGTIME } else { 0 },
        gen,
        next_unlinked: NULLAGINO,
        changecount: 0,
        fork,
        attr_raw: Vec::new(),
        anextents: 0,
        btree_nextents: 0,
    })
}

/// Queues every block of the inode's data fork (and of the fork's own
/// B-tree, if any) for freeing.
fn free_all_blocks(fs: &XfsFs, tp: &mut Transaction, ip: &InodeRef) -> CanFail<XfsError> {
    let (extents, tree_blocks) = {
        let inode = ip.read();
        match &inode.fork {
            DataFork::Extents(_) | DataFork::Btree(_) => {
                extent::fork_extents_and_blocks(fs, &inode)?
            }
            _ => (Vec::new(), Vec::new()),
        }
    };
    for ext in &extents {
        if !ext.is_hole() {
            tp.defer_free(ext.startblock, ext.blockcount);
        }
    }
    for blk in tree_blocks {
        tp.defer_free(blk, 1);
    }
    {
        let mut inode = ip.write();
        inode.fork = DataFork::Extents(Vec::new());
        inode.nblocks = 0;
        inode.size = 0;
    }
    Ok(())
}

/// Reads file bytes. Holes and unwritten extents read as zeros; the result
/// is clamped to the file size.
pub fn read_file(fs: &XfsFs, ip: &InodeRef, offset: u64, buf: &mut [u8]) -> IOResult<usize> {
    let inode = ip.read();
    if !inode.is_reg() {
        return Err(XfsError::Invalid);
    }
    if offset >= inode.size {
        return Ok(0);
    }
    let len = buf.len().min((inode.size - offset) as usize);
    let extents = extent::fork_extents(fs, &inode)?;
    extent::read_extents(fs, &extents, offset, &mut buf[..len])?;
    Ok(len)
}

/// Reads a symlink target.
pub fn read_link(fs: &XfsFs, ip: &InodeRef) -> IOResult<Vec<u8>> {
    let inode = ip.read();
    if !inode.is_symlink() {
        return Err(XfsError::Invalid);
    }
    match &inode.fork {
        DataFork::Local(data) => Ok(data.clone()),
        DataFork::Extents(_) | DataFork::Btree(_) => {
            let extents = extent::fork_extents(fs, &inode)?;
            let mut buf = vec![0u8; inode.size as usize];
            extent::read_extents(fs, &extents, 0, &mut buf)?;
            Ok(buf)
        }
        _ => Err(XfsError::Io),
    }
}

/// Creates a regular file, FIFO, socket or device node under `parent`.
pub fn create(
    fs: &XfsFs,
    parent: &InodeRef,
    name: &[u8],
    mode: u16,
    rdev: u32,
    uid: u32,
    gid: u32,
) -> IOResult<InodeRef> {
    fs.check_writable()?;
    {
        let dir_inode = parent.read();
        if !dir_inode.is_dir() {
            return Err(XfsError::NotDirectory);
        }
        if dir::lookup(fs, &dir_inode, name).is_ok() {
            return Err(XfsError::Exists);
        }
    }
    let ftype = FileType::from_mode(mode).map_err(|_| XfsError::Invalid)?;
    if ftype == FileType::Directory {
        return Err(XfsError::Invalid);
    }

    let mut tp = Transaction::allocate(fs, TransType::Create)?;
    tp.reserve(ichunk_res(fs) + dir_space_res(fs))?;

    let agno = fs.sb().ino_split(parent.read().ino).0;
    let (ino, old_gen) = alloc::ialloc(fs, &mut tp, agno)?;
    let inode = init_inode(fs, ino, old_gen.wrapping_add(1), mode, 1, uid, gid, rdev)?;
    let handle = InodeRef::new(spin::RwLock::new(inode));

    tp.join(parent);
    tp.join(&handle);

    dir::create_name(fs, &mut tp, parent, name, ino, ftype)?;
    parent.write().touch(true, true);
    tp.log_inode(parent);
    tp.log_inode(&handle);

    tp.bmap_finish()?;
    tp.commit()?;
    fs.cache_inode(&handle);
    Ok(handle)
}

/// Creates a directory under `parent`, initialized with `.` and `..`.
pub fn mkdir(
    fs: &XfsFs,
    parent: &InodeRef,
    name: &[u8],
    mode: u16,
    uid: u32,
    gid: u32,
) -> IOResult<InodeRef> {
    fs.check_writable()?;
    {
        let dir_inode = parent.read();
        if !dir_inode.is_dir() {
            return Err(XfsError::NotDirectory);
        }
        if dir::lookup(fs, &dir_inode, name).is_ok() {
            return Err(XfsError::Exists);
        }
    }

    let mut tp = Transaction::allocate(fs, TransType::Mkdir)?;
    tp.reserve(ichunk_res(fs) + dir_space_res(fs))?;

    let parent_ino = parent.read().ino;
    let agno = fs.sb().ino_split(parent_ino).0;
    let (ino, old_gen) = alloc::ialloc(fs, &mut tp, agno)?;
    let mode = (mode & !S_IFMT) | S_IFDIR;
    let mut inode = init_inode(fs, ino, old_gen.wrapping_add(1), mode, 1, uid, gid, 0)?;
    // `.` counts as the second link.
    inode.nlink = 2;
    dir::dir_init(fs.sb(), &mut inode, parent_ino);
    let handle = InodeRef::new(spin::RwLock::new(inode));

    tp.join(parent);
    tp.join(&handle);

    dir::create_name(fs, &mut tp, parent, name, ino, FileType::Directory)?;
    {
        let mut p = parent.write();
        // The new `..` entry references the parent.
        p.nlink += 1;
        p.touch(true, true);
    }
    tp.log_inode(parent);
    tp.log_inode(&handle);

    tp.bmap_finish()?;
    tp.commit()?;
    fs.cache_inode(&handle);
    Ok(handle)
}

/// Removes a non-directory entry. When the link count reaches zero the
/// inode and its blocks are freed within the same transaction.
pub fn unlink(fs: &XfsFs, parent: &InodeRef, name: &[u8]) -> CanFail<XfsError> {
    fs.check_writable()?;
    let (ino, _) = {
        let dir_inode = parent.read();
        if !dir_inode.is_dir() {
            return Err(XfsError::NotDirectory);
        }
        dir::lookup(fs, &dir_inode, name)?
    };
    let target = fs.iget(ino)?;
    if target.read().is_dir() {
        return Err(XfsError::IsDirectory);
    }

    let mut tp = Transaction::allocate(fs, TransType::Remove)?;
    tp.reserve(0)?;
    tp.join(parent);
    tp.join(&target);

    dir::remove_name(fs, &mut tp, parent, name, ino)?;

    let freed = {
        let mut t = target.write();
        t.nlink -= 1;
        t.touch(false, true);
        t.nlink == 0
    };
    if freed {
        free_all_blocks(fs, &mut tp, &target)?;
        alloc::ifree(fs, &mut tp, ino)?;
        let mut t = target.write();
        t.mode = 0;
    }
    parent.write().touch(true, true);
    tp.log_inode(parent);
    tp.log_inode(&target);

    tp.bmap_finish()?;
    tp.commit()?;
    if freed {
        fs.forget_inode(ino);
    }
    Ok(())
}

/// Removes an empty directory.
pub fn rmdir(fs: &XfsFs, parent: &InodeRef, name: &[u8]) -> CanFail<XfsError> {
    fs.check_writable()?;
    if name == b"." || name == b".." {
        return Err(XfsError::Invalid);
    }
    let (ino, _) = {
        let dir_inode = parent.read();
        if !dir_inode.is_dir() {
            return Err(XfsError::NotDirectory);
        }
        dir::lookup(fs, &dir_inode, name)?
    };
    let target = fs.iget(ino)?;
    {
        let t = target.read();
        if !t.is_dir() {
            return Err(XfsError::NotDirectory);
        }
        // Emptiness is decided by scanning the live entries, not by the
        // link count alone.
        if t.nlink > 2 || !dir::is_empty(fs, &t)? {
            return Err(XfsError::NotEmpty);
        }
    }

    let mut tp = Transaction::allocate(fs, TransType::Rmdir)?;
    tp.reserve(0)?;
    tp.join(parent);
    tp.join(&target);

    dir::remove_name(fs, &mut tp, parent, name, ino)?;

    free_all_blocks(fs, &mut tp, &target)?;
    alloc::ifree(fs, &mut tp, ino)?;
    {
        let mut t = target.write();
        t.nlink = 0;
        t.mode = 0;
        t.touch(false, true);
    }
    {
        // The removed `..` no longer references the parent.
        let mut p = parent.write();
        p.nlink -= 1;
        p.touch(true, true);
    }
    tp.log_inode(parent);
    tp.log_inode(&target);

    tp.bmap_finish()?;
    tp.commit()?;
    fs.forget_inode(ino);
    Ok(())
}

/// Renames `src_name` in `src_dir` to `dst_name` in `dst_dir`, replacing
/// an existing destination when the types are compatible.
pub fn rename(
    fs: &XfsFs,
    src_dir: &InodeRef,
    src_name: &[u8],
    dst_dir: &InodeRef,
    dst_name: &[u8],
) -> CanFail<XfsError> {
    fs.check_writable()?;
    if src_name == b"." || src_name == b".." || dst_name == b"." || dst_name == b".." {
        return Err(XfsError::Invalid);
    }
    let same_dir = src_dir.read().ino == dst_dir.read().ino;

    let (src_ino, _) = dir::lookup(fs, &src_dir.read(), src_name)?;
    let src_ip = fs.iget(src_ino)?;
    let src_is_dir = src_ip.read().is_dir();

    // Resolve the destination, if it exists.
    let dst_ip = match dir::lookup(fs, &dst_dir.read(), dst_name) {
        Ok((dst_ino, _)) => {
            if dst_ino == src_ino {
                return Ok(());
            }
            let ip = fs.iget(dst_ino)?;
            let dst_is_dir = ip.read().is_dir();
            if src_is_dir != dst_is_dir {
                return Err(if dst_is_dir {
                    XfsError::IsDirectory
                } else {
                    XfsError::NotDirectory
                });
            }
            if dst_is_dir && (ip.read().nlink > 2 || !dir::is_empty(fs, &ip.read())?) {
                return Err(XfsError::NotEmpty);
            }
            Some(ip)
        }
        Err(XfsError::NoEntry) => None,
        Err(err) => return Err(err),
    };

    let mut tp = Transaction::allocate(fs, TransType::Rename)?;
    tp.reserve(dir_space_res(fs))?;
    tp.join(src_dir);
    if !same_dir {
        tp.join(dst_dir);
    }
    tp.join(&src_ip);
    if let Some(dst_ip) = &dst_ip {
        tp.join(dst_ip);
    }

    // Replace or create the destination entry, then drop the source one.
    if let Some(dst_ip) = &dst_ip {
        let dst_ino = dst_ip.read().ino;
        dir::remove_name(fs, &mut tp, dst_dir, dst_name, dst_ino)?;
        {
            let mut d = dst_ip.write();
            d.nlink -= 1;
            if d.is_dir() {
                d.nlink = 0;
            }
            d.touch(false, true);
        }
        let freed = {
            let d = dst_ip.read();
            d.nlink == 0
        };
        if freed {
            free_all_blocks(fs, &mut tp, dst_ip)?;
            alloc::ifree(fs, &mut tp, dst_ino)?;
            let mut d = dst_ip.write();
            if d.is_dir() {
                // An emptied directory no longer back-references its
                // parent.
                dst_dir.write().nlink -= 1;
            }
            d.mode = 0;
        }
        tp.log_inode(dst_ip);
    }

    let ftype = src_ip.read().file_type()?;
    dir::create_name(fs, &mut tp, dst_dir, dst_name, src_ino, ftype)?;
    dir::remove_name(fs, &mut tp, src_dir, src_name, src_ino)?;

    if src_is_dir && !same_dir {
        // The moved directory's `..` changes parents, and the parents'
        // link counts follow it.
        let dst_dir_ino = dst_dir.read().ino;
        dir::set_parent(fs, &mut tp, &src_ip, dst_dir_ino)?;
        src_dir.write().nlink -= 1;
        dst_dir.write().nlink += 1;
    }

    src_dir.write().touch(true, true);
    if !same_dir {
        dst_dir.write().touch(true, true);
    }
    src_ip.write().touch(false, true);

    tp.log_inode(src_dir);
    if !same_dir {
        tp.log_inode(dst_dir);
    }
    tp.log_inode(&src_ip);

    tp.bmap_finish()?;
    tp.commit()?;
    if let Some(dst_ip) = &dst_ip {
        let d = dst_ip.read();
        if d.nlink == 0 {
            fs.forget_inode(d.ino);
        }
    }
    Ok(())
}

/// Adds a hard link to an existing non-directory inode.
pub fn link(
    fs: &XfsFs,
    target: &InodeRef,
    new_parent: &InodeRef,
    new_name: &[u8],
) -> CanFail<XfsError> {
    fs.check_writable()?;
    {
        let p = new_parent.read();
        if !p.is_dir() {
            return Err(XfsError::NotDirectory);
        }
        if dir::lookup(fs, &p, new_name).is_ok() {
            return Err(XfsError::Exists);
        }
    }
    let (ino, ftype) = {
        let t = target.read();
        if t.is_dir() {
            return Err(XfsError::IsDirectory);
        }
        if t.nlink >= fs.sb().max_link() {
            return Err(XfsError::TooManyLinks);
        }
        (t.ino, t.file_type()?)
    };

    let mut tp = Transaction::allocate(fs, TransType::Link)?;
    tp.reserve(dir_space_res(fs))?;
    tp.join(new_parent);
    tp.join(target);

    dir::create_name(fs, &mut tp, new_parent, new_name, ino, ftype)?;
    {
        let mut t = target.write();
        t.nlink += 1;
        t.touch(false, true);
    }
    new_parent.write().touch(true, true);
    tp.log_inode(new_parent);
    tp.log_inode(target);

    tp.bmap_finish()?;
    tp.commit()
}

/// Creates a symbolic link holding `target_path`. Short targets stay
/// inline in the inode; longer ones go to allocated blocks.
pub fn symlink(
    fs: &XfsFs,
    parent: &InodeRef,
    name: &[u8],
    target_path: &[u8],
    uid: u32,
    gid: u32,
) -> IOResult<InodeRef> {
    fs.check_writable()?;
    if target_path.is_empty() || target_path.len() > MAX_SYMLINK_LEN {
        return Err(XfsError::NameTooLong);
    }
    {
        let p = parent.read();
        if !p.is_dir() {
            return Err(XfsError::NotDirectory);
        }
        if dir::lookup(fs, &p, name).is_ok() {
            return Err(XfsError::Exists);
        }
    }

    let sb = fs.sb();
    let path_blocks = sb.b_to_fsb(target_path.len() as u64);
    let mut tp = Transaction::allocate(fs, TransType::Symlink)?;
    tp.reserve(ichunk_res(fs) + dir_space_res(fs) + path_blocks)?;

    let agno = sb.ino_split(parent.read().ino).0;
    let (ino, old_gen) = alloc::ialloc(fs, &mut tp, agno)?;
    let mut inode = init_inode(fs, ino, old_gen.wrapping_add(1), S_IFLNK | 0o777, 1, uid, gid, 0)?;
    inode.size = target_path.len() as u64;

    if target_path.len() <= usize::from(sb.inodesize) - inode.hdr_size() {
        inode.fork = DataFork::Local(target_path.to_vec());
        let handle = InodeRef::new(spin::RwLock::new(inode));
        finish_symlink(fs, tp, parent, name, &handle)
    } else {
        let handle = InodeRef::new(spin::RwLock::new(inode));
        tp.join(&handle);
        // Remote target: allocate and fill the needed blocks.
        let mut off_fsb = 0u64;
        while off_fsb < path_blocks {
            let (fsbno, got) = alloc::alloc_extent(fs, &mut tp, agno, path_blocks - off_fsb)?;
            for blk in 0..got {
                let buf = fs
                    .bufs()
                    .get(sb.fsb_to_daddr(fsbno + blk), sb.bb_per_blk())?;
                {
                    let mut guard = buf.write();
                    let data = guard.data_mut();
                    data.fill(0);
                    let start = ((off_fsb + blk) << sb.blocklog) as usize;
                    let end = target_path.len().min(start + sb.blocksize as usize);
                    if start < end {
                        data[..end - start].copy_from_slice(&target_path[start..end]);
                    }
                }
                tp.log_buf(&buf);
            }
            {
                let mut i = handle.write();
                let DataFork::Extents(list) = &mut i.fork else {
                    unreachable!()
                };
                list.push(ExtentRec {
                    startoff: off_fsb,
                    startblock: fsbno,
                    blockcount: got,
                    unwritten: false,
                });
                i.nblocks += got;
            }
            off_fsb += got;
        }
        finish_symlink(fs, tp, parent, name, &handle)
    }
}

fn finish_symlink(
    fs: &XfsFs,
    mut tp: Transaction,
    parent: &InodeRef,
    name: &[u8],
    handle: &InodeRef,
) -> IOResult<InodeRef> {
    tp.join(parent);
    tp.join(handle);

    let ino = handle.read().ino;
    dir::create_name(fs, &mut tp, parent, name, ino, FileType::Symlink)?;
    parent.write().touch(true, true);
    tp.log_inode(parent);
    tp.log_inode(handle);

    tp.bmap_finish()?;
    tp.commit()?;
    fs.cache_inode(handle);
    Ok(handle.clone())
}

/// Truncates a regular file. Shrinking frees every block past the new
/// size; growing just extends the size (the gap reads as a hole).
pub fn truncate(fs: &XfsFs, ip: &InodeRef, size: u64) -> CanFail<XfsError> {
    fs.check_writable()?;
    if !ip.read().is_reg() {
        return Err(XfsError::Invalid);
    }

    let mut tp = Transaction::allocate(fs, TransType::Truncate)?;
    tp.reserve(0)?;
    tp.join(ip);

    let old_size = ip.read().size;
    if size < old_size {
        extent::to_extents_fork(fs, &mut tp, ip)?;
        let sb = fs.sb();
        let keep_fsb = sb.b_to_fsb(size);

        let mut inode = ip.write();
        let DataFork::Extents(list) = &mut inode.fork else {
            return Err(XfsError::Io);
        };
        let mut kept = Vec::with_capacity(list.len());
        let mut freed = 0u64;
        for ext in list.drain(..) {
            if ext.startoff >= keep_fsb {
                freed += ext.blockcount;
                tp.defer_free(ext.startblock, ext.blockcount);
                continue;
            }
            if ext.startoff + ext.blockcount > keep_fsb {
                let keep = keep_fsb - ext.startoff;
                freed += ext.blockcount - keep;
                tp.defer_free(ext.startblock + keep, ext.blockcount - keep);
                kept.push(ExtentRec {
                    blockcount: keep,
                    ..ext
                });
                continue;
            }
            kept.push(ext);
        }
        *list = kept;
        inode.nblocks -= freed;
    }

    {
        let mut inode = ip.write();
        inode.size = size;
        inode.touch(true, true);
    }
    tp.log_inode(ip);

    tp.bmap_finish()?;
    tp.commit()
}

/// Maps the file block at `off_fsb` for writing, allocating when it falls
/// in a hole. Returns the physical block run, its length (capped at
/// `max_count`) and whether it was freshly allocated.
fn map_write_blocks(
    fs: &XfsFs,
    tp: &mut Transaction,
    ip: &InodeRef,
    off_fsb: u64,
    max_count: u64,
) -> IOResult<(u64, u64, bool)> {
    let sb = fs.sb();
    let agno = sb.ino_split(ip.read().ino).0;

    {
        let inode = ip.read();
        let DataFork::Extents(list) = &inode.fork else {
            return Err(XfsError::Io);
        };
        if let Some(ext) = extent::lookup_extent(list, off_fsb) {
            if !ext.unwritten {
                let within = off_fsb - ext.startoff;
                let len = (ext.blockcount - within).min(max_count);
                return Ok((ext.startblock + within, len, false));
            }
        }
    }

    // Unwritten ranges are rewritten in place: carve the covered part out
    // and re-insert it as written.
    let unwritten = {
        let inode = ip.read();
        let DataFork::Extents(list) = &inode.fork else {
            unreachable!()
        };
        extent::lookup_extent(list, off_fsb).filter(|e| e.unwritten)
    };
    if let Some(ext) = unwritten {
        let within = off_fsb - ext.startoff;
        let len = (ext.blockcount - within).min(max_count);
        let mut inode = ip.write();
        let DataFork::Extents(list) = &mut inode.fork else {
            unreachable!()
        };
        carve_written(list, off_fsb, len);
        if !inode.fork_fits(sb) {
            return Err(XfsError::NoSpace);
        }
        return Ok((ext.startblock + within, len, true));
    }

    // Hole: allocate, bounded by the next mapped extent.
    let until_next = {
        let inode = ip.read();
        let DataFork::Extents(list) = &inode.fork else {
            unreachable!()
        };
        list.iter()
            .map(|e| e.startoff)
            .filter(|&s| s > off_fsb)
            .min()
            .map_or(max_count, |s| (s - off_fsb).min(max_count))
    };
    let (fsbno, got) = alloc::alloc_extent(fs, tp, agno, until_next)?;
    {
        let mut inode = ip.write();
        let DataFork::Extents(list) = &mut inode.fork else {
            unreachable!()
        };
        insert_extent(
            list,
            ExtentRec {
                startoff: off_fsb,
                startblock: fsbno,
                blockcount: got,
                unwritten: false,
            },
        );
        inode.nblocks += got;
        if !inode.fork_fits(sb) {
            log::warn!("inode {:#x} fork overflow, write rejected", inode.ino);
            return Err(XfsError::NoSpace);
        }
    }
    Ok((fsbno, got, true))
}

/// Splits an unwritten extent so `[off, off + len)` becomes written.
fn carve_written(list: &mut Vec<ExtentRec>, off: u64, len: u64) {
    let Some(idx) = list.iter().position(|e| e.contains(off)) else {
        return;
    };
    let ext = list.remove(idx);
    let mut parts = Vec::new();
    if off > ext.startoff {
        parts.push(ExtentRec {
            blockcount: off - ext.startoff,
            ..ext
        });
    }
    parts.push(ExtentRec {
        startoff: off,
        startblock: ext.startblock + (off - ext.startoff),
        blockcount: len,
        unwritten: false,
    });
    let end = off + len;
    let ext_end = ext.startoff + ext.blockcount;
    if end < ext_end {
        parts.push(ExtentRec {
            startoff: end,
            startblock: ext.startblock + (end - ext.startoff),
            blockcount: ext_end - end,
            unwritten: true,
        });
    }
    for part in parts.into_iter().rev() {
        list.insert(idx, part);
    }
}

/// Inserts an extent, merging with physically adjacent neighbours.
fn insert_extent(list: &mut Vec<ExtentRec>, rec: ExtentRec) {
    let pos = list.partition_point(|e| e.startoff < rec.startoff);
    list.insert(pos, rec);

    // Merge right then left.
    if pos + 1 < list.len() {
        let (a, b) = (list[pos], list[pos + 1]);
        if a.startoff + a.blockcount == b.startoff
            && a.startblock + a.blockcount == b.startblock
            && a.unwritten == b.unwritten
        {
            list[pos].blockcount += b.blockcount;
            list.remove(pos + 1);
        }
    }
    if pos > 0 {
        let (a, b) = (list[pos - 1], list[pos]);
        if a.startoff + a.blockcount == b.startoff
            && a.startblock + a.blockcount == b.startblock
            && a.unwritten == b.unwritten
        {
            list[pos - 1].blockcount += b.blockcount;
            list.remove(pos);
        }
    }
}

/// Writes file bytes, allocating blocks as needed. Processes at most 16
/// blocks per transaction; on an error after partial progress the byte
/// count written so far is returned.
pub fn write_file(fs: &XfsFs, ip: &InodeRef, offset: u64, data: &[u8]) -> IOResult<usize> {
    fs.check_writable()?;
    if !ip.read().is_reg() {
        return Err(XfsError::Invalid);
    }
    let sb = fs.sb();
    let blocksize = u64::from(sb.blocksize);

    let mut written = 0usize;
    while written < data.len() {
        let cur_offset = offset + written as u64;
        let remaining = (data.len() - written) as u64;
        let chunk = remaining.min(blocksize * WRITE_CHUNK_BLOCKS);

        let start_fsb = sb.b_to_fsbt(cur_offset);
        let count_fsb = (sb.b_to_fsb(cur_offset + chunk) - start_fsb).max(1);

        let result = write_chunk(fs, ip, cur_offset, &data[written..written + chunk as usize], start_fsb, count_fsb);
        match result {
            Ok(len) => written += len,
            Err(err) => {
                return if written > 0 { Ok(written) } else { Err(err) };
            }
        }
    }
    Ok(written)
}

/// One write transaction: maps (or allocates) one contiguous run and
/// copies as much of the chunk as it covers.
fn write_chunk(
    fs: &XfsFs,
    ip: &InodeRef,
    cur_offset: u64,
    chunk: &[u8],
    start_fsb: u64,
    count_fsb: u64,
) -> IOResult<usize> {
    let sb = fs.sb();
    let blocksize = u64::from(sb.blocksize);

    let mut tp = Transaction::allocate(fs, TransType::Write)?;
    tp.reserve(count_fsb)?;
    tp.join(ip);
    extent::to_extents_fork(fs, &mut tp, ip)?;

    let (fsbno, got, fresh) = map_write_blocks(fs, &mut tp, ip, start_fsb, count_fsb)?;

    // Byte window this mapping covers.
    let map_start = start_fsb * blocksize;
    let buf_off = cur_offset - map_start;
    let avail = got * blocksize - buf_off;
    let copy_len = (chunk.len() as u64).min(avail) as usize;

    let mut copied = 0usize;
    while copied < copy_len {
        let abs = buf_off + copied as u64;
        let blk = abs / blocksize;
        let blk_off = (abs % blocksize) as usize;
        let n = (blocksize as usize - blk_off).min(copy_len - copied);

        let daddr = sb.fsb_to_daddr(fsbno + blk);
        // Freshly allocated blocks skip the disk read and are zeroed in
        // full, so bytes from a previous life of the block never surface.
        let buf = if fresh {
            let buf = fs.bufs().get(daddr, sb.bb_per_blk())?;
            tp.log_buf(&buf);
            buf.write().data_mut().fill(0);
            buf
        } else {
            let buf = fs.bufs().read(daddr, sb.bb_per_blk())?;
            tp.log_buf(&buf);
            buf
        };
        buf.write().data_mut()[blk_off..blk_off + n]
            .copy_from_slice(&chunk[copied..copied + n]);
        copied += n;
    }

    {
        let mut inode = ip.write();
        let end = cur_offset + copy_len as u64;
        if end > inode.size {
            inode.size = end;
        }
        inode.touch(true, true);
    }
    tp.log_inode(ip);

    tp.bmap_finish()?;
    tp.commit()?;
    Ok(copy_len)
}

/// Changes permission bits, preserving the file type bits.
pub fn setattr_mode(fs: &XfsFs, ip: &InodeRef, mode: u16) -> CanFail<XfsError> {
    fs.check_writable()?;
    let mut tp = Transaction::allocate(fs, TransType::SetAttr)?;
    tp.reserve(0)?;
    tp.join(ip);
    {
        let mut inode = ip.write();
        inode.mode = (inode.mode & S_IFMT) | (mode & !S_IFMT);
        inode.touch(false, true);
    }
    tp.log_inode(ip);
    tp.commit()
}

/// Changes ownership; changing either id clears the setuid/setgid bits.
pub fn setattr_owner(
    fs: &XfsFs,
    ip: &InodeRef,
    uid: Option<u32>,
    gid: Option<u32>,
) -> CanFail<XfsError> {
    fs.check_writable()?;
    let mut tp = Transaction::allocate(fs, TransType::SetAttr)?;
    tp.reserve(0)?;
    tp.join(ip);
    {
        let mut inode = ip.write();
        if let Some(uid) = uid {
            inode.uid = uid;
        }
        if let Some(gid) = gid {
            inode.gid = gid;
        }
        if uid.is_some() || gid.is_some() {
            inode.mode &= !(MODE_SUID | MODE_SGID);
        }
        inode.touch(false, true);
    }
    tp.log_inode(ip);
    tp.commit()
}

/// Sets access/modification times; the change time always advances.
pub fn setattr_times(
    fs: &XfsFs,
    ip: &InodeRef,
    atime: Option<Timestamp>,
    mtime: Option<Timestamp>,
) -> CanFail<XfsError> {
    fs.check_writable()?;
    let mut tp = Transaction::allocate(fs, TransType::SetAttr)?;
    tp.reserve(0)?;
    tp.join(ip);
    {
        let mut inode = ip.write();
        if let Some(atime) = atime {
            inode.atime = atime;
        }
        if let Some(mtime) = mtime {
            inode.mtime = mtime;
        }
        inode.ctime = Timestamp::now();
    }
    tp.log_inode(ip);
    tp.commit()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fs::xfs::path;
    use crate::fs::xfs::test_img::TestImage;
    use crate::io::device::BlockDevice;

    fn names_of(fs: &XfsFs, dir: &InodeRef) -> Vec<String> {
        let mut names = Vec::new();
        dir::readdir(fs, &dir.read(), 0, |entry| {
            names.push(String::from_utf8_lossy(&entry.name).into_owned());
            false
        })
        .unwrap();
        names
    }

    fn root(fs: &XfsFs) -> InodeRef {
        fs.iget(fs.sb().rootino).unwrap()
    }

    #[test]
    fn readdir_and_read_on_ro_mount() {
        let fs = TestImage::default().mount_ro();
        let root = root(&fs);

        assert_eq!(names_of(&fs, &root), vec![".", "..", "hello.txt"]);

        let file = path::walk(&fs, "/hello.txt").unwrap();
        let mut buf = [0u8; 32];
        let n = read_file(&fs, &file, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"Hello XFS\n");

        // Reads past EOF return nothing.
        assert_eq!(read_file(&fs, &file, 1000, &mut buf).unwrap(), 0);
    }

    #[test]
    fn create_write_read_remount() {
        let fs = TestImage::new().empty().mount_rw();
        let root = root(&fs);

        let file = create(&fs, &root, b"a", crate::fs::xfs::inode::S_IFREG | 0o644, 0, 0, 0).unwrap();
        assert_eq!(write_file(&fs, &file, 0, b"abc").unwrap(), 3);
        assert_eq!(file.read().size, 3);

        let mut buf = [0u8; 8];
        let n = read_file(&fs, &file, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"abc");

        // Remount read-only from the synced image: same content.
        fs.sync().unwrap();
        let img = fs.device().image_snapshot().unwrap();
        fs.unmount().unwrap();

        let fs2 = XfsFs::mount(BlockDevice::from_image(img, true), true).unwrap();
        let file2 = path::walk(&fs2, "/a").unwrap();
        assert_eq!(file2.read().size, 3);
        let n = read_file(&fs2, &file2, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"abc");
    }

    #[test]
    fn mkdir_rmdir_emptiness() {
        let fs = TestImage::new().empty().mount_rw();
        let root = root(&fs);

        let d = mkdir(&fs, &root, b"d", 0o755, 0, 0).unwrap();
        assert_eq!(root.read().nlink, 3);
        assert_eq!(d.read().nlink, 2);

        create(&fs, &d, b"x", crate::fs::xfs::inode::S_IFREG | 0o600, 0, 0, 0).unwrap();
        assert_eq!(rmdir(&fs, &root, b"d").unwrap_err(), XfsError::NotEmpty);

        unlink(&fs, &d, b"x").unwrap();
        rmdir(&fs, &root, b"d").unwrap();
        assert_eq!(root.read().nlink, 2);
        assert!(!names_of(&fs, &root).contains(&"d".to_string()));
    }

    #[test]
    fn hard_links() {
        let fs = TestImage::new().empty().mount_rw();
        let root = root(&fs);

        let old = create(&fs, &root, b"old", crate::fs::xfs::inode::S_IFREG | 0o644, 0, 0, 0).unwrap();
        write_file(&fs, &old, 0, b"payload").unwrap();
        link(&fs, &old, &root, b"new").unwrap();
        assert_eq!(old.read().nlink, 2);

        let new = path::walk(&fs, "/new").unwrap();
        assert_eq!(new.read().ino, old.read().ino);

        unlink(&fs, &root, b"old").unwrap();
        assert_eq!(new.read().nlink, 1);

        let mut buf = [0u8; 16];
        let n = read_file(&fs, &new, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"payload");
    }

    #[test]
    fn link_rejects_directories() {
        let fs = TestImage::new().empty().mount_rw();
        let root = root(&fs);
        let d = mkdir(&fs, &root, b"d", 0o755, 0, 0).unwrap();
        assert_eq!(
            link(&fs, &d, &root, b"d2").unwrap_err(),
            XfsError::IsDirectory
        );
    }

    #[test]
    fn symlink_inline_and_remote() {
        let fs = TestImage::new().empty().mount_rw();
        let root = root(&fs);

        let short = symlink(&fs, &root, b"lnk", b"../target", 0, 0).unwrap();
        assert!(matches!(short.read().fork, DataFork::Local(_)));
        assert_eq!(short.read().size, 9);
        assert_eq!(read_link(&fs, &short).unwrap(), b"../target");

        // A target longer than the inode literal area goes to blocks.
        let long_target = vec![b'x'; 600];
        let long = symlink(&fs, &root, b"lnk2", &long_target, 0, 0).unwrap();
        assert!(matches!(long.read().fork, DataFork::Extents(_)));
        assert_eq!(read_link(&fs, &long).unwrap(), long_target);
    }

    #[test]
    fn read_only_mount_rejects_mutation_and_stays_pristine() {
        let image = TestImage::default().build();
        let fs = XfsFs::mount(BlockDevice::from_image(image.clone(), true), true).unwrap();
        let root = root(&fs);

        assert_eq!(
            create(&fs, &root, b"x", crate::fs::xfs::inode::S_IFREG | 0o644, 0, 0, 0).unwrap_err(),
            XfsError::ReadOnly
        );
        assert_eq!(mkdir(&fs, &root, b"x", 0o755, 0, 0).unwrap_err(), XfsError::ReadOnly);
        assert_eq!(unlink(&fs, &root, b"hello.txt").unwrap_err(), XfsError::ReadOnly);
        let file = path::walk(&fs, "/hello.txt").unwrap();
        assert_eq!(write_file(&fs, &file, 0, b"z").unwrap_err(), XfsError::ReadOnly);
        assert_eq!(truncate(&fs, &file, 0).unwrap_err(), XfsError::ReadOnly);
        assert_eq!(setattr_mode(&fs, &file, 0o600).unwrap_err(), XfsError::ReadOnly);

        // Byte-for-byte identical device.
        assert_eq!(fs.device().image_snapshot().unwrap(), image);
    }

    #[test]
    fn write_extends_and_truncate_frees() {
        let fs = TestImage::new().empty().mount_rw();
        let root = root(&fs);
        let file = create(&fs, &root, b"f", crate::fs::xfs::inode::S_IFREG | 0o644, 0, 0, 0).unwrap();

        // Cross the end of file: size follows the write.
        let chunk = vec![7u8; 5000];
        assert_eq!(write_file(&fs, &file, 0, &chunk).unwrap(), 5000);
        assert_eq!(file.read().size, 5000);
        assert_eq!(file.read().nblocks, 2);

        // A sparse write leaves a hole that reads back as zeros.
        assert_eq!(write_file(&fs, &file, 20000, b"tail").unwrap(), 4);
        assert_eq!(file.read().size, 20004);
        let mut buf = vec![0u8; 8];
        read_file(&fs, &file, 10000, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 8]);
        read_file(&fs, &file, 20000, &mut buf).unwrap();
        assert_eq!(&buf[..4], b"tail");

        let free_before = fs.counters().fdblocks;
        truncate(&fs, &file, 0).unwrap();
        assert_eq!(file.read().size, 0);
        assert_eq!(file.read().nblocks, 0);
        assert!(fs.counters().fdblocks > free_before);
    }

    #[test]
    fn rename_within_and_across_dirs() {
        let fs = TestImage::new().empty().mount_rw();
        let root = root(&fs);

        let f = create(&fs, &root, b"src", crate::fs::xfs::inode::S_IFREG | 0o644, 0, 0, 0).unwrap();
        let f_ino = f.read().ino;
        rename(&fs, &root, b"src", &root, b"dst").unwrap();
        assert_eq!(path::walk(&fs, "/dst").unwrap().read().ino, f_ino);
        assert_eq!(path::walk(&fs, "/src").unwrap_err(), XfsError::NoEntry);

        // Move a directory to a new parent: `..` and the link counts
        // follow.
        let a = mkdir(&fs, &root, b"a", 0o755, 0, 0).unwrap();
        let b = mkdir(&fs, &root, b"b", 0o755, 0, 0).unwrap();
        let sub = mkdir(&fs, &a, b"sub", 0o755, 0, 0).unwrap();
        let sub_ino = sub.read().ino;
        assert_eq!(a.read().nlink, 3);

        rename(&fs, &a, b"sub", &b, b"sub").unwrap();
        assert_eq!(a.read().nlink, 2);
        assert_eq!(b.read().nlink, 3);
        assert_eq!(path::walk(&fs, "/b/sub").unwrap().read().ino, sub_ino);
        let (dotdot, _) = dir::lookup(&fs, &sub.read(), b"..").unwrap();
        assert_eq!(dotdot, b.read().ino);
    }

    #[test]
    fn rename_onto_existing() {
        let fs = TestImage::new().empty().mount_rw();
        let root = root(&fs);

        let a = create(&fs, &root, b"a", crate::fs::xfs::inode::S_IFREG | 0o644, 0, 0, 0).unwrap();
        let b = create(&fs, &root, b"b", crate::fs::xfs::inode::S_IFREG | 0o644, 0, 0, 0).unwrap();
        let a_ino = a.read().ino;
        let ifree = fs.counters().ifree;

        rename(&fs, &root, b"a", &root, b"b").unwrap();
        assert_eq!(path::walk(&fs, "/b").unwrap().read().ino, a_ino);
        assert_eq!(b.read().nlink, 0);
        // The replaced inode was freed.
        assert_eq!(fs.counters().ifree, ifree + 1);

        // Directory targets must be empty.
        let d1 = mkdir(&fs, &root, b"d1", 0o755, 0, 0).unwrap();
        mkdir(&fs, &root, b"d2", 0o755, 0, 0).unwrap();
        create(&fs, &d1, b"x", crate::fs::xfs::inode::S_IFREG | 0o600, 0, 0, 0).unwrap();
        assert_eq!(
            rename(&fs, &root, b"d2", &root, b"d1").unwrap_err(),
            XfsError::NotEmpty
        );
    }

    #[test]
    fn setattr_semantics() {
        let fs = TestImage::new().empty().mount_rw();
        let root = root(&fs);
        let f = create(
            &fs,
            &root,
            b"f",
            crate::fs::xfs::inode::S_IFREG | MODE_SUID | 0o755,
            0,
            1000,
            1000,
        )
        .unwrap();

        setattr_mode(&fs, &f, 0o600).unwrap();
        assert_eq!(f.read().mode, crate::fs::xfs::inode::S_IFREG | 0o600);

        // Ownership change clears setuid/setgid.
        setattr_mode(&fs, &f, MODE_SUID | MODE_SGID | 0o755).unwrap();
        setattr_owner(&fs, &f, Some(0), None).unwrap();
        let inode = f.read();
        assert_eq!(inode.uid, 0);
        assert_eq!(inode.gid, 1000);
        assert_eq!(inode.mode & (MODE_SUID | MODE_SGID), 0);
        drop(inode);

        let when = Timestamp { sec: 1_600_000_000, nsec: 42 };
        setattr_times(&fs, &f, Some(when), Some(when)).unwrap();
        assert_eq!(f.read().atime, when);
        assert_eq!(f.read().mtime, when);
    }

    #[test]
    fn directory_format_promotion_and_demotion() {
        let fs = TestImage::new().empty().mount_rw();
        let root = root(&fs);

        // Grow far past the short-form and single-block capacities.
        let count = 200u32;
        for i in 0..count {
            let name = format!("file-{i:04}");
            create(&fs, &root, name.as_bytes(), crate::fs::xfs::inode::S_IFREG | 0o644, 0, 0, 0)
                .unwrap();
        }
        assert!(matches!(root.read().fork, DataFork::Extents(_)));

        // Everything stays reachable by lookup and readdir.
        let names = names_of(&fs, &root);
        assert_eq!(names.len(), 2 + count as usize);
        for i in 0..count {
            let name = format!("file-{i:04}");
            dir::lookup(&fs, &root.read(), name.as_bytes()).unwrap();
        }

        // Shrink back down: the directory demotes to short form again.
        for i in 0..count {
            let name = format!("file-{i:04}");
            unlink(&fs, &root, name.as_bytes()).unwrap();
        }
        assert_eq!(names_of(&fs, &root), vec![".", ".."]);
        assert!(matches!(root.read().fork, DataFork::Local(_)));
    }

    #[test]
    fn readdir_cursor_pagination() {
        let fs = TestImage::new().empty().mount_rw();
        let root = root(&fs);
        for i in 0..20u32 {
            let name = format!("e{i:02}");
            create(&fs, &root, name.as_bytes(), crate::fs::xfs::inode::S_IFREG | 0o644, 0, 0, 0)
                .unwrap();
        }

        // Walk the directory three entries at a time, resuming from the
        // last cookie; the union must be exactly the full listing.
        let mut collected = Vec::new();
        let mut cursor = 0u32;
        loop {
            let mut page = Vec::new();
            dir::readdir(&fs, &root.read(), cursor, |entry| {
                if page.len() == 3 {
                    return true;
                }
                page.push((entry.name.clone(), entry.dataptr));
                false
            })
            .unwrap();
            if page.is_empty() {
                break;
            }
            cursor = page.last().unwrap().1 + 1;
            collected.extend(page.into_iter().map(|(n, _)| n));
        }
        assert_eq!(collected.len(), 22);
        assert_eq!(collected[0], b".".to_vec());
        assert_eq!(collected[1], b"..".to_vec());
    }

    #[test]
    fn refcounts_balance_across_operations() {
        let fs = TestImage::new().empty().mount_rw();
        let rootino = fs.sb().rootino;
        let root = fs.iget(rootino).unwrap();
        let before = fs.inode_refcount(rootino).unwrap();

        let f = create(&fs, &root, b"f", crate::fs::xfs::inode::S_IFREG | 0o644, 0, 0, 0).unwrap();
        write_file(&fs, &f, 0, b"data").unwrap();
        let f_ino = f.read().ino;
        drop(f);
        unlink(&fs, &root, b"f").unwrap();

        assert_eq!(fs.inode_refcount(rootino).unwrap(), before);
        assert_eq!(fs.inode_refcount(f_ino), None);
    }

    #[test]
    fn v5_mutations_keep_checksums_valid() {
        let fs = TestImage::new().v5(true).empty().mount_rw();
        let root = root(&fs);

        let f = create(&fs, &root, b"file", crate::fs::xfs::inode::S_IFREG | 0o644, 0, 0, 0).unwrap();
        write_file(&fs, &f, 0, b"v5 data").unwrap();
        mkdir(&fs, &root, b"dir", 0o755, 0, 0).unwrap();

        // Remount: every CRC (superblock, AG headers, inodes) verifies on
        // the way back in.
        fs.sync().unwrap();
        let img = fs.device().image_snapshot().unwrap();
        fs.unmount().unwrap();

        let fs2 = XfsFs::mount(BlockDevice::from_image(img, false), false).unwrap();
        let f2 = path::walk(&fs2, "/file").unwrap();
        let mut buf = [0u8; 16];
        let n = read_file(&fs2, &f2, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"v5 data");
        assert!(path::walk(&fs2, "/dir").unwrap().read().is_dir());

        // And the tree still accepts mutations.
        let d2 = path::walk(&fs2, "/dir").unwrap();
        create(&fs2, &d2, b"nested", crate::fs::xfs::inode::S_IFREG | 0o600, 0, 0, 0).unwrap();
    }

    #[test]
    fn unmount_remount_identical_tree() {
        let fs = TestImage::new().empty().mount_rw();
        let root = root(&fs);

        create(&fs, &root, b"file", crate::fs::xfs::inode::S_IFREG | 0o644, 0, 0, 0).unwrap();
        let d = mkdir(&fs, &root, b"dir", 0o755, 0, 0).unwrap();
        symlink(&fs, &d, b"ln", b"../file", 0, 0).unwrap();

        let stat = {
            let f = path::walk(&fs, "/file").unwrap();
            let i = f.read();
            (i.ino, i.size, i.mode, i.nlink)
        };

        fs.sync().unwrap();
        let img = fs.device().image_snapshot().unwrap();
        fs.unmount().unwrap();

        let fs2 = XfsFs::mount(BlockDevice::from_image(img, true), true).unwrap();
        let root2 = fs2.iget(fs2.sb().rootino).unwrap();
        // Short-form entries come back in insertion order.
        assert_eq!(names_of(&fs2, &root2), vec![".", "..", "file", "dir"]);

        let f2 = path::walk(&fs2, "/file").unwrap();
        let i2 = f2.read();
        assert_eq!((i2.ino, i2.size, i2.mode, i2.nlink), stat);
        drop(i2);

        let ln = path::walk(&fs2, "/dir/ln").unwrap();
        assert_eq!(read_link(&fs2, &ln).unwrap(), b"../file");
    }

    #[test]
    fn device_nodes() {
        let fs = TestImage::new().empty().mount_rw();
        let root = root(&fs);
        let dev = create(
            &fs,
            &root,
            b"null",
            crate::fs::xfs::inode::S_IFCHR | 0o666,
            0x0103,
            0,
            0,
        )
        .unwrap();
        assert_eq!(dev.read().fork, DataFork::Dev(0x0103));

        fs.sync().unwrap();
        let img = fs.device().image_snapshot().unwrap();
        fs.unmount().unwrap();
        let fs2 = XfsFs::mount(BlockDevice::from_image(img, true), true).unwrap();
        let dev2 = path::walk(&fs2, "/null").unwrap();
        assert_eq!(dev2.read().fork, DataFork::Dev(0x0103));
    }
}
