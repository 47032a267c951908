//! The transaction engine.
//!
//! Every mutation runs inside a [`Transaction`]: a single-owner scope that
//! reserves space, joins the inodes it will modify, accumulates logged
//! buffers and deferred block frees, and finally commits or cancels.
//!
//! The lifecycle is `NEW -> RESERVED -> DIRTY -> COMMITTED | CANCELED`.
//! Joined inodes and logged buffers are snapshotted on first touch; cancel
//! restores the snapshots so a canceled transaction leaves no observable
//! side effect. Dropping a transaction that was neither committed nor
//! canceled cancels it.
//!
//! Reference handling follows the guard model: joining clones the inode
//! handle, and the clone is dropped when the transaction ends. The caller's
//! own handle is never touched, so there is no separate "hold" request: a
//! reference outlives the transaction exactly when its owner keeps a guard.

use crate::errors::{CanFail, IOResult, XfsError};
use crate::fs::xfs::inode::{Inode, InodeRef};
use crate::fs::xfs::XfsFs;
use crate::io::buffer::BufRef;

/// Reservation classes, naming the operation a transaction performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransType {
    Create,
    Mkdir,
    Remove,
    Rmdir,
    Rename,
    Link,
    Symlink,
    Write,
    Truncate,
    SetAttr,
    Ichunk,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TransState {
    New,
    Reserved,
    Dirty,
    Committed,
    Canceled,
}

struct JoinedInode {
    handle: InodeRef,
    /// Snapshot taken at join time, restored on cancel.
    pre: Inode,
    /// Set by `log_inode`; only logged inodes are written at commit.
    logged: bool,
}

struct LoggedBuf {
    buf: BufRef,
    /// Snapshot taken at first log time, restored on cancel.
    pre: Vec<u8>,
}

impl<'fs> std::fmt::Debug for Transaction<'fs> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("ttype", &self.ttype)
            .field("state", &self.state)
            .finish()
    }
}

/// A single mutation scope. See the module documentation.
pub struct Transaction<'fs> {
    fs: &'fs XfsFs,
    ttype: TransType,
    state: TransState,

    /// Blocks reserved against the free-space counter.
    blk_res: u64,
    /// Blocks consumed through the allocator so far.
    blk_alloc: u64,
    /// Blocks returned through the allocator so far.
    blk_freed: u64,
    /// Net inode-count / free-inode deltas, applied at commit.
    icount_delta: i64,
    ifree_delta: i64,

    joined: Vec<JoinedInode>,
    bufs: Vec<LoggedBuf>,
    deferred: Vec<(u64, u64)>,
}

impl<'fs> Transaction<'fs> {
    /// Allocates an empty transaction.
    ///
    /// Fails permanently once the mount has been shut down.
    pub fn allocate(fs: &'fs XfsFs, ttype: TransType) -> IOResult<Self> {
        if fs.is_shutdown() {
            return Err(XfsError::Shutdown);
        }
        Ok(Self {
            fs,
            ttype,
            state: TransState::New,
            blk_res: 0,
            blk_alloc: 0,
            blk_freed: 0,
            icount_delta: 0,
            ifree_delta: 0,
            joined: Vec::new(),
            bufs: Vec::new(),
            deferred: Vec::new(),
        })
    }

    pub fn trans_type(&self) -> TransType {
        self.ttype
    }

    /// Reserves `blocks` data blocks for this transaction.
    ///
    /// The reservation is taken out of the free-block counter up front and
    /// the unused part is returned at commit (or all of it on cancel), so a
    /// shortfall surfaces here as [`XfsError::NoSpace`] before anything is
    /// modified.
    pub fn reserve(&mut self, blocks: u64) -> CanFail<XfsError> {
        debug_assert_eq!(self.state, TransState::New);
        let mut counters = self.fs.counters();
        if counters.fdblocks < blocks {
            return Err(XfsError::NoSpace);
        }
        counters.fdblocks -= blocks;
        self.blk_res = blocks;
        self.state = TransState::Reserved;
        Ok(())
    }

    /// Joins an inode: the transaction takes its own guard and snapshots
    /// the inode so cancel can restore it.
    ///
    /// Joining twice is a no-op.
    pub fn join(&mut self, handle: &InodeRef) {
        if self
            .joined
            .iter()
            .any(|j| std::sync::Arc::ptr_eq(&j.handle, handle))
        {
            return;
        }
        let pre = handle.read().clone();
        self.joined.push(JoinedInode {
            handle: handle.clone(),
            pre,
            logged: false,
        });
    }

    /// Marks a joined inode's changes for write-out at commit.
    pub fn log_inode(&mut self, handle: &InodeRef) {
        let joined = self
            .joined
            .iter_mut()
            .find(|j| std::sync::Arc::ptr_eq(&j.handle, handle))
            .expect("inode logged without being joined");
        joined.logged = true;
        self.state = TransState::Dirty;
    }

    /// Logs a buffer: snapshots it on first touch and marks it dirty so
    /// commit writes it back.
    pub fn log_buf(&mut self, buf: &BufRef) {
        if !self
            .bufs
            .iter()
            .any(|l| std::sync::Arc::ptr_eq(&l.buf, buf))
        {
            let pre = buf.read().data().to_vec();
            self.bufs.push(LoggedBuf {
                buf: buf.clone(),
                pre,
            });
        }
        buf.write().mark_dirty();
        self.state = TransState::Dirty;
    }

    /// Records blocks consumed by the allocator against the reservation.
    pub(crate) fn stat_alloc(&mut self, blocks: u64) -> CanFail<XfsError> {
        if self.blk_alloc + blocks > self.blk_res {
            log::error!(
                "{:?} transaction overran its reservation ({} + {blocks} > {})",
                self.ttype,
                self.blk_alloc,
                self.blk_res
            );
            return Err(XfsError::NoSpace);
        }
        self.blk_alloc += blocks;
        Ok(())
    }

    /// Records blocks returned to the free space.
    pub(crate) fn stat_free(&mut self, blocks: u64) {
        self.blk_freed += blocks;
    }

    /// Records inode allocation/free against the superblock counters.
    pub(crate) fn stat_inodes(&mut self, icount: i64, ifree: i64) {
        self.icount_delta += icount;
        self.ifree_delta += ifree;
    }

    /// Queues an extent for freeing when `bmap_finish` runs.
    pub fn defer_free(&mut self, fsbno: u64, blocks: u64) {
        self.deferred.push((fsbno, blocks));
    }

    /// Executes the deferred block frees accumulated so far (from truncate,
    /// rmdir, directory demotion, ...).
    pub fn bmap_finish(&mut self) -> CanFail<XfsError> {
        let deferred = std::mem::take(&mut self.deferred);
        for (fsbno, blocks) in deferred {
            crate::fs::xfs::alloc::free_extent(self.fs, self, fsbno, blocks)?;
        }
        Ok(())
    }

    /// Commits: writes every logged inode and buffer through the buffer
    /// cache, applies the counter deltas, and consumes the transaction.
    ///
    /// An I/O failure mid-commit shuts the mount down.
    pub fn commit(mut self) -> CanFail<XfsError> {
        debug_assert!(self.deferred.is_empty(), "commit with unfinished deferred frees");

        // Encode logged inodes into their clusters; the touched cluster
        // buffers join the write-out set.
        let mut cluster_bufs = Vec::new();
        let mut failed = false;
        for joined in &self.joined {
            if joined.logged {
                let result = {
                    let inode = joined.handle.read();
                    self.fs.write_inode(&inode)
                };
                match result {
                    Ok(buf) => cluster_bufs.push(buf),
                    Err(_) => {
                        failed = true;
                        break;
                    }
                }
            }
        }

        // Write-out, in insertion order.
        if !failed {
            failed = self
                .bufs
                .iter()
                .any(|logged| self.fs.bufs().write_buf(&logged.buf).is_err());
        }
        if !failed {
            failed = cluster_bufs
                .iter()
                .any(|buf| self.fs.bufs().write_buf(buf).is_err());
        }
        if failed {
            self.fail_commit();
            return Err(XfsError::Io);
        }

        // Counter deltas: return the unused reservation, apply the net
        // allocation and the inode deltas.
        {
            let mut counters = self.fs.counters();
            counters.fdblocks += self.blk_res - self.blk_alloc + self.blk_freed;
            counters.icount = counters.icount.wrapping_add_signed(self.icount_delta);
            counters.ifree = counters.ifree.wrapping_add_signed(self.ifree_delta);
        }

        self.state = TransState::Committed;
        Ok(())
    }

    /// Commit failed after buffers may have partially reached the disk: the
    /// mount is no longer consistent, shut it down.
    fn fail_commit(&mut self) {
        log::error!("transaction commit failed, shutting the filesystem down");
        self.state = TransState::Canceled;
        self.fs.force_shutdown();
    }

    /// Cancels: restores every snapshot and returns the reservation. With
    /// `abort` set the mount is shut down (used when the on-disk state may
    /// already be inconsistent).
    pub fn cancel(mut self, abort: bool) {
        self.do_cancel(abort);
    }

    fn do_cancel(&mut self, abort: bool) {
        if matches!(self.state, TransState::Committed | TransState::Canceled) {
            return;
        }

        // Roll back buffers first, then inodes, in reverse log order.
        for logged in self.bufs.iter().rev() {
            let mut buf = logged.buf.write();
            buf.data_mut().copy_from_slice(&logged.pre);
        }
        for joined in self.joined.iter().rev() {
            *joined.handle.write() = joined.pre.clone();
        }

        if self.blk_res > 0 {
            self.fs.counters().fdblocks += self.blk_res;
        }

        self.state = TransState::Canceled;
        if abort {
            self.fs.force_shutdown();
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        // A transaction abandoned on an error path cancels cleanly.
        self.do_cancel(false);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fs::xfs::test_img::TestImage;

    #[test]
    fn reserve_no_space() {
        let fs = TestImage::default().mount_rw();
        let free = fs.counters().fdblocks;

        let mut tp = Transaction::allocate(&fs, TransType::Write).unwrap();
        assert_eq!(tp.reserve(free + 1).unwrap_err(), XfsError::NoSpace);
        tp.cancel(false);
        assert_eq!(fs.counters().fdblocks, free);
    }

    #[test]
    fn cancel_restores_buffers() {
        let fs = TestImage::default().mount_rw();
        let buf = fs.read_fsb(0, 1).unwrap();
        let orig = buf.read().data().to_vec();

        let mut tp = Transaction::allocate(&fs, TransType::Write).unwrap();
        tp.reserve(1).unwrap();
        tp.log_buf(&buf);
        buf.write().data_mut()[128] ^= 0xff;
        tp.cancel(false);

        assert_eq!(buf.read().data(), &orig[..]);
        assert!(!fs.is_shutdown());
    }

    #[test]
    fn drop_cancels() {
        let fs = TestImage::default().mount_rw();
        let free = fs.counters().fdblocks;
        let buf = fs.read_fsb(0, 1).unwrap();
        let orig = buf.read().data().to_vec();

        {
            let mut tp = Transaction::allocate(&fs, TransType::Write).unwrap();
            tp.reserve(4).unwrap();
            tp.log_buf(&buf);
            buf.write().data_mut()[0] ^= 0xff;
            // Dropped without commit.
        }

        assert_eq!(buf.read().data(), &orig[..]);
        assert_eq!(fs.counters().fdblocks, free);
    }

    #[test]
    fn cancel_restores_inodes() {
        let fs = TestImage::default().mount_rw();
        let root = fs.iget(fs.sb().rootino).unwrap();
        let nlink = root.read().nlink;

        let mut tp = Transaction::allocate(&fs, TransType::SetAttr).unwrap();
        tp.reserve(0).unwrap();
        tp.join(&root);
        root.write().nlink += 7;
        tp.log_inode(&root);
        tp.cancel(false);

        assert_eq!(root.read().nlink, nlink);
    }

    #[test]
    fn abort_shuts_down() {
        let fs = TestImage::default().mount_rw();
        let mut tp = Transaction::allocate(&fs, TransType::Remove).unwrap();
        tp.reserve(0).unwrap();
        tp.cancel(true);

        assert!(fs.is_shutdown());
        assert_eq!(
            Transaction::allocate(&fs, TransType::Remove).unwrap_err(),
            XfsError::Shutdown
        );
    }
}
