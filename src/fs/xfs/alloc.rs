//! Block and inode allocation.
//!
//! Blocks come from an AG's two free-space B-trees (indexed by start block
//! and by extent size); both indices, the AGF counters and the superblock
//! counters are updated together, inside the caller's transaction. Inodes
//! come from the AG's inode B-tree, in chunks of 64: when no chunk has a
//! free slot left, a new chunk is allocated, its cores are initialized and
//! a record is inserted into the tree.
//!
//! Tree updates operate on single-level (leaf-root) trees, which is what
//! mkfs creates and what small and medium filesystems keep. A deeper tree
//! fails the operation rather than risking an inconsistent split.

use bytemuck::Zeroable;

use crate::errors::{CanFail, IOResult, XfsError};
use crate::fs::xfs::ag::{
    self, AllocRec, DiskAgf, DiskAgi, InobtRec, AGF_BTREE_BNO, AGF_BTREE_CNT,
};
use crate::fs::xfs::cksum;
use crate::fs::xfs::inode::{DiskDinodeV3, NULLAGINO, XFS_DINODE_MAGIC};
use crate::fs::xfs::sb::{Superblock, XFS_INODES_PER_CHUNK};
use crate::fs::xfs::trans::Transaction;
use crate::fs::xfs::XfsFs;
use crate::io::buffer::BufRef;

/// Loads and validates the AGF sector of an AG.
fn read_agf(fs: &XfsFs, agno: u32) -> IOResult<BufRef> {
    let sb = fs.sb();
    let buf = fs
        .bufs()
        .read(ag::agf_daddr(sb, agno), ag::hdr_bblen(sb))?;
    {
        let guard = buf.read();
        let agf: &DiskAgf = bytemuck::from_bytes(&guard.data()[..core::mem::size_of::<DiskAgf>()]);
        agf.validate(sb, agno)?;
        if sb.has_crc() && !cksum::verify_cksum(guard.data(), ag::XFS_AGF_CRC_OFF) {
            log::error!("AGF checksum mismatch in AG {agno}");
            return Err(XfsError::Io);
        }
    }
    Ok(buf)
}

/// Loads and validates the AGI sector of an AG.
fn read_agi(fs: &XfsFs, agno: u32) -> IOResult<BufRef> {
    let sb = fs.sb();
    let buf = fs
        .bufs()
        .read(ag::agi_daddr(sb, agno), ag::hdr_bblen(sb))?;
    {
        let guard = buf.read();
        let agi: &DiskAgi = bytemuck::from_bytes(&guard.data()[..core::mem::size_of::<DiskAgi>()]);
        agi.validate(sb, agno)?;
        if sb.has_crc() && !cksum::verify_cksum(guard.data(), ag::XFS_AGI_CRC_OFF) {
            log::error!("AGI checksum mismatch in AG {agno}");
            return Err(XfsError::Io);
        }
    }
    Ok(buf)
}

/// Recomputes the CRC of an AG header or B-tree block after a mutation.
fn rewrite_cksum(sb: &Superblock, buf: &BufRef, off: usize) {
    if sb.has_crc() {
        cksum::update_cksum(buf.write().data_mut(), off);
    }
}

/// A loaded single-level B-tree: its block buffer and decoded records.
struct Leaf<T> {
    buf: BufRef,
    recs: Vec<T>,
    hdr_len: usize,
    rec_size: usize,
}

impl<T: bytemuck::Pod> Leaf<T> {
    fn load(fs: &XfsFs, agno: u32, root: u32, magic_v4: u32, magic_v5: u32) -> IOResult<Self> {
        let sb = fs.sb();
        let buf = fs.read_fsb(sb.agbno_to_fsb(agno, root), 1)?;
        let hdr_len = ag::btree_sblock_hdr_len(sb);
        let rec_size = core::mem::size_of::<T>();

        let recs = {
            let guard = buf.read();
            let hdr = ag::check_btree_sblock(sb, guard.data(), magic_v4, magic_v5)?;
            if hdr.level() != 0 {
                log::error!("multi-level AG btree in AG {agno}, cannot modify");
                return Err(XfsError::Io);
            }
            let n = usize::from(hdr.numrecs());
            let mut recs = Vec::with_capacity(n);
            for i in 0..n {
                let off = hdr_len + i * rec_size;
                recs.push(*bytemuck::from_bytes::<T>(&guard.data()[off..off + rec_size]));
            }
            recs
        };

        Ok(Self {
            buf,
            recs,
            hdr_len,
            rec_size,
        })
    }

    fn capacity(&self) -> usize {
        (self.buf.read().data().len() - self.hdr_len) / self.rec_size
    }

    /// Writes the record array and count back into the block and updates
    /// its CRC; the caller logs the buffer.
    fn store(&self, sb: &Superblock) -> CanFail<XfsError> {
        if self.recs.len() > self.capacity() {
            log::error!("AG btree leaf overflow ({} records)", self.recs.len());
            return Err(XfsError::NoSpace);
        }
        {
            let mut guard = self.buf.write();
            let hdr_len = self.hdr_len;
            let data = guard.data_mut();
            let mut hdr: ag::BtBlockHdr =
                *bytemuck::from_bytes(&data[..core::mem::size_of::<ag::BtBlockHdr>()]);
            hdr.set_numrecs(self.recs.len() as u16);
            data[..core::mem::size_of::<ag::BtBlockHdr>()]
                .copy_from_slice(bytemuck::bytes_of(&hdr));
            for (i, rec) in self.recs.iter().enumerate() {
                let off = hdr_len + i * self.rec_size;
                data[off..off + self.rec_size].copy_from_slice(bytemuck::bytes_of(rec));
            }
            // Clear the tail left by removed records.
            let used = hdr_len + self.recs.len() * self.rec_size;
            let cap_end = hdr_len + ((data.len() - hdr_len) / self.rec_size) * self.rec_size;
            data[used..cap_end].fill(0);
        }
        rewrite_cksum(sb, &self.buf, ag::BTREE_SBLOCK_CRC_OFF);
        Ok(())
    }
}

/// Loads both free-space leaves of an AG.
fn load_freespace(
    fs: &XfsFs,
    agno: u32,
    agf: &DiskAgf,
) -> IOResult<(Leaf<AllocRec>, Leaf<AllocRec>)> {
    if agf.level(AGF_BTREE_BNO) != 1 || agf.level(AGF_BTREE_CNT) != 1 {
        log::error!("free-space btrees of AG {agno} are deeper than one level");
        return Err(XfsError::Io);
    }
    let bno = Leaf::load(
        fs,
        agno,
        agf.root(AGF_BTREE_BNO),
        ag::XFS_ABTB_MAGIC,
        ag::XFS_ABTB_CRC_MAGIC,
    )?;
    let cnt = Leaf::load(
        fs,
        agno,
        agf.root(AGF_BTREE_CNT),
        ag::XFS_ABTC_MAGIC,
        ag::XFS_ABTC_CRC_MAGIC,
    )?;
    Ok((bno, cnt))
}

/// Removes the by-size record matching `(startblock, blockcount)`.
fn cnt_remove(cnt: &mut Leaf<AllocRec>, startblock: u32, blockcount: u32) {
    if let Some(pos) = cnt
        .recs
        .iter()
        .position(|r| r.startblock() == startblock && r.blockcount() == blockcount)
    {
        cnt.recs.remove(pos);
    }
}

/// Inserts a by-size record at its sorted position (count, then start).
fn cnt_insert(cnt: &mut Leaf<AllocRec>, rec: AllocRec) {
    let pos = cnt
        .recs
        .partition_point(|r| (r.blockcount(), r.startblock()) < (rec.blockcount(), rec.startblock()));
    cnt.recs.insert(pos, rec);
}

/// Updates the AGF counters after free space changed, and its CRC.
fn agf_update(
    sb: &Superblock,
    agf_buf: &BufRef,
    bno: &Leaf<AllocRec>,
    delta: i64,
) {
    let longest = bno
        .recs
        .iter()
        .map(AllocRec::blockcount)
        .max()
        .unwrap_or(0);
    {
        let mut guard = agf_buf.write();
        let agf: &mut DiskAgf =
            bytemuck::from_bytes_mut(&mut guard.data_mut()[..core::mem::size_of::<DiskAgf>()]);
        agf.set_freeblks(agf.freeblks().wrapping_add_signed(delta as i32));
        agf.set_longest(longest);
    }
    rewrite_cksum(sb, agf_buf, ag::XFS_AGF_CRC_OFF);
}

/// Allocates up to `want` contiguous blocks, preferring `agno_pref`.
///
/// Returns the absolute start block and the run length actually obtained
/// (shorter than `want` when no AG holds a long-enough extent; callers
/// loop). Fails with `NoSpace` when every AG is exhausted.
pub fn alloc_extent(
    fs: &XfsFs,
    tp: &mut Transaction,
    agno_pref: u32,
    want: u64,
) -> IOResult<(u64, u64)> {
    let sb = fs.sb();
    let agcount = sb.agcount;
    let mut best: Option<(u32, u64)> = None; // (agno, longest)

    for i in 0..agcount {
        let agno = (agno_pref + i) % agcount;
        let agf_buf = read_agf(fs, agno)?;
        let agf: DiskAgf = *bytemuck::from_bytes(
            &agf_buf.read().data()[..core::mem::size_of::<DiskAgf>()],
        );
        if u64::from(agf.longest()) >= want {
            return alloc_extent_in_ag(fs, tp, agno, &agf_buf, want, 1);
        }
        if agf.longest() > 0 {
            let longest = u64::from(agf.longest());
            if best.map_or(true, |(_, l)| longest > l) {
                best = Some((agno, longest));
            }
        }
    }

    // No AG can satisfy the whole run: hand out the longest available.
    if let Some((agno, longest)) = best {
        let agf_buf = read_agf(fs, agno)?;
        return alloc_extent_in_ag(fs, tp, agno, &agf_buf, longest, 1);
    }
    Err(XfsError::NoSpace)
}

/// Allocates exactly `want` blocks aligned to `align`, for inode chunks.
pub fn alloc_extent_aligned(
    fs: &XfsFs,
    tp: &mut Transaction,
    agno: u32,
    want: u64,
    align: u32,
) -> IOResult<u64> {
    let agf_buf = read_agf(fs, agno)?;
    let (fsbno, got) = alloc_extent_in_ag(fs, tp, agno, &agf_buf, want, align.max(1))?;
    debug_assert_eq!(got, want);
    Ok(fsbno)
}

/// The common allocation path within one AG.
fn alloc_extent_in_ag(
    fs: &XfsFs,
    tp: &mut Transaction,
    agno: u32,
    agf_buf: &BufRef,
    want: u64,
    align: u32,
) -> IOResult<(u64, u64)> {
    let sb = fs.sb();
    let agf: DiskAgf =
        *bytemuck::from_bytes(&agf_buf.read().data()[..core::mem::size_of::<DiskAgf>()]);
    let (mut bno, mut cnt) = load_freespace(fs, agno, &agf)?;
    let align = u64::from(align);

    // First fit with the requested alignment; fall back to the longest
    // usable run when nothing covers `want` in full.
    let mut pick: Option<(usize, u64, u64)> = None; // (idx, cut_start, cut_len)
    for (idx, rec) in bno.recs.iter().enumerate() {
        let start = u64::from(rec.startblock());
        let count = u64::from(rec.blockcount());
        let cut_start = start.next_multiple_of(align);
        if cut_start >= start + count {
            continue;
        }
        let avail = start + count - cut_start;
        if avail >= want {
            pick = Some((idx, cut_start, want));
            break;
        }
        if align == 1 {
            if pick.map_or(true, |(_, _, len)| avail > len) {
                pick = Some((idx, cut_start, avail));
            }
        }
    }
    let Some((idx, cut_start, cut_len)) = pick else {
        return Err(XfsError::NoSpace);
    };

    tp.stat_alloc(cut_len)?;
    // Snapshot before mutating, so a cancel rolls all three back.
    tp.log_buf(agf_buf);
    tp.log_buf(&bno.buf);
    tp.log_buf(&cnt.buf);

    let rec = bno.recs[idx];
    let start = u64::from(rec.startblock());
    let count = u64::from(rec.blockcount());
    cnt_remove(&mut cnt, rec.startblock(), rec.blockcount());
    bno.recs.remove(idx);

    // Put the cut-off remainders back (front and tail of the old record).
    let mut insert_bno = |bno: &mut Leaf<AllocRec>, cnt: &mut Leaf<AllocRec>, s: u64, c: u64| {
        if c == 0 {
            return;
        }
        let rec = AllocRec::new(s as u32, c as u32);
        let pos = bno
            .recs
            .partition_point(|r| r.startblock() < rec.startblock());
        bno.recs.insert(pos, rec);
        cnt_insert(cnt, rec);
    };
    insert_bno(&mut bno, &mut cnt, start, cut_start - start);
    insert_bno(
        &mut bno,
        &mut cnt,
        cut_start + cut_len,
        (start + count) - (cut_start + cut_len),
    );

    bno.store(sb)?;
    cnt.store(sb)?;
    agf_update(sb, agf_buf, &bno, -(cut_len as i64));

    Ok((sb.agbno_to_fsb(agno, cut_start as u32), cut_len))
}

/// Returns an extent to its AG's free space, coalescing with neighbours.
pub fn free_extent(fs: &XfsFs, tp: &mut Transaction, fsbno: u64, blocks: u64) -> CanFail<XfsError> {
    let sb = fs.sb();
    let (agno, agbno) = sb.fsb_to_agbno(fsbno);
    let agf_buf = read_agf(fs, agno)?;
    let agf: DiskAgf =
        *bytemuck::from_bytes(&agf_buf.read().data()[..core::mem::size_of::<DiskAgf>()]);
    let (mut bno, mut cnt) = load_freespace(fs, agno, &agf)?;
    tp.log_buf(&agf_buf);
    tp.log_buf(&bno.buf);
    tp.log_buf(&cnt.buf);

    let mut start = agbno;
    let mut count = blocks as u32;

    // Merge with the record ending exactly at `start`.
    if let Some(pos) = bno
        .recs
        .iter()
        .position(|r| r.startblock() + r.blockcount() == start)
    {
        let left = bno.recs.remove(pos);
        cnt_remove(&mut cnt, left.startblock(), left.blockcount());
        start = left.startblock();
        count += left.blockcount();
    }
    // Merge with the record starting exactly past the freed run.
    if let Some(pos) = bno
        .recs
        .iter()
        .position(|r| r.startblock() == agbno + blocks as u32)
    {
        let right = bno.recs.remove(pos);
        cnt_remove(&mut cnt, right.startblock(), right.blockcount());
        count += right.blockcount();
    }

    let rec = AllocRec::new(start, count);
    let pos = bno
        .recs
        .partition_point(|r| r.startblock() < rec.startblock());
    bno.recs.insert(pos, rec);
    cnt_insert(&mut cnt, rec);

    bno.store(sb)?;
    cnt.store(sb)?;
    agf_update(sb, &agf_buf, &bno, blocks as i64);
    tp.stat_free(blocks);

    // Freed blocks may be re-read through fresh buffers later; drop any
    // cached single-block view of them.
    for blk in 0..blocks {
        fs.bufs()
            .forget(sb.fsb_to_daddr(fsbno + blk), sb.bb_per_blk());
    }

    Ok(())
}

/// Allocates an inode, returning its number and the generation found in the
/// on-disk slot (the caller stores `gen + 1`).
///
/// Chunk allocation happens transparently when no existing chunk has free
/// slots.
pub fn ialloc(fs: &XfsFs, tp: &mut Transaction, agno_pref: u32) -> IOResult<(u64, u32)> {
    let sb = fs.sb();
    let agcount = sb.agcount;

    for pass in 0..2 {
        for i in 0..agcount {
            let agno = (agno_pref + i) % agcount;
            let agi_buf = read_agi(fs, agno)?;
            let agi: DiskAgi =
                *bytemuck::from_bytes(&agi_buf.read().data()[..core::mem::size_of::<DiskAgi>()]);

            if agi.freecount() == 0 {
                if pass == 0 {
                    continue;
                }
                // Second pass: grow this AG by one chunk, if it has room.
                if alloc_ichunk(fs, tp, agno, &agi_buf).is_err() {
                    continue;
                }
            }
            if let Some(ino) = ialloc_in_ag(fs, tp, agno, &agi_buf)? {
                let gen = slot_generation(fs, ino)?;
                return Ok((ino, gen));
            }
        }
    }
    Err(XfsError::NoSpace)
}

/// Picks a free slot out of the AG's inode tree.
fn ialloc_in_ag(
    fs: &XfsFs,
    tp: &mut Transaction,
    agno: u32,
    agi_buf: &BufRef,
) -> IOResult<Option<u64>> {
    let sb = fs.sb();
    let agi: DiskAgi =
        *bytemuck::from_bytes(&agi_buf.read().data()[..core::mem::size_of::<DiskAgi>()]);
    if agi.level() != 1 {
        log::error!("inode btree of AG {agno} is deeper than one level");
        return Err(XfsError::Io);
    }
    let mut leaf: Leaf<InobtRec> = Leaf::load(
        fs,
        agno,
        agi.root(),
        ag::XFS_IBT_MAGIC,
        ag::XFS_IBT_CRC_MAGIC,
    )?;

    let Some(idx) = leaf.recs.iter().position(|r| r.freecount() > 0) else {
        return Ok(None);
    };
    tp.log_buf(agi_buf);
    tp.log_buf(&leaf.buf);

    let rec = &mut leaf.recs[idx];
    let bit = rec.free_mask().trailing_zeros();
    let agino = rec.startino() + bit;
    rec.set_free_mask(rec.free_mask() & !(1u64 << bit));
    rec.set_freecount(rec.freecount() - 1);
    leaf.store(sb)?;

    {
        let mut guard = agi_buf.write();
        let agi: &mut DiskAgi =
            bytemuck::from_bytes_mut(&mut guard.data_mut()[..core::mem::size_of::<DiskAgi>()]);
        agi.set_freecount(agi.freecount() - 1);
    }
    rewrite_cksum(sb, agi_buf, ag::XFS_AGI_CRC_OFF);
    tp.stat_inodes(0, -1);

    Ok(Some(sb.ino_make(
        agno,
        agino >> sb.inopblog,
        agino & ((1 << sb.inopblog) - 1),
    )))
}

/// Reads the generation number left in an inode slot by its previous life.
fn slot_generation(fs: &XfsFs, ino: u64) -> IOResult<u32> {
    let sb = fs.sb();
    let (agno, agbno, off) = sb.ino_split(ino);
    let buf = fs.read_fsb(sb.agbno_to_fsb(agno, agbno), 1)?;
    let guard = buf.read();
    let slot = &guard.data()[usize::from(sb.inodesize) * off as usize..];
    if u16::from_be_bytes(slot[..2].try_into().unwrap()) != XFS_DINODE_MAGIC {
        return Ok(0);
    }
    Ok(u32::from_be_bytes(slot[92..96].try_into().unwrap()))
}

/// Allocates and initializes a fresh chunk of 64 inodes in `agno`.
fn alloc_ichunk(fs: &XfsFs, tp: &mut Transaction, agno: u32, agi_buf: &BufRef) -> CanFail<XfsError> {
    let sb = fs.sb();
    if fs.counters().icount + u64::from(XFS_INODES_PER_CHUNK) > sb.max_icount() {
        return Err(XfsError::NoSpace);
    }

    let blocks = u64::from(sb.blocks_per_ichunk());
    let align = if sb.inoalignmt > 0 {
        sb.inoalignmt
    } else {
        sb.blocks_per_ichunk()
    };
    let fsbno = alloc_extent_aligned(fs, tp, agno, blocks, align)?;
    let (_, agbno) = sb.fsb_to_agbno(fsbno);
    let startino = agbno << sb.inopblog;

    // Write empty cores into every slot of the chunk.
    let isize = usize::from(sb.inodesize);
    for blk in 0..blocks {
        let buf = fs.bufs().get(sb.fsb_to_daddr(fsbno + blk), sb.bb_per_blk())?;
        {
            let mut guard = buf.write();
            let data = guard.data_mut();
            data.fill(0);
            for slot_idx in 0..usize::from(sb.inopblock) {
                let slot = &mut data[slot_idx * isize..(slot_idx + 1) * isize];
                slot[..2].copy_from_slice(&XFS_DINODE_MAGIC.to_be_bytes());
                slot[4] = if sb.is_v5() { 3 } else { 2 };
                slot[96..100].copy_from_slice(&NULLAGINO.to_be_bytes());
                if sb.is_v5() {
                    let agino = startino + (blk as u32) * u32::from(sb.inopblock) + slot_idx as u32;
                    let ino = sb.ino_make(agno, agino >> sb.inopblog, agino & ((1 << sb.inopblog) - 1));
                    let mut v3 = DiskDinodeV3::zeroed();
                    v3.di_ino = ino.to_be();
                    v3.di_uuid = sb.uuid;
                    slot[104..176].copy_from_slice(bytemuck::bytes_of(&v3));
                    cksum::update_cksum(slot, crate::fs::xfs::inode::DINODE_CRC_OFF);
                }
            }
        }
        tp.log_buf(&buf);
    }

    // Record the chunk in the inode tree and the AGI.
    let agi: DiskAgi =
        *bytemuck::from_bytes(&agi_buf.read().data()[..core::mem::size_of::<DiskAgi>()]);
    let mut leaf: Leaf<InobtRec> = Leaf::load(
        fs,
        agno,
        agi.root(),
        ag::XFS_IBT_MAGIC,
        ag::XFS_IBT_CRC_MAGIC,
    )?;
    tp.log_buf(agi_buf);
    tp.log_buf(&leaf.buf);
    let rec = InobtRec::new(startino, XFS_INODES_PER_CHUNK, u64::MAX);
    let pos = leaf
        .recs
        .partition_point(|r| r.startino() < rec.startino());
    leaf.recs.insert(pos, rec);
    leaf.store(sb)?;

    {
        let mut guard = agi_buf.write();
        let agi: &mut DiskAgi =
            bytemuck::from_bytes_mut(&mut guard.data_mut()[..core::mem::size_of::<DiskAgi>()]);
        agi.set_count(agi.count() + XFS_INODES_PER_CHUNK);
        agi.set_freecount(agi.freecount() + XFS_INODES_PER_CHUNK);
        agi.set_newino(startino);
    }
    rewrite_cksum(sb, agi_buf, ag::XFS_AGI_CRC_OFF);
    tp.stat_inodes(i64::from(XFS_INODES_PER_CHUNK), i64::from(XFS_INODES_PER_CHUNK));

    Ok(())
}

/// Returns an inode slot to its chunk's free mask.
pub fn ifree(fs: &XfsFs, tp: &mut Transaction, ino: u64) -> CanFail<XfsError> {
    let sb = fs.sb();
    let (agno, _, _) = sb.ino_split(ino);
    let agino = sb.ino_to_agino(ino);

    let agi_buf = read_agi(fs, agno)?;
    let agi: DiskAgi =
        *bytemuck::from_bytes(&agi_buf.read().data()[..core::mem::size_of::<DiskAgi>()]);
    if agi.level() != 1 {
        log::error!("inode btree of AG {agno} is deeper than one level");
        return Err(XfsError::Io);
    }
    let mut leaf: Leaf<InobtRec> = Leaf::load(
        fs,
        agno,
        agi.root(),
        ag::XFS_IBT_MAGIC,
        ag::XFS_IBT_CRC_MAGIC,
    )?;

    tp.log_buf(&agi_buf);
    tp.log_buf(&leaf.buf);
    let Some(rec) = leaf
        .recs
        .iter_mut()
        .find(|r| r.startino() <= agino && agino < r.startino() + XFS_INODES_PER_CHUNK)
    else {
        log::error!("inode {ino:#x} has no chunk record");
        return Err(XfsError::Io);
    };
    let bit = agino - rec.startino();
    if rec.free_mask() & (1u64 << bit) != 0 {
        log::error!("double free of inode {ino:#x}");
        return Err(XfsError::Io);
    }
    rec.set_free_mask(rec.free_mask() | (1u64 << bit));
    rec.set_freecount(rec.freecount() + 1);
    leaf.store(sb)?;

    {
        let mut guard = agi_buf.write();
        let agi: &mut DiskAgi =
            bytemuck::from_bytes_mut(&mut guard.data_mut()[..core::mem::size_of::<DiskAgi>()]);
        agi.set_freecount(agi.freecount() + 1);
    }
    rewrite_cksum(sb, &agi_buf, ag::XFS_AGI_CRC_OFF);
    tp.stat_inodes(0, 1);

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fs::xfs::test_img::TestImage;
    use crate::fs::xfs::trans::TransType;

    #[test]
    fn alloc_then_free_restores_counters() {
        let fs = TestImage::default().mount_rw();
        let free0 = fs.counters().fdblocks;

        let mut tp = Transaction::allocate(&fs, TransType::Write).unwrap();
        tp.reserve(4).unwrap();
        let (fsbno, got) = alloc_extent(&fs, &mut tp, 0, 4).unwrap();
        assert_eq!(got, 4);
        tp.commit().unwrap();
        assert_eq!(fs.counters().fdblocks, free0 - 4);

        let mut tp = Transaction::allocate(&fs, TransType::Truncate).unwrap();
        tp.reserve(0).unwrap();
        free_extent(&fs, &mut tp, fsbno, 4).unwrap();
        tp.commit().unwrap();
        assert_eq!(fs.counters().fdblocks, free0);
    }

    #[test]
    fn alloc_is_contiguous_and_distinct() {
        let fs = TestImage::default().mount_rw();
        let mut tp = Transaction::allocate(&fs, TransType::Write).unwrap();
        tp.reserve(8).unwrap();
        let (a, got_a) = alloc_extent(&fs, &mut tp, 0, 4).unwrap();
        let (b, got_b) = alloc_extent(&fs, &mut tp, 0, 4).unwrap();
        assert_eq!(got_a, 4);
        assert_eq!(got_b, 4);
        // Ranges never overlap.
        assert!(a + 4 <= b || b + 4 <= a);
        tp.commit().unwrap();
    }

    #[test]
    fn free_coalesces() {
        let fs = TestImage::default().mount_rw();

        let mut tp = Transaction::allocate(&fs, TransType::Write).unwrap();
        tp.reserve(8).unwrap();
        let (a, _) = alloc_extent(&fs, &mut tp, 0, 8).unwrap();
        tp.commit().unwrap();

        // Free the two halves separately; the free-space record must merge
        // back so an 8-block run is allocatable again from the same spot.
        let mut tp = Transaction::allocate(&fs, TransType::Truncate).unwrap();
        tp.reserve(0).unwrap();
        free_extent(&fs, &mut tp, a, 4).unwrap();
        free_extent(&fs, &mut tp, a + 4, 4).unwrap();
        tp.commit().unwrap();

        let mut tp = Transaction::allocate(&fs, TransType::Write).unwrap();
        tp.reserve(8).unwrap();
        let (b, got) = alloc_extent(&fs, &mut tp, 0, 8).unwrap();
        assert_eq!(got, 8);
        assert_eq!(b, a);
        tp.commit().unwrap();
    }

    #[test]
    fn ialloc_returns_distinct_inodes() {
        let fs = TestImage::default().mount_rw();
        let ifree0 = fs.counters().ifree;

        let mut tp = Transaction::allocate(&fs, TransType::Create).unwrap();
        tp.reserve(16).unwrap();
        let (a, _) = ialloc(&fs, &mut tp, 0).unwrap();
        let (b, _) = ialloc(&fs, &mut tp, 0).unwrap();
        assert_ne!(a, b);
        tp.commit().unwrap();
        assert_eq!(fs.counters().ifree, ifree0 - 2);

        let mut tp = Transaction::allocate(&fs, TransType::Remove).unwrap();
        tp.reserve(0).unwrap();
        ifree(&fs, &mut tp, a).unwrap();
        ifree(&fs, &mut tp, b).unwrap();
        tp.commit().unwrap();
        assert_eq!(fs.counters().ifree, ifree0);
    }
}
