//! The block buffer cache.
//!
//! Maps `(daddr, length)` pairs to shared in-memory buffers. Within one
//! mount, reading the same range twice yields the same [`Buf`] instance, so
//! a mutation logged through a transaction is observed by every later reader
//! of that range. Dirty buffers are held in the cache until a transaction
//! commit (or an eviction) writes them back.

use std::sync::Arc;

use hashbrown::HashMap;
use spin::{Mutex, RwLock};

use crate::errors::{CanFail, IOResult, XfsError};
use crate::io::device::BlockDevice;
use crate::io::BB_SHIFT;

/// Number of cached buffers above which clean, unreferenced entries are
/// evicted.
const CACHE_HIGH_WATER: usize = 2048;

/// A cached run of basic blocks.
pub struct Buf {
    daddr: u64,
    data: Vec<u8>,
    dirty: bool,
}

impl Buf {
    /// Disk address of the first basic block covered by this buffer.
    pub fn daddr(&self) -> u64 {
        self.daddr
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access to the buffer bytes.
    ///
    /// Mutations must be paired with a transaction log call so the change
    /// reaches the disk on commit.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Marks the buffer as needing write-back.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn clear_dirty(&mut self) {
        self.dirty = false;
    }
}

/// Shared handle on a cached buffer.
pub type BufRef = Arc<RwLock<Buf>>;

/// The per-volume buffer cache.
pub struct BufCache {
    dev: Arc<BlockDevice>,
    bufs: Mutex<HashMap<(u64, u32), BufRef>>,
}

impl BufCache {
    pub fn new(dev: Arc<BlockDevice>) -> Self {
        Self {
            dev,
            bufs: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the buffer covering `bblen` basic blocks at `daddr`, reading
    /// it from the device if it is not cached yet.
    pub fn read(&self, daddr: u64, bblen: u32) -> IOResult<BufRef> {
        let mut bufs = self.bufs.lock();
        if let Some(buf) = bufs.get(&(daddr, bblen)) {
            return Ok(buf.clone());
        }

        let mut data = vec![0u8; (bblen as usize) << BB_SHIFT];
        self.dev.read_daddr(daddr, &mut data)?;

        let buf = Arc::new(RwLock::new(Buf {
            daddr,
            data,
            dirty: false,
        }));
        Self::evict(&mut bufs);
        bufs.insert((daddr, bblen), buf.clone());
        Ok(buf)
    }

    /// Returns a zero-filled buffer for a range that is about to be
    /// overwritten entirely, skipping the disk read.
    ///
    /// If the range is already cached the cached instance is returned
    /// unchanged, preserving the one-instance-per-range guarantee.
    pub fn get(&self, daddr: u64, bblen: u32) -> IOResult<BufRef> {
        let mut bufs = self.bufs.lock();
        if let Some(buf) = bufs.get(&(daddr, bblen)) {
            return Ok(buf.clone());
        }

        let buf = Arc::new(RwLock::new(Buf {
            daddr,
            data: vec![0u8; (bblen as usize) << BB_SHIFT],
            dirty: false,
        }));
        Self::evict(&mut bufs);
        bufs.insert((daddr, bblen), buf.clone());
        Ok(buf)
    }

    /// Writes one buffer through to the device and clears its dirty bit.
    pub fn write_buf(&self, buf: &BufRef) -> CanFail<XfsError> {
        let mut buf = buf.write();
        self.dev.write_daddr(buf.daddr, &buf.data)?;
        buf.clear_dirty();
        Ok(())
    }

    /// Writes every dirty buffer back to the device.
    pub fn flush(&self) -> CanFail<XfsError> {
        let bufs = self.bufs.lock();
        for buf in bufs.values() {
            let mut buf = buf.write();
            if buf.dirty {
                self.dev.write_daddr(buf.daddr, &buf.data)?;
                buf.clear_dirty();
            }
        }
        Ok(())
    }

    /// Drops the cache entry for a range whose blocks were freed.
    pub fn forget(&self, daddr: u64, bblen: u32) {
        self.bufs.lock().remove(&(daddr, bblen));
    }

    /// Evicts clean, unreferenced entries once the cache grows past the high
    /// water mark. Dirty entries are never evicted here; they are written by
    /// transaction commit.
    fn evict(bufs: &mut HashMap<(u64, u32), BufRef>) {
        if bufs.len() < CACHE_HIGH_WATER {
            return;
        }
        bufs.retain(|_, buf| {
            if Arc::strong_count(buf) > 1 {
                return true;
            }
            buf.read().dirty
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn cache() -> BufCache {
        let dev = Arc::new(BlockDevice::from_image(vec![0u8; 64 * 512], false));
        BufCache::new(dev)
    }

    #[test]
    fn same_range_same_instance() {
        let cache = cache();
        let a = cache.read(4, 2).unwrap();
        let b = cache.read(4, 2).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn dirty_survives_until_flush() {
        let dev = Arc::new(BlockDevice::from_image(vec![0u8; 64 * 512], false));
        let cache = BufCache::new(dev.clone());
        let buf = cache.read(0, 1).unwrap();
        {
            let mut buf = buf.write();
            buf.data_mut()[0] = 0x42;
            buf.mark_dirty();
        }

        // Not written back yet.
        let mut raw = [0u8; 512];
        dev.read_daddr(0, &mut raw).unwrap();
        assert_eq!(raw[0], 0);

        cache.flush().unwrap();
        assert!(!buf.read().is_dirty());
        dev.read_daddr(0, &mut raw).unwrap();
        assert_eq!(raw[0], 0x42);
    }

    #[test]
    fn get_skips_read() {
        let mut image = vec![0u8; 512];
        image[0] = 0xff;
        let dev = Arc::new(BlockDevice::from_image(image, false));
        let cache = BufCache::new(dev);

        let buf = cache.get(0, 1).unwrap();
        assert_eq!(buf.read().data()[0], 0);
    }
}
