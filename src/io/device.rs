//! Sector-addressed access to the backing storage.
//!
//! A [`BlockDevice`] wraps either a block device / image file on the host,
//! or an in-memory image used by the test suites. Addresses are expressed in
//! basic blocks (see [`super::BB_SHIFT`]); lengths are whole numbers of
//! basic blocks.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use spin::Mutex;

use crate::errors::{CanFail, XfsError};
use crate::io::{BB_SHIFT, BB_SIZE};

enum Backing {
    /// A block device or image file on the host filesystem.
    File(File),
    /// An in-memory image.
    Mem(Mutex<Vec<u8>>),
}

/// The storage a volume is bound to.
pub struct BlockDevice {
    backing: Backing,
    read_only: bool,
    /// Device capacity, in basic blocks.
    size_bb: u64,
}

impl BlockDevice {
    /// Opens a block device or image file.
    ///
    /// A read-only open never issues writes; [`BlockDevice::write_daddr`]
    /// fails on such a device.
    pub fn open(path: &Path, read_only: bool) -> Result<Self, std::io::Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;
        let size_bb = file.metadata()?.len() >> BB_SHIFT;

        Ok(Self {
            backing: Backing::File(file),
            read_only,
            size_bb,
        })
    }

    /// Wraps an in-memory image. The image length must be sector aligned.
    pub fn from_image(image: Vec<u8>, read_only: bool) -> Self {
        let size_bb = (image.len() >> BB_SHIFT) as u64;

        Self {
            backing: Backing::Mem(Mutex::new(image)),
            read_only,
            size_bb,
        }
    }

    /// Tells whether the device was opened read-only.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Device capacity, in basic blocks.
    pub fn size_bb(&self) -> u64 {
        self.size_bb
    }

    /// Reads `buf.len()` bytes starting at basic block `daddr`.
    ///
    /// The buffer length must be a multiple of the basic block size.
    pub fn read_daddr(&self, daddr: u64, buf: &mut [u8]) -> CanFail<XfsError> {
        debug_assert_eq!(buf.len() % BB_SIZE, 0);
        let off = daddr << BB_SHIFT;

        if daddr + ((buf.len() >> BB_SHIFT) as u64) > self.size_bb {
            log::error!("read past end of device (daddr {daddr:#x})");
            return Err(XfsError::Io);
        }

        match &self.backing {
            Backing::File(file) => file.read_exact_at(buf, off).map_err(|err| {
                log::error!("device read failed at daddr {daddr:#x}: {err}");
                XfsError::Io
            }),
            Backing::Mem(image) => {
                let image = image.lock();
                buf.copy_from_slice(&image[off as usize..off as usize + buf.len()]);
                Ok(())
            }
        }
    }

    /// Writes `buf.len()` bytes starting at basic block `daddr`.
    pub fn write_daddr(&self, daddr: u64, buf: &[u8]) -> CanFail<XfsError> {
        debug_assert_eq!(buf.len() % BB_SIZE, 0);
        if self.read_only {
            return Err(XfsError::ReadOnly);
        }
        let off = daddr << BB_SHIFT;

        if daddr + ((buf.len() >> BB_SHIFT) as u64) > self.size_bb {
            log::error!("write past end of device (daddr {daddr:#x})");
            return Err(XfsError::Io);
        }

        match &self.backing {
            Backing::File(file) => file.write_all_at(buf, off).map_err(|err| {
                log::error!("device write failed at daddr {daddr:#x}: {err}");
                XfsError::Io
            }),
            Backing::Mem(image) => {
                let mut image = image.lock();
                image[off as usize..off as usize + buf.len()].copy_from_slice(buf);
                Ok(())
            }
        }
    }

    /// Clones the current content of an in-memory image.
    ///
    /// Only meaningful for test devices; file-backed devices return `None`.
    pub fn image_snapshot(&self) -> Option<Vec<u8>> {
        match &self.backing {
            Backing::Mem(image) => Some(image.lock().clone()),
            Backing::File(_) => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mem_device_roundtrip() {
        let dev = BlockDevice::from_image(vec![0u8; 4096], false);
        assert_eq!(dev.size_bb(), 8);

        let sector = [0xabu8; BB_SIZE];
        dev.write_daddr(3, &sector).unwrap();

        let mut back = [0u8; BB_SIZE];
        dev.read_daddr(3, &mut back).unwrap();
        assert_eq!(back, sector);

        // Neighbouring sectors are untouched.
        dev.read_daddr(2, &mut back).unwrap();
        assert_eq!(back, [0u8; BB_SIZE]);
    }

    #[test]
    fn mem_device_read_only() {
        let dev = BlockDevice::from_image(vec![0u8; 4096], true);
        let sector = [0u8; BB_SIZE];
        assert_eq!(dev.write_daddr(0, &sector), Err(XfsError::ReadOnly));
    }

    #[test]
    fn mem_device_bounds() {
        let dev = BlockDevice::from_image(vec![0u8; 1024], false);
        let mut buf = [0u8; BB_SIZE];
        assert_eq!(dev.read_daddr(2, &mut buf), Err(XfsError::Io));
    }
}
