//! RAM-backed block device.
//!
//! The block-device contract with nothing underneath it: 512-byte blocks,
//! block-aligned positions, whole-block transfer lengths. Backs the
//! filesystem in hosted runs and in tests, and doubles as the reference
//! implementation of the contract real transports must satisfy.

use alloc::sync::Arc;
use alloc::vec;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::io::Io;

/// Block size of the device.
pub const RAMDISK_BLKSZ: usize = 512;

/// A block device over a heap buffer.
pub struct RamDisk {
    data: Mutex<alloc::boxed::Box<[u8]>>,
}

impl RamDisk {
    /// A zeroed disk of `blocks` blocks.
    pub fn new(blocks: usize) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(vec![0u8; blocks * RAMDISK_BLKSZ].into_boxed_slice()),
        })
    }

    /// A disk initialized from an image, padded up to a whole block.
    pub fn from_image(image: &[u8]) -> Arc<Self> {
        let blocks = crate::mm::round_up(image.len().max(RAMDISK_BLKSZ), RAMDISK_BLKSZ)
            / RAMDISK_BLKSZ;
        let disk = Self::new(blocks);
        disk.data.lock()[..image.len()].copy_from_slice(image);
        disk
    }

    fn check_request(&self, pos: u64, len: usize) -> KernelResult<usize> {
        if pos % RAMDISK_BLKSZ as u64 != 0 || len % RAMDISK_BLKSZ != 0 {
            return Err(KernelError::Invalid);
        }
        let size = self.data.lock().len() as u64;
        if pos > size {
            return Err(KernelError::Invalid);
        }
        // Clamp to the device end in whole blocks.
        let avail = (size - pos) as usize;
        Ok(len.min(avail))
    }
}

impl Io for RamDisk {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> KernelResult<usize> {
        let n = self.check_request(pos, buf.len())?;
        let data = self.data.lock();
        buf[..n].copy_from_slice(&data[pos as usize..pos as usize + n]);
        Ok(n)
    }

    fn write_at(&self, pos: u64, buf: &[u8]) -> KernelResult<usize> {
        let n = self.check_request(pos, buf.len())?;
        let mut data = self.data.lock();
        data[pos as usize..pos as usize + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    fn block_size(&self) -> usize {
        RAMDISK_BLKSZ
    }

    fn end(&self) -> KernelResult<u64> {
        Ok(self.data.lock().len() as u64)
    }
}
