//! Device registry.
//!
//! MMIO driver bodies live outside this crate's core; what the kernel
//! needs from a device is the I/O contract it presents. Drivers register
//! an I/O object under a (name, instance) pair at attach time and
//! `devopen` hands out added references.

pub mod ramdisk;

pub use ramdisk::RamDisk;

use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::io::IoRef;

struct DeviceEntry {
    name: &'static str,
    instno: usize,
    io: IoRef,
}

lazy_static! {
    static ref DEVICES: Mutex<Vec<DeviceEntry>> = Mutex::new(Vec::new());
}

/// Attach a device instance under `name`/`instno`.
///
/// Fails with `BusyOrExists` if the pair is already registered.
pub fn register_device(name: &'static str, instno: usize, io: IoRef) -> KernelResult<()> {
    let mut devices = DEVICES.lock();
    if devices
        .iter()
        .any(|d| d.name == name && d.instno == instno)
    {
        return Err(KernelError::BusyOrExists);
    }
    devices.push(DeviceEntry { name, instno, io });
    log::info!("dev: registered {}{}", name, instno);
    Ok(())
}

/// Open a registered device: returns an added reference to its I/O object.
pub fn open_device(name: &str, instno: usize) -> KernelResult<IoRef> {
    let devices = DEVICES.lock();
    devices
        .iter()
        .find(|d| d.name == name && d.instno == instno)
        .map(|d| d.io.clone())
        .ok_or(KernelError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemIo;

    #[test]
    fn test_register_and_open() {
        let io: IoRef = MemIo::with_capacity(64);
        register_device("testdev", 7, io).unwrap();

        let opened = open_device("testdev", 7).unwrap();
        assert_eq!(opened.end().unwrap(), 64);

        assert_eq!(
            open_device("testdev", 8).unwrap_err(),
            KernelError::NotFound
        );
        assert_eq!(
            register_device("testdev", 7, MemIo::with_capacity(1)).unwrap_err(),
            KernelError::BusyOrExists
        );
    }
}
