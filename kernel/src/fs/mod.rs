//! Filesystem layer: the block cache and the KTFS implementation, plus
//! the kernel's single global mount.

pub mod cache;
pub mod ktfs;

pub use cache::{BlockCache, BlockGuard, BLOCK_SIZE};
pub use ktfs::Ktfs;

use alloc::sync::Arc;

use spin::Once;

use crate::error::{KernelError, KernelResult};
use crate::io::IoRef;

static MOUNT: Once<Arc<Ktfs>> = Once::new();

/// Mount the global filesystem from a block-device endpoint. One mount
/// per boot.
pub fn mount(dev: IoRef) -> KernelResult<()> {
    let fs = Ktfs::mount(dev)?;
    let mut first = false;
    MOUNT.call_once(|| {
        first = true;
        fs
    });
    if first {
        Ok(())
    } else {
        Err(KernelError::BusyOrExists)
    }
}

fn mounted() -> KernelResult<&'static Arc<Ktfs>> {
    MOUNT.get().ok_or(KernelError::NotFound)
}

/// Open a file on the global mount.
pub fn open(name: &str) -> KernelResult<IoRef> {
    mounted()?.open(name)
}

/// Create a file on the global mount.
pub fn create(name: &str) -> KernelResult<()> {
    mounted()?.create(name)
}

/// Delete a file on the global mount.
pub fn delete(name: &str) -> KernelResult<()> {
    mounted()?.delete(name)
}

/// Flush the global mount's dirty blocks.
pub fn flush() -> KernelResult<()> {
    mounted()?.flush()
}
