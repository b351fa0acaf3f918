//! Memory-backed I/O.
//!
//! A fixed-capacity byte buffer behind the positioned-I/O contract. The
//! readable/writable *end* can move anywhere within the buffer's capacity,
//! which is fixed at creation.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::io::Io;

struct MemIoState {
    buf: Box<[u8]>,
    end: usize,
}

/// Fixed-capacity memory buffer exposed as a positioned I/O object.
pub struct MemIo {
    inner: Mutex<MemIoState>,
}

impl MemIo {
    /// Wrap an existing buffer; the end starts at the buffer's length.
    pub fn new(buf: Box<[u8]>) -> Arc<Self> {
        let end = buf.len();
        Arc::new(Self {
            inner: Mutex::new(MemIoState { buf, end }),
        })
    }

    /// A zeroed buffer of `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Self::new(vec![0u8; capacity].into_boxed_slice())
    }
}

impl Io for MemIo {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> KernelResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let state = self.inner.lock();
        let pos = pos as usize;
        if pos >= state.end {
            return Err(KernelError::Invalid);
        }
        let n = buf.len().min(state.end - pos);
        buf[..n].copy_from_slice(&state.buf[pos..pos + n]);
        Ok(n)
    }

    fn write_at(&self, pos: u64, buf: &[u8]) -> KernelResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.inner.lock();
        let pos = pos as usize;
        if pos >= state.end {
            return Err(KernelError::Invalid);
        }
        let n = buf.len().min(state.end - pos);
        state.buf[pos..pos + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    fn end(&self) -> KernelResult<u64> {
        Ok(self.inner.lock().end as u64)
    }

    /// Move the end anywhere in `[0, capacity]`.
    fn set_end(&self, end: u64) -> KernelResult<()> {
        let mut state = self.inner.lock();
        if end > state.buf.len() as u64 {
            return Err(KernelError::Invalid);
        }
        state.end = end as usize;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io;

    #[test]
    fn test_read_write_clamped_to_end() {
        let mem = MemIo::with_capacity(16);
        assert_eq!(mem.write_at(12, b"abcdef").unwrap(), 4);
        let mut buf = [0u8; 8];
        assert_eq!(mem.read_at(12, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"abcd");
    }

    #[test]
    fn test_out_of_range_position_rejected() {
        let mem = MemIo::with_capacity(8);
        let mut buf = [0u8; 4];
        assert_eq!(mem.read_at(8, &mut buf), Err(KernelError::Invalid));
        assert_eq!(mem.write_at(9, &buf), Err(KernelError::Invalid));
        // Empty transfers succeed anywhere.
        assert_eq!(mem.read_at(100, &mut []).unwrap(), 0);
    }

    #[test]
    fn test_set_end_within_capacity() {
        let mem = MemIo::with_capacity(8);
        mem.set_end(4).unwrap();
        assert_eq!(mem.end().unwrap(), 4);
        let mut buf = [0u8; 8];
        assert_eq!(mem.read_at(0, &mut buf).unwrap(), 4);

        // Grow back up to capacity, but never beyond.
        mem.set_end(8).unwrap();
        assert_eq!(mem.end().unwrap(), 8);
        assert_eq!(mem.set_end(9), Err(KernelError::Invalid));
    }

    #[test]
    fn test_round_trip_through_helpers() {
        let mem = MemIo::with_capacity(32);
        io::write_exact_at(&*mem, 5, b"payload").unwrap();
        let mut back = [0u8; 7];
        io::read_exact_at(&*mem, 5, &mut back).unwrap();
        assert_eq!(&back, b"payload");
    }
}
