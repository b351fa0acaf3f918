//! Seekable wrapper.
//!
//! Adapts a positioned-I/O endpoint into a stream: a current position and
//! a cached end, with `read`/`write` forwarding to `read_at`/`write_at`.
//! Transfers must be at least one backing block and are truncated down to
//! a whole number of blocks; writing past the end grows the backing
//! endpoint first. Holds one reference on the backing object for its
//! lifetime.

use alloc::sync::Arc;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::io::{Io, IoRef};

struct SeekState {
    pos: u64,
    end: u64,
}

/// Stream view over a positioned-I/O endpoint.
pub struct SeekIo {
    backing: IoRef,
    blksz: usize,
    state: Mutex<SeekState>,
}

impl SeekIo {
    /// Wrap `backing`, snapshotting its end.
    ///
    /// The backing block size must be a positive power of two and the
    /// backing object must report an end.
    pub fn new(backing: IoRef) -> KernelResult<Arc<Self>> {
        let blksz = backing.block_size();
        if blksz == 0 || !blksz.is_power_of_two() {
            return Err(KernelError::Invalid);
        }
        let end = backing.end()?;
        Ok(Arc::new(Self {
            backing,
            blksz,
            state: Mutex::new(SeekState { pos: 0, end }),
        }))
    }
}

impl Io for SeekIo {
    fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        let mut state = self.state.lock();
        // Cannot read past the end.
        let avail = state.end.saturating_sub(state.pos);
        let mut len = (buf.len() as u64).min(avail) as usize;
        if len == 0 {
            return Ok(0);
        }
        if len < self.blksz {
            return Err(KernelError::Invalid);
        }
        len &= !(self.blksz - 1);

        let n = self.backing.read_at(state.pos, &mut buf[..len])?;
        state.pos += n as u64;
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> KernelResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if buf.len() < self.blksz {
            return Err(KernelError::Invalid);
        }
        let len = buf.len() & !(self.blksz - 1);

        let mut state = self.state.lock();
        // Writing past the end extends the backing endpoint first.
        if state.end.saturating_sub(state.pos) < len as u64 {
            let new_end = state
                .pos
                .checked_add(len as u64)
                .ok_or(KernelError::Invalid)?;
            self.backing.set_end(new_end)?;
            state.end = new_end;
        }

        let n = self.backing.write_at(state.pos, &buf[..len])?;
        state.pos += n as u64;
        Ok(n)
    }

    fn read_at(&self, pos: u64, buf: &mut [u8]) -> KernelResult<usize> {
        self.backing.read_at(pos, buf)
    }

    fn write_at(&self, pos: u64, buf: &[u8]) -> KernelResult<usize> {
        self.backing.write_at(pos, buf)
    }

    fn block_size(&self) -> usize {
        self.blksz
    }

    fn end(&self) -> KernelResult<u64> {
        Ok(self.state.lock().end)
    }

    fn set_end(&self, end: u64) -> KernelResult<()> {
        self.backing.set_end(end)?;
        self.state.lock().end = end;
        Ok(())
    }

    fn position(&self) -> KernelResult<u64> {
        Ok(self.state.lock().pos)
    }

    /// Seek; the position must be block-aligned and not past the end.
    fn set_position(&self, pos: u64) -> KernelResult<()> {
        let mut state = self.state.lock();
        if pos & (self.blksz as u64 - 1) != 0 {
            return Err(KernelError::Invalid);
        }
        if pos > state.end {
            return Err(KernelError::Invalid);
        }
        state.pos = pos;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemIo;

    /// Byte-granular backing (block size 1), like a filesystem file.
    fn byte_backing(len: usize) -> IoRef {
        MemIo::with_capacity(len)
    }

    #[test]
    fn test_sequential_reads_advance() {
        let mem = byte_backing(10);
        mem.write_at(0, b"0123456789").unwrap();
        let sio = SeekIo::new(mem).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(sio.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"0123");
        assert_eq!(sio.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"4567");
        // Clamped at end, then end-of-stream.
        assert_eq!(sio.read(&mut buf).unwrap(), 2);
        assert_eq!(sio.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_write_past_end_grows_backing() {
        let mem = byte_backing(64);
        mem.set_end(0).unwrap();
        let sio = SeekIo::new(mem.clone()).unwrap();

        assert_eq!(sio.end().unwrap(), 0);
        assert_eq!(sio.write(b"hello").unwrap(), 5);
        assert_eq!(sio.end().unwrap(), 5);
        assert_eq!(mem.end().unwrap(), 5);

        let mut buf = [0u8; 5];
        assert_eq!(sio.read_at(0, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_seek_rules() {
        let mem = byte_backing(16);
        let sio = SeekIo::new(mem).unwrap();
        sio.set_position(8).unwrap();
        assert_eq!(sio.position().unwrap(), 8);
        // Past the end.
        assert_eq!(sio.set_position(17), Err(KernelError::Invalid));
    }

    /// Backing with 4-byte blocks to exercise the multiple-of-block rules.
    struct Blocky {
        mem: IoRef,
    }

    impl Io for Blocky {
        fn read_at(&self, pos: u64, buf: &mut [u8]) -> KernelResult<usize> {
            self.mem.read_at(pos, buf)
        }
        fn write_at(&self, pos: u64, buf: &[u8]) -> KernelResult<usize> {
            self.mem.write_at(pos, buf)
        }
        fn block_size(&self) -> usize {
            4
        }
        fn end(&self) -> KernelResult<u64> {
            self.mem.end()
        }
        fn set_end(&self, end: u64) -> KernelResult<()> {
            self.mem.set_end(end)
        }
    }

    #[test]
    fn test_block_granularity_enforced() {
        let sio = SeekIo::new(Arc::new(Blocky {
            mem: byte_backing(32),
        }))
        .unwrap();

        let mut small = [0u8; 2];
        assert_eq!(sio.read(&mut small), Err(KernelError::Invalid));
        assert_eq!(sio.write(&small), Err(KernelError::Invalid));

        // A 10-byte request is truncated down to 8 (two blocks).
        let mut buf = [0u8; 10];
        assert_eq!(sio.read(&mut buf).unwrap(), 8);
        assert_eq!(sio.position().unwrap(), 8);

        // Seeks must be block-aligned.
        assert_eq!(sio.set_position(6), Err(KernelError::Invalid));
        sio.set_position(8).unwrap();
    }
}
