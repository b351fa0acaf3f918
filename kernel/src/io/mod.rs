//! Unified I/O objects.
//!
//! Everything byte-shaped in the kernel (files, devices, pipes, memory
//! buffers) is an [`Io`] trait object behind an [`Arc`]. Each operation
//! is optional; objects implement what they support and inherit
//! `NotSupported` for the rest. References are counted by the `Arc`:
//! cloning a descriptor adds a reference, dropping the last one runs the
//! object's `Drop`, which is its close.
//!
//! Stream reads and writes may be short; `0` from `read` means end of
//! stream. The [`fill`] and [`write_all`] helpers loop an operation to
//! completion and surface the first error verbatim.

pub mod memio;
pub mod pipe;
pub mod seekio;

use alloc::sync::Arc;

use crate::error::{KernelError, KernelResult};

pub use memio::MemIo;
pub use pipe::{create_pipe, PipeReader, PipeWriter};
pub use seekio::SeekIo;

/// A shared, reference-counted I/O object.
pub type IoRef = Arc<dyn Io>;

/// The polymorphic I/O contract.
///
/// All operations take `&self`; objects carry their own interior locking.
impl core::fmt::Debug for dyn Io {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("dyn Io")
    }
}

pub trait Io: Send + Sync {
    /// Stream read. May be short; `Ok(0)` is end of stream.
    fn read(&self, _buf: &mut [u8]) -> KernelResult<usize> {
        Err(KernelError::NotSupported)
    }

    /// Stream write. May be short.
    fn write(&self, _buf: &[u8]) -> KernelResult<usize> {
        Err(KernelError::NotSupported)
    }

    /// Positioned read; same shortness semantics as `read`.
    fn read_at(&self, _pos: u64, _buf: &mut [u8]) -> KernelResult<usize> {
        Err(KernelError::NotSupported)
    }

    /// Positioned write; same shortness semantics as `write`.
    fn write_at(&self, _pos: u64, _buf: &[u8]) -> KernelResult<usize> {
        Err(KernelError::NotSupported)
    }

    /// Transfer granularity in bytes; 1 means byte-granular.
    fn block_size(&self) -> usize {
        1
    }

    /// Device or file end, exclusive.
    fn end(&self) -> KernelResult<u64> {
        Err(KernelError::NotSupported)
    }

    /// Move the end (grow or truncate, object-specific).
    fn set_end(&self, _end: u64) -> KernelResult<()> {
        Err(KernelError::NotSupported)
    }

    /// Current position of a seekable object.
    fn position(&self) -> KernelResult<u64> {
        Err(KernelError::NotSupported)
    }

    /// Seek a seekable object.
    fn set_position(&self, _pos: u64) -> KernelResult<()> {
        Err(KernelError::NotSupported)
    }
}

/// Read until `buf` is full or the stream ends. Returns the bytes read;
/// the first error is surfaced verbatim.
pub fn fill(io: &dyn Io, buf: &mut [u8]) -> KernelResult<usize> {
    let mut pos = 0;
    while pos < buf.len() {
        let n = io.read(&mut buf[pos..])?;
        if n == 0 {
            break;
        }
        pos += n;
    }
    Ok(pos)
}

/// Write all of `buf`, looping over short writes.
pub fn write_all(io: &dyn Io, buf: &[u8]) -> KernelResult<usize> {
    let mut pos = 0;
    while pos < buf.len() {
        let n = io.write(&buf[pos..])?;
        if n == 0 {
            break;
        }
        pos += n;
    }
    Ok(pos)
}

/// Positioned read of exactly `buf.len()` bytes; a premature end is an
/// `IoError`.
pub fn read_exact_at(io: &dyn Io, pos: u64, buf: &mut [u8]) -> KernelResult<()> {
    let mut done = 0;
    while done < buf.len() {
        let n = io.read_at(pos + done as u64, &mut buf[done..])?;
        if n == 0 {
            return Err(KernelError::IoError);
        }
        done += n;
    }
    Ok(())
}

/// Positioned write of exactly `buf.len()` bytes.
pub fn write_exact_at(io: &dyn Io, pos: u64, buf: &[u8]) -> KernelResult<()> {
    let mut done = 0;
    while done < buf.len() {
        let n = io.write_at(pos + done as u64, &buf[done..])?;
        if n == 0 {
            return Err(KernelError::IoError);
        }
        done += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    /// A stream that hands out its bytes at most `chunk` at a time.
    struct Trickle {
        data: spin::Mutex<(vec::Vec<u8>, usize)>,
        chunk: usize,
    }

    impl Io for Trickle {
        fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
            let mut state = self.data.lock();
            let (ref data, ref mut off) = *state;
            let n = buf.len().min(self.chunk).min(data.len() - *off);
            buf[..n].copy_from_slice(&data[*off..*off + n]);
            *off += n;
            Ok(n)
        }
    }

    #[test]
    fn test_fill_loops_over_short_reads() {
        let io = Trickle {
            data: spin::Mutex::new((b"abcdefgh".to_vec(), 0)),
            chunk: 3,
        };
        let mut buf = [0u8; 8];
        assert_eq!(fill(&io, &mut buf).unwrap(), 8);
        assert_eq!(&buf, b"abcdefgh");
    }

    #[test]
    fn test_fill_stops_at_stream_end() {
        let io = Trickle {
            data: spin::Mutex::new((b"abc".to_vec(), 0)),
            chunk: 2,
        };
        let mut buf = [0u8; 8];
        assert_eq!(fill(&io, &mut buf).unwrap(), 3);
    }

    #[test]
    fn test_defaults_are_not_supported() {
        struct Nothing;
        impl Io for Nothing {}
        let mut buf = [0u8; 4];
        assert_eq!(Nothing.read(&mut buf), Err(KernelError::NotSupported));
        assert_eq!(Nothing.write(&buf), Err(KernelError::NotSupported));
        assert_eq!(Nothing.end(), Err(KernelError::NotSupported));
        assert_eq!(Nothing.block_size(), 1);
    }
}
