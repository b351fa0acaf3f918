//! Byte pipe.
//!
//! A one-page circular buffer connecting a write end to a read end, each
//! its own reference-counted I/O object. Reads block while the pipe is
//! empty and the write end is open, then drain whatever remains and
//! return short (finally 0) once it closes. Writes block while the pipe
//! is full and fail with `BrokenPipe` once the read end is gone. The
//! shared buffer lives exactly as long as either end does.

use alloc::boxed::Box;
use alloc::sync::Arc;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::io::Io;
use crate::mm::PAGE_SIZE;
use crate::sched::sync::Condition;

/// Ring capacity: one page. One slot is kept open to tell full from
/// empty, so the usable capacity is `PIPE_BUFSZ - 1` bytes.
const PIPE_BUFSZ: usize = PAGE_SIZE;

struct PipeInner {
    buf: Box<[u8; PIPE_BUFSZ]>,
    head: usize,
    tail: usize,
    read_open: bool,
    write_open: bool,
}

impl PipeInner {
    fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    fn is_full(&self) -> bool {
        (self.tail + 1) % PIPE_BUFSZ == self.head
    }

    /// Move bytes out of the ring; never blocks.
    fn read_some(&mut self, out: &mut [u8]) -> usize {
        let mut n = 0;
        while n < out.len() && !self.is_empty() {
            out[n] = self.buf[self.head];
            self.head = (self.head + 1) % PIPE_BUFSZ;
            n += 1;
        }
        n
    }

    /// Move bytes into the ring; never blocks.
    fn write_some(&mut self, data: &[u8]) -> usize {
        let mut n = 0;
        while n < data.len() && !self.is_full() {
            self.buf[self.tail] = data[n];
            self.tail = (self.tail + 1) % PIPE_BUFSZ;
            n += 1;
        }
        n
    }
}

struct PipeShared {
    inner: Mutex<PipeInner>,
    can_read: Condition,
    can_write: Condition,
}

/// The read end of a pipe.
pub struct PipeReader {
    shared: Arc<PipeShared>,
}

/// The write end of a pipe.
pub struct PipeWriter {
    shared: Arc<PipeShared>,
}

/// Create a connected pipe pair.
pub fn create_pipe() -> (Arc<PipeWriter>, Arc<PipeReader>) {
    let shared = Arc::new(PipeShared {
        inner: Mutex::new(PipeInner {
            buf: Box::new([0u8; PIPE_BUFSZ]),
            head: 0,
            tail: 0,
            read_open: true,
            write_open: true,
        }),
        can_read: Condition::new("pipe.can_read"),
        can_write: Condition::new("pipe.can_write"),
    });
    (
        Arc::new(PipeWriter {
            shared: shared.clone(),
        }),
        Arc::new(PipeReader { shared }),
    )
}

impl Io for PipeReader {
    /// Fill `buf` from the pipe, blocking while it is empty and the write
    /// end is open. Once the write end closes, remaining bytes are
    /// drained and the read returns short; an empty pipe then reads 0.
    fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut nread = 0;
        loop {
            {
                let mut inner = self.shared.inner.lock();
                let n = inner.read_some(&mut buf[nread..]);
                nread += n;
                if n > 0 {
                    self.shared.can_write.broadcast();
                }
                if nread == buf.len() || !inner.write_open {
                    return Ok(nread);
                }
            }
            self.shared.can_read.wait();
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.shared.inner.lock().read_open = false;
        // Blocked writers must observe the broken pipe.
        self.shared.can_write.broadcast();
    }
}

impl Io for PipeWriter {
    /// Write all of `data`, blocking while the pipe is full and the read
    /// end is open. Fails with `BrokenPipe` once the read end is closed.
    fn write(&self, data: &[u8]) -> KernelResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut written = 0;
        loop {
            {
                let mut inner = self.shared.inner.lock();
                if !inner.read_open {
                    return Err(KernelError::BrokenPipe);
                }
                let n = inner.write_some(&data[written..]);
                written += n;
                if n > 0 {
                    self.shared.can_read.broadcast();
                }
                if written == data.len() {
                    return Ok(written);
                }
            }
            self.shared.can_write.wait();
        }
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.shared.inner.lock().write_open = false;
        // Blocked readers must observe end of stream.
        self.shared.can_read.broadcast();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_bytes_arrive_in_order() {
        let (w, r) = create_pipe();
        assert_eq!(w.write(b"hello pipe").unwrap(), 10);
        let mut buf = [0u8; 10];
        assert_eq!(r.read(&mut buf).unwrap(), 10);
        assert_eq!(&buf, b"hello pipe");
    }

    #[test]
    fn test_close_write_end_drains_then_eof() {
        let (w, r) = create_pipe();
        w.write(b"tail").unwrap();
        drop(w);

        let mut buf = [0u8; 16];
        // Short read: the remaining bytes are drained.
        assert_eq!(r.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"tail");
        // End of stream thereafter.
        assert_eq!(r.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_broken_pipe_after_reader_close() {
        let (w, r) = create_pipe();
        drop(r);
        assert_eq!(w.write(b"x"), Err(KernelError::BrokenPipe));
    }

    #[test]
    fn test_ring_wraps_and_preserves_order() {
        let (w, r) = create_pipe();
        // Push well past one ring's worth in interleaved chunks so neither
        // end ever has to block.
        let total = 12_000; // ~3 rings, a multiple of the chunk size
        let chunk = 1000;
        let mut sent = 0usize;
        let mut received = 0usize;
        let mut out = vec![0u8; chunk];
        while received < total {
            if sent < total {
                let data: vec::Vec<u8> =
                    (sent..sent + chunk).map(|i| (i % 251) as u8).collect();
                assert_eq!(w.write(&data).unwrap(), chunk);
                sent += chunk;
            }
            let n = r.read(&mut out[..chunk.min(sent - received)]).unwrap();
            for &byte in &out[..n] {
                assert_eq!(byte, (received % 251) as u8);
                received += 1;
            }
        }
        assert_eq!(received, total);
    }

    #[test]
    fn test_backpressure_totals() {
        let (w, r) = create_pipe();
        let total = 5000usize;
        let mut written = 0usize;
        let mut read = 0usize;
        let mut reads = 0usize;
        let mut buf = [0u8; 100];
        // Writer stays ahead but within the ring's capacity; reader takes
        // 100 bytes at a time.
        while read < total {
            while written < total && written - read + 1000 < PIPE_BUFSZ {
                let n = w
                    .write(&vec![0xA5u8; 1000.min(total - written)])
                    .unwrap();
                written += n;
            }
            let n = r.read(&mut buf[..100.min(written - read)]).unwrap();
            assert!(buf[..n].iter().all(|&b| b == 0xA5));
            read += n;
            reads += 1;
        }
        assert_eq!(written, 5000);
        assert_eq!(read, 5000);
        assert_eq!(reads, 50);
    }
}
