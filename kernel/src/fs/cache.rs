//! LRU block cache.
//!
//! Sits between the filesystem and a block-device I/O endpoint. A fixed
//! number of 512-byte entries is kept in most-recent-first order; a hit
//! moves the entry to the front, a miss claims an invalid entry or evicts
//! the least-recently-used one (writing it back first when dirty).
//!
//! A block is *checked out* while a caller holds its [`BlockGuard`]: the
//! entry's buffer is moved into the guard, so no second caller can obtain
//! the same position and checked-out entries are never eviction victims.
//! Releasing with `dirty` writes the block through to the backing
//! endpoint before the release returns; if that write fails, the entry is
//! left dirty so a later flush (or eviction) can retry it.

use alloc::boxed::Box;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::io::{self, IoRef};

/// Cache block size in bytes.
pub const BLOCK_SIZE: usize = 512;
/// Number of cache entries.
const CAPACITY: usize = 64;

type Block = [u8; BLOCK_SIZE];

struct Entry {
    /// Byte position of this block in the backing endpoint.
    pos: u64,
    valid: bool,
    dirty: bool,
    /// `None` while the block is checked out to a caller.
    buf: Option<Box<Block>>,
}

/// A checked-out cache block. Must be returned with
/// [`BlockCache::release`].
pub struct BlockGuard {
    pos: u64,
    buf: Box<Block>,
}

impl BlockGuard {
    pub fn pos(&self) -> u64 {
        self.pos
    }
}

impl core::ops::Deref for BlockGuard {
    type Target = Block;

    fn deref(&self) -> &Block {
        &self.buf
    }
}

impl core::ops::DerefMut for BlockGuard {
    fn deref_mut(&mut self) -> &mut Block {
        &mut self.buf
    }
}

/// LRU cache of fixed-size blocks over a backing positioned-I/O endpoint.
pub struct BlockCache {
    backing: IoRef,
    /// Entries in LRU order: front is most recent, back is the victim.
    entries: Mutex<Vec<Entry>>,
}

impl BlockCache {
    /// Build a cache of invalid entries over `backing`.
    pub fn new(backing: IoRef) -> Self {
        let mut entries = Vec::with_capacity(CAPACITY);
        for _ in 0..CAPACITY {
            entries.push(Entry {
                pos: 0,
                valid: false,
                dirty: false,
                buf: Some(Box::new([0u8; BLOCK_SIZE])),
            });
        }
        Self {
            backing,
            entries: Mutex::new(entries),
        }
    }

    /// The backing endpoint.
    pub fn backing(&self) -> &IoRef {
        &self.backing
    }

    /// Check out the block at byte position `pos` (block-aligned).
    ///
    /// Hit: the entry moves to the LRU front. Miss: an invalid entry is
    /// claimed in place, or the rearmost entry holding a buffer is
    /// evicted (written back first when dirty) and the reloaded entry
    /// becomes the front.
    pub fn get(&self, pos: u64) -> KernelResult<BlockGuard> {
        debug_assert_eq!(pos % BLOCK_SIZE as u64, 0);

        // Hit path.
        {
            let mut entries = self.entries.lock();
            if let Some(at) = entries.iter().position(|e| e.valid && e.pos == pos) {
                if entries[at].buf.is_none() {
                    // Already checked out; a second handout would alias.
                    return Err(KernelError::BusyOrExists);
                }
                let mut entry = entries.remove(at);
                let buf = entry.buf.take().unwrap();
                entries.insert(0, entry);
                return Ok(BlockGuard { pos, buf });
            }
        }

        // Miss: claim an invalid entry in place.
        let claimed = {
            let mut entries = self.entries.lock();
            match entries
                .iter()
                .position(|e| !e.valid && e.buf.is_some())
            {
                Some(at) => {
                    let entry = &mut entries[at];
                    entry.valid = true;
                    entry.dirty = false;
                    entry.pos = pos;
                    Some(entry.buf.take().unwrap())
                }
                None => None,
            }
        };
        if let Some(mut buf) = claimed {
            if let Err(e) = io::read_exact_at(&**self.backing(), pos, &mut buf[..]) {
                let mut entries = self.entries.lock();
                if let Some(at) = entries.iter().position(|e| e.valid && e.pos == pos) {
                    entries[at].valid = false;
                    entries[at].buf = Some(buf);
                }
                return Err(e);
            }
            return Ok(BlockGuard { pos, buf });
        }

        // Eviction: take the rearmost entry that still holds its buffer.
        let (mut entry, was_dirty) = {
            let mut entries = self.entries.lock();
            let at = entries
                .iter()
                .rposition(|e| e.buf.is_some())
                .ok_or(KernelError::IoError)?;
            let entry = entries.remove(at);
            let was_dirty = entry.dirty;
            (entry, was_dirty)
        };

        if was_dirty {
            let buf = entry.buf.as_ref().unwrap();
            if let Err(e) = io::write_exact_at(&**self.backing(), entry.pos, &buf[..]) {
                // Keep the victim (still dirty) so a later flush retries.
                self.entries.lock().push(entry);
                return Err(e);
            }
            entry.dirty = false;
        }

        let mut buf = entry.buf.take().unwrap();
        if let Err(e) = io::read_exact_at(&**self.backing(), pos, &mut buf[..]) {
            entry.valid = false;
            entry.buf = Some(buf);
            self.entries.lock().push(entry);
            return Err(e);
        }

        entry.pos = pos;
        entry.valid = true;
        entry.dirty = false;
        // The reloaded entry rotates to the front.
        self.entries.lock().insert(0, entry);
        Ok(BlockGuard { pos, buf })
    }

    /// Return a checked-out block.
    ///
    /// With `dirty`, the block is written through to the backing endpoint
    /// before this returns; on failure the entry keeps its dirty mark and
    /// the error propagates. Guards whose entry has vanished are ignored.
    pub fn release(&self, guard: BlockGuard, dirty: bool) -> KernelResult<()> {
        let BlockGuard { pos, buf } = guard;

        let write_result = if dirty {
            io::write_exact_at(&**self.backing(), pos, &buf[..])
        } else {
            Ok(())
        };

        let mut entries = self.entries.lock();
        if let Some(at) = entries
            .iter()
            .position(|e| e.valid && e.pos == pos && e.buf.is_none())
        {
            let entry = &mut entries[at];
            entry.buf = Some(buf);
            if dirty {
                entry.dirty = write_result.is_err();
            }
        }
        write_result
    }

    /// Write back every valid dirty entry.
    pub fn flush(&self) -> KernelResult<()> {
        let mut entries = self.entries.lock();
        for entry in entries.iter_mut() {
            if entry.valid && entry.dirty {
                if let Some(buf) = entry.buf.as_ref() {
                    io::write_exact_at(&**self.backing(), entry.pos, &buf[..])?;
                    entry.dirty = false;
                }
            }
        }
        Ok(())
    }
}
