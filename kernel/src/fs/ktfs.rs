//! KTFS on-disk filesystem.
//!
//! Layout, in 512-byte blocks: block 0 is the superblock, blocks
//! `1..1+B` the allocation bitmap, then `N` inode-table blocks, then the
//! data region. Bitmap bit `k` describes *absolute* block `k`; block
//! numbers stored inside inodes are relative to the start of the data
//! region, and a stored pointer of 0 means "not allocated". An inode is
//! free iff it is all zero bytes.
//!
//! Files map logical blocks through 3 direct pointers, one single-
//! indirect block, and two double-indirect blocks (128 pointers per
//! 512-byte block), for a maximum file size of 16,844,288 bytes. The one
//! directory is the root: a packed array of 16-byte entries in its first
//! three direct blocks, giving a namespace of at most 96 files.
//!
//! One mount, one reentrant lock. All operations go through the block
//! cache; releasing a block dirty writes it through, so a completed
//! operation is durable on the backing device.

use alloc::sync::Arc;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::fs::cache::BlockCache;
use crate::io::{Io, IoRef, SeekIo};
use crate::sched::sync::Lock;

/// Filesystem block size.
pub const KTFS_BLKSZ: usize = 512;
/// On-disk inode size.
pub const KTFS_INOSZ: usize = 32;
/// Direct data-block pointers per inode.
pub const KTFS_NUM_DIRECT: usize = 3;
/// Double-indirect pointers per inode.
pub const KTFS_NUM_DINDIRECT: usize = 2;
/// Block pointers per indirect block.
pub const PTRS_PER_BLOCK: usize = KTFS_BLKSZ / 4;

/// Directory entry size; 32 entries per directory block.
pub const DIRENT_SIZE: usize = 16;
/// Name bytes in a directory entry (NUL-padded).
pub const KTFS_NAME_LEN: usize = DIRENT_SIZE - 2;
/// Longest usable file name (one byte is kept for the terminator).
pub const KTFS_MAX_FILENAME_LEN: usize = KTFS_NAME_LEN - 1;

/// Directory entries per block.
const DENTRIES_PER_BLOCK: usize = KTFS_BLKSZ / DIRENT_SIZE;
/// The root directory spans at most its three direct blocks.
pub const KTFS_MAX_DIR_ENTRIES: usize = KTFS_NUM_DIRECT * DENTRIES_PER_BLOCK;

/// Open-file table size.
pub const MAX_OPEN_FILES: usize = 96;

/// Inode flag marking a live file. A fresh, empty file must not be all
/// zero bytes, or the free-inode scan would hand its slot out again.
pub const INODE_FLAG_USED: u32 = 1 << 0;

/// Largest representable file: 3 + 128 + 2*128*128 data blocks.
pub const KTFS_MAX_FILE_SIZE: u64 =
    ((KTFS_NUM_DIRECT + PTRS_PER_BLOCK + KTFS_NUM_DINDIRECT * PTRS_PER_BLOCK * PTRS_PER_BLOCK)
        * KTFS_BLKSZ) as u64;

const INODES_PER_BLOCK: usize = KTFS_BLKSZ / KTFS_INOSZ;
const BITS_PER_BLOCK: u32 = (KTFS_BLKSZ * 8) as u32;

// ---------------------------------------------------------------------------
// On-disk structures
// ---------------------------------------------------------------------------

/// Superblock, stored at the start of block 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub block_count: u32,
    pub bitmap_block_count: u32,
    pub inode_block_count: u32,
    pub root_directory_inode: u16,
}

impl Superblock {
    pub fn decode(raw: &[u8]) -> Self {
        Self {
            block_count: u32::from_le_bytes(raw[0..4].try_into().unwrap()),
            bitmap_block_count: u32::from_le_bytes(raw[4..8].try_into().unwrap()),
            inode_block_count: u32::from_le_bytes(raw[8..12].try_into().unwrap()),
            root_directory_inode: u16::from_le_bytes(raw[12..14].try_into().unwrap()),
        }
    }

    pub fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.block_count.to_le_bytes());
        out[4..8].copy_from_slice(&self.bitmap_block_count.to_le_bytes());
        out[8..12].copy_from_slice(&self.inode_block_count.to_le_bytes());
        out[12..14].copy_from_slice(&self.root_directory_inode.to_le_bytes());
    }
}

/// On-disk inode. All block numbers are data-region-relative; 0 means
/// unallocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Inode {
    pub size: u32,
    pub flags: u32,
    pub block: [u32; KTFS_NUM_DIRECT],
    pub indirect: u32,
    pub dindirect: [u32; KTFS_NUM_DINDIRECT],
}

impl Inode {
    pub fn decode(raw: &[u8]) -> Self {
        let word = |i: usize| u32::from_le_bytes(raw[4 * i..4 * i + 4].try_into().unwrap());
        Self {
            size: word(0),
            flags: word(1),
            block: [word(2), word(3), word(4)],
            indirect: word(5),
            dindirect: [word(6), word(7)],
        }
    }

    pub fn encode(&self, out: &mut [u8]) {
        let words = [
            self.size,
            self.flags,
            self.block[0],
            self.block[1],
            self.block[2],
            self.indirect,
            self.dindirect[0],
            self.dindirect[1],
        ];
        for (i, word) in words.iter().enumerate() {
            out[4 * i..4 * i + 4].copy_from_slice(&word.to_le_bytes());
        }
    }

    /// An all-zero inode is a free slot.
    pub fn is_free(&self) -> bool {
        *self == Inode::default()
    }
}

/// Directory entry: NUL-padded name plus inode number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    pub name: [u8; KTFS_NAME_LEN],
    pub inode: u16,
}

impl DirEntry {
    pub fn decode(raw: &[u8]) -> Self {
        let mut name = [0u8; KTFS_NAME_LEN];
        name.copy_from_slice(&raw[..KTFS_NAME_LEN]);
        Self {
            name,
            inode: u16::from_le_bytes(raw[KTFS_NAME_LEN..DIRENT_SIZE].try_into().unwrap()),
        }
    }

    pub fn encode(&self, out: &mut [u8]) {
        out[..KTFS_NAME_LEN].copy_from_slice(&self.name);
        out[KTFS_NAME_LEN..DIRENT_SIZE].copy_from_slice(&self.inode.to_le_bytes());
    }

    fn matches(&self, name: &str) -> bool {
        name_matches(&self.name, name)
    }
}

/// Compare a NUL-padded on-disk name field with a kernel string.
fn name_matches(stored: &[u8; KTFS_NAME_LEN], name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() <= KTFS_MAX_FILENAME_LEN
        && stored[..bytes.len()] == *bytes
        && stored[bytes.len()] == 0
}

fn name_bytes(name: &str) -> KernelResult<[u8; KTFS_NAME_LEN]> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > KTFS_MAX_FILENAME_LEN || bytes.contains(&0) {
        return Err(KernelError::Invalid);
    }
    let mut out = [0u8; KTFS_NAME_LEN];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Open-file table
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
struct OpenFile {
    in_use: bool,
    name: [u8; KTFS_NAME_LEN],
    ino: u16,
    size: u64,
    flags: u32,
}

const EMPTY_SLOT: OpenFile = OpenFile {
    in_use: false,
    name: [0; KTFS_NAME_LEN],
    ino: 0,
    size: 0,
    flags: 0,
};

// ---------------------------------------------------------------------------
// The mount
// ---------------------------------------------------------------------------

/// One mounted KTFS volume.
pub struct Ktfs {
    cache: BlockCache,
    lock: Lock,
    sb: Superblock,
    bitmap_start: u32,
    inode_start: u32,
    data_start: u32,
    open_files: Mutex<[OpenFile; MAX_OPEN_FILES]>,
}

impl core::fmt::Debug for Ktfs {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("Ktfs")
    }
}

/// Scoped hold of the filesystem lock.
struct FsLocked<'a>(&'a Lock);

impl Drop for FsLocked<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

impl Ktfs {
    /// Mount a volume from a block-device endpoint.
    pub fn mount(dev: IoRef) -> KernelResult<Arc<Ktfs>> {
        let cache = BlockCache::new(dev);
        let guard = cache.get(0)?;
        let sb = Superblock::decode(&guard[..]);
        cache.release(guard, false)?;

        let bitmap_start = 1u32;
        let inode_start = bitmap_start + sb.bitmap_block_count;
        let data_start = inode_start + sb.inode_block_count;
        if sb.block_count <= data_start || sb.root_directory_inode as usize
            >= sb.inode_block_count as usize * INODES_PER_BLOCK
        {
            return Err(KernelError::BadFormat);
        }

        log::info!(
            "ktfs: {} blocks, bitmap {} + inodes {}, data at {}",
            sb.block_count,
            sb.bitmap_block_count,
            sb.inode_block_count,
            data_start
        );

        Ok(Arc::new(Ktfs {
            cache,
            lock: Lock::new(),
            sb,
            bitmap_start,
            inode_start,
            data_start,
            open_files: Mutex::new([EMPTY_SLOT; MAX_OPEN_FILES]),
        }))
    }

    /// Write an empty KTFS image onto `dev`: superblock, bitmap with the
    /// metadata region pre-marked, zeroed inode table, and a root
    /// directory of size 0 with its first data block in place.
    pub fn format(dev: &IoRef, inode_blocks: u32) -> KernelResult<()> {
        let block_count = (dev.end()? / KTFS_BLKSZ as u64) as u32;
        let bitmap_blocks = block_count.div_ceil(BITS_PER_BLOCK);
        let data_start = 1 + bitmap_blocks + inode_blocks;
        // Smallest useful volume: metadata, the reserved data block, the
        // root directory block, and one block of file data.
        if inode_blocks == 0 || block_count < data_start + 3 {
            return Err(KernelError::Invalid);
        }

        let mut block = [0u8; KTFS_BLKSZ];
        Superblock {
            block_count,
            bitmap_block_count: bitmap_blocks,
            inode_block_count: inode_blocks,
            root_directory_inode: 0,
        }
        .encode(&mut block);
        crate::io::write_exact_at(&**dev, 0, &block)?;

        // Bitmap: everything up to and including data-relative block 1 is
        // taken: the metadata blocks, relative block 0 (unusable, since a
        // stored pointer of 0 means a hole), and the root's directory
        // block at relative 1.
        let used = data_start as u64 + 2;
        for b in 0..bitmap_blocks {
            let mut bits = [0u8; KTFS_BLKSZ];
            let base = b as u64 * BITS_PER_BLOCK as u64;
            for k in 0..BITS_PER_BLOCK as u64 {
                if base + k < used {
                    bits[(k / 8) as usize] |= 1 << (k % 8);
                }
            }
            crate::io::write_exact_at(&**dev, (1 + b) as u64 * KTFS_BLKSZ as u64, &bits)?;
        }

        // Inode table: all free except the root directory inode.
        let zero = [0u8; KTFS_BLKSZ];
        for b in 0..inode_blocks {
            let pos = (1 + bitmap_blocks + b) as u64 * KTFS_BLKSZ as u64;
            crate::io::write_exact_at(&**dev, pos, &zero)?;
        }
        let mut root_block = [0u8; KTFS_BLKSZ];
        let root = Inode {
            flags: INODE_FLAG_USED,
            block: [1, 0, 0],
            ..Inode::default()
        };
        root.encode(&mut root_block[..KTFS_INOSZ]);
        crate::io::write_exact_at(
            &**dev,
            (1 + bitmap_blocks) as u64 * KTFS_BLKSZ as u64,
            &root_block,
        )?;

        // Zero the root's directory block.
        crate::io::write_exact_at(
            &**dev,
            (data_start + 1) as u64 * KTFS_BLKSZ as u64,
            &zero,
        )?;
        Ok(())
    }

    fn locked(&self) -> FsLocked<'_> {
        self.lock.acquire();
        FsLocked(&self.lock)
    }

    /// Byte position of an absolute block.
    fn blkpos(&self, abs_block: u32) -> u64 {
        abs_block as u64 * KTFS_BLKSZ as u64
    }

    /// Byte position of a data-region-relative block.
    fn datapos(&self, rel_block: u32) -> u64 {
        self.blkpos(rel_block + self.data_start)
    }

    // -- inode access -------------------------------------------------------

    /// Fetch inode `ino`; with `delete`, the on-disk copy is zeroed.
    fn get_inode(&self, ino: u16, delete: bool) -> KernelResult<Inode> {
        let blk = self.inode_start + ino as u32 / INODES_PER_BLOCK as u32;
        let offset = (ino as usize % INODES_PER_BLOCK) * KTFS_INOSZ;

        let mut guard = self.cache.get(self.blkpos(blk))?;
        let inode = Inode::decode(&guard[offset..offset + KTFS_INOSZ]);
        if delete {
            guard[offset..offset + KTFS_INOSZ].fill(0);
        }
        self.cache.release(guard, delete)?;
        Ok(inode)
    }

    /// Persist inode `ino`.
    fn put_inode(&self, ino: u16, inode: &Inode) -> KernelResult<()> {
        let blk = self.inode_start + ino as u32 / INODES_PER_BLOCK as u32;
        let offset = (ino as usize % INODES_PER_BLOCK) * KTFS_INOSZ;

        let mut guard = self.cache.get(self.blkpos(blk))?;
        inode.encode(&mut guard[offset..offset + KTFS_INOSZ]);
        self.cache.release(guard, true)
    }

    /// First all-zero inode slot.
    fn find_free_inode(&self) -> KernelResult<u16> {
        for blk in self.inode_start..self.inode_start + self.sb.inode_block_count {
            let guard = self.cache.get(self.blkpos(blk))?;
            for i in 0..INODES_PER_BLOCK {
                let raw = &guard[i * KTFS_INOSZ..(i + 1) * KTFS_INOSZ];
                if raw.iter().all(|&b| b == 0) {
                    let ino = (blk - self.inode_start) as usize * INODES_PER_BLOCK + i;
                    self.cache.release(guard, false)?;
                    return Ok(ino as u16);
                }
            }
            self.cache.release(guard, false)?;
        }
        Err(KernelError::NoMemory)
    }

    // -- allocation bitmap --------------------------------------------------

    /// Claim the first clear bitmap bit; returns the *absolute* block
    /// index it describes.
    fn alloc_block(&self) -> KernelResult<u32> {
        for bmp in self.bitmap_start..self.inode_start {
            let mut guard = self.cache.get(self.blkpos(bmp))?;
            for i in 0..KTFS_BLKSZ {
                if guard[i] == 0xFF {
                    continue;
                }
                let bit = guard[i].trailing_ones() as usize;
                guard[i] |= 1 << bit;
                let abs =
                    (bmp - self.bitmap_start) * BITS_PER_BLOCK + (i * 8 + bit) as u32;
                self.cache.release(guard, true)?;
                if abs >= self.sb.block_count {
                    return Err(KernelError::NoMemory);
                }
                return Ok(abs);
            }
            self.cache.release(guard, false)?;
        }
        Err(KernelError::NoMemory)
    }

    /// Claim a data-region block and zero it; returns its relative index.
    fn alloc_data_block(&self) -> KernelResult<u32> {
        let abs = self.alloc_block()?;
        if abs < self.data_start {
            // Metadata blocks must be pre-marked in the bitmap.
            return Err(KernelError::BadFormat);
        }
        let rel = abs - self.data_start;
        let mut guard = self.cache.get(self.datapos(rel))?;
        guard.fill(0);
        self.cache.release(guard, true)?;
        Ok(rel)
    }

    /// Clear the bitmap bit of an absolute block index.
    fn free_block(&self, abs: u32) -> KernelResult<()> {
        let bmp = self.bitmap_start + abs / BITS_PER_BLOCK;
        let bit = abs % BITS_PER_BLOCK;
        let mut guard = self.cache.get(self.blkpos(bmp))?;
        guard[(bit / 8) as usize] &= !(1 << (bit % 8));
        self.cache.release(guard, true)
    }

    // -- directory ----------------------------------------------------------

    /// Find `name` in the root directory; with `delete`, remove the entry
    /// by overwriting it with the directory's last entry (swap-with-last)
    /// and shrinking the root by one entry.
    fn find_inode_by_name(&self, name: &str, delete: bool) -> KernelResult<u16> {
        let root_ino = self.sb.root_directory_inode;
        let mut root = self.get_inode(root_ino, false)?;
        let total = root.size as usize / DIRENT_SIZE;

        let mut found: Option<(usize, u16)> = None;
        'scan: for bi in 0..KTFS_NUM_DIRECT {
            let base = bi * DENTRIES_PER_BLOCK;
            if base >= total {
                break;
            }
            let guard = self.cache.get(self.datapos(root.block[bi]))?;
            for ei in 0..DENTRIES_PER_BLOCK {
                let idx = base + ei;
                if idx >= total {
                    break;
                }
                let entry = DirEntry::decode(&guard[ei * DIRENT_SIZE..(ei + 1) * DIRENT_SIZE]);
                if entry.matches(name) {
                    found = Some((idx, entry.inode));
                    self.cache.release(guard, false)?;
                    break 'scan;
                }
            }
            self.cache.release(guard, false)?;
        }

        let (found_idx, ino) = found.ok_or(KernelError::NotFound)?;
        if !delete {
            return Ok(ino);
        }

        // Swap-with-last tombstoning. Note the tail block is deliberately
        // not returned to the bitmap when the directory shrinks below a
        // block boundary.
        let last_idx = total - 1;
        let found_blk = root.block[found_idx / DENTRIES_PER_BLOCK];
        let last_blk = root.block[last_idx / DENTRIES_PER_BLOCK];
        let found_off = (found_idx % DENTRIES_PER_BLOCK) * DIRENT_SIZE;
        let last_off = (last_idx % DENTRIES_PER_BLOCK) * DIRENT_SIZE;

        if found_blk == last_blk {
            let mut guard = self.cache.get(self.datapos(found_blk))?;
            if found_idx != last_idx {
                let last = DirEntry::decode(&guard[last_off..last_off + DIRENT_SIZE]);
                last.encode(&mut guard[found_off..found_off + DIRENT_SIZE]);
            }
            guard[last_off..last_off + DIRENT_SIZE].fill(0);
            self.cache.release(guard, true)?;
        } else {
            let mut found_guard = self.cache.get(self.datapos(found_blk))?;
            let mut last_guard = self.cache.get(self.datapos(last_blk))?;
            let last = DirEntry::decode(&last_guard[last_off..last_off + DIRENT_SIZE]);
            last.encode(&mut found_guard[found_off..found_off + DIRENT_SIZE]);
            last_guard[last_off..last_off + DIRENT_SIZE].fill(0);
            self.cache.release(found_guard, true)?;
            self.cache.release(last_guard, true)?;
        }

        root.size -= DIRENT_SIZE as u32;
        self.put_inode(root_ino, &root)?;
        Ok(ino)
    }

    // -- block mapping ------------------------------------------------------

    /// Resolve a logical block index to a data-region-relative block.
    /// `None` is a hole; out of range is an error.
    fn data_block_of(&self, inode: &Inode, index: usize) -> KernelResult<Option<u32>> {
        let nonzero = |b: u32| if b == 0 { None } else { Some(b) };

        if index < KTFS_NUM_DIRECT {
            return Ok(nonzero(inode.block[index]));
        }

        let index = index - KTFS_NUM_DIRECT;
        if index < PTRS_PER_BLOCK {
            let Some(ind) = nonzero(inode.indirect) else {
                return Ok(None);
            };
            return Ok(nonzero(self.read_ptr(ind, index)?));
        }

        let index = index - PTRS_PER_BLOCK;
        let span = PTRS_PER_BLOCK * PTRS_PER_BLOCK;
        let tier = index / span;
        if tier >= KTFS_NUM_DINDIRECT {
            return Err(KernelError::Invalid);
        }
        let Some(dind) = nonzero(inode.dindirect[tier]) else {
            return Ok(None);
        };
        let inside = index % span;
        let Some(mid) = nonzero(self.read_ptr(dind, inside / PTRS_PER_BLOCK)?) else {
            return Ok(None);
        };
        Ok(nonzero(self.read_ptr(mid, inside % PTRS_PER_BLOCK)?))
    }

    /// Read one pointer out of an indirect block.
    fn read_ptr(&self, rel_block: u32, slot: usize) -> KernelResult<u32> {
        let guard = self.cache.get(self.datapos(rel_block))?;
        let value = u32::from_le_bytes(guard[4 * slot..4 * slot + 4].try_into().unwrap());
        self.cache.release(guard, false)?;
        Ok(value)
    }

    /// Write one pointer into an indirect block.
    fn write_ptr(&self, rel_block: u32, slot: usize, value: u32) -> KernelResult<()> {
        let mut guard = self.cache.get(self.datapos(rel_block))?;
        guard[4 * slot..4 * slot + 4].copy_from_slice(&value.to_le_bytes());
        self.cache.release(guard, true)
    }

    /// Stitch a newly allocated data block into the inode's topology at
    /// logical index `index`, allocating missing indirect blocks on the
    /// way.
    fn attach_block(&self, inode: &mut Inode, index: usize, rel: u32) -> KernelResult<()> {
        if index < KTFS_NUM_DIRECT {
            inode.block[index] = rel;
            return Ok(());
        }

        let index = index - KTFS_NUM_DIRECT;
        if index < PTRS_PER_BLOCK {
            if inode.indirect == 0 {
                inode.indirect = self.alloc_data_block()?;
            }
            return self.write_ptr(inode.indirect, index, rel);
        }

        let index = index - PTRS_PER_BLOCK;
        let span = PTRS_PER_BLOCK * PTRS_PER_BLOCK;
        let tier = index / span;
        if tier >= KTFS_NUM_DINDIRECT {
            return Err(KernelError::Invalid);
        }
        if inode.dindirect[tier] == 0 {
            inode.dindirect[tier] = self.alloc_data_block()?;
        }
        let inside = index % span;
        let top = inside / PTRS_PER_BLOCK;
        let mut mid = self.read_ptr(inode.dindirect[tier], top)?;
        if mid == 0 {
            mid = self.alloc_data_block()?;
            self.write_ptr(inode.dindirect[tier], top, mid)?;
        }
        self.write_ptr(mid, inside % PTRS_PER_BLOCK, rel)
    }

    // -- open-file operations ----------------------------------------------

    /// Open `name`: claim an open-file slot and wrap it in a seekable
    /// stream (block size 1, end = file size).
    pub fn open(self: &Arc<Self>, name: &str) -> KernelResult<IoRef> {
        let _held = self.locked();

        let (slot, ino) = {
            let mut table = self.open_files.lock();
            if table.iter().any(|f| f.in_use && name_matches(&f.name, name)) {
                return Err(KernelError::BusyOrExists);
            }
            let slot = table
                .iter()
                .position(|f| !f.in_use)
                .ok_or(KernelError::TooManyOpen)?;

            let ino = self.find_inode_by_name(name, false)?;
            let inode = self.get_inode(ino, false)?;
            table[slot] = OpenFile {
                in_use: true,
                name: name_bytes(name)?,
                ino,
                size: inode.size as u64,
                flags: inode.flags,
            };
            (slot, ino)
        };

        let file: IoRef = Arc::new(KtfsFile {
            fs: self.clone(),
            slot,
            ino,
        });
        match SeekIo::new(file) {
            Ok(seekable) => Ok(seekable),
            Err(e) => {
                self.open_files.lock()[slot] = EMPTY_SLOT;
                Err(e)
            }
        }
    }

    /// Create an empty file named `name`.
    pub fn create(&self, name: &str) -> KernelResult<()> {
        let name_arr = name_bytes(name)?;
        let _held = self.locked();

        match self.find_inode_by_name(name, false) {
            Ok(_) => return Err(KernelError::BusyOrExists),
            Err(KernelError::NotFound) => {}
            Err(e) => return Err(e),
        }

        let root_ino = self.sb.root_directory_inode;
        let mut root = self.get_inode(root_ino, false)?;
        if root.size as usize >= KTFS_MAX_DIR_ENTRIES * DIRENT_SIZE {
            return Err(KernelError::NoMemory);
        }

        // The new entry may cross into a direct block the root does not
        // have yet.
        let dir_block = root.size as usize / KTFS_BLKSZ;
        if root.block[dir_block] == 0 {
            root.block[dir_block] = self.alloc_data_block()?;
        }

        let ino = self.find_free_inode()?;
        self.put_inode(
            ino,
            &Inode {
                flags: INODE_FLAG_USED,
                ..Inode::default()
            },
        )?;

        let entry = DirEntry {
            name: name_arr,
            inode: ino,
        };
        let offset = root.size as usize % KTFS_BLKSZ;
        let mut guard = self.cache.get(self.datapos(root.block[dir_block]))?;
        entry.encode(&mut guard[offset..offset + DIRENT_SIZE]);
        self.cache.release(guard, true)?;

        root.size += DIRENT_SIZE as u32;
        self.put_inode(root_ino, &root)
    }

    /// Delete `name`: free every data and indirect block it references,
    /// zero its inode, and remove its directory entry. Any open handle on
    /// the name is force-closed first.
    pub fn delete(&self, name: &str) -> KernelResult<()> {
        let _held = self.locked();

        {
            let mut table = self.open_files.lock();
            for file in table.iter_mut() {
                if file.in_use && name_matches(&file.name, name) {
                    *file = EMPTY_SLOT;
                }
            }
        }

        let ino = self.find_inode_by_name(name, true)?;
        let inode = self.get_inode(ino, true)?;

        let total = (inode.size as usize).div_ceil(KTFS_BLKSZ);
        let mut cleared = 0usize;

        for i in 0..KTFS_NUM_DIRECT {
            if cleared >= total {
                break;
            }
            if inode.block[i] != 0 {
                self.free_block(inode.block[i] + self.data_start)?;
                cleared += 1;
            }
        }

        if inode.indirect != 0 {
            let guard = self.cache.get(self.datapos(inode.indirect))?;
            for slot in 0..PTRS_PER_BLOCK {
                if cleared >= total {
                    break;
                }
                let ptr =
                    u32::from_le_bytes(guard[4 * slot..4 * slot + 4].try_into().unwrap());
                if ptr == 0 {
                    continue;
                }
                self.free_block(ptr + self.data_start)?;
                cleared += 1;
            }
            self.cache.release(guard, false)?;
            self.free_block(inode.indirect + self.data_start)?;
        }

        for tier in 0..KTFS_NUM_DINDIRECT {
            if inode.dindirect[tier] == 0 {
                continue;
            }
            let dind = self.cache.get(self.datapos(inode.dindirect[tier]))?;
            for top in 0..PTRS_PER_BLOCK {
                if cleared >= total {
                    break;
                }
                let mid = u32::from_le_bytes(dind[4 * top..4 * top + 4].try_into().unwrap());
                if mid == 0 {
                    continue;
                }
                let ind = self.cache.get(self.datapos(mid))?;
                for slot in 0..PTRS_PER_BLOCK {
                    if cleared >= total {
                        break;
                    }
                    let ptr =
                        u32::from_le_bytes(ind[4 * slot..4 * slot + 4].try_into().unwrap());
                    if ptr == 0 {
                        continue;
                    }
                    self.free_block(ptr + self.data_start)?;
                    cleared += 1;
                }
                self.cache.release(ind, false)?;
                self.free_block(mid + self.data_start)?;
            }
            self.cache.release(dind, false)?;
            self.free_block(inode.dindirect[tier] + self.data_start)?;
        }

        Ok(())
    }

    /// Write back all dirty cache blocks.
    pub fn flush(&self) -> KernelResult<()> {
        let _held = self.locked();
        self.cache.flush()
    }

    // -- per-file plumbing (called through `KtfsFile`) ----------------------

    fn slot_file(&self, slot: usize, ino: u16) -> KernelResult<OpenFile> {
        let table = self.open_files.lock();
        let file = table[slot];
        if !file.in_use || file.ino != ino {
            return Err(KernelError::BadDescriptor);
        }
        Ok(file)
    }

    fn file_read_at(
        &self,
        slot: usize,
        ino: u16,
        pos: u64,
        buf: &mut [u8],
    ) -> KernelResult<usize> {
        let _held = self.locked();
        let file = self.slot_file(slot, ino)?;

        if pos >= file.size {
            return Ok(0);
        }
        let len = (buf.len() as u64).min(file.size - pos) as usize;
        let inode = self.get_inode(file.ino, false)?;

        let mut total = 0usize;
        while total < len {
            let offset = pos as usize + total;
            let chunk = (KTFS_BLKSZ - offset % KTFS_BLKSZ).min(len - total);

            let result = self.data_block_of(&inode, offset / KTFS_BLKSZ);
            match result {
                Ok(Some(rel)) => {
                    let guard = match self.cache.get(self.datapos(rel)) {
                        Ok(g) => g,
                        Err(e) => return if total > 0 { Ok(total) } else { Err(e) },
                    };
                    let at = offset % KTFS_BLKSZ;
                    buf[total..total + chunk].copy_from_slice(&guard[at..at + chunk]);
                    self.cache.release(guard, false)?;
                }
                // Holes read as zeros.
                Ok(None) => buf[total..total + chunk].fill(0),
                Err(e) => return if total > 0 { Ok(total) } else { Err(e) },
            }
            total += chunk;
        }
        Ok(total)
    }

    fn file_write_at(&self, slot: usize, ino: u16, pos: u64, buf: &[u8]) -> KernelResult<usize> {
        let _held = self.locked();
        let file = self.slot_file(slot, ino)?;

        // Writes only reach already-allocated extents; the file is grown
        // explicitly through `set_end`.
        if pos >= file.size {
            return Ok(0);
        }
        let len = (buf.len() as u64).min(file.size - pos) as usize;
        let inode = self.get_inode(file.ino, false)?;

        let mut total = 0usize;
        while total < len {
            let offset = pos as usize + total;
            let chunk = (KTFS_BLKSZ - offset % KTFS_BLKSZ).min(len - total);

            let rel = match self.data_block_of(&inode, offset / KTFS_BLKSZ) {
                Ok(Some(rel)) => rel,
                Ok(None) => {
                    return if total > 0 {
                        Ok(total)
                    } else {
                        Err(KernelError::IoError)
                    }
                }
                Err(e) => return if total > 0 { Ok(total) } else { Err(e) },
            };
            let mut guard = match self.cache.get(self.datapos(rel)) {
                Ok(g) => g,
                Err(e) => return if total > 0 { Ok(total) } else { Err(e) },
            };
            let at = offset % KTFS_BLKSZ;
            guard[at..at + chunk].copy_from_slice(&buf[total..total + chunk]);
            self.cache.release(guard, true)?;
            total += chunk;
        }
        Ok(total)
    }

    fn file_size(&self, slot: usize, ino: u16) -> KernelResult<u64> {
        let _held = self.locked();
        Ok(self.slot_file(slot, ino)?.size)
    }

    /// Grow a file to `new_size`, allocating and zeroing every new data
    /// block and any missing indirect blocks. Shrinking is not supported.
    fn file_set_end(&self, slot: usize, ino: u16, new_size: u64) -> KernelResult<()> {
        let _held = self.locked();
        let file = self.slot_file(slot, ino)?;

        let mut inode = self.get_inode(file.ino, false)?;
        if new_size < inode.size as u64 || new_size > KTFS_MAX_FILE_SIZE {
            return Err(KernelError::Invalid);
        }

        let old_blocks = (inode.size as usize).div_ceil(KTFS_BLKSZ);
        let new_blocks = (new_size as usize).div_ceil(KTFS_BLKSZ);

        for index in old_blocks..new_blocks {
            let rel = self.alloc_data_block()?;
            self.attach_block(&mut inode, index, rel)?;
        }

        inode.size = new_size as u32;
        self.put_inode(file.ino, &inode)?;
        self.open_files.lock()[slot].size = new_size;
        Ok(())
    }

    fn close_slot(&self, slot: usize, ino: u16) {
        let mut table = self.open_files.lock();
        if table[slot].in_use && table[slot].ino == ino {
            table[slot] = EMPTY_SLOT;
        }
    }

    /// Number of open files (test and diagnostic aid).
    pub fn open_count(&self) -> usize {
        self.open_files.lock().iter().filter(|f| f.in_use).count()
    }
}

/// An open KTFS file: the positioned-I/O endpoint under the seekable
/// wrapper handed out by [`Ktfs::open`].
struct KtfsFile {
    fs: Arc<Ktfs>,
    slot: usize,
    ino: u16,
}

impl Io for KtfsFile {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> KernelResult<usize> {
        self.fs.file_read_at(self.slot, self.ino, pos, buf)
    }

    fn write_at(&self, pos: u64, buf: &[u8]) -> KernelResult<usize> {
        self.fs.file_write_at(self.slot, self.ino, pos, buf)
    }

    fn end(&self) -> KernelResult<u64> {
        self.fs.file_size(self.slot, self.ino)
    }

    fn set_end(&self, end: u64) -> KernelResult<()> {
        self.fs.file_set_end(self.slot, self.ino, end)
    }
}

impl Drop for KtfsFile {
    fn drop(&mut self) {
        self.fs.close_slot(self.slot, self.ino);
    }
}
