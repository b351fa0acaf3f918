//! ELF loader.
//!
//! Loads 64-bit little-endian RISC-V `ET_EXEC` images into the active
//! address space. Only `PT_LOAD` segments are consumed; each must fall
//! inside the user-memory window. Segments are mapped writable for the
//! copy, then demoted to their final permissions.

use alloc::vec;

use crate::error::{KernelError, KernelResult};
use crate::io::{self, IoRef};
use crate::mm::{self, PteFlags, PAGE_SIZE, UMEM_END_VMA, UMEM_START_VMA};

const EI_NIDENT: usize = 16;
const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const EI_VERSION: usize = 6;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;

const ET_EXEC: u16 = 2;
const EM_RISCV: u16 = 243;

const PT_LOAD: u32 = 1;

const PF_X: u32 = 0x1;
const PF_W: u32 = 0x2;
const PF_R: u32 = 0x4;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

struct Ehdr {
    ident: [u8; EI_NIDENT],
    e_type: u16,
    machine: u16,
    version: u32,
    entry: u64,
    phoff: u64,
    phentsize: u16,
    phnum: u16,
}

impl Ehdr {
    fn decode(raw: &[u8; EHDR_SIZE]) -> Self {
        let mut ident = [0u8; EI_NIDENT];
        ident.copy_from_slice(&raw[..EI_NIDENT]);
        Self {
            ident,
            e_type: u16::from_le_bytes(raw[16..18].try_into().unwrap()),
            machine: u16::from_le_bytes(raw[18..20].try_into().unwrap()),
            version: u32::from_le_bytes(raw[20..24].try_into().unwrap()),
            entry: u64::from_le_bytes(raw[24..32].try_into().unwrap()),
            phoff: u64::from_le_bytes(raw[32..40].try_into().unwrap()),
            phentsize: u16::from_le_bytes(raw[54..56].try_into().unwrap()),
            phnum: u16::from_le_bytes(raw[56..58].try_into().unwrap()),
        }
    }
}

struct Phdr {
    p_type: u32,
    flags: u32,
    offset: u64,
    vaddr: u64,
    filesz: u64,
    memsz: u64,
}

impl Phdr {
    fn decode(raw: &[u8; PHDR_SIZE]) -> Self {
        Self {
            p_type: u32::from_le_bytes(raw[0..4].try_into().unwrap()),
            flags: u32::from_le_bytes(raw[4..8].try_into().unwrap()),
            offset: u64::from_le_bytes(raw[8..16].try_into().unwrap()),
            vaddr: u64::from_le_bytes(raw[16..24].try_into().unwrap()),
            filesz: u64::from_le_bytes(raw[32..40].try_into().unwrap()),
            memsz: u64::from_le_bytes(raw[40..48].try_into().unwrap()),
        }
    }
}

/// Load an executable image from `elfio` into the active address space.
/// Returns the entry point.
pub fn load(elfio: &IoRef) -> KernelResult<usize> {
    let mut raw = [0u8; EHDR_SIZE];
    io::read_exact_at(&**elfio, 0, &mut raw)?;
    let ehdr = Ehdr::decode(&raw);

    if ehdr.ident[..4] != ELF_MAGIC {
        return Err(KernelError::Invalid);
    }
    if ehdr.ident[EI_CLASS] != ELFCLASS64
        || ehdr.ident[EI_DATA] != ELFDATA2LSB
        || ehdr.ident[EI_VERSION] != EV_CURRENT
        || ehdr.e_type != ET_EXEC
        || ehdr.machine != EM_RISCV
        || ehdr.version != EV_CURRENT as u32
    {
        return Err(KernelError::BadFormat);
    }
    if (ehdr.phentsize as usize) < PHDR_SIZE {
        return Err(KernelError::BadFormat);
    }

    for i in 0..ehdr.phnum {
        let mut raw = [0u8; PHDR_SIZE];
        let pos = ehdr.phoff + i as u64 * ehdr.phentsize as u64;
        io::read_exact_at(&**elfio, pos, &mut raw)?;
        let phdr = Phdr::decode(&raw);

        if phdr.p_type != PT_LOAD || phdr.memsz == 0 {
            continue;
        }
        load_segment(elfio, &phdr)?;
    }

    Ok(ehdr.entry as usize)
}

fn load_segment(elfio: &IoRef, phdr: &Phdr) -> KernelResult<()> {
    let vaddr = phdr.vaddr as usize;
    let memsz = phdr.memsz as usize;
    let filesz = phdr.filesz as usize;

    // Segments must live inside the user window, page-aligned, with the
    // file part no larger than the memory part.
    if vaddr < UMEM_START_VMA
        || vaddr.checked_add(memsz).is_none()
        || vaddr + memsz > UMEM_END_VMA
        || vaddr % PAGE_SIZE != 0
        || filesz > memsz
    {
        return Err(KernelError::BadFormat);
    }

    let span = mm::round_up(memsz, PAGE_SIZE);
    mm::alloc_and_map_range(vaddr, span, PteFlags::R | PteFlags::W | PteFlags::U)?;

    // Pull the file bytes through a bounce buffer into the new mapping.
    let mut chunk = vec![0u8; PAGE_SIZE];
    let mut done = 0;
    while done < filesz {
        let n = PAGE_SIZE.min(filesz - done);
        io::read_exact_at(&**elfio, phdr.offset + done as u64, &mut chunk[..n])?;
        mm::copy_to_range(vaddr + done, &chunk[..n], PteFlags::W)?;
        done += n;
    }

    // The BSS tail stays zero (fresh frames are zeroed, and this keeps it
    // explicit even if that changes).
    mm::zero_range(vaddr + filesz, memsz - filesz, PteFlags::W)?;

    // Demote to the segment's own permissions; user pages stay user.
    let mut flags = PteFlags::U;
    if phdr.flags & PF_R != 0 {
        flags |= PteFlags::R;
    }
    if phdr.flags & PF_W != 0 {
        flags |= PteFlags::W;
    }
    if phdr.flags & PF_X != 0 {
        flags |= PteFlags::X;
    }
    mm::set_range_flags(vaddr, span, flags);
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use alloc::vec::Vec;

    /// Entry point of the synthetic test image.
    pub const ENTRY: usize = 0xC000_0000;
    /// Data segment address of the synthetic test image.
    pub const DATA_VADDR: usize = 0xC010_0000;
    /// File bytes in the data segment; the rest of `DATA_MEMSZ` is BSS.
    pub const DATA_FILESZ: usize = 64;
    pub const DATA_MEMSZ: usize = 5000;

    fn push_phdr(
        out: &mut Vec<u8>,
        p_type: u32,
        flags: u32,
        offset: u64,
        vaddr: u64,
        filesz: u64,
        memsz: u64,
    ) {
        out.extend_from_slice(&p_type.to_le_bytes());
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&offset.to_le_bytes());
        out.extend_from_slice(&vaddr.to_le_bytes());
        out.extend_from_slice(&vaddr.to_le_bytes()); // paddr
        out.extend_from_slice(&filesz.to_le_bytes());
        out.extend_from_slice(&memsz.to_le_bytes());
        out.extend_from_slice(&0x1000u64.to_le_bytes()); // align
    }

    /// A minimal two-segment executable: 16 bytes of "text" at [`ENTRY`]
    /// and a data segment with a BSS tail at [`DATA_VADDR`].
    pub fn two_segment_image() -> Vec<u8> {
        let text_off = 0x1000u64;
        let data_off = 0x2000u64;

        let mut image = Vec::new();
        image.extend_from_slice(&ELF_MAGIC);
        image.push(ELFCLASS64);
        image.push(ELFDATA2LSB);
        image.push(EV_CURRENT);
        image.resize(EI_NIDENT, 0);
        image.extend_from_slice(&ET_EXEC.to_le_bytes());
        image.extend_from_slice(&EM_RISCV.to_le_bytes());
        image.extend_from_slice(&(EV_CURRENT as u32).to_le_bytes());
        image.extend_from_slice(&(ENTRY as u64).to_le_bytes());
        image.extend_from_slice(&(EHDR_SIZE as u64).to_le_bytes()); // phoff
        image.extend_from_slice(&0u64.to_le_bytes()); // shoff
        image.extend_from_slice(&0u32.to_le_bytes()); // flags
        image.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        image.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        image.extend_from_slice(&2u16.to_le_bytes()); // phnum
        image.extend_from_slice(&0u16.to_le_bytes()); // shentsize
        image.extend_from_slice(&0u16.to_le_bytes()); // shnum
        image.extend_from_slice(&0u16.to_le_bytes()); // shstrndx
        debug_assert_eq!(image.len(), EHDR_SIZE);

        push_phdr(
            &mut image,
            PT_LOAD,
            PF_R | PF_X,
            text_off,
            ENTRY as u64,
            16,
            16,
        );
        push_phdr(
            &mut image,
            PT_LOAD,
            PF_R | PF_W,
            data_off,
            DATA_VADDR as u64,
            DATA_FILESZ as u64,
            DATA_MEMSZ as u64,
        );

        image.resize(text_off as usize, 0);
        image.extend_from_slice(&[0x13u8; 16]); // addi x0,x0,0 filler
        image.resize(data_off as usize, 0);
        image.extend((0..DATA_FILESZ).map(|i| i as u8 + 1));
        image
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemIo;
    use crate::testing;

    fn image_io(image: alloc::vec::Vec<u8>) -> IoRef {
        MemIo::new(image.into_boxed_slice())
    }

    #[test]
    fn test_bad_magic_rejected() {
        let _guard = testing::kernel_lock();
        let mut image = test_support::two_segment_image();
        image[0] = b'Z';
        assert_eq!(load(&image_io(image)).unwrap_err(), KernelError::Invalid);
    }

    #[test]
    fn test_wrong_class_and_machine_rejected() {
        let _guard = testing::kernel_lock();

        let mut image = test_support::two_segment_image();
        image[EI_CLASS] = 1; // 32-bit
        assert_eq!(load(&image_io(image)).unwrap_err(), KernelError::BadFormat);

        let mut image = test_support::two_segment_image();
        image[18] = 0x3E; // x86-64
        assert_eq!(load(&image_io(image)).unwrap_err(), KernelError::BadFormat);

        let mut image = test_support::two_segment_image();
        image[16] = 3; // ET_DYN
        assert_eq!(load(&image_io(image)).unwrap_err(), KernelError::BadFormat);
    }

    #[test]
    fn test_segment_outside_user_window_rejected() {
        let _guard = testing::kernel_lock();
        testing::init_phys_pool();
        let scratch = testing::fresh_user_space();
        let prev = crate::mm::switch_mspace(scratch);

        let mut image = test_support::two_segment_image();
        // Rewrite the first phdr's vaddr to below the window.
        let vaddr_at = EHDR_SIZE + 16;
        image[vaddr_at..vaddr_at + 8]
            .copy_from_slice(&0x1000_0000u64.to_le_bytes());
        assert_eq!(load(&image_io(image)).unwrap_err(), KernelError::BadFormat);

        crate::mm::reset_active_mspace();
        crate::mm::switch_mspace(prev);
    }

    #[test]
    fn test_load_maps_segments_with_final_permissions() {
        let _guard = testing::kernel_lock();
        testing::init_phys_pool();
        let scratch = testing::fresh_user_space();
        let prev = crate::mm::switch_mspace(scratch);

        let entry = load(&image_io(test_support::two_segment_image())).unwrap();
        assert_eq!(entry, test_support::ENTRY);

        // Text: present, executable, not writable.
        let mapper = unsafe { crate::mm::Mapper::new(scratch.root()) };
        let text = mapper.translate(test_support::ENTRY).unwrap();
        assert!(text.flags().contains(PteFlags::R | PteFlags::X | PteFlags::U));
        assert!(!text.flags().contains(PteFlags::W));

        // Data: file bytes followed by a zero BSS tail.
        let mut head = [0u8; test_support::DATA_FILESZ];
        mm::copy_from_range(test_support::DATA_VADDR, &mut head, PteFlags::U).unwrap();
        assert!(head.iter().enumerate().all(|(i, &b)| b == i as u8 + 1));

        let mut tail = [0xFFu8; 256];
        mm::copy_from_range(
            test_support::DATA_VADDR + test_support::DATA_FILESZ,
            &mut tail,
            PteFlags::U,
        )
        .unwrap();
        assert!(tail.iter().all(|&b| b == 0));

        let data = mapper.translate(test_support::DATA_VADDR).unwrap();
        assert!(data.flags().contains(PteFlags::R | PteFlags::W | PteFlags::U));
        assert!(!data.flags().contains(PteFlags::X));

        crate::mm::reset_active_mspace();
        crate::mm::switch_mspace(prev);
    }
}
