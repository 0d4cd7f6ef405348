use bitflags::bitflags;
use core::fmt;

use crate::fs::{self, file::File};
use crate::interrupts::usermode::TrapFrame;
use crate::memory::paging::{self, AddressSpace, USER_STACK};
use crate::memory::palloc::{self, PGSIZE};

// ══════════════════════════════════════════════════════════════
//  ELF64 constants
// ══════════════════════════════════════════════════════════════

/// Magic, class 64, little-endian, ident version 1.
const ELF_IDENT: [u8; 7] = [0x7F, b'E', b'L', b'F', 2, 1, 1];
const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 0x3E;
const EV_CURRENT: u32 = 1;
const PHDR_SIZE: u16 = 56;
const MAX_PHDRS: u16 = 1024;

const PT_NULL: u32 = 0;
const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_INTERP: u32 = 3;
const PT_NOTE: u32 = 4;
const PT_SHLIB: u32 = 5;
const PT_PHDR: u32 = 6;
const PT_STACK: u32 = 0x6474_E551;

bitflags! {
    #[derive(Debug, Clone, Copy)]
    pub struct SegFlags: u32 {
        const X = 1;
        const W = 2;
        const R = 4;
    }
}

// ══════════════════════════════════════════════════════════════
//  ExecError
// ══════════════════════════════════════════════════════════════

#[derive(Debug)]
pub enum ExecError {
    FileNotFound,
    InvalidFormat,
    BadSegment,
    MemoryError,
    ReadError,
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExecError::FileNotFound => write!(f, "file not found"),
            ExecError::InvalidFormat => write!(f, "error loading executable"),
            ExecError::BadSegment => write!(f, "invalid loadable segment"),
            ExecError::MemoryError => write!(f, "memory allocation error"),
            ExecError::ReadError => write!(f, "file read error"),
        }
    }
}

// ══════════════════════════════════════════════════════════════
//  ELF64 structures
// ══════════════════════════════════════════════════════════════

struct Elf64Ehdr {
    e_entry: u64,
    e_phoff: u64,
    e_phentsize: u16,
    e_phnum: u16,
}

impl Elf64Ehdr {
    fn parse(data: &[u8]) -> Result<Self, ExecError> {
        if data.len() < 64 || data[0..7] != ELF_IDENT {
            return Err(ExecError::InvalidFormat);
        }
        let e_type = u16::from_le_bytes([data[16], data[17]]);
        let e_machine = u16::from_le_bytes([data[18], data[19]]);
        let e_version = u32::from_le_bytes(data[20..24].try_into().unwrap());
        let ehdr = Elf64Ehdr {
            e_entry: u64::from_le_bytes(data[24..32].try_into().unwrap()),
            e_phoff: u64::from_le_bytes(data[32..40].try_into().unwrap()),
            e_phentsize: u16::from_le_bytes([data[54], data[55]]),
            e_phnum: u16::from_le_bytes([data[56], data[57]]),
        };
        if e_type != ET_EXEC
            || e_machine != EM_X86_64
            || e_version != EV_CURRENT
            || ehdr.e_phentsize != PHDR_SIZE
            || ehdr.e_phnum > MAX_PHDRS
        {
            return Err(ExecError::InvalidFormat);
        }
        Ok(ehdr)
    }
}

struct Elf64Phdr {
    p_type: u32,
    p_flags: SegFlags,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
    p_memsz: u64,
}

impl Elf64Phdr {
    fn parse(data: &[u8]) -> Result<Self, ExecError> {
        if data.len() < PHDR_SIZE as usize {
            return Err(ExecError::InvalidFormat);
        }
        Ok(Elf64Phdr {
            p_type: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            p_flags: SegFlags::from_bits_truncate(u32::from_le_bytes(
                data[4..8].try_into().unwrap(),
            )),
            p_offset: u64::from_le_bytes(data[8..16].try_into().unwrap()),
            p_vaddr: u64::from_le_bytes(data[16..24].try_into().unwrap()),
            p_filesz: u64::from_le_bytes(data[32..40].try_into().unwrap()),
            p_memsz: u64::from_le_bytes(data[40..48].try_into().unwrap()),
        })
    }

    /// The rules a loadable segment must satisfy: congruent in-page
    /// offsets, inside the file, inside user space, non-empty, no
    /// wrap-around, and never page 0.
    fn validate(&self, file_len: u64) -> bool {
        if paging::pg_ofs(self.p_offset) != paging::pg_ofs(self.p_vaddr) {
            return false;
        }
        if self.p_offset > file_len {
            return false;
        }
        if self.p_memsz < self.p_filesz || self.p_memsz == 0 {
            return false;
        }
        // The region must not wrap around the address space.
        let Some(end) = self.p_vaddr.checked_add(self.p_memsz) else {
            return false;
        };
        if !paging::is_user_vaddr(self.p_vaddr) || !paging::is_user_vaddr(end) {
            return false;
        }
        if self.p_vaddr < PGSIZE {
            return false;
        }
        true
    }
}

// ══════════════════════════════════════════════════════════════
//  Loader
// ══════════════════════════════════════════════════════════════

/// Load an ELF64 executable into a fresh address space.
///
/// On success the trap frame's rip points at the entry and rsp at the top
/// of a zeroed user stack; the returned file has writes denied and must
/// stay open while the image runs.
pub fn load(file_name: &str, frame: &mut TrapFrame) -> Result<(AddressSpace, File), ExecError> {
    let mut file = match fs::open(file_name) {
        Some(f) => f,
        None => {
            crate::println!("load: {}: open failed", file_name);
            return Err(ExecError::FileNotFound);
        }
    };
    let file_len = file.length() as u64;

    let mut aspace = AddressSpace::new().ok_or(ExecError::MemoryError)?;

    let mut header = [0u8; 64];
    if file.read(&mut header) != header.len() {
        crate::println!("load: {}: error loading executable", file_name);
        return Err(ExecError::InvalidFormat);
    }
    let ehdr = match Elf64Ehdr::parse(&header) {
        Ok(ehdr) => ehdr,
        Err(e) => {
            crate::println!("load: {}: error loading executable", file_name);
            return Err(e);
        }
    };

    let mut file_ofs = ehdr.e_phoff;
    for _ in 0..ehdr.e_phnum {
        if file_ofs > file_len {
            return Err(ExecError::InvalidFormat);
        }
        file.seek(file_ofs as usize);
        let mut raw = [0u8; PHDR_SIZE as usize];
        if file.read(&mut raw) != raw.len() {
            return Err(ExecError::ReadError);
        }
        file_ofs += PHDR_SIZE as u64;

        let phdr = Elf64Phdr::parse(&raw)?;
        match phdr.p_type {
            PT_NULL | PT_NOTE | PT_PHDR | PT_STACK => {}
            PT_DYNAMIC | PT_INTERP | PT_SHLIB => return Err(ExecError::InvalidFormat),
            PT_LOAD => {
                if !phdr.validate(file_len) {
                    return Err(ExecError::BadSegment);
                }
                let writable = phdr.p_flags.contains(SegFlags::W);
                let file_page = phdr.p_offset & !(PGSIZE - 1);
                let mem_page = phdr.p_vaddr & !(PGSIZE - 1);
                let page_offset = paging::pg_ofs(phdr.p_vaddr);
                let (read_bytes, zero_bytes) = if phdr.p_filesz > 0 {
                    let read = page_offset + phdr.p_filesz;
                    (read, paging::pg_round_up(page_offset + phdr.p_memsz) - read)
                } else {
                    (0, paging::pg_round_up(page_offset + phdr.p_memsz))
                };
                load_segment(
                    &mut file, &mut aspace, file_page, mem_page, read_bytes, zero_bytes, writable,
                )?;
            }
            _ => {}
        }
    }

    // One zeroed page of user stack.
    if !aspace.alloc_map_page(USER_STACK - PGSIZE, true) {
        return Err(ExecError::MemoryError);
    }
    frame.rsp = USER_STACK;
    frame.rip = ehdr.e_entry;

    // Nobody writes to a running image.
    file.deny_write();
    Ok((aspace, file))
}

/// Read `read_bytes` from `file_ofs` into pages mapped at `upage`, zero
/// the next `zero_bytes`, all in freshly allocated user pages.
fn load_segment(
    file: &mut File,
    aspace: &mut AddressSpace,
    file_ofs: u64,
    upage: u64,
    mut read_bytes: u64,
    mut zero_bytes: u64,
    writable: bool,
) -> Result<(), ExecError> {
    debug_assert_eq!((read_bytes + zero_bytes) % PGSIZE, 0);
    debug_assert_eq!(paging::pg_ofs(upage), 0);
    debug_assert_eq!(paging::pg_ofs(file_ofs), 0);

    file.seek(file_ofs as usize);
    let mut va = upage;
    while read_bytes > 0 || zero_bytes > 0 {
        let page_read = read_bytes.min(PGSIZE) as usize;
        let page_zero = PGSIZE as usize - page_read;

        let mut page = palloc::alloc_page().ok_or(ExecError::MemoryError)?;
        if file.read(&mut page.bytes_mut()[..page_read]) != page_read {
            return Err(ExecError::ReadError);
        }
        // The page came zeroed; the tail past page_read needs no memset.
        if !aspace.map_page(va, page, writable) {
            return Err(ExecError::BadSegment);
        }

        read_bytes -= page_read as u64;
        zero_bytes -= page_zero as u64;
        va += PGSIZE;
    }
    Ok(())
}
