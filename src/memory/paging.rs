//! Per-process address spaces over 4-level page tables.
//!
//! Boot glue identity-maps the first gigabyte, so physical addresses
//! double as kernel pointers and page tables can be edited in place. Each
//! `AddressSpace` starts as a private clone of the kernel's upper levels
//! (leaves stay shared) and grows user mappings on demand; because every
//! table and user frame is an owned `Page`, dropping the address space
//! returns all of it to the pool.

use alloc::vec::Vec;
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::PageTableFlags;
use x86_64::PhysAddr;

use super::palloc::{self, Page, PGSIZE};

pub const PGMASK: u64 = PGSIZE - 1;

/// First kernel-reserved virtual address; user space lies below it.
pub const KERN_BASE: u64 = 0x80_0400_0000;

/// Lowest user virtual address. User space starts above the identity-mapped
/// first gigabyte so user mappings can never shadow physical memory the
/// kernel is using through the identity map.
pub const USER_BASE: u64 = 0x4000_0000;

/// Top of the initial user stack.
pub const USER_STACK: u64 = 0x4748_0000;

pub fn is_user_vaddr(va: u64) -> bool {
    va >= USER_BASE && va < KERN_BASE
}

pub fn pg_round_down(va: u64) -> u64 {
    va & !PGMASK
}

pub fn pg_round_up(va: u64) -> u64 {
    (va + PGMASK) & !PGMASK
}

pub fn pg_ofs(va: u64) -> u64 {
    va & PGMASK
}

const PRESENT: u64 = PageTableFlags::PRESENT.bits();
const WRITABLE: u64 = PageTableFlags::WRITABLE.bits();
const USER: u64 = PageTableFlags::USER_ACCESSIBLE.bits();
const HUGE: u64 = PageTableFlags::HUGE_PAGE.bits();
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

unsafe fn table(phys: u64) -> &'static mut [u64; 512] {
    &mut *(phys as *mut [u64; 512])
}

fn index(va: u64, level: u32) -> usize {
    ((va >> (12 + 9 * (level - 1))) & 0x1FF) as usize
}

/// One user page installed in an address space, kept for fork duplication.
pub struct UserMapping {
    pub va: u64,
    pub page: Page,
    pub writable: bool,
}

pub struct AddressSpace {
    pml4: Page,
    tables: Vec<Page>,
    user_pages: Vec<UserMapping>,
}

impl AddressSpace {
    /// Clone the kernel's pml4/pdpt/pd levels into private tables so user
    /// mappings never touch shared kernel structures. Page tables and huge
    /// leaves below that stay shared.
    pub fn new() -> Option<AddressSpace> {
        let pml4 = palloc::alloc_page()?;
        let mut tables = Vec::new();

        let kernel_root = crate::memory::kernel_pml4();
        unsafe {
            let src4 = table(kernel_root);
            let dst4 = table(pml4.addr());
            for i4 in 0..512 {
                let e4 = src4[i4];
                if e4 & PRESENT == 0 {
                    continue;
                }
                let pdpt = palloc::alloc_page()?;
                let src3 = table(e4 & ADDR_MASK);
                let dst3 = table(pdpt.addr());
                for i3 in 0..512 {
                    let e3 = src3[i3];
                    if e3 & PRESENT == 0 || e3 & HUGE != 0 {
                        dst3[i3] = e3;
                        continue;
                    }
                    let pd = palloc::alloc_page()?;
                    let src2 = table(e3 & ADDR_MASK);
                    let dst2 = table(pd.addr());
                    dst2.copy_from_slice(src2);
                    dst3[i3] = pd.addr() | (e3 & !ADDR_MASK);
                    tables.push(pd);
                }
                dst4[i4] = pdpt.addr() | (e4 & !ADDR_MASK);
                tables.push(pdpt);
            }
        }

        Some(AddressSpace {
            pml4,
            tables,
            user_pages: Vec::new(),
        })
    }

    fn owns_table(&self, phys: u64) -> bool {
        phys == self.pml4.addr() || self.tables.iter().any(|t| t.addr() == phys)
    }

    /// Descend one level, making the child table private and 4 KiB-grained:
    /// allocates missing tables, splits huge leaves, clones shared tables.
    unsafe fn ensure_table(&mut self, parent: u64, idx: usize, level: u32) -> Option<u64> {
        let entries = table(parent);
        let entry = entries[idx];

        if entry & PRESENT == 0 {
            let fresh = palloc::alloc_page()?;
            entries[idx] = fresh.addr() | PRESENT | WRITABLE | USER;
            let addr = fresh.addr();
            self.tables.push(fresh);
            return Some(addr);
        }

        if entry & HUGE != 0 {
            // Split a huge leaf into the next level down, preserving the
            // physical range and flags.
            let fresh = palloc::alloc_page()?;
            let child = table(fresh.addr());
            let base = entry & ADDR_MASK;
            let step = if level == 3 { 0x20_0000 } else { PGSIZE };
            let child_flags = if level == 3 {
                entry & !ADDR_MASK
            } else {
                entry & !ADDR_MASK & !HUGE
            };
            for (k, slot) in child.iter_mut().enumerate() {
                *slot = (base + k as u64 * step) | child_flags;
            }
            entries[idx] = fresh.addr() | PRESENT | WRITABLE | USER;
            let addr = fresh.addr();
            self.tables.push(fresh);
            return Some(addr);
        }

        let child_phys = entry & ADDR_MASK;
        if !self.owns_table(child_phys) {
            let fresh = palloc::alloc_page()?;
            table(fresh.addr()).copy_from_slice(table(child_phys));
            entries[idx] = fresh.addr() | PRESENT | WRITABLE | USER;
            let addr = fresh.addr();
            self.tables.push(fresh);
            return Some(addr);
        }

        // Intermediate entries need USER set for Ring 3 to reach the leaf.
        entries[idx] = entry | USER | WRITABLE;
        Some(child_phys)
    }

    /// Map one user page at `va` (page-aligned). Fails if `va` is already
    /// mapped or a table cannot be allocated.
    pub fn map_page(&mut self, va: u64, page: Page, writable: bool) -> bool {
        debug_assert_eq!(pg_ofs(va), 0);
        debug_assert!(is_user_vaddr(va));

        unsafe {
            let Some(pdpt) = self.ensure_table(self.pml4.addr(), index(va, 4), 4) else {
                return false;
            };
            let Some(pd) = self.ensure_table(pdpt, index(va, 3), 3) else {
                return false;
            };
            let Some(pt) = self.ensure_table(pd, index(va, 2), 2) else {
                return false;
            };

            let entries = table(pt);
            let slot = index(va, 1);
            if entries[slot] & PRESENT != 0 {
                return false;
            }
            let mut flags = PRESENT | USER;
            if writable {
                flags |= WRITABLE;
            }
            entries[slot] = page.addr() | flags;
            self.user_pages.push(UserMapping { va, page, writable });
            true
        }
    }

    /// Allocate a zeroed page and map it. Convenience for stack setup.
    pub fn alloc_map_page(&mut self, va: u64, writable: bool) -> bool {
        match palloc::alloc_page() {
            Some(page) => self.map_page(va, page, writable),
            None => false,
        }
    }

    /// Resolve a user virtual address to (physical address, writable).
    /// Kernel mappings are deliberately invisible here; this is the check
    /// behind syscall pointer validation.
    pub fn resolve(&self, va: u64) -> Option<(u64, bool)> {
        if !is_user_vaddr(va) {
            return None;
        }
        unsafe {
            let mut phys = self.pml4.addr();
            for level in (2..=4).rev() {
                let entry = table(phys)[index(va, level)];
                if entry & PRESENT == 0 {
                    return None;
                }
                if entry & HUGE != 0 {
                    if entry & USER == 0 {
                        return None;
                    }
                    let span = if level == 3 { 0x4000_0000 } else { 0x20_0000 };
                    let base = entry & ADDR_MASK;
                    return Some((base + (va & (span - 1)), entry & WRITABLE != 0));
                }
                phys = entry & ADDR_MASK;
            }
            let entry = table(phys)[index(va, 1)];
            if entry & PRESENT == 0 || entry & USER == 0 {
                return None;
            }
            Some(((entry & ADDR_MASK) + pg_ofs(va), entry & WRITABLE != 0))
        }
    }

    /// Copy bytes out of user memory, page by page.
    pub fn read_user(&self, mut va: u64, mut buf: &mut [u8]) -> bool {
        while !buf.is_empty() {
            let Some((phys, _)) = self.resolve(va) else {
                return false;
            };
            let chunk = ((PGSIZE - pg_ofs(va)) as usize).min(buf.len());
            unsafe {
                core::ptr::copy_nonoverlapping(phys as *const u8, buf.as_mut_ptr(), chunk);
            }
            buf = &mut buf[chunk..];
            va += chunk as u64;
        }
        true
    }

    /// Copy bytes into user memory; every touched page must be writable.
    pub fn write_user(&self, mut va: u64, mut buf: &[u8]) -> bool {
        while !buf.is_empty() {
            let Some((phys, writable)) = self.resolve(va) else {
                return false;
            };
            if !writable {
                return false;
            }
            let chunk = ((PGSIZE - pg_ofs(va)) as usize).min(buf.len());
            unsafe {
                core::ptr::copy_nonoverlapping(buf.as_ptr(), phys as *mut u8, chunk);
            }
            buf = &buf[chunk..];
            va += chunk as u64;
        }
        true
    }

    pub fn user_mappings(&self) -> &[UserMapping] {
        &self.user_pages
    }

    /// Load this address space into CR3.
    pub fn activate(&self) {
        unsafe {
            Cr3::write(
                x86_64::structures::paging::PhysFrame::containing_address(PhysAddr::new(
                    self.pml4.addr(),
                )),
                Cr3Flags::empty(),
            );
        }
    }
}

/// Switch back to the kernel-only page tables. Required before an address
/// space is destroyed so CR3 never points at freed pages.
pub fn activate_kernel() {
    unsafe {
        Cr3::write(
            x86_64::structures::paging::PhysFrame::containing_address(PhysAddr::new(
                crate::memory::kernel_pml4(),
            )),
            Cr3Flags::empty(),
        );
    }
}
