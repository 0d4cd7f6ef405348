//! Physical page pool. Hands out zero-initialized 4 KiB pages and
//! contiguous page runs; both return to the bitmap when dropped.
//!
//! Thread stacks, page tables and user memory all come from here, so the
//! pool must support free — the boot-time bump allocator the kernel used
//! to carry could not.

use bit_field::BitField;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::interrupts::gate;

pub const PGSIZE: u64 = 4096;

/// Pool capacity: 32768 pages = 128 MiB of managed RAM.
const MAX_PAGES: usize = 32768;
const BITMAP_WORDS: usize = MAX_PAGES / 64;

pub struct PagePool {
    base: u64,
    page_count: usize,
    free_count: usize,
    bitmap: [u64; BITMAP_WORDS], // bit set = in use
}

impl PagePool {
    const fn new() -> Self {
        PagePool {
            base: 0,
            page_count: 0,
            free_count: 0,
            bitmap: [0; BITMAP_WORDS],
        }
    }

    unsafe fn init(&mut self, start: u64, end: u64) {
        let base = (start + PGSIZE - 1) & !(PGSIZE - 1);
        let count = (((end & !(PGSIZE - 1)).saturating_sub(base)) / PGSIZE) as usize;
        self.base = base;
        self.page_count = count.min(MAX_PAGES);
        self.free_count = self.page_count;
    }

    fn is_used(&self, idx: usize) -> bool {
        self.bitmap[idx / 64].get_bit(idx % 64)
    }

    fn mark(&mut self, idx: usize, used: bool) {
        self.bitmap[idx / 64].set_bit(idx % 64, used);
    }

    fn take_run(&mut self, count: usize) -> Option<u64> {
        if count == 0 || count > self.free_count {
            return None;
        }
        let mut run_start = 0usize;
        let mut run_len = 0usize;
        for idx in 0..self.page_count {
            if self.is_used(idx) {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = idx;
                }
                run_len += 1;
                if run_len == count {
                    for i in run_start..run_start + count {
                        self.mark(i, true);
                    }
                    self.free_count -= count;
                    return Some(self.base + run_start as u64 * PGSIZE);
                }
            }
        }
        None
    }

    fn release_run(&mut self, addr: u64, count: usize) {
        debug_assert!(addr >= self.base && addr % PGSIZE == 0);
        let start = ((addr - self.base) / PGSIZE) as usize;
        for idx in start..start + count {
            debug_assert!(self.is_used(idx), "double free of page {:#x}", addr);
            self.mark(idx, false);
        }
        self.free_count += count;
    }
}

lazy_static! {
    static ref POOL: Mutex<PagePool> = Mutex::new(PagePool::new());
}

/// Describe the managed physical range. Must precede any allocation.
pub unsafe fn init(start: u64, end: u64) {
    POOL.lock().init(start, end);
}

pub fn free_pages() -> usize {
    gate::with_disabled(|| POOL.lock().free_count)
}

/// An owned, zeroed physical page. Identity-mapped, so `addr` doubles as a
/// kernel pointer. Returns to the pool on drop.
#[derive(Debug)]
pub struct Page {
    addr: u64,
}

impl Page {
    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.addr as *mut u8
    }

    pub fn bytes_mut(&mut self) -> &mut [u8; PGSIZE as usize] {
        unsafe { &mut *(self.addr as *mut [u8; PGSIZE as usize]) }
    }

    pub fn bytes(&self) -> &[u8; PGSIZE as usize] {
        unsafe { &*(self.addr as *const [u8; PGSIZE as usize]) }
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        gate::with_disabled(|| POOL.lock().release_run(self.addr, 1));
    }
}

/// An owned run of physically contiguous pages.
#[derive(Debug)]
pub struct PageRun {
    addr: u64,
    count: usize,
}

impl PageRun {
    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn len_bytes(&self) -> usize {
        self.count * PGSIZE as usize
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.addr as *mut u8
    }
}

impl Drop for PageRun {
    fn drop(&mut self) {
        gate::with_disabled(|| POOL.lock().release_run(self.addr, self.count));
    }
}

/// Allocate one zeroed page.
pub fn alloc_page() -> Option<Page> {
    alloc_run(1).map(|run| {
        let addr = run.addr;
        core::mem::forget(run);
        Page { addr }
    })
}

/// Allocate `count` zeroed, physically contiguous pages.
pub fn alloc_run(count: usize) -> Option<PageRun> {
    // Interrupts stay off around the pool lock: the scheduler allocates
    // and frees pages inside its own critical sections.
    let addr = gate::with_disabled(|| POOL.lock().take_run(count))?;
    unsafe {
        core::ptr::write_bytes(addr as *mut u8, 0, count * PGSIZE as usize);
    }
    Some(PageRun { addr, count })
}
