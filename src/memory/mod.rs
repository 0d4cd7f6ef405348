pub mod paging;
pub mod palloc;

use alloc::string::String;
use spin::Once;

/// Physical address of the boot page tables; every address space clones
/// its kernel half from here, and cleanup switches back to it.
static KERNEL_PML4: Once<u64> = Once::new();

/// Kernel command line from the bootloader.
static CMDLINE: Once<String> = Once::new();

/// Skip everything below 16 MiB (kernel image, legacy regions).
const POOL_FLOOR: u64 = 0x100_0000;

/// Boot glue identity-maps only the first gigabyte; the page pool must not
/// hand out frames the kernel cannot address.
const POOL_CEILING: u64 = 0x4000_0000;

pub fn init(multiboot_info_addr: usize) {
    let boot_info = unsafe {
        multiboot2::BootInformation::load(multiboot_info_addr as *const _)
            .expect("Failed to load Multiboot2 info!")
    };
    let memory_map_tag = boot_info.memory_map_tag().expect("Memory map tag required");

    // Largest usable region, clamped to what the identity map covers.
    let mut best: Option<(u64, u64)> = None;
    for area in memory_map_tag.memory_areas() {
        if multiboot2::MemoryAreaType::from(area.typ()) != multiboot2::MemoryAreaType::Available {
            continue;
        }
        let start = area.start_address().max(POOL_FLOOR);
        let end = area.end_address().min(POOL_CEILING);
        if end <= start {
            continue;
        }
        if best.map_or(true, |(s, e)| end - start > e - s) {
            best = Some((start, end));
        }
    }
    let (pool_start, pool_end) = best.expect("no usable memory region above 16 MiB");

    unsafe {
        palloc::init(pool_start, pool_end);
    }
    crate::log_info!(
        "Page pool: {} pages in {:#x}..{:#x}.",
        palloc::free_pages(),
        pool_start,
        pool_end
    );

    // Carve the kernel heap out of the pool; it lives for the whole run.
    let heap_pages = crate::allocator::HEAP_SIZE / palloc::PGSIZE as usize;
    let heap = palloc::alloc_run(heap_pages).expect("Heap allocation failed");
    unsafe {
        crate::allocator::init_heap(heap.as_ptr(), heap.len_bytes());
    }
    core::mem::forget(heap);
    crate::log_info!("Heap Allocator initialized successfully.");

    let (root_frame, _) = x86_64::registers::control::Cr3::read();
    KERNEL_PML4.call_once(|| root_frame.start_address().as_u64());

    let cmdline = boot_info
        .command_line_tag()
        .and_then(|tag| tag.cmdline().ok())
        .unwrap_or("");
    CMDLINE.call_once(|| String::from(cmdline));
}

pub fn kernel_pml4() -> u64 {
    *KERNEL_PML4.get().expect("memory::init not called")
}

pub fn command_line() -> &'static str {
    CMDLINE.get().map(|s| s.as_str()).unwrap_or("")
}
