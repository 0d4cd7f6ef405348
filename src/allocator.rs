use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

use linked_list_allocator::Heap;
use spin::Mutex;

use crate::interrupts::gate;

/// Kernel heap size (1 MiB). The heap backs `alloc` (Box, Vec, String);
/// thread stacks and user pages come from the page pool instead.
pub const HEAP_SIZE: usize = 1024 * 1024;

/// The scheduler allocates inside interrupt-disabled critical sections,
/// so every heap operation must itself run with interrupts off — a holder
/// preempted mid-allocation would deadlock them otherwise.
struct KernelHeap {
    inner: Mutex<Heap>,
}

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        gate::with_disabled(|| {
            self.inner
                .lock()
                .allocate_first_fit(layout)
                .map_or(ptr::null_mut(), |block| block.as_ptr())
        })
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        gate::with_disabled(|| {
            self.inner
                .lock()
                .deallocate(NonNull::new_unchecked(ptr), layout)
        })
    }
}

#[global_allocator]
static ALLOCATOR: KernelHeap = KernelHeap {
    inner: Mutex::new(Heap::empty()),
};

/// Hand a contiguous, identity-mapped page run to the allocator.
/// Called once from memory::init; the run is never returned.
pub unsafe fn init_heap(heap_start: *mut u8, heap_size: usize) {
    ALLOCATOR.inner.lock().init(heap_start, heap_size);
}
