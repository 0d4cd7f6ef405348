use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use super::context::Context;
use super::sync::Semaphore;
use crate::fs::fd::FdTable;
use crate::fs::file::File;
use crate::interrupts::usermode::TrapFrame;
use crate::memory::paging::AddressSpace;
use crate::memory::palloc::{Page, PGSIZE};

/// Thread identifier. Unique, monotonically assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tid(pub i64);

pub const TID_ERROR: Tid = Tid(-1);

impl core::fmt::Display for Tid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub const PRI_MIN: u8 = 0;
pub const PRI_DEFAULT: u8 = 31;
pub const PRI_MAX: u8 = 63;

/// Written at the base of every thread's stack page. The stack grows down
/// toward it, so an overflow clobbers the cookie before anything else.
pub const STACK_MAGIC: u64 = 0xcd6a_bf4b;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Running,
    Ready,
    Blocked,
    Dying,
}

/// Which queue a thread is linked into. A thread is on at most one queue
/// at any instant; every insert and remove asserts this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Unqueued,
    Ready,
    Sleep,
    Waiters,
    Reap,
}

/// A kernel thread or user process.
pub struct Thread {
    pub tid: Tid,
    pub name: String,
    pub status: Status,
    /// Current (effective) priority, donations included.
    pub priority: u8,
    /// The last priority set by the thread itself.
    pub base_priority: u8,
    /// Absolute tick to wake at; meaningful only while on the sleep queue.
    pub wake_tick: i64,
    /// Lock this thread is blocked on, if any. Donation walks follow it.
    pub wait_lock: Option<usize>,
    /// Threads that have donated priority to this one.
    pub donors: Vec<Tid>,
    pub location: Location,
    /// The thread's single stack page. The boot thread runs on the loader
    /// stack and has none.
    pub stack: Option<Page>,
    pub context: Context,

    // Process half.
    pub is_process: bool,
    pub parent: Option<Tid>,
    pub children: Vec<Tid>,
    pub exit_status: i64,
    /// Trap frame stashed by fork for the child to copy.
    pub parent_frame: Option<Box<TrapFrame>>,
    pub fork_sema: Semaphore,
    pub wait_sema: Semaphore,
    pub free_sema: Semaphore,
    pub fd_table: FdTable,
    /// The executable this process runs, held open to deny writes.
    pub running_file: Option<File>,
    pub address_space: Option<AddressSpace>,
}

impl Thread {
    pub fn new(
        tid: Tid,
        name: &str,
        priority: u8,
        mut stack: Option<Page>,
        semas: [Semaphore; 3],
    ) -> Thread {
        debug_assert!(priority <= PRI_MAX);
        if let Some(page) = stack.as_mut() {
            page.bytes_mut()[..8].copy_from_slice(&STACK_MAGIC.to_le_bytes());
        }
        Thread {
            tid,
            name: String::from(name),
            status: Status::Blocked,
            priority,
            base_priority: priority,
            wake_tick: 0,
            wait_lock: None,
            donors: Vec::new(),
            location: Location::Unqueued,
            stack,
            context: Context::empty(),
            is_process: false,
            parent: None,
            children: Vec::new(),
            exit_status: 0,
            parent_frame: None,
            fork_sema: semas[0],
            wait_sema: semas[1],
            free_sema: semas[2],
            fd_table: FdTable::new(),
            running_file: None,
            address_space: None,
        }
    }

    pub fn stack_top(&self) -> Option<u64> {
        self.stack.as_ref().map(|page| page.addr() + PGSIZE)
    }

    /// Panics if the stack guard has been overwritten. Checked on every
    /// pass through the scheduler.
    pub fn check_stack_guard(&self) {
        if let Some(page) = &self.stack {
            let cookie = u64::from_le_bytes(page.bytes()[..8].try_into().unwrap());
            assert!(
                cookie == STACK_MAGIC,
                "kernel stack overflow in thread '{}'",
                self.name
            );
        }
    }
}
