use alloc::vec::Vec;

use super::file::File;

/// Per-process file descriptor limit.
pub const FD_LIMIT: usize = 128;

/// What a descriptor refers to. The standard streams are sentinels whose
/// read/write paths go straight to the console.
pub enum FdEntry {
    Stdin,
    Stdout,
    Stderr,
    File(File),
}

/// Dense per-process descriptor table. Slots 0/1/2 are reserved for the
/// standard streams; allocation hands out the smallest free index >= 3.
pub struct FdTable {
    slots: Vec<Option<FdEntry>>,
}

impl FdTable {
    pub fn new() -> FdTable {
        let mut slots = Vec::with_capacity(FD_LIMIT);
        slots.push(Some(FdEntry::Stdin));
        slots.push(Some(FdEntry::Stdout));
        slots.push(Some(FdEntry::Stderr));
        for _ in 3..FD_LIMIT {
            slots.push(None);
        }
        FdTable { slots }
    }

    /// Install a file at the smallest free descriptor >= 3.
    pub fn allocate(&mut self, file: File) -> Option<usize> {
        for fd in 3..FD_LIMIT {
            if self.slots[fd].is_none() {
                self.slots[fd] = Some(FdEntry::File(file));
                return Some(fd);
            }
        }
        None
    }

    pub fn is_full(&self) -> bool {
        self.slots[3..].iter().all(|slot| slot.is_some())
    }

    pub fn get(&self, fd: usize) -> Option<&FdEntry> {
        self.slots.get(fd)?.as_ref()
    }

    pub fn get_mut(&mut self, fd: usize) -> Option<&mut FdEntry> {
        self.slots.get_mut(fd)?.as_mut()
    }

    /// Clear a descriptor. Dropping a File entry closes the handle.
    pub fn close(&mut self, fd: usize) -> bool {
        if fd >= FD_LIMIT || self.slots[fd].is_none() {
            return false;
        }
        self.slots[fd] = None;
        true
    }

    /// Close every descriptor, including the standard streams.
    pub fn close_all(&mut self) {
        for fd in 0..FD_LIMIT {
            self.slots[fd] = None;
        }
    }

    /// Entry-by-entry copy for fork. File handles are duplicated so the
    /// child gets its own positions and deny-write state.
    pub fn duplicate(&self) -> FdTable {
        let mut slots = Vec::with_capacity(FD_LIMIT);
        for slot in &self.slots {
            slots.push(match slot {
                None => None,
                Some(FdEntry::Stdin) => Some(FdEntry::Stdin),
                Some(FdEntry::Stdout) => Some(FdEntry::Stdout),
                Some(FdEntry::Stderr) => Some(FdEntry::Stderr),
                Some(FdEntry::File(file)) => Some(FdEntry::File(file.duplicate())),
            });
        }
        FdTable { slots }
    }
}
