use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::interrupts::gate;

/// In-memory inode. Files are fixed-size once created; writes never grow
/// them. `deny_write_cnt` counts handles holding the file as a running
/// executable image.
pub struct Inode {
    pub data: Vec<u8>,
    deny_write_cnt: u32,
}

impl Inode {
    pub fn new(data: Vec<u8>) -> Inode {
        Inode {
            data,
            deny_write_cnt: 0,
        }
    }
}

/// An open file handle: shared inode, private position and deny flag.
///
/// The inode lock is always taken with interrupts off: handles are also
/// dropped from scheduler critical sections (fd teardown, thread reaping),
/// and a preempted holder would deadlock those.
pub struct File {
    inode: Arc<Mutex<Inode>>,
    pos: usize,
    denying: bool,
}

impl File {
    pub fn open(inode: Arc<Mutex<Inode>>) -> File {
        File {
            inode,
            pos: 0,
            denying: false,
        }
    }

    /// A second handle to the same inode with the same position and the
    /// same write-deny state. Used by fork's fd duplication.
    pub fn duplicate(&self) -> File {
        if self.denying {
            gate::with_disabled(|| self.inode.lock().deny_write_cnt += 1);
        }
        File {
            inode: self.inode.clone(),
            pos: self.pos,
            denying: self.denying,
        }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let count = gate::with_disabled(|| {
            let inode = self.inode.lock();
            let available = inode.data.len().saturating_sub(self.pos);
            let count = available.min(buf.len());
            buf[..count].copy_from_slice(&inode.data[self.pos..self.pos + count]);
            count
        });
        self.pos += count;
        count
    }

    /// Write within the file's current size. Returns 0 while writes are
    /// denied (the file is someone's running image).
    pub fn write(&mut self, buf: &[u8]) -> usize {
        let count = gate::with_disabled(|| {
            let mut inode = self.inode.lock();
            if inode.deny_write_cnt > 0 {
                return 0;
            }
            let available = inode.data.len().saturating_sub(self.pos);
            let count = available.min(buf.len());
            let pos = self.pos;
            inode.data[pos..pos + count].copy_from_slice(&buf[..count]);
            count
        });
        self.pos += count;
        count
    }

    pub fn length(&self) -> usize {
        gate::with_disabled(|| self.inode.lock().data.len())
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn tell(&self) -> usize {
        self.pos
    }

    /// Refuse writes through any handle until this one allows them again
    /// (or is closed).
    pub fn deny_write(&mut self) {
        if !self.denying {
            self.denying = true;
            gate::with_disabled(|| self.inode.lock().deny_write_cnt += 1);
        }
    }

    pub fn allow_write(&mut self) {
        if self.denying {
            self.denying = false;
            gate::with_disabled(|| {
                let mut inode = self.inode.lock();
                debug_assert!(inode.deny_write_cnt > 0);
                inode.deny_write_cnt -= 1;
            });
        }
    }
}

impl Drop for File {
    fn drop(&mut self) {
        // Closing a deny-write handle re-enables writes.
        self.allow_write();
    }
}
