//! Syscall dispatch. The number rides in rax, arguments in rdi/rsi/rdx,
//! and the result returns through the frame's rax slot.
//!
//! Every pointer argument is validated (non-null, user-space, mapped in
//! the current address space) before use; a bad pointer terminates the
//! offending process with exit status -1. Filesystem calls serialize
//! behind one global lock; console writes bypass it in bounded chunks.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use spin::Once;

use crate::fs::{self, fd::FdEntry};
use crate::interrupts::usermode::TrapFrame;
use crate::memory::palloc::PGSIZE;
use crate::process;
use crate::scheduler::{with_scheduler, Lock, Tid};

pub const SYS_HALT: u64 = 0;
pub const SYS_EXIT: u64 = 1;
pub const SYS_FORK: u64 = 2;
pub const SYS_EXEC: u64 = 3;
pub const SYS_WAIT: u64 = 4;
pub const SYS_CREATE: u64 = 5;
pub const SYS_REMOVE: u64 = 6;
pub const SYS_OPEN: u64 = 7;
pub const SYS_FILESIZE: u64 = 8;
pub const SYS_READ: u64 = 9;
pub const SYS_WRITE: u64 = 10;
pub const SYS_SEEK: u64 = 11;
pub const SYS_TELL: u64 = 12;
pub const SYS_CLOSE: u64 = 13;

/// Largest read/write the kernel will buffer at once.
const IO_LIMIT: usize = 1024 * 1024;

/// Console output is emitted in chunks of this size.
const CONSOLE_CHUNK: usize = 256;

static FILESYS_LOCK: Once<Lock> = Once::new();

fn fs_lock() -> Lock {
    *FILESYS_LOCK.get().expect("syscalls::init not called")
}

pub fn init() {
    FILESYS_LOCK.call_once(Lock::new);
    crate::log_info!("Syscall interface initialized.");
}

/// Entry point from the syscall shim.
pub extern "C" fn dispatch(frame: *mut TrapFrame) {
    // The gate masked IF on entry; syscalls may block and be preempted.
    x86_64::instructions::interrupts::enable();

    let frame = unsafe { &mut *frame };
    let (a0, a1, a2) = (frame.rdi, frame.rsi, frame.rdx);

    match frame.rax {
        SYS_HALT => crate::power_off(),
        SYS_EXIT => process::sys_exit(a0 as i64),
        SYS_FORK => {
            let name = user_str(a0);
            frame.rax = process::fork(&name, frame) as u64;
        }
        SYS_EXEC => {
            let path = user_str(a0);
            if process::exec(&path) == -1 {
                process::sys_exit(-1);
            }
            unreachable!("exec returned on success");
        }
        SYS_WAIT => frame.rax = process::wait(Tid(a0 as i64)) as u64,
        SYS_CREATE => {
            let path = user_str(a0);
            fs_lock().acquire();
            let created = fs::create(&path, a1 as usize);
            fs_lock().release();
            frame.rax = created as u64;
        }
        SYS_REMOVE => {
            let path = user_str(a0);
            fs_lock().acquire();
            let removed = fs::remove(&path);
            fs_lock().release();
            frame.rax = removed as u64;
        }
        SYS_OPEN => frame.rax = sys_open(a0) as u64,
        SYS_FILESIZE => frame.rax = sys_filesize(a0 as usize) as u64,
        SYS_READ => frame.rax = sys_read(a0 as usize, a1, a2) as u64,
        SYS_WRITE => frame.rax = sys_write(a0 as usize, a1, a2) as u64,
        SYS_SEEK => {
            sys_seek(a0 as usize, a1 as usize);
            frame.rax = 0;
        }
        SYS_TELL => frame.rax = sys_tell(a0 as usize) as u64,
        SYS_CLOSE => {
            sys_close(a0 as usize);
            frame.rax = 0;
        }
        other => {
            crate::log_warn!("syscall: unknown number {}", other);
            process::sys_exit(-1);
        }
    }
}

fn sys_open(path_ptr: u64) -> i64 {
    let path = user_str(path_ptr);
    fs_lock().acquire();
    let result = match fs::open(&path) {
        None => -1,
        // On table exhaustion `allocate` drops (closes) the file; an
        // allocated descriptor keeps it open.
        Some(file) => with_scheduler(|s| {
            let cur = s.current;
            match s.tmut(cur).fd_table.allocate(file) {
                Some(fd) => fd as i64,
                None => -1,
            }
        }),
    };
    fs_lock().release();
    result
}

fn sys_filesize(fd: usize) -> i64 {
    with_scheduler(|s| {
        let cur = s.current;
        match s.tmut(cur).fd_table.get(fd) {
            Some(FdEntry::File(file)) => file.length() as i64,
            _ => -1,
        }
    })
}

fn sys_read(fd: usize, buf: u64, len: u64) -> i64 {
    if len == 0 {
        return 0;
    }
    if len as usize > IO_LIMIT {
        return -1;
    }
    check_buffer(buf, len);

    enum Kind {
        Stdin,
        File,
        Bad,
    }
    let kind = with_scheduler(|s| {
        let cur = s.current;
        match s.tref(cur).fd_table.get(fd) {
            Some(FdEntry::Stdin) => Kind::Stdin,
            Some(FdEntry::File(_)) => Kind::File,
            _ => Kind::Bad,
        }
    });

    match kind {
        Kind::Bad => -1,
        Kind::Stdin => {
            // Keyboard bytes, one at a time; blocks until enough arrive.
            for i in 0..len {
                let byte = crate::drivers::keyboard::read_byte();
                let ok = with_scheduler(|s| {
                    let t = s.tref(s.current);
                    match &t.address_space {
                        Some(aspace) => aspace.write_user(buf + i, &[byte]),
                        None => false,
                    }
                });
                if !ok {
                    process::sys_exit(-1);
                }
            }
            len as i64
        }
        Kind::File => {
            fs_lock().acquire();
            let count = with_scheduler(|s| {
                let cur = s.current;
                let mut bounce = vec![0u8; len as usize];
                let count = match s.tmut(cur).fd_table.get_mut(fd) {
                    Some(FdEntry::File(file)) => file.read(&mut bounce),
                    _ => return None,
                };
                let t = s.tref(cur);
                let aspace = t.address_space.as_ref()?;
                if !aspace.write_user(buf, &bounce[..count]) {
                    return None;
                }
                Some(count)
            });
            fs_lock().release();
            match count {
                Some(n) => n as i64,
                None => -1,
            }
        }
    }
}

fn sys_write(fd: usize, buf: u64, len: u64) -> i64 {
    if len == 0 {
        return 0;
    }
    if len as usize > IO_LIMIT {
        return -1;
    }
    check_buffer(buf, len);

    enum Kind {
        Console,
        File,
        Bad,
    }
    let kind = with_scheduler(|s| {
        let cur = s.current;
        match s.tref(cur).fd_table.get(fd) {
            Some(FdEntry::Stdout) | Some(FdEntry::Stderr) => Kind::Console,
            Some(FdEntry::File(_)) => Kind::File,
            _ => Kind::Bad,
        }
    });

    match kind {
        Kind::Bad => -1,
        Kind::Console => {
            let Some(bytes) = copy_in(buf, len as usize) else {
                process::sys_exit(-1);
            };
            console_write(&bytes);
            len as i64
        }
        Kind::File => {
            let Some(bytes) = copy_in(buf, len as usize) else {
                process::sys_exit(-1);
            };
            fs_lock().acquire();
            debug_assert!(fs_lock().held_by_current());
            let count = with_scheduler(|s| {
                let cur = s.current;
                match s.tmut(cur).fd_table.get_mut(fd) {
                    Some(FdEntry::File(file)) => file.write(&bytes) as i64,
                    _ => -1,
                }
            });
            fs_lock().release();
            count
        }
    }
}

fn sys_seek(fd: usize, pos: usize) {
    with_scheduler(|s| {
        let cur = s.current;
        if let Some(FdEntry::File(file)) = s.tmut(cur).fd_table.get_mut(fd) {
            file.seek(pos);
        }
    });
}

fn sys_tell(fd: usize) -> i64 {
    with_scheduler(|s| {
        let cur = s.current;
        match s.tref(cur).fd_table.get(fd) {
            // The handle's position, not the descriptor index.
            Some(FdEntry::File(file)) => file.tell() as i64,
            _ => -1,
        }
    })
}

fn sys_close(fd: usize) {
    with_scheduler(|s| {
        let cur = s.current;
        s.tmut(cur).fd_table.close(fd);
    });
}

/// Write bytes to the console in bounded chunks.
pub fn console_write(bytes: &[u8]) {
    for chunk in bytes.chunks(CONSOLE_CHUNK) {
        crate::print!("{}", String::from_utf8_lossy(chunk));
    }
}

/// Kill the process over a bad pointer argument.
fn die_bad_pointer() -> ! {
    process::sys_exit(-1)
}

/// Validate every page the buffer touches.
fn check_buffer(buf: u64, len: u64) {
    if buf == 0 {
        die_bad_pointer();
    }
    let Some(end) = buf.checked_add(len - 1) else {
        die_bad_pointer();
    };
    let ok = with_scheduler(|s| {
        let t = s.tref(s.current);
        let Some(aspace) = &t.address_space else {
            return false;
        };
        let mut va = buf & !(PGSIZE - 1);
        while va <= end {
            if aspace.resolve(va).is_none() {
                return false;
            }
            match va.checked_add(PGSIZE) {
                Some(next) => va = next,
                None => return false,
            }
        }
        true
    });
    if !ok {
        die_bad_pointer();
    }
}

/// Copy a NUL-terminated string out of user memory, validating each byte's
/// page. Dies on any invalid address.
fn user_str(ptr: u64) -> String {
    if ptr == 0 {
        die_bad_pointer();
    }
    let copied = with_scheduler(|s| {
        let t = s.tref(s.current);
        let aspace = t.address_space.as_ref()?;
        let mut out = Vec::new();
        let mut addr = ptr;
        loop {
            let mut byte = [0u8];
            if !aspace.read_user(addr, &mut byte) {
                return None;
            }
            if byte[0] == 0 {
                break;
            }
            out.push(byte[0]);
            if out.len() >= PGSIZE as usize {
                return None;
            }
            addr += 1;
        }
        String::from_utf8(out).ok()
    });
    match copied {
        Some(s) => s,
        None => die_bad_pointer(),
    }
}

/// Copy a validated buffer out of user memory.
fn copy_in(buf: u64, len: usize) -> Option<Vec<u8>> {
    with_scheduler(|s| {
        let t = s.tref(s.current);
        let aspace = t.address_space.as_ref()?;
        let mut bytes = vec![0u8; len];
        if !aspace.read_user(buf, &mut bytes) {
            return None;
        }
        Some(bytes)
    })
}
