//! User-process lifecycle: fork, exec, wait and exit.
//!
//! Every thread carries three binary semaphores. `fork_sema` gates the
//! parent until the child finishes duplicating; `wait_sema` wakes a
//! waiting parent when the child exits; `free_sema` keeps the child's
//! record readable until the parent has taken the exit status. The
//! wait/free handshake applies to process threads — plain kernel workers
//! exit straight into the reap queue.

pub mod elf;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use crate::interrupts::usermode::{do_iret, TrapFrame};
use crate::memory::paging::{self, AddressSpace};
use crate::memory::palloc;
use crate::scheduler::{self, with_scheduler, CreateError, Tid, PRI_DEFAULT};
use crate::{log_error, println};

/// Command lines split into at most this many tokens.
pub const MAX_ARGS: usize = 128;

/// Spawn a process thread running a kernel entry function. The child is
/// linked into the caller's child set, so `wait` works on it.
pub fn spawn(name: &str, entry: fn(usize), arg: usize) -> Result<Tid, CreateError> {
    let parent = scheduler::current_tid();
    scheduler::create_process(name, PRI_DEFAULT, entry, arg, parent)
}

/// Spawn the first user program: a process thread that execs `cmdline`.
pub fn create_initial(cmdline: &str) -> Result<Tid, CreateError> {
    let boxed = Box::new(String::from(cmdline));
    let name = first_token(cmdline);
    spawn(&name, initial_entry, Box::into_raw(boxed) as usize)
}

fn initial_entry(arg: usize) {
    let cmdline = *unsafe { Box::from_raw(arg as *mut String) };
    if exec(&cmdline) == -1 {
        panic!("Fail to launch initial process: {}", cmdline);
    }
}

fn first_token(cmdline: &str) -> String {
    String::from(cmdline.split(' ').find(|t| !t.is_empty()).unwrap_or(cmdline))
}

/// Duplicate the current process. Returns the child tid to the parent and
/// -1 on failure; the child resumes from the copied frame with rax = 0.
pub fn fork(name: &str, frame: &TrapFrame) -> i64 {
    let parent = scheduler::current_tid();
    with_scheduler(|s| {
        let cur = s.current;
        s.tmut(cur).parent_frame = Some(Box::new(*frame));
    });

    let child = match scheduler::create_process(
        name,
        PRI_DEFAULT,
        fork_child_entry,
        parent.0 as usize,
        parent,
    ) {
        Ok(tid) => tid,
        Err(_) => return -1,
    };

    // Block until the child has finished (or failed) duplication.
    let fork_sema = with_scheduler(|s| s.tref(child).fork_sema);
    fork_sema.down();

    let failed = with_scheduler(|s| s.get(child).map_or(true, |t| t.exit_status == -1));
    if failed {
        return -1;
    }
    child.0
}

/// Child half of fork: copy the parent's frame, address space and fd
/// table, signal the parent, and drop into user mode.
fn fork_child_entry(parent_raw: usize) {
    let parent = Tid(parent_raw as i64);

    let frame = with_scheduler(|s| s.get(parent).and_then(|p| p.parent_frame.as_deref().copied()));
    let Some(mut frame) = frame else {
        fork_fail();
    };
    // fork returns 0 in the child.
    frame.rax = 0;

    if !duplicate_from(parent) {
        fork_fail();
    }

    let fork_sema = with_scheduler(|s| {
        let cur = s.current;
        if let Some(aspace) = &s.tref(cur).address_space {
            aspace.activate();
        }
        s.tref(cur).fork_sema
    });
    fork_sema.up();

    unsafe { do_iret(&frame) }
}

fn fork_fail() -> ! {
    let fork_sema = with_scheduler(|s| {
        let cur = s.current;
        s.tmut(cur).exit_status = -1;
        s.tref(cur).fork_sema
    });
    fork_sema.up();
    thread_exit();
}

/// Copy every user page and fd entry of `parent` into the current thread.
fn duplicate_from(parent: Tid) -> bool {
    let Some(mut aspace) = AddressSpace::new() else {
        return false;
    };
    with_scheduler(move |s| {
        let cur = s.current;
        let Some(p) = s.get(parent) else {
            return false;
        };
        if p.fd_table.is_full() {
            return false;
        }
        if let Some(parent_space) = &p.address_space {
            for mapping in parent_space.user_mappings() {
                let Some(mut page) = palloc::alloc_page() else {
                    return false;
                };
                page.bytes_mut().copy_from_slice(mapping.page.bytes());
                if !aspace.map_page(mapping.va, page, mapping.writable) {
                    return false;
                }
            }
        }
        let fd_copy = p.fd_table.duplicate();
        let t = s.tmut(cur);
        t.fd_table = fd_copy;
        t.address_space = Some(aspace);
        true
    })
}

/// Replace the current process image. Never returns on success.
pub fn exec(cmdline: &str) -> i64 {
    let argv = tokenize(cmdline);
    if argv.is_empty() {
        return -1;
    }

    // The old image dies first; on failure there is nothing to return to
    // and the caller exits.
    process_cleanup();

    let mut frame = TrapFrame::new_user();
    match elf::load(&argv[0], &mut frame) {
        Err(err) => {
            log_error!("exec: {}: {}", argv[0], err);
            -1
        }
        Ok((aspace, file)) => {
            if !argument_stack(&mut frame, &argv, &aspace) {
                return -1;
            }
            with_scheduler(|s| {
                let cur = s.current;
                let t = s.tmut(cur);
                t.name = argv[0].clone();
                t.is_process = true;
                t.running_file = Some(file);
                t.address_space = Some(aspace);
                t.address_space.as_ref().unwrap().activate();
            });
            unsafe { do_iret(&frame) }
        }
    }
}

/// Split on ASCII spaces, keeping at most MAX_ARGS tokens.
pub fn tokenize(cmdline: &str) -> Vec<String> {
    cmdline
        .split(' ')
        .filter(|t| !t.is_empty())
        .take(MAX_ARGS)
        .map(String::from)
        .collect()
}

/// Lay out argc/argv on the user stack:
/// token bytes right-to-left, zero padding to an 8-byte boundary, the
/// argv pointer array with its NULL terminator, and a fake return
/// address. rdi/rsi receive argc and &argv[0].
pub fn argument_stack(frame: &mut TrapFrame, argv: &[String], aspace: &AddressSpace) -> bool {
    debug_assert!(argv.len() <= MAX_ARGS);
    let mut rsp = frame.rsp;
    let mut addrs = [0u64; MAX_ARGS];

    for (i, arg) in argv.iter().enumerate().rev() {
        let bytes = arg.as_bytes();
        rsp -= bytes.len() as u64 + 1;
        if !aspace.write_user(rsp, bytes) || !aspace.write_user(rsp + bytes.len() as u64, &[0]) {
            return false;
        }
        addrs[i] = rsp;
    }

    while rsp % 8 != 0 {
        rsp -= 1;
        if !aspace.write_user(rsp, &[0]) {
            return false;
        }
    }

    rsp -= 8;
    if !aspace.write_user(rsp, &0u64.to_le_bytes()) {
        return false;
    }
    for i in (0..argv.len()).rev() {
        rsp -= 8;
        if !aspace.write_user(rsp, &addrs[i].to_le_bytes()) {
            return false;
        }
    }
    let argv_base = rsp;

    rsp -= 8;
    if !aspace.write_user(rsp, &0u64.to_le_bytes()) {
        return false;
    }

    frame.rsp = rsp;
    frame.rdi = argv.len() as u64;
    frame.rsi = argv_base;
    true
}

/// Wait for a child to exit and reap it. Returns its exit status, or -1
/// if `child_tid` is not an un-waited child of the caller.
pub fn wait(child_tid: Tid) -> i64 {
    let cur = scheduler::current_tid();
    let wait_sema = with_scheduler(|s| {
        if !s.tref(cur).children.contains(&child_tid) {
            return None;
        }
        Some(s.tref(child_tid).wait_sema)
    });
    let Some(wait_sema) = wait_sema else {
        return -1;
    };

    wait_sema.down();

    // The child is blocked on free_sema; its record stays readable until
    // we release it below.
    let (status, free_sema) = with_scheduler(|s| {
        let status = s.tref(child_tid).exit_status;
        let free_sema = s.tref(child_tid).free_sema;
        s.tmut(cur).children.retain(|&c| c != child_tid);
        (status, free_sema)
    });
    free_sema.up();
    status
}

/// The exit syscall: record the status, print the termination line, die.
pub fn sys_exit(status: i64) -> ! {
    let name = with_scheduler(|s| {
        let cur = s.current;
        s.tmut(cur).exit_status = status;
        s.tref(cur).name.clone()
    });
    println!("{}: exit({})", name, status);
    thread_exit();
}

/// Tear down the current thread and schedule away. Also the landing pad
/// for kernel threads whose entry function returned.
pub fn thread_exit() -> ! {
    process_exit();
    scheduler::exit_current();
}

/// Release process resources in handshake order: descriptors, the running
/// image, orphaned children, then wake the parent and wait until it has
/// read our status.
fn process_exit() {
    let cur = scheduler::current_tid();

    let (running, is_process, parent, wait_sema, free_sema, orphans) = with_scheduler(|s| {
        let t = s.tmut(cur);
        t.fd_table.close_all();
        let running = t.running_file.take();
        let is_process = t.is_process;
        let parent = t.parent;
        let wait_sema = t.wait_sema;
        let free_sema = t.free_sema;
        let children = core::mem::take(&mut t.children);

        let mut orphans = Vec::new();
        for child in children {
            if let Some(c) = s.threads.iter_mut().find(|c| c.tid == child) {
                c.parent = None;
                orphans.push(c.free_sema);
            }
        }
        (running, is_process, parent, wait_sema, free_sema, orphans)
    });

    // Closing the image handle re-enables writes to the executable.
    drop(running);

    // Nobody will ever wait on our children; let any dead ones finish.
    for sema in orphans {
        sema.up();
    }

    if is_process && parent.is_some() {
        wait_sema.up();
        free_sema.down();
    }

    process_cleanup();
}

/// Destroy the current address space. The kernel tables are activated
/// first so CR3 never points into freed pages.
fn process_cleanup() {
    with_scheduler(|s| {
        let cur = s.current;
        if let Some(aspace) = s.tmut(cur).address_space.take() {
            paging::activate_kernel();
            drop(aspace);
        }
    });
}
