//! Preemptive priority scheduler.
//!
//! All scheduler state lives in one structure behind a spin lock; every
//! caller disables interrupts before taking the lock, so the timer ISR can
//! never spin on a lock its own CPU holds. Context-switch pointers are
//! taken only after all queue mutation is done, and the lock is dropped
//! before the actual switch.

pub mod context;
pub mod sync;
pub mod thread;

use alloc::string::String;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::interrupts::{gate, gdt};
use crate::memory::paging;
use crate::memory::palloc;
use context::Context;
use sync::{LockSlot, SemaSlot};
use thread::{Location, Status, Thread};

pub use sync::{Lock, Semaphore};
pub use thread::{Tid, PRI_DEFAULT, PRI_MAX, PRI_MIN, TID_ERROR};

/// Timer ticks each thread gets before it is preempted.
pub const TIME_SLICE: u32 = 4;

/// Maximum length of a priority-donation chain walk.
pub const DONATION_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateError {
    OutOfMemory,
}

pub struct Scheduler {
    pub(crate) threads: Vec<Thread>,
    /// Runnable threads, sorted by priority descending, FIFO within ties.
    ready: Vec<Tid>,
    /// Threads waiting on an absolute wake tick. Tail-inserted; the wake
    /// scan is linear, so no order is maintained.
    sleepers: Vec<Tid>,
    /// Dead threads whose pages are freed on the next scheduling pass.
    reap: Vec<Tid>,
    pub(crate) current: Tid,
    idle: Tid,
    next_tid: i64,
    /// Ticks consumed by the running thread in its current quantum.
    slice: u32,
    started: bool,
    mlfqs: bool,
    pub(crate) semas: Vec<SemaSlot>,
    free_semas: Vec<usize>,
    pub(crate) locks: Vec<LockSlot>,
    free_locks: Vec<usize>,
    idle_ticks: u64,
    kernel_ticks: u64,
    user_ticks: u64,
}

lazy_static! {
    pub(crate) static ref SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());
}

fn priority_in(threads: &[Thread], tid: Tid) -> u8 {
    threads
        .iter()
        .find(|t| t.tid == tid)
        .map(|t| t.priority)
        .unwrap_or(PRI_MIN)
}

/// Ordered insertion shared by the ready queue and the semaphore wait
/// sets: before the first lower-priority entry, after every equal one,
/// so arrival order breaks ties (FIFO).
fn insert_by_priority(list: &mut Vec<Tid>, threads: &[Thread], tid: Tid) {
    let pri = priority_in(threads, tid);
    let pos = list
        .iter()
        .position(|&other| priority_in(threads, other) < pri)
        .unwrap_or(list.len());
    list.insert(pos, tid);
}

impl Scheduler {
    fn new() -> Self {
        Scheduler {
            threads: Vec::new(),
            ready: Vec::new(),
            sleepers: Vec::new(),
            reap: Vec::new(),
            current: TID_ERROR,
            idle: TID_ERROR,
            next_tid: 1,
            slice: 0,
            started: false,
            mlfqs: false,
            semas: Vec::new(),
            free_semas: Vec::new(),
            locks: Vec::new(),
            free_locks: Vec::new(),
            idle_ticks: 0,
            kernel_ticks: 0,
            user_ticks: 0,
        }
    }

    fn index_of(&self, tid: Tid) -> Option<usize> {
        self.threads.iter().position(|t| t.tid == tid)
    }

    pub(crate) fn get(&self, tid: Tid) -> Option<&Thread> {
        self.threads.iter().find(|t| t.tid == tid)
    }

    pub(crate) fn tref(&self, tid: Tid) -> &Thread {
        self.get(tid).expect("no such thread")
    }

    pub(crate) fn tmut(&mut self, tid: Tid) -> &mut Thread {
        self.threads
            .iter_mut()
            .find(|t| t.tid == tid)
            .expect("no such thread")
    }

    pub(crate) fn sema_alloc(&mut self, value: u32) -> Semaphore {
        let slot = SemaSlot {
            live: true,
            value,
            waiters: Vec::new(),
        };
        match self.free_semas.pop() {
            Some(idx) => {
                self.semas[idx] = slot;
                Semaphore::from_raw(idx)
            }
            None => {
                self.semas.push(slot);
                Semaphore::from_raw(self.semas.len() - 1)
            }
        }
    }

    fn sema_free(&mut self, sema: Semaphore) {
        let idx = sema.raw();
        debug_assert!(self.semas[idx].waiters.is_empty());
        self.semas[idx].live = false;
        self.free_semas.push(idx);
    }

    pub(crate) fn lock_alloc(&mut self) -> usize {
        let sema = self.sema_alloc(1);
        let slot = LockSlot {
            live: true,
            holder: None,
            sema,
        };
        match self.free_locks.pop() {
            Some(idx) => {
                self.locks[idx] = slot;
                idx
            }
            None => {
                self.locks.push(slot);
                self.locks.len() - 1
            }
        }
    }

    fn insert_ready(&mut self, tid: Tid) {
        {
            let t = self.tmut(tid);
            debug_assert_eq!(t.location, Location::Unqueued);
            t.location = Location::Ready;
        }
        insert_by_priority(&mut self.ready, &self.threads, tid);
    }

    /// Re-establish a ready thread's position after its priority changed.
    pub(crate) fn reposition_ready(&mut self, tid: Tid) {
        if self.tref(tid).location == Location::Ready {
            self.ready.retain(|&t| t != tid);
            self.tmut(tid).location = Location::Unqueued;
            self.insert_ready(tid);
        }
    }

    /// Move a blocked thread to the ready queue. Does not preempt; the
    /// caller decides, so adjacent data updates stay atomic with the
    /// unblock.
    pub(crate) fn unblock_locked(&mut self, tid: Tid) {
        debug_assert_eq!(self.tref(tid).status, Status::Blocked);
        self.tmut(tid).status = Status::Ready;
        self.insert_ready(tid);
    }

    fn pick_next(&mut self) -> Tid {
        if self.ready.is_empty() {
            self.idle
        } else {
            let head = self.ready.remove(0);
            self.tmut(head).location = Location::Unqueued;
            head
        }
    }

    fn ready_head_outranks_current(&self) -> bool {
        match self.ready.first() {
            Some(&head) => self.tref(head).priority > self.tref(self.current).priority,
            None => false,
        }
    }

    /// Free threads queued for destruction by earlier passes. Never runs
    /// for the thread that is currently switching away.
    fn drain_reap(&mut self) {
        while let Some(tid) = self.reap.pop() {
            let semas = {
                let t = self.tref(tid);
                [t.fork_sema, t.wait_sema, t.free_sema]
            };
            for sema in semas {
                self.sema_free(sema);
            }
            let idx = self.index_of(tid).expect("reaped thread missing");
            // Dropping the record returns its stack page, fd table and
            // address space.
            self.threads.swap_remove(idx);
        }
    }

    /// Lift priority along the chain donor → wait_lock.holder → …, at most
    /// DONATION_DEPTH deep. Monotonic within one walk.
    pub(crate) fn donate_from(&mut self, donor: Tid) {
        let mut walk = donor;
        for _ in 0..DONATION_DEPTH {
            let Some(lock_id) = self.tref(walk).wait_lock else {
                break;
            };
            let Some(holder) = self.locks[lock_id].holder else {
                break;
            };
            let donated = self.tref(walk).priority;
            if self.tref(holder).priority < donated {
                self.tmut(holder).priority = donated;
                self.reposition_ready(holder);
            }
            walk = holder;
        }
    }

    /// Recompute a thread's current priority: its base, lifted to the
    /// highest remaining donor. Idempotent.
    pub(crate) fn refresh_priority_of(&mut self, tid: Tid) {
        let base = self.tref(tid).base_priority;
        let mut donors = core::mem::take(&mut self.tmut(tid).donors);
        donors.sort_by(|&a, &b| self.tref(b).priority.cmp(&self.tref(a).priority));
        let top = donors.first().map(|&d| self.tref(d).priority);
        self.tmut(tid).donors = donors;
        let mut priority = base;
        if let Some(donated) = top {
            priority = priority.max(donated);
        }
        self.tmut(tid).priority = priority;
        self.reposition_ready(tid);
    }

    /// Drop every donation tied to the given lock from a holder's donor
    /// set, on release.
    pub(crate) fn remove_donors_for(&mut self, holder: Tid, lock_id: usize) {
        let donors = core::mem::take(&mut self.tmut(holder).donors);
        let kept: Vec<Tid> = donors
            .into_iter()
            .filter(|&d| self.tref(d).wait_lock != Some(lock_id))
            .collect();
        self.tmut(holder).donors = kept;
    }
}

/// Run a closure against the locked scheduler with interrupts off.
pub(crate) fn with_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    gate::with_disabled(|| f(&mut SCHEDULER.lock()))
}

/// Pick the next thread and switch to it. Consumes the guard: the lock is
/// released before the switch, and interrupts stay off throughout.
fn schedule(mut s: spin::MutexGuard<'static, Scheduler>, new_status: Status) {
    debug_assert!(!gate::enabled());
    s.drain_reap();

    let cur = s.current;
    s.tref(cur).check_stack_guard();
    debug_assert_eq!(s.tref(cur).status, Status::Running);
    s.tmut(cur).status = new_status;

    let next = s.pick_next();
    s.tmut(next).status = Status::Running;
    s.current = next;
    s.slice = 0;

    // Activate the incoming thread's address space and kernel stack.
    match &s.tref(next).address_space {
        Some(aspace) => aspace.activate(),
        None => paging::activate_kernel(),
    }
    if let Some(top) = s.tref(next).stack_top() {
        gdt::set_tss_rsp0(top);
    }

    if cur == next {
        return;
    }

    let dying = s.tref(cur).status == Status::Dying;
    if dying {
        // Queue the page for free; it is still our stack, so the actual
        // release happens at the start of the next scheduling pass.
        debug_assert_eq!(s.tref(cur).location, Location::Unqueued);
        s.tmut(cur).location = Location::Reap;
        s.reap.push(cur);
    }

    let cur_idx = s.index_of(cur).expect("current thread missing");
    let next_idx = s.index_of(next).expect("next thread missing");
    let cur_ctx = &mut s.threads[cur_idx].context as *mut Context;
    let next_ctx = &s.threads[next_idx].context as *const Context;
    drop(s);

    unsafe {
        if dying {
            context::restore_context(next_ctx);
        } else {
            context::switch_context(cur_ctx, next_ctx);
        }
    }
}

/// Prologue of every kernel thread; reached through the startup shim.
pub(crate) extern "C" fn kernel_thread_main(entry_raw: u64, arg: u64) -> ! {
    // The scheduler runs with interrupts off; threads run with them on.
    gate::restore(true);
    let entry: fn(usize) = unsafe { core::mem::transmute(entry_raw as usize) };
    entry(arg as usize);
    crate::process::thread_exit();
}

fn create_common(
    name: &str,
    priority: u8,
    entry: fn(usize),
    arg: usize,
    process_parent: Option<Tid>,
) -> Result<Tid, CreateError> {
    let stack = palloc::alloc_page().ok_or(CreateError::OutOfMemory)?;

    let was = gate::disable();
    let mut s = SCHEDULER.lock();
    let tid = Tid(s.next_tid);
    s.next_tid += 1;
    let semas = [s.sema_alloc(0), s.sema_alloc(0), s.sema_alloc(0)];
    let mut t = Thread::new(tid, name, priority, Some(stack), semas);
    t.context = Context::for_kernel_thread(entry, arg, t.stack_top().unwrap());
    if let Some(parent) = process_parent {
        t.is_process = true;
        t.parent = Some(parent);
        s.tmut(parent).children.push(tid);
    }
    s.threads.push(t);
    s.unblock_locked(tid);
    let should_yield = s.started && s.ready_head_outranks_current();
    drop(s);

    // A new thread that outranks us runs immediately.
    if should_yield {
        yield_inner();
    }
    gate::restore(was);
    Ok(tid)
}

/// Create a kernel thread and add it to the ready queue.
pub fn create(name: &str, priority: u8, entry: fn(usize), arg: usize) -> Result<Tid, CreateError> {
    create_common(name, priority, entry, arg, None)
}

/// Create a process thread: linked into `parent`'s child set and subject
/// to the wait/free handshake on exit.
pub fn create_process(
    name: &str,
    priority: u8,
    entry: fn(usize),
    arg: usize,
    parent: Tid,
) -> Result<Tid, CreateError> {
    create_common(name, priority, entry, arg, Some(parent))
}

/// Transform the running boot code into the "main" thread.
/// Interrupts must still be off.
pub fn init(mlfqs: bool) {
    debug_assert!(!gate::enabled());
    let mut s = SCHEDULER.lock();
    s.mlfqs = mlfqs;
    let tid = Tid(s.next_tid);
    s.next_tid += 1;
    let semas = [s.sema_alloc(0), s.sema_alloc(0), s.sema_alloc(0)];
    let mut main = Thread::new(tid, "main", PRI_DEFAULT, None, semas);
    main.status = Status::Running;
    s.threads.push(main);
    s.current = tid;
    drop(s);
    crate::log_info!("Scheduler initialized; running as thread 'main'.");
}

/// Start preemptive scheduling: spawn the idle thread, enable interrupts,
/// and wait until idle has come up once.
pub fn start() {
    let idle_started = Semaphore::new(0);
    let idle_tid =
        create("idle", PRI_MIN, idle_thread, idle_started.raw()).expect("idle thread creation");
    with_scheduler(|s| {
        s.idle = idle_tid;
        s.started = true;
    });
    x86_64::instructions::interrupts::enable();
    idle_started.down();
}

/// The idle thread. Runs only as the pick-next fallback; never appears on
/// the ready queue.
fn idle_thread(started_sema: usize) {
    Semaphore::from_raw(started_sema).up();

    loop {
        gate::disable();
        let s = SCHEDULER.lock();
        schedule(s, Status::Blocked);

        // `sti` holds interrupts off until after the next instruction, so
        // enable-and-halt is atomic and no wakeup slips in between.
        unsafe {
            core::arch::asm!("sti; hlt", options(nomem, nostack));
        }
    }
}

fn yield_inner() {
    let was = gate::disable();
    let mut s = SCHEDULER.lock();
    if !s.started {
        drop(s);
        gate::restore(was);
        return;
    }
    let cur = s.current;
    if cur != s.idle {
        s.insert_ready(cur);
    }
    schedule(s, Status::Ready);
    gate::restore(was);
}

/// Give up the CPU. The current thread keeps its FIFO slot within its
/// priority and may be rescheduled immediately.
pub fn yield_now() {
    debug_assert!(gate::enabled());
    yield_inner();
}

/// Yield requested from the timer ISR epilogue.
pub fn yield_on_return() {
    yield_inner();
}

/// Put the current thread to sleep until the given absolute tick.
pub fn sleep_until(wake_tick: i64) {
    let was = gate::disable();
    let mut s = SCHEDULER.lock();
    let cur = s.current;
    debug_assert!(cur != s.idle);
    {
        let t = s.tmut(cur);
        debug_assert_eq!(t.location, Location::Unqueued);
        t.wake_tick = wake_tick;
        t.location = Location::Sleep;
    }
    s.sleepers.push(cur);
    schedule(s, Status::Blocked);
    gate::restore(was);
}

/// Mark the current thread dying and schedule away. The record and its
/// pages are freed by the next scheduling pass, never by this thread.
pub fn exit_current() -> ! {
    gate::disable();
    let s = SCHEDULER.lock();
    schedule(s, Status::Dying);
    unreachable!("dying thread was rescheduled");
}

/// Timer tick bookkeeping, called from the ISR. Returns true when the ISR
/// epilogue should yield: quantum exhausted or a woken sleeper outranks
/// the running thread.
pub fn tick(now: i64) -> bool {
    let mut s = SCHEDULER.lock();
    if !s.started {
        return false;
    }

    let cur = s.current;
    if cur == s.idle {
        s.idle_ticks += 1;
    } else if s.tref(cur).address_space.is_some() {
        s.user_ticks += 1;
    } else {
        s.kernel_ticks += 1;
    }

    // Wake every due sleeper before the quantum decision.
    let mut i = 0;
    while i < s.sleepers.len() {
        let tid = s.sleepers[i];
        if s.tref(tid).wake_tick <= now {
            s.sleepers.remove(i);
            let t = s.tmut(tid);
            t.location = Location::Unqueued;
            t.wake_tick = 0;
            s.unblock_locked(tid);
        } else {
            i += 1;
        }
    }

    s.slice += 1;
    s.slice >= TIME_SLICE || s.ready_head_outranks_current()
}

pub fn current_tid() -> Tid {
    with_scheduler(|s| {
        s.tref(s.current).check_stack_guard();
        s.current
    })
}

pub fn current_name() -> String {
    with_scheduler(|s| s.tref(s.current).name.clone())
}

/// Set the current thread's base priority, keeping any higher active
/// donation, and yield if the recomputed priority no longer tops the
/// ready queue.
pub fn set_priority(new_priority: u8) {
    let was = gate::disable();
    let mut s = SCHEDULER.lock();
    let cur = s.current;
    s.tmut(cur).base_priority = new_priority.min(PRI_MAX);
    s.refresh_priority_of(cur);
    let should_yield = s.ready_head_outranks_current();
    drop(s);
    if should_yield {
        yield_inner();
    }
    gate::restore(was);
}

/// The current thread's effective priority (donations included).
pub fn get_priority() -> u8 {
    with_scheduler(|s| s.tref(s.current).priority)
}

pub fn priority_of(tid: Tid) -> Option<u8> {
    with_scheduler(|s| s.get(tid).map(|t| t.priority))
}

pub fn mlfqs_enabled() -> bool {
    with_scheduler(|s| s.mlfqs)
}

// MLFQS interface, stubbed until the fair-share scheduler exists.

pub fn set_nice(_nice: i32) {}

pub fn get_nice() -> i32 {
    0
}

pub fn get_load_avg() -> i32 {
    0
}

pub fn get_recent_cpu() -> i32 {
    0
}

pub fn print_stats() {
    with_scheduler(|s| {
        crate::println!(
            "Thread: {} idle ticks, {} kernel ticks, {} user ticks",
            s.idle_ticks,
            s.kernel_ticks,
            s.user_ticks
        );
    });
}

/// Assert the scheduler's structural invariants: the ready queue is sorted
/// by priority, and every thread is linked into at most one queue.
pub fn check_invariants() {
    with_scheduler(|s| {
        for pair in s.ready.windows(2) {
            assert!(
                s.tref(pair[0]).priority >= s.tref(pair[1]).priority,
                "ready queue out of order"
            );
        }
        for t in &s.threads {
            let tid = t.tid;
            let mut memberships = s.ready.iter().filter(|&&x| x == tid).count()
                + s.sleepers.iter().filter(|&&x| x == tid).count()
                + s.reap.iter().filter(|&&x| x == tid).count();
            for slot in s.semas.iter().filter(|slot| slot.live) {
                memberships += slot.waiters.iter().filter(|&&x| x == tid).count();
            }
            let expected = if t.location == Location::Unqueued { 0 } else { 1 };
            assert_eq!(
                memberships, expected,
                "thread '{}' linked into {} queues (location {:?})",
                t.name, memberships, t.location
            );
            if t.location == Location::Sleep {
                assert!(t.wake_tick > 0, "sleeping thread without a wake tick");
            }
        }
    });
}
