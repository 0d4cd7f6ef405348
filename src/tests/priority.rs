//! Priority scheduling and donation scenarios.

use alloc::format;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use lazy_static::lazy_static;
use spin::Mutex;

use super::{check, expect_events, record, take_events};
use crate::scheduler::{self, sync::Lock, sync::Semaphore, Tid, PRI_DEFAULT};

lazy_static! {
    static ref LOCKS: Mutex<Vec<Lock>> = Mutex::new(Vec::new());
    static ref SEMA: Mutex<Option<Semaphore>> = Mutex::new(None);
}

static DONE: AtomicUsize = AtomicUsize::new(0);

pub fn run() {
    preemption_on_create();
    set_priority_laws();
    donation_single_and_multiple();
    donation_chain_with_depth_cap();
    sema_wakes_highest();
    scheduler::check_invariants();
}

fn hi_thread(_arg: usize) {
    record("hi: ran");
}

/// A newly created thread that outranks the creator runs immediately.
fn preemption_on_create() {
    take_events();
    record("main: spawning");
    scheduler::create("hi", PRI_DEFAULT + 1, hi_thread, 0).unwrap();
    record("main: resumed");
    expect_events(
        "priority: higher-priority thread preempts its creator",
        &["main: spawning", "hi: ran", "main: resumed"],
    );
}

/// set_priority(p); set_priority(q) leaves base priority q.
fn set_priority_laws() {
    scheduler::set_priority(40);
    check(scheduler::get_priority() == 40, "priority: set_priority takes effect");
    scheduler::set_priority(25);
    check(
        scheduler::get_priority() == 25,
        "priority: second set_priority overrides the first",
    );
    scheduler::set_priority(PRI_DEFAULT);
}

fn lock_acquirer(idx: usize) {
    let lock = LOCKS.lock()[idx];
    lock.acquire();
    record(format!("{}: acquired", scheduler::current_name()));
    lock.release();
    DONE.fetch_add(1, Ordering::SeqCst);
}

/// One lock, two higher-priority waiters: the holder runs at the highest
/// donated priority and drops back to base on release. The waiters finish
/// in priority order.
fn donation_single_and_multiple() {
    take_events();
    LOCKS.lock().clear();
    LOCKS.lock().push(Lock::new());
    DONE.store(0, Ordering::SeqCst);
    let base = scheduler::get_priority();

    let lock = LOCKS.lock()[0];
    lock.acquire();

    scheduler::create("acq-32", PRI_DEFAULT + 1, lock_acquirer, 0).unwrap();
    check(
        scheduler::get_priority() == PRI_DEFAULT + 1,
        "donation: single donor lifts the holder",
    );

    scheduler::create("acq-33", PRI_DEFAULT + 2, lock_acquirer, 0).unwrap();
    check(
        scheduler::get_priority() == PRI_DEFAULT + 2,
        "donation: highest of multiple donors wins",
    );

    lock.release();
    check(
        scheduler::get_priority() == base,
        "donation: release restores the pre-acquire priority",
    );
    check(DONE.load(Ordering::SeqCst) == 2, "donation: both waiters finished");
    expect_events(
        "donation: waiters served in priority order",
        &["acq-33: acquired", "acq-32: acquired"],
    );
}

/// Link i owns lock i and blocks on lock i-1.
fn chain_link(idx: usize) {
    let (own, prev) = {
        let locks = LOCKS.lock();
        (locks[idx], locks[idx - 1])
    };
    own.acquire();
    prev.acquire();
    prev.release();
    own.release();
    DONE.fetch_add(1, Ordering::SeqCst);
}

/// Nine links chain onto a lock held by main. Donation propagates through
/// eight holders and leaves the ninth (main) at the previous donation
/// level; releasing unwinds everything back to base.
fn donation_chain_with_depth_cap() {
    LOCKS.lock().clear();
    for _ in 0..10 {
        LOCKS.lock().push(Lock::new());
    }
    DONE.store(0, Ordering::SeqCst);
    let base = scheduler::get_priority();

    let root = LOCKS.lock()[0];
    root.acquire();

    let mut links: Vec<Tid> = Vec::new();
    for i in 1..=9usize {
        let name = format!("link-{}", i);
        let tid = scheduler::create(&name, PRI_DEFAULT + i as u8, chain_link, i).unwrap();
        links.push(tid);
    }

    // link-9 donates 40 down the chain but the walk stops after eight
    // holders; main, ninth in line, keeps the 39 donated by link-8.
    check(
        scheduler::get_priority() == PRI_DEFAULT + 8,
        "donation: ninth holder in the chain stays undonated",
    );
    check(
        scheduler::priority_of(links[0]) == Some(PRI_DEFAULT + 9),
        "donation: eighth holder received the deepest donation",
    );

    root.release();
    check(
        DONE.load(Ordering::SeqCst) == 9,
        "donation: chain drained after root release",
    );
    check(
        scheduler::get_priority() == base,
        "donation: chain release restores base priority",
    );
}

fn sema_waiter(_arg: usize) {
    let sema = SEMA.lock().unwrap();
    sema.down();
    record(format!("{}: woke", scheduler::current_name()));
}

/// up() always releases the highest-priority waiter, regardless of the
/// order the waiters arrived in.
fn sema_wakes_highest() {
    take_events();
    *SEMA.lock() = Some(Semaphore::new(0));

    scheduler::create("wait-33", PRI_DEFAULT + 2, sema_waiter, 0).unwrap();
    scheduler::create("wait-35", PRI_DEFAULT + 4, sema_waiter, 0).unwrap();
    scheduler::create("wait-34", PRI_DEFAULT + 3, sema_waiter, 0).unwrap();

    let sema = SEMA.lock().unwrap();
    sema.up();
    sema.up();
    sema.up();
    expect_events(
        "semaphore: up releases waiters best-first",
        &["wait-35: woke", "wait-34: woke", "wait-33: woke"],
    );
}
