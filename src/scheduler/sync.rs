//! Semaphores and locks with priority donation.
//!
//! Handles are Copy indices into registries owned by the scheduler, so a
//! semaphore operation and the queue transitions it causes happen inside
//! one critical section. Slots are recycled when their owner dies.

use alloc::vec::Vec;

use super::thread::{Location, Status, Tid};
use super::SCHEDULER;
use crate::interrupts::gate;

pub struct SemaSlot {
    pub live: bool,
    pub value: u32,
    /// Blocked waiters, kept in priority order; re-sorted on every up()
    /// because priorities may change while a thread waits.
    pub waiters: Vec<Tid>,
}

pub struct LockSlot {
    pub live: bool,
    pub holder: Option<Tid>,
    pub sema: Semaphore,
}

/// A counting semaphore (binary when initialized to 0 or 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Semaphore(usize);

impl Semaphore {
    pub(crate) const fn from_raw(idx: usize) -> Semaphore {
        Semaphore(idx)
    }

    pub(crate) fn raw(self) -> usize {
        self.0
    }

    pub fn new(value: u32) -> Semaphore {
        super::with_scheduler(|s| s.sema_alloc(value))
    }

    /// Decrement the value, blocking until it is positive.
    pub fn down(self) {
        let was = gate::disable();
        loop {
            let mut s = SCHEDULER.lock();
            debug_assert!(s.semas[self.0].live);
            if s.semas[self.0].value > 0 {
                s.semas[self.0].value -= 1;
                drop(s);
                break;
            }

            // Join the wait set in priority order and block. On wakeup the
            // loop re-checks the value; a higher-priority down() may have
            // taken it first.
            let cur = s.current;
            {
                let t = s.tmut(cur);
                debug_assert_eq!(t.location, Location::Unqueued);
                t.location = Location::Waiters;
            }
            let sched = &mut *s;
            super::insert_by_priority(&mut sched.semas[self.0].waiters, &sched.threads, cur);
            super::schedule(s, Status::Blocked);
        }
        gate::restore(was);
    }

    /// Increment the value and wake the highest-priority waiter, yielding
    /// to it if it outranks the caller.
    pub fn up(self) {
        let was = gate::disable();
        let mut s = SCHEDULER.lock();
        debug_assert!(s.semas[self.0].live);

        let mut waiters = core::mem::take(&mut s.semas[self.0].waiters);
        waiters.sort_by(|&a, &b| s.tref(b).priority.cmp(&s.tref(a).priority));
        let woken = if waiters.is_empty() {
            None
        } else {
            Some(waiters.remove(0))
        };
        s.semas[self.0].waiters = waiters;

        if let Some(tid) = woken {
            s.tmut(tid).location = Location::Unqueued;
            s.unblock_locked(tid);
        }
        s.semas[self.0].value += 1;

        let should_yield = s.started && s.ready_head_outranks_current();
        drop(s);

        if should_yield && was {
            super::yield_inner();
        }
        // With interrupts off we are inside someone's critical section;
        // the next preemption point picks the new head up.
        gate::restore(was);
    }
}

/// A mutual-exclusion lock built on a binary semaphore, with priority
/// donation from waiters to the holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lock(usize);

impl Lock {
    pub fn new() -> Lock {
        Lock(super::with_scheduler(|s| s.lock_alloc()))
    }

    pub fn acquire(self) {
        let was = gate::disable();
        let sema = {
            let mut s = SCHEDULER.lock();
            debug_assert!(s.locks[self.0].live);
            let cur = s.current;
            debug_assert!(
                s.locks[self.0].holder != Some(cur),
                "recursive lock acquire"
            );

            if let Some(holder) = s.locks[self.0].holder {
                // Record the edge, join the holder's donor set in priority
                // order, and push our priority down the chain.
                s.tmut(cur).wait_lock = Some(self.0);
                let pri = s.tref(cur).priority;
                let pos = s
                    .tref(holder)
                    .donors
                    .iter()
                    .position(|&d| s.tref(d).priority < pri)
                    .unwrap_or(s.tref(holder).donors.len());
                s.tmut(holder).donors.insert(pos, cur);
                s.donate_from(cur);
            }
            s.locks[self.0].sema
        };

        sema.down();

        {
            let mut s = SCHEDULER.lock();
            let cur = s.current;
            s.tmut(cur).wait_lock = None;
            s.locks[self.0].holder = Some(cur);
        }
        gate::restore(was);
    }

    pub fn release(self) {
        let was = gate::disable();
        let sema = {
            let mut s = SCHEDULER.lock();
            let cur = s.current;
            debug_assert_eq!(s.locks[self.0].holder, Some(cur), "release by non-holder");

            s.remove_donors_for(cur, self.0);
            s.refresh_priority_of(cur);
            s.locks[self.0].holder = None;
            s.locks[self.0].sema
        };

        // Wakes the highest-priority waiter and preempts if it outranks us.
        sema.up();
        gate::restore(was);
    }

    pub fn held_by_current(self) -> bool {
        super::with_scheduler(|s| s.locks[self.0].holder == Some(s.current))
    }
}
