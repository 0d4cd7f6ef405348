//! Alarm-clock scenarios: the sleep queue and tick-driven wakeups.

use alloc::format;
use core::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use super::{check, expect_events, record, take_events};
use crate::drivers::timer;
use crate::scheduler::{self, PRI_DEFAULT};

pub fn run() {
    sleep_zero_returns();
    wake_order_and_bounds();
    simultaneous_wakeups();
    scheduler::check_invariants();
}

/// sleep(0) and sleep(-k) return without ever blocking.
fn sleep_zero_returns() {
    let before = timer::ticks();
    timer::sleep(0);
    timer::sleep(-7);
    check(
        timer::elapsed(before) <= 1,
        "alarm: zero and negative sleeps return immediately",
    );
}

static SLEEP_START: AtomicI64 = AtomicI64::new(0);

fn sleeper(delta: usize) {
    let start = SLEEP_START.load(Ordering::SeqCst);
    timer::sleep(delta as i64);
    let woke_after = timer::ticks() - start;
    record(format!("wake-{}", delta));
    let delta = delta as i64;
    check(
        woke_after >= delta && woke_after <= delta + 2,
        "alarm: sleeper woke inside its window",
    );
}

/// Three sleepers with staggered durations wake in duration order.
fn wake_order_and_bounds() {
    take_events();
    SLEEP_START.store(timer::ticks(), Ordering::SeqCst);
    scheduler::create("sleep-10", PRI_DEFAULT, sleeper, 10).unwrap();
    scheduler::create("sleep-20", PRI_DEFAULT, sleeper, 20).unwrap();
    scheduler::create("sleep-30", PRI_DEFAULT, sleeper, 30).unwrap();

    timer::sleep(40);
    expect_events("alarm: wake order follows durations", &["wake-10", "wake-20", "wake-30"]);
}

static WOKEN: AtomicUsize = AtomicUsize::new(0);

fn simultaneous_sleeper(_arg: usize) {
    timer::sleep(5);
    WOKEN.fetch_add(1, Ordering::SeqCst);
}

/// Several threads due on the same tick all wake on that tick.
fn simultaneous_wakeups() {
    WOKEN.store(0, Ordering::SeqCst);
    for i in 0..4 {
        let name = format!("simul-{}", i);
        scheduler::create(&name, PRI_DEFAULT, simultaneous_sleeper, i).unwrap();
    }
    timer::sleep(12);
    check(
        WOKEN.load(Ordering::SeqCst) == 4,
        "alarm: simultaneous sleepers all woke",
    );
}
