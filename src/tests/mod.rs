//! In-kernel self-test suite. Scenario threads coordinate through
//! semaphores and atomics; ordering-sensitive scenarios append to a
//! shared event log that is compared against the expected sequence.

pub mod alarm;
pub mod priority;
pub mod userprog;

use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use lazy_static::lazy_static;
use spin::Mutex;

use crate::interrupts::gate;
use crate::{log_error, log_info, println};

static PASS: AtomicUsize = AtomicUsize::new(0);
static FAIL: AtomicUsize = AtomicUsize::new(0);

pub fn check(cond: bool, name: &str) {
    if cond {
        PASS.fetch_add(1, Ordering::SeqCst);
        log_info!("ok: {}", name);
    } else {
        FAIL.fetch_add(1, Ordering::SeqCst);
        log_error!("FAIL: {}", name);
        println!("FAIL: {}", name);
    }
}

lazy_static! {
    static ref EVENTS: Mutex<Vec<String>> = Mutex::new(Vec::new());
}

/// Append to the event log. Any thread may call this.
pub fn record(event: impl Into<String>) {
    let event = event.into();
    gate::with_disabled(|| EVENTS.lock().push(event));
}

pub fn take_events() -> Vec<String> {
    gate::with_disabled(|| core::mem::take(&mut *EVENTS.lock()))
}

/// Compare the recorded sequence against the expectation and clear it.
pub fn expect_events(name: &str, expected: &[&str]) {
    let got = take_events();
    let matches = got.len() == expected.len() && got.iter().zip(expected).all(|(g, e)| g == e);
    if !matches {
        log_error!("{}: expected {:?}, got {:?}", name, expected, got);
    }
    check(matches, name);
}

pub fn run_all() {
    println!("Running kernel self-tests...");

    alarm::run();
    priority::run();
    userprog::run();

    let passed = PASS.load(Ordering::SeqCst);
    let failed = FAIL.load(Ordering::SeqCst);
    println!("Self-tests complete: {} passed, {} failed.", passed, failed);
    if failed == 0 {
        println!("ALL TESTS PASSED");
    }
}
