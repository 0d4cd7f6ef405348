//! 8254 PIT glue: the system tick, the alarm clock, and calibrated
//! sub-tick busy-waits.

use core::sync::atomic::{compiler_fence, AtomicI64, AtomicU64, Ordering};
use x86_64::instructions::port::Port;

use crate::interrupts::gate;
use crate::scheduler;
use crate::{print, println};

/// Timer interrupts per second.
pub const TIMER_FREQ: i64 = 100;
const _: () = assert!(TIMER_FREQ >= 19, "8254 timer requires TIMER_FREQ >= 19");
const _: () = assert!(TIMER_FREQ <= 1000, "TIMER_FREQ <= 1000 recommended");

/// Timer ticks since boot.
static TICKS: AtomicI64 = AtomicI64::new(0);

/// Busy-wait iterations per tick, measured once by `calibrate`.
static LOOPS_PER_TICK: AtomicU64 = AtomicU64::new(0);

/// Program the PIT for TIMER_FREQ interrupts per second on IRQ0.
pub fn init() {
    let count = ((1193180 + TIMER_FREQ / 2) / TIMER_FREQ) as u16;
    let mut control: Port<u8> = Port::new(0x43);
    let mut channel0: Port<u8> = Port::new(0x40);
    unsafe {
        // CW: counter 0, LSB then MSB, mode 2 (rate generator), binary.
        control.write(0x34);
        channel0.write((count & 0xFF) as u8);
        channel0.write((count >> 8) as u8);
    }
    crate::log_info!("8254 PIT programmed for {} Hz.", TIMER_FREQ);
}

/// Ticks since boot.
pub fn ticks() -> i64 {
    gate::with_disabled(|| TICKS.load(Ordering::SeqCst))
}

/// Ticks elapsed since `then`, which must be a value from `ticks()`.
pub fn elapsed(then: i64) -> i64 {
    ticks() - then
}

/// Advance time from the timer ISR. Returns whether the ISR epilogue
/// should yield.
pub fn on_tick() -> bool {
    let now = TICKS.fetch_add(1, Ordering::SeqCst) + 1;
    scheduler::tick(now)
}

/// Suspend the current thread for approximately `duration` ticks.
/// Non-positive durations return immediately.
pub fn sleep(duration: i64) {
    if duration <= 0 {
        return;
    }
    debug_assert!(gate::enabled());
    let start = ticks();
    scheduler::sleep_until(start + duration);
}

pub fn msleep(ms: i64) {
    real_time_sleep(ms, 1000);
}

pub fn usleep(us: i64) {
    real_time_sleep(us, 1000 * 1000);
}

pub fn nsleep(ns: i64) {
    real_time_sleep(ns, 1000 * 1000 * 1000);
}

pub fn print_stats() {
    println!("Timer: {} ticks", ticks());
}

/// Measure the largest busy-wait loop count that still fits in one tick.
/// Runs once at boot, after interrupts are enabled.
pub fn calibrate() {
    debug_assert!(gate::enabled());
    print!("Calibrating timer...  ");

    // Largest power of two under one tick.
    let mut loops_per_tick: u64 = 1 << 10;
    while !too_many_loops(loops_per_tick << 1) {
        loops_per_tick <<= 1;
        assert!(loops_per_tick != 0);
    }

    // Refine the next 8 bits.
    let high_bit = loops_per_tick;
    let mut test_bit = high_bit >> 1;
    while test_bit != high_bit >> 10 {
        if !too_many_loops(high_bit | test_bit) {
            loops_per_tick |= test_bit;
        }
        test_bit >>= 1;
    }

    LOOPS_PER_TICK.store(loops_per_tick, Ordering::SeqCst);
    println!("{} loops/s.", loops_per_tick * TIMER_FREQ as u64);
}

/// True if `loops` iterations span more than one timer tick.
fn too_many_loops(loops: u64) -> bool {
    // Wait for a tick boundary.
    let start = ticks();
    while ticks() == start {
        core::hint::spin_loop();
    }

    let start = ticks();
    busy_wait(loops as i64);

    compiler_fence(Ordering::SeqCst);
    start != ticks()
}

/// Spin `loops` times. Kept out of line so code placement does not skew
/// the calibration.
#[inline(never)]
fn busy_wait(mut loops: i64) {
    while loops > 0 {
        loops -= 1;
        compiler_fence(Ordering::SeqCst);
    }
}

/// Sleep for approximately `num`/`denom` seconds: a tick-granular sleep
/// when at least one tick long, a calibrated busy-wait otherwise.
fn real_time_sleep(num: i64, denom: i64) {
    let tick_count = num * TIMER_FREQ / denom;
    debug_assert!(gate::enabled());

    if tick_count > 0 {
        sleep(tick_count);
    } else {
        // Scale down by 1000 to avoid overflow in the multiply.
        debug_assert!(denom % 1000 == 0);
        let loops = LOOPS_PER_TICK.load(Ordering::SeqCst) as i64;
        busy_wait(loops * num / 1000 * TIMER_FREQ / (denom / 1000));
    }
}
