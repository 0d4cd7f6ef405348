#![no_std]
#![feature(abi_x86_interrupt)]

extern crate alloc;

pub mod allocator;
pub mod drivers;
pub mod fs;
pub mod interrupts;
pub mod memory;
pub mod process;
pub mod scheduler;
pub mod serial;
pub mod syscalls;
pub mod tests;
pub mod vga;

use core::panic::PanicInfo;

#[no_mangle]
pub extern "C" fn _start(multiboot_info_addr: usize) -> ! {
    vga::init();
    serial::init();
    interrupts::init();
    log_info!("OrbitOS kernel started.");

    memory::init(multiboot_info_addr);

    let cmdline = memory::command_line();
    let mlfqs = cmdline.contains("-o mlfqs");
    if mlfqs {
        log_info!("Fair-share scheduler selected (stubbed).");
    }

    scheduler::init(mlfqs);
    fs::init();
    syscalls::init();
    drivers::init();

    // Idle comes up and interrupts go live here.
    scheduler::start();
    drivers::timer::calibrate();
    println!("OrbitOS is successfully running!");

    if let Some(target) = run_target(cmdline) {
        match process::create_initial(target) {
            Ok(child) => {
                process::wait(child);
            }
            Err(e) => log_error!("failed to start '{}': {:?}", target, e),
        }
    } else {
        tests::run_all();
    }

    scheduler::print_stats();
    drivers::timer::print_stats();
    power_off();
}

/// `run PROGRAM ARGS...` on the command line launches a user program
/// instead of the self-test suite.
fn run_target(cmdline: &str) -> Option<&str> {
    let rest = cmdline.split_once("run ")?.1.trim();
    if rest.is_empty() {
        None
    } else {
        Some(rest)
    }
}

/// QEMU ACPI poweroff.
pub fn power_off() -> ! {
    use x86_64::instructions::port::Port;
    log_info!("Powering off.");
    unsafe {
        Port::<u16>::new(0x604).write(0x2000);
    }
    loop {
        x86_64::instructions::hlt();
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    x86_64::instructions::interrupts::disable();
    println!("{}", info);
    log_error!("{}", info);
    loop {
        x86_64::instructions::hlt();
    }
}
