//! Process-layer scenarios: fd tables, argv marshalling, ELF validation,
//! write-deny, and the fork/wait handshake.

use alloc::vec;
use alloc::vec::Vec;

use super::check;
use crate::drivers::timer;
use crate::fs;
use crate::fs::fd::FdTable;
use crate::interrupts::usermode::TrapFrame;
use crate::memory::paging::{AddressSpace, USER_BASE, USER_STACK};
use crate::memory::palloc::PGSIZE;
use crate::process::{self, elf};
use crate::scheduler;

pub fn run() {
    fd_allocation_policy();
    tokenizer_limits();
    argv_stack_layout();
    elf_accepts_valid_image();
    elf_rejects_bad_images();
    wait_reaps_child_once();
    scheduler::check_invariants();
}

/// Descriptors are handed out smallest-first from 3 and reused after
/// close; a full table refuses new files.
fn fd_allocation_policy() {
    check(fs::create("fd-scratch", 16), "fd: scratch file created");
    let mut table = FdTable::new();

    let fd_a = table.allocate(fs::open("fd-scratch").unwrap());
    let fd_b = table.allocate(fs::open("fd-scratch").unwrap());
    let fd_c = table.allocate(fs::open("fd-scratch").unwrap());
    check(
        fd_a == Some(3) && fd_b == Some(4) && fd_c == Some(5),
        "fd: allocation starts at 3 and counts up",
    );

    check(table.close(4), "fd: close clears an open slot");
    check(!table.close(4), "fd: double close is a no-op");
    check(
        table.allocate(fs::open("fd-scratch").unwrap()) == Some(4),
        "fd: smallest free descriptor is reused",
    );

    while !table.is_full() {
        table.allocate(fs::open("fd-scratch").unwrap());
    }
    check(
        table.allocate(fs::open("fd-scratch").unwrap()).is_none(),
        "fd: full table refuses new descriptors",
    );

    fs::remove("fd-scratch");
}

fn tokenizer_limits() {
    let argv = process::tokenize("echo x y z");
    check(
        argv.len() == 4 && argv[0] == "echo" && argv[3] == "z",
        "exec: tokenizer splits on spaces",
    );
    check(
        process::tokenize("  a   b  ").len() == 2,
        "exec: repeated spaces produce no empty tokens",
    );

    let mut long = alloc::string::String::new();
    for i in 0..200 {
        long.push_str(&alloc::format!("t{} ", i));
    }
    check(
        process::tokenize(&long).len() == process::MAX_ARGS,
        "exec: token count is capped",
    );
}

/// Build the argv stack for "echo x y z" and read it back through the
/// address space.
fn argv_stack_layout() {
    let mut aspace = AddressSpace::new().expect("address space");
    check(
        aspace.alloc_map_page(USER_STACK - PGSIZE, true),
        "exec: stack page maps",
    );

    let mut frame = TrapFrame::default();
    frame.rsp = USER_STACK;
    let argv = process::tokenize("echo x y z");
    check(
        process::argument_stack(&mut frame, &argv, &aspace),
        "exec: argument stack builds",
    );

    check(frame.rdi == 4, "exec: rdi carries argc");
    check(frame.rsi == frame.rsp + 8, "exec: rsi points at argv[0]");
    check(frame.rsp % 16 == 0, "exec: stack pointer is ABI-aligned");

    // argv[0..3] point at the tokens, argv[4] is NULL.
    let mut ptr_bytes = [0u8; 40];
    check(
        aspace.read_user(frame.rsi, &mut ptr_bytes),
        "exec: argv array is readable",
    );
    let ptrs: Vec<u64> = ptr_bytes
        .chunks(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect();
    check(ptrs[4] == 0, "exec: argv[argc] is NULL");

    let expected = ["echo", "x", "y", "z"];
    let mut all_match = true;
    for (ptr, want) in ptrs[..4].iter().zip(expected) {
        let mut buf = vec![0u8; want.len() + 1];
        if !aspace.read_user(*ptr, &mut buf)
            || &buf[..want.len()] != want.as_bytes()
            || buf[want.len()] != 0
        {
            all_match = false;
        }
    }
    check(all_match, "exec: argv strings land NUL-terminated");

    let mut ret = [0u8; 8];
    check(
        aspace.read_user(frame.rsp, &mut ret) && ret == [0; 8],
        "exec: fake return address is zero",
    );
}

const TEST_ENTRY: u64 = USER_BASE + 0x1000;

/// A minimal ELF64 executable: one LOAD segment of NOPs at TEST_ENTRY.
fn build_test_elf() -> Vec<u8> {
    let mut image = vec![0u8; 0x1100];

    // Ehdr
    image[0..7].copy_from_slice(&[0x7F, b'E', b'L', b'F', 2, 1, 1]);
    image[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    image[18..20].copy_from_slice(&0x3Eu16.to_le_bytes()); // EM_X86_64
    image[20..24].copy_from_slice(&1u32.to_le_bytes()); // EV_CURRENT
    image[24..32].copy_from_slice(&TEST_ENTRY.to_le_bytes()); // e_entry
    image[32..40].copy_from_slice(&64u64.to_le_bytes()); // e_phoff
    image[54..56].copy_from_slice(&56u16.to_le_bytes()); // e_phentsize
    image[56..58].copy_from_slice(&1u16.to_le_bytes()); // e_phnum

    // Phdr: LOAD, R|X, offset 0x1000 -> vaddr TEST_ENTRY, 0x100 bytes of
    // code, 0x200 bytes in memory.
    image[64..68].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    image[68..72].copy_from_slice(&5u32.to_le_bytes()); // PF_R | PF_X
    image[72..80].copy_from_slice(&0x1000u64.to_le_bytes()); // p_offset
    image[80..88].copy_from_slice(&TEST_ENTRY.to_le_bytes()); // p_vaddr
    image[96..104].copy_from_slice(&0x100u64.to_le_bytes()); // p_filesz
    image[104..112].copy_from_slice(&0x200u64.to_le_bytes()); // p_memsz

    for byte in image[0x1000..0x1100].iter_mut() {
        *byte = 0x90; // nop
    }
    image
}

fn elf_accepts_valid_image() {
    let image = build_test_elf();
    check(fs::create("prog", 0), "elf: image file created");
    check(fs::write_file("prog", &image), "elf: image file seeded");

    let mut frame = TrapFrame::default();
    match elf::load("prog", &mut frame) {
        Ok((aspace, _file)) => {
            check(frame.rip == TEST_ENTRY, "elf: entry point installed");
            check(frame.rsp == USER_STACK, "elf: stack pointer at USER_STACK");

            let code = aspace.resolve(TEST_ENTRY);
            check(
                matches!(code, Some((_, false))),
                "elf: code segment mapped read-only",
            );
            let mut first = [0u8; 4];
            check(
                aspace.read_user(TEST_ENTRY, &mut first) && first == [0x90; 4],
                "elf: segment bytes loaded",
            );
            let mut bss = [0xFFu8; 4];
            check(
                aspace.read_user(TEST_ENTRY + 0x100, &mut bss) && bss == [0; 4],
                "elf: memsz tail zero-filled",
            );
            check(
                matches!(aspace.resolve(USER_STACK - PGSIZE), Some((_, true))),
                "elf: stack page mapped writable",
            );

            // The image is someone's running binary: writes bounce.
            let mut other = fs::open("prog").unwrap();
            check(other.write(&[0x7F]) == 0, "elf: running image denies writes");
            drop(other);
        }
        Err(_) => {
            check(false, "elf: valid image loads");
        }
    }

    // The loader's handle is closed now; writes work again.
    let mut reopened = fs::open("prog").unwrap();
    check(
        reopened.write(&[0x7F]) == 1,
        "elf: writes succeed after the image closes",
    );
}

fn elf_rejects_bad_images() {
    check(fs::create("prog-bad", 0), "elf: scratch reject file created");

    let mut bad_magic = build_test_elf();
    bad_magic[0] = 0x7E;
    fs::write_file("prog-bad", &bad_magic);
    let mut frame = TrapFrame::default();
    check(
        elf::load("prog-bad", &mut frame).is_err(),
        "elf: bad magic rejected",
    );

    let mut too_many = build_test_elf();
    too_many[56..58].copy_from_slice(&1025u16.to_le_bytes());
    fs::write_file("prog-bad", &too_many);
    check(
        elf::load("prog-bad", &mut frame).is_err(),
        "elf: more than 1024 program headers rejected",
    );

    let mut dynamic = build_test_elf();
    dynamic[64..68].copy_from_slice(&2u32.to_le_bytes()); // PT_DYNAMIC
    fs::write_file("prog-bad", &dynamic);
    check(
        elf::load("prog-bad", &mut frame).is_err(),
        "elf: dynamic executables rejected",
    );

    let mut low_vaddr = build_test_elf();
    low_vaddr[80..88].copy_from_slice(&0x800u64.to_le_bytes());
    fs::write_file("prog-bad", &low_vaddr);
    check(
        elf::load("prog-bad", &mut frame).is_err(),
        "elf: segment below user space rejected",
    );

    check(
        elf::load("prog-missing", &mut frame).is_err(),
        "elf: missing file rejected",
    );
}

fn child_body(_arg: usize) {
    process::sys_exit(42);
}

/// The child exits before the parent waits; wait still returns its status
/// exactly once.
fn wait_reaps_child_once() {
    let child = process::spawn("child-42", child_body, 0).expect("spawn child");

    // Let the child run to exit; it then parks on free_sema with its
    // status readable.
    timer::sleep(5);

    check(
        process::wait(child) == 42,
        "process: wait returns the child's exit status",
    );
    check(
        process::wait(child) == -1,
        "process: waiting twice on the same child fails",
    );
    check(
        process::wait(scheduler::Tid(9999)) == -1,
        "process: waiting on a non-child fails",
    );
}
