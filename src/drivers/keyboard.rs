//! PS/2 keyboard: a small set-1 scancode decoder feeding a ring buffer
//! that backs stdin reads.

use lazy_static::lazy_static;
use spin::Mutex;

use crate::interrupts::gate;

const BUFFER_SIZE: usize = 256;

struct KeyBuffer {
    bytes: [u8; BUFFER_SIZE],
    head: usize,
    tail: usize,
}

impl KeyBuffer {
    const fn new() -> Self {
        KeyBuffer {
            bytes: [0; BUFFER_SIZE],
            head: 0,
            tail: 0,
        }
    }

    fn push(&mut self, byte: u8) {
        let next = (self.head + 1) % BUFFER_SIZE;
        if next == self.tail {
            return; // full; drop the keystroke
        }
        self.bytes[self.head] = byte;
        self.head = next;
    }

    fn pop(&mut self) -> Option<u8> {
        if self.tail == self.head {
            return None;
        }
        let byte = self.bytes[self.tail];
        self.tail = (self.tail + 1) % BUFFER_SIZE;
        Some(byte)
    }
}

lazy_static! {
    static ref BUFFER: Mutex<KeyBuffer> = Mutex::new(KeyBuffer::new());
}

/// Set-1 make codes for the printable keys we care about.
fn decode(scancode: u8) -> Option<u8> {
    const MAP: [(u8, u8); 48] = [
        (0x02, b'1'), (0x03, b'2'), (0x04, b'3'), (0x05, b'4'), (0x06, b'5'),
        (0x07, b'6'), (0x08, b'7'), (0x09, b'8'), (0x0A, b'9'), (0x0B, b'0'),
        (0x0C, b'-'), (0x0D, b'='), (0x0E, 0x08), (0x0F, b'\t'),
        (0x10, b'q'), (0x11, b'w'), (0x12, b'e'), (0x13, b'r'), (0x14, b't'),
        (0x15, b'y'), (0x16, b'u'), (0x17, b'i'), (0x18, b'o'), (0x19, b'p'),
        (0x1C, b'\n'),
        (0x1E, b'a'), (0x1F, b's'), (0x20, b'd'), (0x21, b'f'), (0x22, b'g'),
        (0x23, b'h'), (0x24, b'j'), (0x25, b'k'), (0x26, b'l'),
        (0x27, b';'), (0x28, b'\''),
        (0x2C, b'z'), (0x2D, b'x'), (0x2E, b'c'), (0x2F, b'v'), (0x30, b'b'),
        (0x31, b'n'), (0x32, b'm'),
        (0x33, b','), (0x34, b'.'), (0x35, b'/'),
        (0x39, b' '), (0x29, b'`'),
    ];
    MAP.iter().find(|&&(code, _)| code == scancode).map(|&(_, ch)| ch)
}

/// Called from the keyboard ISR with a raw scancode.
pub fn push_scancode(scancode: u8) {
    // Break codes have the top bit set; ignore them.
    if scancode & 0x80 != 0 {
        return;
    }
    if let Some(byte) = decode(scancode) {
        BUFFER.lock().push(byte);
    }
}

pub fn try_read_byte() -> Option<u8> {
    gate::with_disabled(|| BUFFER.lock().pop())
}

/// Block until a key arrives.
pub fn read_byte() -> u8 {
    loop {
        if let Some(byte) = try_read_byte() {
            return byte;
        }
        crate::scheduler::yield_now();
        x86_64::instructions::interrupts::enable_and_hlt();
    }
}

pub fn init() {
    // Drain any residual scancode left by the 8042 controller.
    let mut port: x86_64::instructions::port::Port<u8> = x86_64::instructions::port::Port::new(0x60);
    let _ = unsafe { port.read() };
    crate::log_info!("PS/2 Keyboard driver initialized.");
}
