use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::instructions::port::Port;

use crate::interrupts::gate;

/// 16550 UART on COM1. Kernel log output goes here so it survives VGA
/// scrolling and can be captured by the emulator.
///
/// Registers are addressed as offsets from the base port.
pub struct SerialPort {
    base: u16,
}

const DATA: u16 = 0;
const INT_ENABLE: u16 = 1;
const FIFO_CTRL: u16 = 2;
const LINE_CTRL: u16 = 3;
const MODEM_CTRL: u16 = 4;
const LINE_STATUS: u16 = 5;

impl SerialPort {
    pub const fn new(base: u16) -> SerialPort {
        SerialPort { base }
    }

    fn write_reg(&mut self, offset: u16, value: u8) {
        unsafe { Port::new(self.base + offset).write(value) }
    }

    fn read_reg(&mut self, offset: u16) -> u8 {
        unsafe { Port::new(self.base + offset).read() }
    }

    /// 38400 baud, 8N1, FIFOs on.
    pub fn init(&mut self) {
        self.write_reg(INT_ENABLE, 0x00);
        self.write_reg(LINE_CTRL, 0x80); // DLAB on
        self.write_reg(DATA, 0x03); // divisor 3
        self.write_reg(INT_ENABLE, 0x00);
        self.write_reg(LINE_CTRL, 0x03); // 8N1, DLAB off
        self.write_reg(FIFO_CTRL, 0xC7);
        self.write_reg(MODEM_CTRL, 0x0B);
        self.write_reg(INT_ENABLE, 0x01);
    }

    pub fn send(&mut self, byte: u8) {
        while self.read_reg(LINE_STATUS) & 0x20 == 0 {}
        self.write_reg(DATA, byte);
    }
}

impl core::fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for byte in s.bytes() {
            self.send(byte);
        }
        Ok(())
    }
}

lazy_static! {
    pub static ref SERIAL1: Mutex<SerialPort> = {
        let mut port = SerialPort::new(0x3F8);
        port.init();
        Mutex::new(port)
    };
}

#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    use core::fmt::Write;
    // Same discipline as every other ambient lock: taken with interrupts
    // off so a preempted holder cannot wedge a logging critical section.
    gate::with_disabled(|| {
        SERIAL1.lock().write_fmt(args).expect("Printing to serial failed");
    });
}

/// One serial log line, tagged with a severity level.
#[macro_export]
macro_rules! log {
    ($level:literal, $($arg:tt)*) => {{
        $crate::serial::_print(format_args!(concat!("[", $level, "] ")));
        $crate::serial::_print(format_args!($($arg)*));
        $crate::serial::_print(format_args!("\n"));
    }};
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => { $crate::log!("INFO", $($arg)*) };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => { $crate::log!("WARN", $($arg)*) };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => { $crate::log!("ERROR", $($arg)*) };
}

pub fn init() {
    let _ = SERIAL1.lock();
}
