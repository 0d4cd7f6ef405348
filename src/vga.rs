//! VGA text console: 80x25 color cells at 0xB8000, with scrolling and
//! line editing for the keyboard echo path.

use core::fmt;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::interrupts::gate;

/// Physical address of the VGA text framebuffer.
const VGA_BUFFER: u64 = 0xB8000;
const VGA_WIDTH: usize = 80;
const VGA_HEIGHT: usize = 25;

/// Standard 16-color VGA text mode palette.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(dead_code)]
pub enum Color {
    Black = 0,
    Blue = 1,
    Green = 2,
    Cyan = 3,
    Red = 4,
    Magenta = 5,
    Brown = 6,
    LightGray = 7,
    DarkGray = 8,
    LightBlue = 9,
    LightGreen = 10,
    LightCyan = 11,
    LightRed = 12,
    Pink = 13,
    Yellow = 14,
    White = 15,
}

fn color_code(fg: Color, bg: Color) -> u8 {
    (bg as u8) << 4 | (fg as u8)
}

/// Cursor position and attribute state for the text console.
pub struct Writer {
    col: usize,
    row: usize,
    attr: u8,
}

impl Writer {
    fn write_cell(&self, offset: usize, entry: u16) {
        let buffer = VGA_BUFFER as *mut u16;
        unsafe {
            buffer.add(offset).write_volatile(entry);
        }
    }

    fn read_cell(&self, offset: usize) -> u16 {
        let buffer = VGA_BUFFER as *const u16;
        unsafe { buffer.add(offset).read_volatile() }
    }

    fn blank(&self) -> u16 {
        (self.attr as u16) << 8 | b' ' as u16
    }

    pub fn set_color(&mut self, fg: Color, bg: Color) {
        self.attr = color_code(fg, bg);
    }

    /// Write one byte, handling newline, carriage return, tab and
    /// wrapping; scrolls when the last row fills.
    pub fn put_char(&mut self, c: u8) {
        match c {
            b'\n' => {
                self.col = 0;
                self.row += 1;
            }
            b'\r' => {
                self.col = 0;
            }
            b'\t' => {
                self.col = (self.col + 8) & !7;
            }
            _ => {
                let offset = self.row * VGA_WIDTH + self.col;
                self.write_cell(offset, (self.attr as u16) << 8 | c as u16);
                self.col += 1;
            }
        }

        if self.col >= VGA_WIDTH {
            self.col = 0;
            self.row += 1;
        }
        if self.row >= VGA_HEIGHT {
            self.scroll();
            self.row = VGA_HEIGHT - 1;
        }
    }

    fn scroll(&mut self) {
        for row in 1..VGA_HEIGHT {
            for col in 0..VGA_WIDTH {
                let entry = self.read_cell(row * VGA_WIDTH + col);
                self.write_cell((row - 1) * VGA_WIDTH + col, entry);
            }
        }
        for col in 0..VGA_WIDTH {
            self.write_cell((VGA_HEIGHT - 1) * VGA_WIDTH + col, self.blank());
        }
    }

    /// Erase the character before the cursor (keyboard line editing).
    pub fn backspace(&mut self) {
        if self.col > 0 {
            self.col -= 1;
            self.write_cell(self.row * VGA_WIDTH + self.col, self.blank());
        }
    }

    /// Blank the whole screen and home the cursor.
    pub fn clear(&mut self) {
        for offset in 0..VGA_WIDTH * VGA_HEIGHT {
            self.write_cell(offset, self.blank());
        }
        self.col = 0;
        self.row = 0;
    }
}

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.put_char(byte);
        }
        Ok(())
    }
}

lazy_static! {
    pub static ref WRITER: Mutex<Writer> = Mutex::new(Writer {
        col: 0,
        row: 0,
        attr: color_code(Color::LightGray, Color::Black),
    });
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::vga::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    // Interrupt handlers also print; keep the critical section tiny.
    gate::with_disabled(|| {
        WRITER.lock().write_fmt(args).unwrap();
    });
}

pub fn init() {
    WRITER.lock().clear();
}
