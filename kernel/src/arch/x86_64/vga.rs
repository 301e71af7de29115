//! VGA text-mode console
//!
//! 80x25 cells at physical 0xb8000, one foreground/background color pair per
//! cell. The writer tracks a cursor; a newline past the last row scrolls the
//! whole buffer up by one. Tab advances to the next 4-column stop, backspace
//! overwrites the previous cell with a blank.

use core::{fmt, ptr::write_volatile};

#[cfg(target_os = "none")]
use lazy_static::lazy_static;
#[cfg(target_os = "none")]
use spin::Mutex;

/// VGA text-mode color palette. Not all variants are used but the full
/// 16-color palette is defined per the VGA specification.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct ColorCode(u8);

impl ColorCode {
    pub const fn new(foreground: Color, background: Color) -> ColorCode {
        ColorCode(((background as u8) << 4) | (foreground as u8))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
struct ScreenChar {
    ascii_character: u8,
    color_code: ColorCode,
}

pub const BUFFER_HEIGHT: usize = 25;
pub const BUFFER_WIDTH: usize = 80;

const TAB_STOP: usize = 4;

#[repr(transparent)]
pub struct Buffer {
    chars: [[ScreenChar; BUFFER_WIDTH]; BUFFER_HEIGHT],
}

pub struct Writer {
    row: usize,
    column: usize,
    color_code: ColorCode,
    buffer: &'static mut Buffer,
}

impl Writer {
    /// Build a writer over an arbitrary cell buffer. The global console
    /// wraps the hardware buffer at 0xb8000; tests supply their own.
    pub fn with_buffer(buffer: &'static mut Buffer) -> Self {
        Self {
            row: 0,
            column: 0,
            color_code: ColorCode::new(Color::White, Color::Black),
            buffer,
        }
    }

    pub fn set_color(&mut self, foreground: Color, background: Color) {
        self.color_code = ColorCode::new(foreground, background);
    }

    pub fn write_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => self.new_line(),
            b'\t' => {
                let next_stop = (self.column / TAB_STOP + 1) * TAB_STOP;
                while self.column < next_stop && self.column < BUFFER_WIDTH {
                    self.put(b' ');
                }
            }
            0x08 => self.backspace(),
            byte => self.put(byte),
        }
    }

    fn put(&mut self, byte: u8) {
        if self.column >= BUFFER_WIDTH {
            self.new_line();
        }
        let row = self.row;
        let col = self.column;
        let color_code = self.color_code;
        // SAFETY: row/col are kept in bounds by new_line and the wrap check
        // above; write_volatile keeps the MMIO store from being elided.
        unsafe {
            write_volatile(
                &mut self.buffer.chars[row][col],
                ScreenChar {
                    ascii_character: byte,
                    color_code,
                },
            );
        }
        self.column += 1;
    }

    fn backspace(&mut self) {
        if self.column == 0 {
            return;
        }
        self.column -= 1;
        let row = self.row;
        let col = self.column;
        let blank = ScreenChar {
            ascii_character: b' ',
            color_code: self.color_code,
        };
        // SAFETY: column was just decremented below BUFFER_WIDTH; row is in
        // bounds by construction.
        unsafe {
            write_volatile(&mut self.buffer.chars[row][col], blank);
        }
    }

    fn new_line(&mut self) {
        self.column = 0;
        if self.row + 1 < BUFFER_HEIGHT {
            self.row += 1;
            return;
        }
        // Scroll everything up one row and blank the last
        for row in 1..BUFFER_HEIGHT {
            for col in 0..BUFFER_WIDTH {
                // SAFETY: both indices are bounded by the loop ranges.
                let character = unsafe { core::ptr::read_volatile(&self.buffer.chars[row][col]) };
                unsafe {
                    write_volatile(&mut self.buffer.chars[row - 1][col], character);
                }
            }
        }
        self.clear_row(BUFFER_HEIGHT - 1);
    }

    fn clear_row(&mut self, row: usize) {
        let blank = ScreenChar {
            ascii_character: b' ',
            color_code: self.color_code,
        };
        for col in 0..BUFFER_WIDTH {
            // SAFETY: row comes from callers that keep it below
            // BUFFER_HEIGHT; col is bounded by the loop.
            unsafe {
                write_volatile(&mut self.buffer.chars[row][col], blank);
            }
        }
    }

    pub fn clear(&mut self) {
        for row in 0..BUFFER_HEIGHT {
            self.clear_row(row);
        }
        self.row = 0;
        self.column = 0;
    }

    pub fn write_string(&mut self, s: &str) {
        for byte in s.bytes() {
            match byte {
                0x20..=0x7e | b'\n' | b'\t' | 0x08 => self.write_byte(byte),
                _ => self.write_byte(0xfe),
            }
        }
    }

    #[cfg(all(test, not(target_os = "none")))]
    fn char_at(&self, row: usize, col: usize) -> u8 {
        self.buffer.chars[row][col].ascii_character
    }

    #[cfg(all(test, not(target_os = "none")))]
    fn cursor(&self) -> (usize, usize) {
        (self.row, self.column)
    }
}

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_string(s);
        Ok(())
    }
}

#[cfg(target_os = "none")]
lazy_static! {
    pub static ref WRITER: Mutex<Writer> = Mutex::new(Writer::with_buffer(
        // SAFETY: 0xb8000 is the identity-mapped VGA text buffer; the Mutex
        // makes this the only live reference.
        unsafe { &mut *(0xb8000 as *mut Buffer) },
    ));
}

#[cfg(target_os = "none")]
#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    use x86_64::instructions::interrupts;

    interrupts::without_interrupts(|| {
        WRITER.lock().write_fmt(args).expect("VGA write_fmt failed");
    });
}

/// Console output is a hardware device; on the host the macros discard.
#[cfg(not(target_os = "none"))]
#[doc(hidden)]
pub fn _print(_args: fmt::Arguments) {}

/// Set the console colors for subsequent output.
#[cfg(target_os = "none")]
pub fn set_color(foreground: Color, background: Color) {
    x86_64::instructions::interrupts::without_interrupts(|| {
        WRITER.lock().set_color(foreground, background);
    });
}

#[cfg(not(target_os = "none"))]
pub fn set_color(_foreground: Color, _background: Color) {}

/// Blank the screen and home the cursor.
#[cfg(target_os = "none")]
pub fn clear() {
    x86_64::instructions::interrupts::without_interrupts(|| {
        WRITER.lock().clear();
    });
}

#[cfg(not(target_os = "none"))]
pub fn clear() {}

/// Write a single byte to the console (syscall `putchar`/`write` backend).
#[cfg(target_os = "none")]
pub fn put_byte(byte: u8) {
    x86_64::instructions::interrupts::without_interrupts(|| {
        WRITER.lock().write_byte(byte);
    });
}

#[cfg(not(target_os = "none"))]
pub fn put_byte(_byte: u8) {}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate std;
    use std::boxed::Box;

    use super::*;

    fn test_writer() -> Writer {
        let buffer = Box::leak(Box::new(Buffer {
            chars: [[ScreenChar {
                ascii_character: b' ',
                color_code: ColorCode::new(Color::White, Color::Black),
            }; BUFFER_WIDTH]; BUFFER_HEIGHT],
        }));
        Writer::with_buffer(buffer)
    }

    #[test]
    fn cursor_advances_and_wraps() {
        let mut w = test_writer();
        w.write_string("ab");
        assert_eq!(w.cursor(), (0, 2));
        assert_eq!(w.char_at(0, 0), b'a');
        assert_eq!(w.char_at(0, 1), b'b');

        for _ in 0..BUFFER_WIDTH {
            w.write_byte(b'x');
        }
        // Writing past column 79 wrapped onto the next row
        assert_eq!(w.cursor().0, 1);
    }

    #[test]
    fn tab_stops_every_four_columns() {
        let mut w = test_writer();
        w.write_byte(b'\t');
        assert_eq!(w.cursor(), (0, 4));
        w.write_byte(b'a');
        w.write_byte(b'\t');
        assert_eq!(w.cursor(), (0, 8));
    }

    #[test]
    fn backspace_blanks_previous_cell() {
        let mut w = test_writer();
        w.write_string("hi");
        w.write_byte(0x08);
        assert_eq!(w.cursor(), (0, 1));
        assert_eq!(w.char_at(0, 1), b' ');
        // At column zero backspace does nothing
        w.write_byte(0x08);
        w.write_byte(0x08);
        assert_eq!(w.cursor(), (0, 0));
    }

    #[test]
    fn newline_scrolls_at_bottom() {
        let mut w = test_writer();
        for i in 0..BUFFER_HEIGHT {
            w.write_string("line");
            w.write_byte(b'0' + (i % 10) as u8);
            w.write_byte(b'\n');
        }
        // The first line has scrolled off; row stays pinned to the last one
        assert_eq!(w.cursor().0, BUFFER_HEIGHT - 1);
        assert_eq!(w.char_at(0, 4), b'1');
    }

    #[test]
    fn clear_homes_cursor() {
        let mut w = test_writer();
        w.write_string("something\nelse");
        w.clear();
        assert_eq!(w.cursor(), (0, 0));
        assert_eq!(w.char_at(0, 0), b' ');
    }

    #[test]
    fn unprintable_bytes_become_fe() {
        let mut w = test_writer();
        w.write_string("\u{1}");
        assert_eq!(w.char_at(0, 0), 0xfe);
    }
}
