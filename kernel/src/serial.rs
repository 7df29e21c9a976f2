//! COM1 serial driver.
//!
//! The serial port is the kernel's console: the logger formats into it, the
//! shell prompts on it, and the kernel table's `log` entry writes raw bytes
//! to it. All access funnels through one spinlock taken with interrupts
//! masked, so an IRQ handler can log without deadlocking against the thread
//! it interrupted.

use crate::ports::{inb, outb};
use core::fmt::{self, Write};
use kernel_sync::{IrqGuard, SpinLock};

/// COM1 base port.
const COM1: u16 = 0x3F8;

const DATA: u16 = COM1;
const INT_ENABLE: u16 = COM1 + 1;
const FIFO_CTRL: u16 = COM1 + 2;
const LINE_CTRL: u16 = COM1 + 3;
const MODEM_CTRL: u16 = COM1 + 4;
const LINE_STATUS: u16 = COM1 + 5;

/// LSR bit: transmit holding register empty.
const THR_EMPTY: u8 = 1 << 5;

struct SerialPort;

impl SerialPort {
    /// 115200 baud, 8N1, FIFOs on, no interrupts (the port is polled).
    unsafe fn init(&mut self) {
        unsafe {
            outb(INT_ENABLE, 0x00);
            outb(LINE_CTRL, 0x80); // DLAB on
            outb(DATA, 0x01); // divisor 1 = 115200 baud
            outb(INT_ENABLE, 0x00);
            outb(LINE_CTRL, 0x03); // 8 bits, no parity, one stop
            outb(FIFO_CTRL, 0xC7); // enable + clear FIFOs, 14-byte threshold
            outb(MODEM_CTRL, 0x0B); // DTR | RTS | OUT2
        }
    }

    fn write_byte(&mut self, byte: u8) {
        unsafe {
            while inb(LINE_STATUS) & THR_EMPTY == 0 {
                core::hint::spin_loop();
            }
            outb(DATA, byte);
        }
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.write_byte(b);
        }
    }
}

impl Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_bytes(s.as_bytes());
        Ok(())
    }
}

static PORT: SpinLock<SerialPort> = SpinLock::new(SerialPort);

/// Program the UART. Call once, before the first output.
pub fn init() {
    let _irq = IrqGuard::new();
    unsafe { PORT.lock().init() };
}

/// Write formatted text to the console.
pub fn print(args: fmt::Arguments) {
    let _irq = IrqGuard::new();
    // Formatting cannot fail on a port that only ever returns Ok.
    let _ = PORT.lock().write_fmt(args);
}

/// Write raw bytes, verbatim: no prefix, no added newline. Backs the
/// kernel-table `log` service.
pub fn write_raw(bytes: &[u8]) {
    let _irq = IrqGuard::new();
    PORT.lock().write_bytes(bytes);
}

/// Last-resort output for the panic path: skips the lock if it is held (a
/// panic mid-print would otherwise spin forever on this CPU).
pub fn force_print(args: fmt::Arguments) {
    match PORT.try_lock() {
        Some(mut port) => {
            let _ = port.write_fmt(args);
        }
        None => {
            // The holder is gone for good; the port itself is stateless.
            let mut port = SerialPort;
            let _ = port.write_fmt(args);
        }
    }
}

/// Console print without a log-level prefix (shell output).
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::serial::print(core::format_args!($($arg)*))
    };
}

macro_rules! kprintln {
    () => { $crate::serial::print(core::format_args!("\n")) };
    ($($arg:tt)*) => {{
        $crate::serial::print(core::format_args!($($arg)*));
        $crate::serial::print(core::format_args!("\n"));
    }};
}

pub(crate) use {kprint, kprintln};
