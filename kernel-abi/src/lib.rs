//! # The kernel service table
//!
//! Keyhole is a single-address-space system: a loaded program runs in the
//! same page tables and at the same privilege level as the kernel, so there
//! is no trap gateway to call through. Instead the kernel hands every
//! program one pointer, to a [`KernelTable`], and all services are plain
//! C-ABI calls through that record. Isolation is the business of protection
//! keys, not of the call mechanism.
//!
//! Both sides of the boundary compile this crate: the kernel builds the one
//! global table, user programs receive its address in `RDI` (first SysV
//! integer argument) at their entry point and go through [`Services`] after
//! checking the magic.
//!
//! ## Binary layout
//!
//! The layout is the contract and is frozen by const assertions and unit
//! tests; a program written in any language can consume it.
//!
//! | offset | field        | signature                       |
//! |--------|--------------|---------------------------------|
//! | 0      | `magic`      | `u64` == `0xDEADC0DE`           |
//! | 8      | `log`        | `fn(ptr: *const u8, len: usize)`|
//! | 16     | `draw_rect`  | `fn(x, y, w, h, color: u32)`    |
//! | 24     | `poll_key`   | `fn() -> u8`                    |
//! | 32     | `sleep_ms`   | `fn(ms: u64)`                   |
//! | 40     | `alloc_pages`| `fn(count: usize) -> *mut u8`   |
//!
//! Total size: 48 bytes. All pointers use the C calling convention with no
//! obligations beyond SysV.

#![cfg_attr(not(any(test, doctest)), no_std)]

use core::mem::offset_of;

/// Value of [`KernelTable::magic`]; lets a program validate the handoff
/// before making any call.
pub const KERNEL_TABLE_MAGIC: u64 = 0xDEAD_C0DE;

/// Write `len` bytes, verbatim, to the kernel console (serial).
pub type LogFn = unsafe extern "C" fn(ptr: *const u8, len: usize);

/// Fill a rectangle in 32-bit ARGB. Out-of-bounds pixels are clipped; a
/// machine without a framebuffer turns this into a no-op.
pub type DrawRectFn = extern "C" fn(x: u32, y: u32, w: u32, h: u32, color: u32);

/// Next buffered key as ASCII, or 0 when no key is pending. Never blocks.
pub type PollKeyFn = extern "C" fn() -> u8;

/// Busy-wait for approximately `ms` milliseconds.
pub type SleepMsFn = extern "C" fn(ms: u64);

/// Allocate `count` physically contiguous pages; returns the virtual
/// address or null when out of memory.
pub type AllocPagesFn = extern "C" fn(count: usize) -> *mut u8;

/// Entry-point signature of a loaded program. The single argument is the
/// address of the kernel's [`KernelTable`]; the return value is reported by
/// the shell.
pub type ProgramEntry = extern "C" fn(table: *const KernelTable) -> i32;

/// The function-pointer record handed to every loaded program.
///
/// Constructed once by the kernel and never mutated afterwards; user code
/// reads it, it never writes back.
#[repr(C)]
pub struct KernelTable {
    pub magic: u64,
    pub log: LogFn,
    pub draw_rect: DrawRectFn,
    pub poll_key: PollKeyFn,
    pub sleep_ms: SleepMsFn,
    pub alloc_pages: AllocPagesFn,
}

// The offsets are the ABI. Anything that moves here breaks every already
// built user program.
const _: () = {
    assert!(size_of::<KernelTable>() == 48);
    assert!(offset_of!(KernelTable, magic) == 0);
    assert!(offset_of!(KernelTable, log) == 8);
    assert!(offset_of!(KernelTable, draw_rect) == 16);
    assert!(offset_of!(KernelTable, poll_key) == 24);
    assert!(offset_of!(KernelTable, sleep_ms) == 32);
    assert!(offset_of!(KernelTable, alloc_pages) == 40);
};

/// Checked, ergonomic view of a [`KernelTable`] for user programs.
///
/// ```
/// # use kernel_abi::{KernelTable, Services, KERNEL_TABLE_MAGIC};
/// # unsafe extern "C" fn log(_: *const u8, _: usize) {}
/// # extern "C" fn draw_rect(_: u32, _: u32, _: u32, _: u32, _: u32) {}
/// # extern "C" fn poll_key() -> u8 { 0 }
/// # extern "C" fn sleep_ms(_: u64) {}
/// # extern "C" fn alloc_pages(_: usize) -> *mut u8 { core::ptr::null_mut() }
/// # let table = KernelTable { magic: KERNEL_TABLE_MAGIC, log, draw_rect, poll_key, sleep_ms, alloc_pages };
/// let sys = unsafe { Services::from_raw(&table) }.expect("bad handoff");
/// sys.log("hello");
/// ```
#[derive(Clone, Copy)]
pub struct Services {
    table: &'static KernelTable,
}

impl Services {
    /// Validate the magic and wrap the table.
    ///
    /// Returns `None` for a null pointer or a wrong magic value.
    ///
    /// # Safety
    /// `table` must point to a live, correctly laid out `KernelTable` (the
    /// pointer a Keyhole kernel passed to the program entry qualifies).
    #[must_use]
    pub unsafe fn from_raw(table: *const KernelTable) -> Option<Self> {
        if table.is_null() {
            return None;
        }
        let table = unsafe { &*table };
        (table.magic == KERNEL_TABLE_MAGIC).then_some(Self { table })
    }

    pub fn log(self, text: &str) {
        unsafe { (self.table.log)(text.as_ptr(), text.len()) }
    }

    pub fn draw_rect(self, x: u32, y: u32, w: u32, h: u32, color: u32) {
        (self.table.draw_rect)(x, y, w, h, color);
    }

    #[must_use]
    pub fn poll_key(self) -> u8 {
        (self.table.poll_key)()
    }

    pub fn sleep_ms(self, ms: u64) {
        (self.table.sleep_ms)(ms);
    }

    #[must_use]
    pub fn alloc_pages(self, count: usize) -> *mut u8 {
        (self.table.alloc_pages)(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    unsafe extern "C" fn log_stub(_ptr: *const u8, len: usize) {
        LOGGED.store(len, Ordering::SeqCst);
    }
    extern "C" fn draw_rect_stub(_x: u32, _y: u32, _w: u32, _h: u32, _color: u32) {}
    extern "C" fn poll_key_stub() -> u8 {
        b'K'
    }
    extern "C" fn sleep_ms_stub(_ms: u64) {}
    extern "C" fn alloc_pages_stub(_count: usize) -> *mut u8 {
        core::ptr::null_mut()
    }

    static LOGGED: AtomicUsize = AtomicUsize::new(0);

    fn table_with_magic(magic: u64) -> &'static KernelTable {
        Box::leak(Box::new(KernelTable {
            magic,
            log: log_stub,
            draw_rect: draw_rect_stub,
            poll_key: poll_key_stub,
            sleep_ms: sleep_ms_stub,
            alloc_pages: alloc_pages_stub,
        }))
    }

    #[test]
    fn layout_is_frozen() {
        assert_eq!(size_of::<KernelTable>(), 48);
        assert_eq!(offset_of!(KernelTable, magic), 0);
        assert_eq!(offset_of!(KernelTable, log), 8);
        assert_eq!(offset_of!(KernelTable, draw_rect), 16);
        assert_eq!(offset_of!(KernelTable, poll_key), 24);
        assert_eq!(offset_of!(KernelTable, sleep_ms), 32);
        assert_eq!(offset_of!(KernelTable, alloc_pages), 40);
        assert_eq!(KERNEL_TABLE_MAGIC, 0xDEADC0DE);
    }

    #[test]
    fn services_validates_magic() {
        let good = table_with_magic(KERNEL_TABLE_MAGIC);
        let sys = unsafe { Services::from_raw(good) }.expect("valid table");
        assert_eq!(sys.poll_key(), b'K');

        sys.log("four");
        assert_eq!(LOGGED.load(Ordering::SeqCst), 4);

        let bad = table_with_magic(0x1BADC0DE);
        assert!(unsafe { Services::from_raw(bad) }.is_none());
        assert!(unsafe { Services::from_raw(core::ptr::null()) }.is_none());
    }
}
