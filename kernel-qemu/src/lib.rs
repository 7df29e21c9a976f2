//! # QEMU test-exit device
//!
//! The kernel test harness runs under QEMU with
//! `-device isa-debug-exit,iobase=0x604,iosize=0x04`. Writing one byte to
//! that port terminates the emulator with exit status `(byte << 1) | 1`,
//! which is how a headless selftest boot reports pass or fail to the build
//! system (see the `test` targets in the GNUmakefile).
//!
//! On real hardware port 0x604 has no device attached and the write is
//! harmless; the fallback halt loop simply keeps the machine parked.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

/// I/O port the isa-debug-exit device is configured at.
pub const EXIT_PORT: u16 = 0x604;

/// Exit byte written to [`EXIT_PORT`].
///
/// The observed process exit status is `(byte << 1) | 1`, so `Success`
/// yields 33 and `Failure` yields 35. Neither can collide with QEMU's own
/// exit codes (0 and 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    Success = 0x10,
    Failure = 0x11,
}

/// Report `code` to QEMU and stop.
///
/// Never returns: either the emulator exits, or (without the device) the
/// CPU parks in a halt loop.
pub fn exit(code: ExitCode) -> ! {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::asm!(
            "out dx, al",
            in("dx") EXIT_PORT,
            in("al") code as u8,
            options(nomem, nostack, preserves_flags),
        );
    }
    loop {
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_bytes_map_to_distinct_statuses() {
        assert_eq!((ExitCode::Success as u8) << 1 | 1, 33);
        assert_eq!((ExitCode::Failure as u8) << 1 | 1, 35);
    }
}
