//! TSC time base.
//!
//! The kernel has no timer interrupt; delays busy-wait on the time-stamp
//! counter. The counter's frequency comes from CPUID when the processor
//! reports it and from a one-shot PIT measurement otherwise, taken once
//! during bring-up while interrupts are still off.

use crate::cpuid;
use crate::ports::{inb, outb};
use kernel_sync::SyncOnceCell;
use log::info;

static TSC_HZ: SyncOnceCell<u64> = SyncOnceCell::new();

/// Read the TSC, fenced so it cannot drift ahead of program order.
#[inline]
pub fn rdtsc() -> u64 {
    let lo: u32;
    let hi: u32;
    unsafe {
        core::arch::asm!(
            "lfence",
            "rdtsc",
            out("eax") lo,
            out("edx") hi,
            options(nomem, nostack, preserves_flags),
        );
    }
    (u64::from(hi) << 32) | u64::from(lo)
}

/// Determine and cache the TSC frequency. Call once with interrupts off.
pub fn init() {
    let hz = TSC_HZ.get_or_init(|| {
        cpuid::tsc_hz_from_leaf_15h()
            .or_else(cpuid::tsc_hz_from_leaf_16h)
            .unwrap_or_else(|| unsafe { measure_with_pit(50_000) })
    });
    info!("TSC: {} MHz time base", hz / 1_000_000);
}

fn tsc_hz() -> u64 {
    // Lazily measured on machines that somehow sleep before init().
    *TSC_HZ.get_or_init(|| unsafe { measure_with_pit(50_000) })
}

/// Busy-wait approximately `ms` milliseconds.
pub fn sleep_ms(ms: u64) {
    let ticks = ms.saturating_mul(tsc_hz()) / 1000;
    let deadline = rdtsc().wrapping_add(ticks);
    while rdtsc().wrapping_sub(deadline) as i64 <= 0 {
        core::hint::spin_loop();
    }
}

const PIT_CH0: u16 = 0x40;
const PIT_CMD: u16 = 0x43;
const PIT_HZ: u64 = 1_193_182;

/// Measure the TSC against a PIT countdown window of `window_us`
/// microseconds.
///
/// Channel 0 is programmed in mode 0 (interrupt on terminal count, which
/// nothing is wired to); the counter is polled via latch commands until it
/// expires, and the TSC delta over the window gives the frequency.
///
/// # Safety
/// Reprograms PIT channel 0; call during bring-up only, with interrupts
/// masked.
unsafe fn measure_with_pit(window_us: u64) -> u64 {
    let reload = (PIT_HZ * window_us / 1_000_000).clamp(2, 0xFFFF) as u16;

    unsafe {
        // Channel 0, lobyte/hibyte access, mode 0, binary.
        outb(PIT_CMD, 0b0011_0000);
        outb(PIT_CH0, (reload & 0xFF) as u8);
        outb(PIT_CH0, (reload >> 8) as u8);
    }

    let start = rdtsc();
    loop {
        unsafe {
            // Latch and read back channel 0.
            outb(PIT_CMD, 0);
            let lo = u16::from(inb(PIT_CH0));
            let hi = u16::from(inb(PIT_CH0));
            let count = (hi << 8) | lo;
            // Mode 0 counts down and parks; near-zero means the window is
            // over. The wrap check catches the parked/reloaded readback.
            if count <= 2 || count > reload {
                break;
            }
        }
        core::hint::spin_loop();
    }
    let delta = rdtsc().wrapping_sub(start);

    delta.saturating_mul(1_000_000) / window_us
}
