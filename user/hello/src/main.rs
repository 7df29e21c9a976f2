//! Demo program for the Keyhole kernel.
//!
//! Runs in the kernel's address space at supervisor privilege; the only
//! doorway back into the kernel is the service table whose address
//! arrives in the first argument register. Prints over the table's `log`,
//! draws a few rectangles, and exits back to the shell.

#![no_std]
#![no_main]

use kernel_abi::{KernelTable, Services};

#[unsafe(no_mangle)]
extern "C" fn _start(table: *const KernelTable) -> i32 {
    let Some(sys) = (unsafe { Services::from_raw(table) }) else {
        // Wrong magic: nothing sane to call, not even log.
        return 1;
    };

    sys.log("hello from a loaded module\n");

    // A little banner of color bars.
    for (i, color) in [0xFFCC_3333u32, 0xFF33_CC33, 0xFF33_33CC].iter().enumerate() {
        sys.draw_rect(40 + 60 * i as u32, 40, 50, 30, *color);
        sys.sleep_ms(100);
    }

    let page = sys.alloc_pages(1);
    if page.is_null() {
        sys.log("alloc_pages failed\n");
        return 2;
    }
    unsafe {
        page.write(0x42);
        if page.read() != 0x42 {
            return 3;
        }
    }
    sys.log("scratch page works, goodbye\n");
    0
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {
        core::hint::spin_loop();
    }
}
