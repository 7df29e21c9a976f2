//! The kernel's side of the service table.
//!
//! One immutable [`KernelTable`] instance, built during bring-up, whose
//! address is the single argument every loaded program receives. The
//! entries are thin shims onto the subsystems; the contract for each is
//! documented in `kernel-abi`.

use crate::{framebuffer, keyboard, mem, serial, tsc};
use kernel_abi::{KERNEL_TABLE_MAGIC, KernelTable};
use kernel_sync::SyncOnceCell;

unsafe extern "C" fn kt_log(ptr: *const u8, len: usize) {
    if ptr.is_null() {
        return;
    }
    let bytes = unsafe { core::slice::from_raw_parts(ptr, len) };
    serial::write_raw(bytes);
}

extern "C" fn kt_draw_rect(x: u32, y: u32, w: u32, h: u32, color: u32) {
    framebuffer::fill_rect(x, y, w, h, color);
}

extern "C" fn kt_poll_key() -> u8 {
    keyboard::poll()
}

extern "C" fn kt_sleep_ms(ms: u64) {
    tsc::sleep_ms(ms);
}

extern "C" fn kt_alloc_pages(count: usize) -> *mut u8 {
    mem::alloc_user_pages(count)
}

static TABLE: SyncOnceCell<KernelTable> = SyncOnceCell::new();

/// Build the table. Idempotent; the instance never changes afterwards.
pub fn init() {
    let _ = table();
    log::info!("kernel table ready ({} bytes)", core::mem::size_of::<KernelTable>());
}

/// The global table.
pub fn table() -> &'static KernelTable {
    TABLE.get_or_init(|| KernelTable {
        magic: KERNEL_TABLE_MAGIC,
        log: kt_log,
        draw_rect: kt_draw_rect,
        poll_key: kt_poll_key,
        sleep_ms: kt_sleep_ms,
        alloc_pages: kt_alloc_pages,
    })
}
