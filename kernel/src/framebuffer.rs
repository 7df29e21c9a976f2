//! Linear framebuffer, 32-bit ARGB.
//!
//! The one drawing primitive the kernel exposes (through the kernel
//! table) is a clipped rectangle fill. A machine without a framebuffer,
//! or with one the kernel cannot draw to, leaves the slot uninitialized
//! and every fill becomes a no-op.

use kernel_sync::{SpinLock, SyncOnceCell};
use log::{info, warn};

struct Framebuffer {
    base: *mut u32,
    width: u32,
    height: u32,
    /// Pixels per scanline; at least `width`, often more.
    stride: u32,
}

// Safety: the raw pointer targets the exclusive framebuffer mapping.
unsafe impl Send for Framebuffer {}

static FB: SyncOnceCell<SpinLock<Framebuffer>> = SyncOnceCell::new();

/// Adopt the bootloader-provided framebuffer, if there is a drawable one.
pub fn init() {
    let Some(fb) = crate::boot::framebuffer() else {
        info!("framebuffer: none, drawing disabled");
        return;
    };
    if fb.bpp() != 32 {
        warn!("framebuffer: {} bpp unsupported, drawing disabled", fb.bpp());
        return;
    }

    let stride = (fb.pitch() / 4) as u32;
    info!(
        "framebuffer: {}x{} at {:p}, stride {stride} px",
        fb.width(),
        fb.height(),
        fb.addr()
    );
    let _ = FB.get_or_init(|| {
        SpinLock::new(Framebuffer {
            base: fb.addr().cast(),
            width: fb.width() as u32,
            height: fb.height() as u32,
            stride,
        })
    });
}

/// Fill a rectangle with `color` (`0xAARRGGBB`). Out-of-bounds parts are
/// clipped; without a framebuffer this does nothing.
pub fn fill_rect(x: u32, y: u32, w: u32, h: u32, color: u32) {
    let Some(fb) = FB.get() else { return };
    let fb = fb.lock();

    let x_end = x.saturating_add(w).min(fb.width);
    let y_end = y.saturating_add(h).min(fb.height);
    if x >= x_end || y >= y_end {
        return;
    }

    for row in y..y_end {
        let line = unsafe { fb.base.add((row * fb.stride) as usize) };
        for col in x..x_end {
            unsafe { line.add(col as usize).write_volatile(color) };
        }
    }
}
