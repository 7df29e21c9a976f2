//! Limine boot protocol requests and typed access to the responses.
//!
//! The request structs live in the dedicated `.requests*` linker sections,
//! bracketed by the start/end markers; the bootloader finds them there and
//! writes the response pointers back before jumping to `kmain`. Everything
//! the core consumes comes through the accessors below: the memory map, the
//! HHDM offset, the kernel's load addresses, the framebuffer and the module
//! list.
//!
//! A missing response is a fatal boot error. It can only mean a bootloader
//! too old for the requested base revision, and nothing sensible can run
//! without a memory map, so the accessors halt instead of limping on.

use crate::halt_loop;
use crate::serial;
use limine::BaseRevision;
use limine::framebuffer::Framebuffer;
use limine::memory_map::Entry;
use limine::request::{
    ExecutableAddressRequest, FramebufferRequest, HhdmRequest, MemoryMapRequest, ModuleRequest,
    RequestsEndMarker, RequestsStartMarker,
};
use limine::response::{ExecutableAddressResponse, ModuleResponse};

#[used]
#[unsafe(link_section = ".requests_start_marker")]
static _START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

#[used]
#[unsafe(link_section = ".requests")]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[unsafe(link_section = ".requests")]
static MEMORY_MAP: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static HHDM: HhdmRequest = HhdmRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static FRAMEBUFFER: FramebufferRequest = FramebufferRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static EXECUTABLE_ADDRESS: ExecutableAddressRequest = ExecutableAddressRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static MODULES: ModuleRequest = ModuleRequest::new();

#[used]
#[unsafe(link_section = ".requests_end_marker")]
static _END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

/// Halt early when the bootloader does not speak our base revision. Runs
/// before the logger exists, hence the raw serial write.
pub fn check_base_revision() {
    if !BASE_REVISION.is_supported() {
        serial::force_print(format_args!("FATAL: Limine base revision unsupported\n"));
        halt_loop();
    }
}

/// Whether the handshake succeeded; logged late in bring-up.
pub fn base_revision_supported() -> bool {
    BASE_REVISION.is_supported()
}

fn missing(what: &str) -> ! {
    serial::force_print(format_args!("FATAL: bootloader response missing: {what}\n"));
    halt_loop()
}

/// The physical memory map, sorted by base, as Limine guarantees.
pub fn memory_map() -> &'static [&'static Entry] {
    match MEMORY_MAP.get_response() {
        Some(r) => r.entries(),
        None => missing("memory map"),
    }
}

/// Higher-half direct map offset. Invariant once read.
pub fn hhdm_offset() -> u64 {
    match HHDM.get_response() {
        Some(r) => r.offset(),
        None => missing("hhdm"),
    }
}

/// Virtual and physical base the kernel image was loaded at.
pub fn executable_address() -> &'static ExecutableAddressResponse {
    match EXECUTABLE_ADDRESS.get_response() {
        Some(r) => r,
        None => missing("executable address"),
    }
}

/// First framebuffer, if the machine has one. Optional by design: headless
/// boots are fine, drawing just becomes a no-op.
pub fn framebuffer() -> Option<Framebuffer<'static>> {
    FRAMEBUFFER.get_response()?.framebuffers().next()
}

/// Loaded modules; empty when the bootloader passed none.
pub fn modules() -> &'static [&'static limine::file::File] {
    MODULES.get_response().map_or(&[], ModuleResponse::modules)
}
