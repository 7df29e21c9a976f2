//! Serial-console shell.
//!
//! A deliberately small demo surface over the real subsystems: it reads
//! keys from the PS/2 ring, echoes to the serial console, and knows four
//! commands. `load` is the interesting one; it takes a substring of a
//! module path, runs the ELF loader on the matching module and jumps to
//! the entry point with the kernel table in the first argument register.

use crate::serial::{kprint, kprintln};
use crate::{keyboard, ktable, loader, mem};
use alloc::string::String;

fn wait_for_interrupt() {
    unsafe {
        core::arch::asm!("hlt", options(nomem, nostack, preserves_flags));
    }
}

pub fn run() -> ! {
    kprintln!();
    kprintln!("Keyhole shell. Type 'help' for commands.");
    kprint!("> ");

    let mut line = String::new();
    loop {
        let key = keyboard::poll();
        match key {
            0 => wait_for_interrupt(),
            b'\n' => {
                kprintln!();
                execute(line.trim());
                line.clear();
                kprint!("> ");
            }
            0x08 => {
                if line.pop().is_some() {
                    // Rub out the echoed character.
                    kprint!("\x08 \x08");
                }
            }
            key if key.is_ascii_graphic() || key == b' ' => {
                line.push(key as char);
                kprint!("{}", key as char);
            }
            _ => {}
        }
    }
}

fn execute(line: &str) {
    let mut parts = line.split_whitespace();
    match parts.next() {
        None => {}
        Some("help") => {
            kprintln!("help         this text");
            kprintln!("mem          physical memory statistics");
            kprintln!("mods         list boot modules");
            kprintln!("load NAME    load and run the module whose path contains NAME");
        }
        Some("mem") => {
            let (free, total) = mem::with_pmm(|pmm| (pmm.free_page_count(), pmm.total_pages()));
            kprintln!(
                "{} / {} pages free ({} / {} MiB)",
                free,
                total,
                free * 4 / 1024,
                total * 4 / 1024
            );
        }
        Some("mods") => {
            let modules = crate::boot::modules();
            if modules.is_empty() {
                kprintln!("no modules loaded");
            }
            for module in modules {
                kprintln!(
                    "{}  ({} bytes)",
                    module.path().to_str().unwrap_or("<non-utf8>"),
                    module.size()
                );
            }
        }
        Some("load") => match parts.next() {
            None => kprintln!("usage: load NAME"),
            Some(name) => load_module(name),
        },
        Some(other) => kprintln!("unknown command '{other}'"),
    }
}

fn load_module(name: &str) {
    let Some(module) = crate::boot::modules()
        .iter()
        .find(|m| m.path().to_str().is_ok_and(|p| p.contains(name)))
    else {
        kprintln!("no module matching '{name}'");
        return;
    };

    let image = unsafe { core::slice::from_raw_parts(module.addr(), module.size() as usize) };
    match loader::load(image) {
        Ok(entry) => {
            kprintln!("Jumping to entry point...");
            let status = entry(ktable::table());
            kprintln!("program exited with status {status}");
        }
        Err(e) => kprintln!("load failed: {e}"),
    }
}
