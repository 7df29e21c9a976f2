//! # Typed x86_64 register access
//!
//! Thin, typed wrappers over the control registers and model-specific
//! registers the kernel actually touches. Bit layouts are expressed with
//! [`bitfield_struct`](https://docs.rs/bitfield-struct/) so call sites never
//! shift or mask by hand.
//!
//! Reading or writing any of these requires CPL 0; every accessor is
//! `unsafe` and only compiled for `x86_64`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod cr3;
pub mod cr4;
pub mod msr;

pub use cr3::Cr3;
pub use cr4::Cr4;
pub use msr::{Ia32Pkrs, Msr};

/// A register value that can be read from the CPU.
pub trait LoadRegister: Sized {
    /// # Safety
    /// Must execute at CPL 0; see the implementing type for specifics.
    unsafe fn load() -> Self;
}

/// A register value that can be written back to the CPU.
pub trait StoreRegister: Sized {
    /// # Safety
    /// Must execute at CPL 0. Writing reserved or unsupported bits raises
    /// `#GP`; see the implementing type for specifics.
    unsafe fn store(self);
}
