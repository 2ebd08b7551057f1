//! UEFI boot stub for an embedded ELF kernel payload.
//!
//! The stub is linked with the kernel image as a flat binary blob. At boot it
//! locates that blob, validates its ELF64 structure, copies the loadable
//! segments into freshly allocated physical memory, leaves boot services the
//! way the UEFI spec demands, and jumps into the kernel with the boot hart id
//! and the device tree address in the argument registers.
//!
//! The pipeline is strictly linear: discovery -> validation -> program header
//! resolution -> layout planning -> segment loading -> permission remapping ->
//! boot services exit -> handoff. The first failure aborts the boot.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod elf;
pub mod error;
pub mod firmware;
pub mod handoff;
pub mod payload;
pub mod span;
pub mod stub;

pub use error::{BootError, Result};
