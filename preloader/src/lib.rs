//! Program-loader shim.
//!
//! Runs before the host's dynamic linker, reserves a fixed set of
//! virtual-address ranges for the program it is about to load, maps that
//! program (and its interpreter) the way the kernel would have, synthesizes
//! a matching auxiliary vector, and jumps to it as if the shim had never
//! been there.
//!
//! The crate is freestanding: no heap, no unwinding, no libc. On the host
//! the library also builds against std so the unit tests can run under the
//! standard harness.

#![no_std]

#[cfg(test)]
extern crate std;

#[macro_use]
pub mod print;

// The freestanding binary has no C library behind it; the host test build
// must keep libc's own versions.
#[cfg(not(test))]
mod intrinsics;

#[cfg(target_os = "linux")]
pub mod arch;
#[cfg(target_os = "linux")]
pub mod auxv;
pub mod context;
pub mod cstr;
#[cfg(target_os = "linux")]
pub mod elf;
pub mod error;
pub mod logger;
#[cfg(target_os = "macos")]
pub mod macho;
#[cfg(target_os = "linux")]
pub mod reserve;
#[cfg(target_os = "linux")]
pub mod stack;
#[cfg(target_os = "linux")]
pub mod start;
#[cfg(target_os = "linux")]
pub mod syscall;
