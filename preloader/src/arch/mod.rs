//! Architecture selection.
//!
//! Each platform module provides the raw syscall primitives and the ABI
//! constants the portable code consumes. The `target` alias names the module
//! matching the compilation target.

#[cfg(target_arch = "x86")]
pub mod x86;
#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "x86")]
pub use x86 as target;
#[cfg(target_arch = "x86_64")]
pub use x86_64 as target;
