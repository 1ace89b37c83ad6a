//! Link-time setup for the loader binary.
//!
//! The binary (and only the binary; the library still builds for the host
//! test harness) is linked without the C startup files so that the entry
//! trampoline is the literal first instruction of the process, statically and
//! non-relocatable so its own extent is known, and with the text segment
//! pinned high so the image stays clear of every reserved low range.

fn main() {
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os == "linux" {
        println!("cargo:rustc-link-arg-bins=-nostartfiles");
        println!("cargo:rustc-link-arg-bins=-nodefaultlibs");
        println!("cargo:rustc-link-arg-bins=-static");
        println!("cargo:rustc-link-arg-bins=-no-pie");
        println!("cargo:rustc-link-arg-bins=-Wl,--image-base=0x7c400000");
    }
}
