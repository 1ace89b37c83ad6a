//! Loader error taxonomy and the fatal-exit sink.
//!
//! There is no unwinding anywhere in this program: every terminal condition
//! is described by a [`LoaderError`] and handed to [`fatal`], which reports
//! on fd 2 and exits with status 1. Non-terminal conditions (a reservation
//! that could not be satisfied, a missing optional symbol) go through the
//! `log` macros instead and execution continues.

use core::fmt;

#[cfg(target_os = "linux")]
use crate::syscall::Errno;

/// Everything that can terminate the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "loader errors must either be handled or passed to fatal()"]
pub enum LoaderError<'a> {
    /// Fewer than two command-line arguments.
    Usage { argv0: &'a str },
    /// Malformed WINEPRELOADRESERVE value.
    InvalidReserveSpec { value: &'a str },
    /// The target image could not be opened.
    #[cfg(target_os = "linux")]
    OpenFailed { path: &'a str, errno: Errno },
    /// The image file ends before its headers do.
    ShortRead { path: &'a str },
    /// The image does not start with the ELF magic.
    BadMagic { path: &'a str },
    /// 32/64-bit class does not match this build.
    WrongClass { path: &'a str },
    /// Machine type does not match this build.
    WrongMachine { path: &'a str, machine: u16 },
    /// Neither a fixed executable nor a shared object.
    WrongType { path: &'a str, e_type: u16 },
    /// More program headers than the fixed load-command buffer holds.
    TooManyHeaders { path: &'a str, count: u16 },
    /// The program-header table lies outside the header buffer or its entry
    /// size is not ours.
    BadHeaderTable { path: &'a str },
    /// A segment's file size exceeds its memory size.
    BadSegmentSize { path: &'a str },
    /// A load command's alignment is not a multiple of the page size.
    BadAlignment { path: &'a str, align: usize },
    /// A load command's address and file offset disagree modulo alignment.
    MisalignedSegment { path: &'a str },
    /// The image has no PT_LOAD segment.
    NoLoadSegments { path: &'a str },
    /// No program header table is visible in any mapped segment.
    NoProgramHeader { path: &'a str },
    /// A segment mapping failed.
    #[cfg(target_os = "linux")]
    MapFailed { path: &'a str, errno: Errno },
    /// A fixed-address image wants the loader's own address range.
    OverlapsLoader {
        path_start: usize,
        path_end: usize,
        loader_start: usize,
        loader_end: usize,
    },
    /// The host dynamic loader does not export a function we need.
    #[cfg(target_os = "macos")]
    DyldLookupFailed { symbol: &'a str },
    /// The host dynamic loader could not load the target image.
    #[cfg(target_os = "macos")]
    HostLoadFailed { path: &'a str },
    /// The loaded image has no usable entry-point load command.
    #[cfg(target_os = "macos")]
    NoEntryPoint { path: &'a str },
}

impl fmt::Display for LoaderError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            LoaderError::Usage { argv0 } => {
                write!(f, "Usage: {} target_program [args]", argv0)
            }
            LoaderError::InvalidReserveSpec { value } => {
                write!(f, "invalid WINEPRELOADRESERVE value '{}'", value)
            }
            #[cfg(target_os = "linux")]
            LoaderError::OpenFailed { path, errno } => {
                write!(f, "{}: could not open ({})", path, errno)
            }
            LoaderError::ShortRead { path } => {
                write!(f, "{}: file too short for its headers", path)
            }
            LoaderError::BadMagic { path } => write!(f, "{}: not an ELF binary", path),
            LoaderError::WrongClass { path } => {
                write!(f, "{}: wrong 32/64-bit ELF class", path)
            }
            LoaderError::WrongMachine { path, machine } => {
                write!(f, "{}: unsupported machine type {:#x}", path, machine)
            }
            LoaderError::WrongType { path, e_type } => {
                write!(f, "{}: unsupported object type {}", path, e_type)
            }
            LoaderError::TooManyHeaders { path, count } => {
                write!(f, "{}: too many program headers ({})", path, count)
            }
            LoaderError::BadHeaderTable { path } => {
                write!(f, "{}: malformed program header table", path)
            }
            LoaderError::BadSegmentSize { path } => {
                write!(f, "{}: segment file size exceeds memory size", path)
            }
            LoaderError::BadAlignment { path, align } => {
                write!(
                    f,
                    "{}: load command alignment {:#x} is not page-aligned",
                    path, align
                )
            }
            LoaderError::MisalignedSegment { path } => {
                write!(f, "{}: load command address/offset not properly aligned", path)
            }
            LoaderError::NoLoadSegments { path } => {
                write!(f, "{}: no loadable segments", path)
            }
            LoaderError::NoProgramHeader { path } => {
                write!(f, "{}: no program header in any mapped segment", path)
            }
            #[cfg(target_os = "linux")]
            LoaderError::MapFailed { path, errno } => {
                write!(f, "{}: could not map segment ({})", path, errno)
            }
            LoaderError::OverlapsLoader {
                path_start,
                path_end,
                loader_start,
                loader_end,
            } => {
                write!(
                    f,
                    "binary ({:#x}-{:#x}) overlaps the loader ({:#x}-{:#x})",
                    path_start, path_end, loader_start, loader_end
                )
            }
            #[cfg(target_os = "macos")]
            LoaderError::DyldLookupFailed { symbol } => {
                write!(f, "host loader lookup failed for '{}'", symbol)
            }
            #[cfg(target_os = "macos")]
            LoaderError::HostLoadFailed { path } => {
                write!(f, "{}: could not load binary", path)
            }
            #[cfg(target_os = "macos")]
            LoaderError::NoEntryPoint { path } => {
                write!(f, "{}: no LC_MAIN or LC_UNIXTHREAD entry point", path)
            }
        }
    }
}

/// Report a terminal condition on fd 2 and exit with status 1.
pub fn fatal(err: LoaderError) -> ! {
    crate::printerrln!("preloader: {}", err);
    exit(1)
}

/// Platform-independent process exit.
pub fn exit(status: i32) -> ! {
    #[cfg(target_os = "linux")]
    crate::syscall::exit(status);
    #[cfg(target_os = "macos")]
    crate::macho::sys::exit(status);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(err: LoaderError) -> std::string::String {
        use std::string::ToString;
        err.to_string()
    }

    #[test]
    fn usage_message_names_argv0() {
        let msg = render(LoaderError::Usage { argv0: "loader" });
        assert!(msg.starts_with("Usage: loader"));
    }

    #[test]
    fn reserve_message_quotes_the_value() {
        let msg = render(LoaderError::InvalidReserveSpec { value: "zzz" });
        assert_eq!(msg, "invalid WINEPRELOADRESERVE value 'zzz'");
    }

    #[test]
    fn overlap_message_names_both_ranges() {
        let msg = render(LoaderError::OverlapsLoader {
            path_start: 0x400000,
            path_end: 0x500000,
            loader_start: 0x7c400000,
            loader_end: 0x7c500000,
        });
        assert!(msg.contains("0x400000"));
        assert!(msg.contains("0x7c400000"));
    }
}
