//! Typed wrappers over the raw kernel entry points.
//!
//! Every wrapper decodes the kernel's small-negative error convention into a
//! `Result`; nothing here touches errno or any other libc state. The process
//! exit wrapper never returns.

use linux_raw_sys::general;

use crate::arch::target as arch;

/// A raw kernel error number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub i32);

impl Errno {
    pub const ENOSYS: Errno = Errno(linux_raw_sys::errno::ENOSYS as i32);
    pub const EINVAL: Errno = Errno(linux_raw_sys::errno::EINVAL as i32);
    pub const EBADF: Errno = Errno(linux_raw_sys::errno::EBADF as i32);
}

impl core::fmt::Display for Errno {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "errno {}", self.0)
    }
}

pub type Result<T> = core::result::Result<T, Errno>;

/// Kernel return values in the top 4095 values of the address space encode
/// a negated error number.
fn check(ret: usize) -> Result<usize> {
    if ret > (-4096isize) as usize {
        Err(Errno(-(ret as isize) as i32))
    } else {
        Ok(ret)
    }
}

bitflags::bitflags! {
    /// Memory protection bits for mmap/mprotect. An empty set is PROT_NONE.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u32 {
        const READ = general::PROT_READ;
        const WRITE = general::PROT_WRITE;
        const EXEC = general::PROT_EXEC;
    }
}

bitflags::bitflags! {
    /// Mapping flags for mmap.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const PRIVATE = general::MAP_PRIVATE;
        const FIXED = general::MAP_FIXED;
        const ANONYMOUS = general::MAP_ANONYMOUS;
        const NORESERVE = general::MAP_NORESERVE;
    }
}

pub const STDERR_FILENO: i32 = 2;

/// Terminate the whole process.
pub fn exit(status: i32) -> ! {
    // SAFETY: exit_group takes one integer and does not return.
    unsafe {
        arch::syscall1(general::__NR_exit_group as usize, status as usize);
        core::hint::unreachable_unchecked()
    }
}

/// # Safety
/// `buf` must be valid for writes of `count` bytes.
pub unsafe fn read(fd: i32, buf: *mut u8, count: usize) -> Result<usize> {
    // SAFETY: guaranteed by the caller.
    check(unsafe { arch::syscall3(general::__NR_read as usize, fd as usize, buf as usize, count) })
}

/// # Safety
/// `buf` must be valid for reads of `count` bytes.
pub unsafe fn write(fd: i32, buf: *const u8, count: usize) -> Result<usize> {
    // SAFETY: guaranteed by the caller.
    check(unsafe {
        arch::syscall3(general::__NR_write as usize, fd as usize, buf as usize, count)
    })
}

/// # Safety
/// `path` must point to a NUL-terminated string.
pub unsafe fn open_readonly(path: *const u8) -> Result<i32> {
    // SAFETY: guaranteed by the caller.
    let ret = unsafe {
        arch::syscall3(
            general::__NR_open as usize,
            path as usize,
            general::O_RDONLY as usize,
            0,
        )
    };
    check(ret).map(|fd| fd as i32)
}

pub fn close(fd: i32) -> Result<()> {
    // SAFETY: close is safe for any descriptor value.
    check(unsafe { arch::syscall1(general::__NR_close as usize, fd as usize) }).map(|_| ())
}

/// Map `len` bytes at `addr` (a hint unless `MapFlags::FIXED` is set).
///
/// On 32-bit x86 this goes through mmap2 with the page-shifted offset and
/// falls back to the legacy single-struct syscall on kernels that report
/// ENOSYS for it.
///
/// # Safety
/// A FIXED mapping replaces whatever was previously at `addr`.
pub unsafe fn mmap(
    addr: usize,
    len: usize,
    prot: Prot,
    flags: MapFlags,
    fd: i32,
    offset: usize,
) -> Result<usize> {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: guaranteed by the caller.
    let ret = unsafe {
        arch::syscall6(
            general::__NR_mmap as usize,
            addr,
            len,
            prot.bits() as usize,
            flags.bits() as usize,
            fd as usize,
            offset,
        )
    };

    #[cfg(target_arch = "x86")]
    // SAFETY: guaranteed by the caller.
    let ret = unsafe {
        let ret = arch::syscall6(
            general::__NR_mmap2 as usize,
            addr,
            len,
            prot.bits() as usize,
            flags.bits() as usize,
            fd as usize,
            offset >> arch::MMAP_OFFSET_SHIFT,
        );
        if check(ret) == Err(Errno::ENOSYS) {
            // Pre-mmap2 kernels take a pointer to the six arguments.
            let packed = [
                addr,
                len,
                prot.bits() as usize,
                flags.bits() as usize,
                fd as usize,
                offset,
            ];
            arch::syscall1(general::__NR_mmap as usize, packed.as_ptr() as usize)
        } else {
            ret
        }
    };

    check(ret)
}

/// # Safety
/// Unmapping a range still in use frees it out from under its users.
pub unsafe fn munmap(addr: usize, len: usize) -> Result<()> {
    // SAFETY: guaranteed by the caller.
    check(unsafe { arch::syscall2(general::__NR_munmap as usize, addr, len) }).map(|_| ())
}

/// # Safety
/// Changing protections on a range still in use may fault its users.
pub unsafe fn mprotect(addr: usize, len: usize, prot: Prot) -> Result<()> {
    // SAFETY: guaranteed by the caller.
    check(unsafe {
        arch::syscall3(general::__NR_mprotect as usize, addr, len, prot.bits() as usize)
    })
    .map(|_| ())
}

/// # Safety
/// `vec` must be valid for writes of one byte per page in `[addr, addr+len)`.
pub unsafe fn mincore(addr: usize, len: usize, vec: *mut u8) -> Result<()> {
    // SAFETY: guaranteed by the caller.
    check(unsafe { arch::syscall3(general::__NR_mincore as usize, addr, len, vec as usize) })
        .map(|_| ())
}

/// # Safety
/// `arg` must be valid for the given prctl option.
pub unsafe fn prctl(option: u32, arg: usize) -> Result<usize> {
    // SAFETY: guaranteed by the caller.
    check(unsafe { arch::syscall2(general::__NR_prctl as usize, option as usize, arg) })
}

#[cfg(target_arch = "x86")]
use linux_raw_sys::general::{
    __NR_getegid32 as NR_GETEGID, __NR_geteuid32 as NR_GETEUID, __NR_getgid32 as NR_GETGID,
    __NR_getuid32 as NR_GETUID,
};
#[cfg(target_arch = "x86_64")]
use linux_raw_sys::general::{
    __NR_getegid as NR_GETEGID, __NR_geteuid as NR_GETEUID, __NR_getgid as NR_GETGID,
    __NR_getuid as NR_GETUID,
};

pub fn getuid() -> usize {
    // SAFETY: takes no arguments and cannot fail.
    unsafe { arch::syscall0(NR_GETUID as usize) }
}

pub fn geteuid() -> usize {
    // SAFETY: as for getuid.
    unsafe { arch::syscall0(NR_GETEUID as usize) }
}

pub fn getgid() -> usize {
    // SAFETY: as for getuid.
    unsafe { arch::syscall0(NR_GETGID as usize) }
}

pub fn getegid() -> usize {
    // SAFETY: as for getuid.
    unsafe { arch::syscall0(NR_GETEGID as usize) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_mapping_round_trip() {
        let len = 0x4000;
        let addr = unsafe {
            mmap(
                0,
                len,
                Prot::READ | Prot::WRITE,
                MapFlags::PRIVATE | MapFlags::ANONYMOUS,
                -1,
                0,
            )
        }
        .expect("anonymous mmap failed");
        assert_ne!(addr, 0);
        assert_eq!(addr % 0x1000, 0);

        unsafe {
            core::ptr::write_bytes(addr as *mut u8, 0xa5, len);
            assert_eq!(*(addr as *const u8), 0xa5);
            mprotect(addr, len, Prot::READ).expect("mprotect failed");
            assert_eq!(*(addr as *const u8), 0xa5);
            munmap(addr, len).expect("munmap failed");
        }
    }

    #[test]
    fn errors_are_decoded() {
        // Unaligned base address is always rejected.
        let err = unsafe { mprotect(0x1001, 0x1000, Prot::READ) }.unwrap_err();
        assert_eq!(err, Errno::EINVAL);
        assert_eq!(close(-1).unwrap_err(), Errno::EBADF);
    }

    #[test]
    fn id_wrappers_match_proc_status() {
        // /proc/self/status lists the ids the wrappers must agree with:
        // "Uid:\t<real>\t<effective>\t<saved>\t<fs>", same for Gid.
        let status = std::fs::read_to_string("/proc/self/status").unwrap();
        let field = |key: &str, idx: usize| -> usize {
            status
                .lines()
                .find(|l| l.starts_with(key))
                .and_then(|l| l.split_whitespace().nth(idx))
                .and_then(|v| v.parse().ok())
                .expect("id field missing from /proc/self/status")
        };
        assert_eq!(getuid(), field("Uid:", 1));
        assert_eq!(geteuid(), field("Uid:", 2));
        assert_eq!(getgid(), field("Gid:", 1));
        assert_eq!(getegid(), field("Gid:", 2));
    }
}
