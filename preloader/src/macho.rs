//! Mach-O host variant.
//!
//! Direct image mapping is impractical under dyld, so this variant only
//! reserves the address ranges itself and lets the host dynamic loader pull
//! in the target image; the entry point is then dug out of the loaded Mach
//! header. The kernel here ignores mmap address hints often enough that a
//! reservation is verified with a residency probe and retried fixed.

use log::warn;

use crate::cstr;
use crate::error::{self, LoaderError};

/// BSD syscall wrappers. Errors are reported through the carry flag with
/// the error number left in the result register.
pub mod sys {
    use core::arch::asm;

    /// BSD class prefix for ordinary syscalls.
    const CLASS_UNIX: usize = 0x0200_0000;

    pub const SYS_EXIT: usize = CLASS_UNIX | 1;
    pub const SYS_WRITE: usize = CLASS_UNIX | 4;
    pub const SYS_MUNMAP: usize = CLASS_UNIX | 73;
    pub const SYS_MPROTECT: usize = CLASS_UNIX | 74;
    pub const SYS_MINCORE: usize = CLASS_UNIX | 78;
    pub const SYS_MMAP: usize = CLASS_UNIX | 197;

    /// For the trampoline's exit-after-main path.
    pub const SYS_EXIT_TRAP: u32 = (CLASS_UNIX | 1) as u32;

    pub type Result<T> = core::result::Result<T, i32>;

    /// # Safety
    /// The arguments must be valid for the syscall `nr`.
    unsafe fn syscall6(
        nr: usize,
        a1: usize,
        a2: usize,
        a3: usize,
        a4: usize,
        a5: usize,
        a6: usize,
    ) -> Result<usize> {
        let ret: usize;
        let carry: u8;
        // SAFETY: guaranteed by the caller; the kernel clobbers rcx/r11 and
        // signals failure in the carry flag.
        unsafe {
            asm!(
                "syscall",
                "setc {carry}",
                inlateout("rax") nr => ret,
                in("rdi") a1,
                in("rsi") a2,
                in("rdx") a3,
                in("r10") a4,
                in("r8") a5,
                in("r9") a6,
                carry = out(reg_byte) carry,
                lateout("rcx") _,
                lateout("r11") _,
                options(nostack),
            );
        }
        if carry != 0 {
            Err(ret as i32)
        } else {
            Ok(ret)
        }
    }

    /// # Safety
    /// `buf` must be valid for reads of `count` bytes.
    pub unsafe fn write(fd: i32, buf: *const u8, count: usize) -> Result<usize> {
        // SAFETY: guaranteed by the caller.
        unsafe { syscall6(SYS_WRITE, fd as usize, buf as usize, count, 0, 0, 0) }
    }

    pub fn exit(status: i32) -> ! {
        // SAFETY: exit takes one integer and does not return.
        unsafe {
            let _ = syscall6(SYS_EXIT, status as usize, 0, 0, 0, 0, 0);
            core::hint::unreachable_unchecked()
        }
    }

    /// # Safety
    /// A FIXED mapping replaces whatever was previously at `addr`.
    pub unsafe fn mmap(
        addr: usize,
        len: usize,
        prot: u32,
        flags: u32,
        fd: i32,
        offset: usize,
    ) -> Result<usize> {
        // SAFETY: guaranteed by the caller.
        unsafe {
            syscall6(
                SYS_MMAP,
                addr,
                len,
                prot as usize,
                flags as usize,
                fd as usize,
                offset,
            )
        }
    }

    /// # Safety
    /// Unmapping a live range frees it out from under its users.
    pub unsafe fn munmap(addr: usize, len: usize) -> Result<usize> {
        // SAFETY: guaranteed by the caller.
        unsafe { syscall6(SYS_MUNMAP, addr, len, 0, 0, 0, 0) }
    }

    /// # Safety
    /// `vec` must be valid for one byte per page of the range.
    pub unsafe fn mincore(addr: usize, len: usize, vec: *mut u8) -> Result<usize> {
        // SAFETY: guaranteed by the caller.
        unsafe { syscall6(SYS_MINCORE, addr, len, vec as usize, 0, 0, 0) }
    }
}

const PROT_NONE: u32 = 0;
const MAP_PRIVATE: u32 = 0x0002;
const MAP_FIXED: u32 = 0x0010;
const MAP_NORESERVE: u32 = 0x0040;
const MAP_ANON: u32 = 0x1000;

const PAGE_SIZE: usize = 0x1000;

/// Address ranges to claim, same intent and hand-off layout as the ELF
/// side: the zero entry terminates the table the loaded program walks.
#[derive(Clone, Copy)]
#[repr(C)]
struct Zone {
    addr: usize,
    size: usize,
}

static ZONES: [Zone; 5] = [
    Zone { addr: 0x0000_0001_0000, size: 0x0010_0000 }, // DOS area
    Zone { addr: 0x0000_0011_0000, size: 0x67ef_0000 }, // low memory area
    Zone { addr: 0x0000_7ff0_0000, size: 0x000f_0000 }, // shared user data
    Zone { addr: 0x7fff_fe00_0000, size: 0x01ff_0000 }, // top-down allocations
    Zone { addr: 0, size: 0 },
];

/// Window the host loader must not hand out while it resolves the target.
const BUILTIN_DLL_BASE: usize = 0x7a00_0000;
const BUILTIN_DLL_SIZE: usize = 0x0200_0000;

const MH_MAGIC_64: u32 = 0xfeed_facf;
const LC_UNIXTHREAD: u32 = 0x5;
const LC_MAIN: u32 = 0x8000_0028;
const RTLD_NOW: i32 = 2;

#[repr(C)]
struct MachHeader64 {
    magic: u32,
    cputype: i32,
    cpusubtype: i32,
    filetype: u32,
    ncmds: u32,
    sizeofcmds: u32,
    flags: u32,
    reserved: u32,
}

#[repr(C)]
struct LoadCommand {
    cmd: u32,
    cmdsize: u32,
}

#[repr(C)]
struct EntryPointCommand {
    cmd: u32,
    cmdsize: u32,
    entryoff: u64,
    stacksize: u64,
}

/// In x86_THREAD_STATE64, rip is the 17th register slot after the
/// flavor/count words of the thread command.
const UNIXTHREAD_RIP_INDEX: usize = 16;

extern "C" {
    fn _dyld_func_lookup(name: *const u8, address: *mut *const core::ffi::c_void) -> i32;
}

struct DyldFuncs {
    dlopen: unsafe extern "C" fn(*const u8, i32) -> *mut core::ffi::c_void,
    dlsym: unsafe extern "C" fn(*mut core::ffi::c_void, *const u8) -> *mut core::ffi::c_void,
    image_count: unsafe extern "C" fn() -> u32,
    get_image_header: unsafe extern "C" fn(u32) -> *const MachHeader64,
    get_image_vmaddr_slide: unsafe extern "C" fn(u32) -> isize,
    get_image_name: unsafe extern "C" fn(u32) -> *const u8,
}

/// Resolve one host-loader function; a miss is fatal.
unsafe fn dyld_lookup(name: &'static [u8]) -> *const core::ffi::c_void {
    let mut addr = core::ptr::null();
    // SAFETY: `name` is NUL-terminated static data.
    let found = unsafe { _dyld_func_lookup(name.as_ptr(), &mut addr) };
    if found == 0 || addr.is_null() {
        let symbol = core::str::from_utf8(&name[..name.len() - 1]).unwrap_or("<dyld symbol>");
        error::fatal(LoaderError::DyldLookupFailed { symbol });
    }
    addr
}

unsafe fn dyld_funcs() -> DyldFuncs {
    // SAFETY: each pointer was just resolved and the signatures are dyld's
    // documented ones.
    unsafe {
        DyldFuncs {
            dlopen: core::mem::transmute(dyld_lookup(b"__dyld_dlopen\0")),
            dlsym: core::mem::transmute(dyld_lookup(b"__dyld_dlsym\0")),
            image_count: core::mem::transmute(dyld_lookup(b"__dyld_image_count\0")),
            get_image_header: core::mem::transmute(dyld_lookup(b"__dyld_get_image_header\0")),
            get_image_vmaddr_slide: core::mem::transmute(dyld_lookup(
                b"__dyld_get_image_vmaddr_slide\0",
            )),
            get_image_name: core::mem::transmute(dyld_lookup(b"__dyld_get_image_name\0")),
        }
    }
}

/// Is `[addr, addr+len)` entirely free of resident pages?
unsafe fn range_is_unresident(addr: usize, len: usize) -> bool {
    let mut vec = [0u8; 1024];
    let chunk = vec.len() * PAGE_SIZE;
    let mut off = 0;
    while off < len {
        let span = chunk.min(len - off);
        // SAFETY: `vec` covers one byte per page of `span`.
        match unsafe { sys::mincore(addr + off, span, vec.as_mut_ptr()) } {
            // An error means nothing is mapped there at all.
            Err(_) => {}
            Ok(_) => {
                let pages = (span + PAGE_SIZE - 1) / PAGE_SIZE;
                if vec[..pages].iter().any(|&b| b & 1 != 0) {
                    return false;
                }
            }
        }
        off += span;
    }
    true
}

/// Claim one zone. The kernel is free to ignore the address hint, so a
/// mapping that lands elsewhere is released, the target range is probed for
/// residency, and only a provably empty range is re-claimed with MAP_FIXED.
unsafe fn reserve_zone(zone: &Zone) {
    let flags = MAP_PRIVATE | MAP_ANON | MAP_NORESERVE;
    // SAFETY: a hinted (non-fixed) mapping cannot clobber anything.
    if let Ok(got) = unsafe { sys::mmap(zone.addr, zone.size, PROT_NONE, flags, -1, 0) } {
        if got == zone.addr {
            return;
        }
        // SAFETY: releasing the mapping we were just handed.
        let _ = unsafe { sys::munmap(got, zone.size) };
    }

    // SAFETY: residency probe reads nothing from the range itself.
    if unsafe { range_is_unresident(zone.addr, zone.size) } {
        // SAFETY: the range was just verified empty.
        if let Ok(got) =
            unsafe { sys::mmap(zone.addr, zone.size, PROT_NONE, flags | MAP_FIXED, -1, 0) }
        {
            if got == zone.addr {
                return;
            }
        }
    }
    warn!(
        "failed to reserve range {:#x}-{:#x}",
        zone.addr,
        zone.addr + zone.size
    );
}

/// Walk the loaded image's load commands for its entry point.
///
/// Returns `(address, is_main)`, preferring LC_MAIN over LC_UNIXTHREAD.
unsafe fn find_entry_point(header: *const MachHeader64, slide: isize) -> Option<(usize, bool)> {
    // SAFETY: dyld handed out this header.
    let ncmds = unsafe { (*header).ncmds };
    if unsafe { (*header).magic } != MH_MAGIC_64 {
        return None;
    }
    // SAFETY: load commands follow the header.
    let mut cmd = unsafe { header.add(1) as *const LoadCommand };
    let mut fallback = None;
    for _ in 0..ncmds {
        // SAFETY: dyld validated the command chain when it loaded the image.
        let lc = unsafe { cmd.read() };
        match lc.cmd {
            LC_MAIN => {
                // SAFETY: LC_MAIN commands are entry_point_command sized.
                let ep = unsafe { (cmd as *const EntryPointCommand).read() };
                return Some((header as usize + ep.entryoff as usize, true));
            }
            LC_UNIXTHREAD => {
                // SAFETY: the register state follows the flavor/count words.
                let regs = unsafe { (cmd.add(1) as *const u32).add(2) as *const u64 };
                // SAFETY: x86_THREAD_STATE64 has at least 17 registers.
                let rip = unsafe { regs.add(UNIXTHREAD_RIP_INDEX).read() };
                fallback = Some((rip as usize + slide as usize, false));
            }
            _ => {}
        }
        // SAFETY: cmdsize is the distance to the next command.
        cmd = unsafe { (cmd as *const u8).add(lc.cmdsize as usize) as *const LoadCommand };
    }
    fallback
}

/// What the trampoline needs to finish the hand-off.
#[repr(C)]
pub struct HandoffState {
    pub entry: usize,
    /// 0 = LC_UNIXTHREAD (jump with the raw stack), 1 = LC_MAIN (C call).
    pub kind: usize,
    pub argc: usize,
    pub argv: usize,
    pub envp: usize,
    pub apple: usize,
    pub stack: usize,
}

static mut HANDOFF: HandoffState = HandoffState {
    entry: 0,
    kind: 0,
    argc: 0,
    argv: 0,
    envp: 0,
    apple: 0,
    stack: 0,
};

/// Entry-trampoline callback: reserve, load through the host loader, find
/// the entry point, and fill the hand-off block.
///
/// # Safety
/// Must be called exactly once, from the entry trampoline, with `sp`
/// pointing at the kernel-formed initial stack.
pub unsafe extern "C" fn start(sp: *mut usize) -> *const HandoffState {
    crate::logger::init();

    // SAFETY: the kernel formed this stack: argc, argv..., NULL, envp...,
    // NULL, apple strings.
    let (argc, argv, envp, apple) = unsafe {
        let argc = sp.read();
        let argv = sp.add(1);
        let mut p = argv.add(argc + 1);
        let envp = p;
        while p.read() != 0 {
            p = p.add(1);
        }
        (argc, argv, envp, p.add(1))
    };

    if argc < 2 {
        // SAFETY: argv[0] is always present.
        let argv0 = unsafe { cstr::to_str(argv.read() as *const u8) };
        error::fatal(LoaderError::Usage { argv0 });
    }

    for zone in ZONES.iter() {
        if zone.size == 0 {
            break;
        }
        // Leave any zone containing the live stack alone.
        let stack_addr = sp as usize;
        if stack_addr >= zone.addr && stack_addr < zone.addr + zone.size {
            continue;
        }
        // SAFETY: the zone holds nothing of ours.
        unsafe { reserve_zone(zone) };
    }

    // Keep the host loader out of the builtin-DLL window while it resolves
    // the target image.
    // SAFETY: the window is inside a zone check above, claimed non-fixed.
    let placeholder = unsafe {
        sys::mmap(
            BUILTIN_DLL_BASE,
            BUILTIN_DLL_SIZE,
            PROT_NONE,
            MAP_PRIVATE | MAP_ANON | MAP_NORESERVE | MAP_FIXED,
            -1,
            0,
        )
    };

    // SAFETY: every pointer comes from dyld itself.
    let funcs = unsafe { dyld_funcs() };

    // SAFETY: argv[1] is a NUL-terminated path.
    let target = unsafe { argv.add(1).read() } as *const u8;
    // SAFETY: dlopen only reads the path.
    let module = unsafe { (funcs.dlopen)(target, RTLD_NOW) };
    if module.is_null() {
        // SAFETY: same NUL-terminated path.
        let path = unsafe { cstr::to_str(target) };
        error::fatal(LoaderError::HostLoadFailed { path });
    }

    // Publish the live reservation table to the loaded program.
    // SAFETY: dlsym only reads the name.
    let info = unsafe { (funcs.dlsym)(module, b"wine_main_preload_info\0".as_ptr()) };
    if info.is_null() {
        warn!("wine_main_preload_info not found");
    } else {
        // SAFETY: the symbol is a pointer-sized object inside the image.
        unsafe { (info as *mut *const Zone).write(ZONES.as_ptr()) };
    }

    if let Ok(addr) = placeholder {
        // SAFETY: releasing our own placeholder before entry discovery.
        let _ = unsafe { sys::munmap(addr, BUILTIN_DLL_SIZE) };
    }

    // The image dlopen just pulled in is the last one registered under the
    // target's path.
    // SAFETY: indices below image_count are valid dyld queries.
    let (header, slide) = unsafe {
        let count = (funcs.image_count)();
        let target_bytes = cstr::to_bytes(target);
        let mut found = None;
        for i in (0..count).rev() {
            let name = (funcs.get_image_name)(i);
            if !name.is_null() && cstr::to_bytes(name) == target_bytes {
                found = Some(i);
                break;
            }
        }
        let idx = found.unwrap_or(count - 1);
        ((funcs.get_image_header)(idx), (funcs.get_image_vmaddr_slide)(idx))
    };

    // SAFETY: the header was handed out by dyld.
    let (entry, is_main) = match unsafe { find_entry_point(header, slide) } {
        Some(found) => found,
        None => {
            // SAFETY: NUL-terminated path as above.
            let path = unsafe { cstr::to_str(target) };
            error::fatal(LoaderError::NoEntryPoint { path });
        }
    };

    // Drop the loader's own argument before the target sees the stack.
    // SAFETY: slot 1 is the old argv[0], no longer needed.
    unsafe {
        sp.add(1).write(argc - 1);
    }

    // SAFETY: single-threaded; the trampoline reads the block right after
    // this returns.
    unsafe {
        HANDOFF = HandoffState {
            entry,
            kind: is_main as usize,
            argc: argc - 1,
            argv: argv.add(1) as usize,
            envp: envp as usize,
            apple: apple as usize,
            stack: sp.add(1) as usize,
        };
        core::ptr::addr_of!(HANDOFF)
    }
}
