//! The high-level start routine.
//!
//! Runs between the entry trampoline and the jump into the loaded image:
//! decode the initial stack, reserve the address ranges, map the target and
//! its interpreter, publish the reservation table, rewrite the auxiliary
//! vector, and hand the entry point back to the trampoline.

use log::warn;

use crate::auxv::{
    self, AuxEntry, AT_BASE, AT_EGID, AT_ENTRY, AT_EUID, AT_FLAGS, AT_GID, AT_PAGESZ, AT_PHDR,
    AT_PHENT, AT_PHNUM, AT_SYSINFO, AT_SYSINFO_EHDR, AT_UID,
};
use crate::context::LoaderContext;
use crate::cstr;
use crate::elf::{hash, mapper, ElfPhdr, STT_OBJECT};
use crate::error::{self, LoaderError};
use crate::reserve::{self, PreloadRange, PRELOAD_TABLE};
use crate::stack;
use crate::syscall;

const RESERVE_ENV: &[u8] = b"WINEPRELOADRESERVE=";
const PRELOAD_INFO_SYMBOL: &[u8] = b"wine_main_preload_info";

extern "C" {
    // Linker-provided bounds of the loader's own image.
    static __executable_start: u8;
    static _end: u8;
}

/// Entry-trampoline callback.
///
/// `stack_slot` points at the saved initial stack pointer; the adjusted
/// stack top is written back through it. Returns the address the trampoline
/// must enter.
///
/// # Safety
/// Must be called exactly once, from the entry trampoline, with `stack_slot`
/// pointing at the saved kernel-provided stack pointer.
pub unsafe extern "C" fn start(stack_slot: *mut *mut u8) -> usize {
    crate::logger::init();

    // SAFETY: the trampoline stored the kernel-provided stack pointer there.
    let sp = unsafe { stack_slot.read() } as *mut usize;
    // SAFETY: the kernel formed this stack.
    let layout = unsafe { stack::read_layout(sp) };

    if layout.argc < 2 {
        // SAFETY: argv[0] is always present and NUL-terminated.
        let argv0 = unsafe { cstr::to_str(layout.argv.read()) };
        error::fatal(LoaderError::Usage { argv0 });
    }

    // SAFETY: the auxv was located by the stack walk above.
    let page_size = unsafe { auxv::get_auxiliary(layout.auxv, AT_PAGESZ, 0x1000) };
    // SAFETY: only the addresses of the linker-provided symbols are taken.
    let (image_start, image_end) = unsafe {
        (
            core::ptr::addr_of!(__executable_start) as usize,
            core::ptr::addr_of!(_end) as usize,
        )
    };
    let ctx = LoaderContext::new(page_size, image_start, image_end);

    // SAFETY: single-threaded; this is the only live reference.
    let ranges = unsafe { PRELOAD_TABLE.ranges_mut() };

    // SAFETY: the environment block is part of the decoded stack.
    if let Some(spec_ptr) = unsafe { stack::find_env(&layout, RESERVE_ENV) } {
        // SAFETY: environment values are NUL-terminated.
        let spec = unsafe { cstr::to_bytes(spec_ptr) };
        match reserve::parse_reserve_spec(spec, ctx.page_mask) {
            Ok(Some(range)) => reserve::apply_user_range(ranges, &ctx, range),
            Ok(None) => {}
            Err(()) => {
                // SAFETY: same NUL-terminated value as above.
                let value = unsafe { cstr::to_str(spec_ptr) };
                error::fatal(LoaderError::InvalidReserveSpec { value });
            }
        }
    }

    // SAFETY: the live stack window is passed so no reservation can pave
    // over it; everything else in the table is fair game.
    unsafe { reserve::reserve_ranges(ranges, layout.argc_ptr as usize, layout.auxv as usize) };
    #[cfg(target_arch = "x86")]
    reserve::protect_exec_top_page(ranges, &ctx);

    // SAFETY: argc >= 2 was checked; argv[1] is NUL-terminated.
    let target = unsafe { layout.argv.add(1).read() };
    // SAFETY: the target path comes from argv.
    let main_map =
        unsafe { mapper::map_image(target, &ctx) }.unwrap_or_else(|e| error::fatal(e));

    // Load the interpreter the image names; a static image is entered
    // directly.
    let (handoff_entry, interp_base) = if main_map.l_interp != 0 {
        let path = main_map.l_addr.wrapping_add(main_map.l_interp) as *const u8;
        // SAFETY: PT_INTERP points at a NUL-terminated path inside the
        // mapped image.
        let interp_map =
            unsafe { mapper::map_image(path, &ctx) }.unwrap_or_else(|e| error::fatal(e));
        (interp_map.l_entry, interp_map.l_addr)
    } else {
        (main_map.l_entry, 0)
    };

    // Publish the live reservation table to the loaded program.
    // SAFETY: the main image is fully mapped.
    match unsafe { hash::find_symbol(&main_map, PRELOAD_INFO_SYMBOL, STT_OBJECT) } {
        // SAFETY: the symbol is a pointer-sized object inside the image.
        Some(addr) => unsafe { (addr as *mut *mut PreloadRange).write(PRELOAD_TABLE.base()) },
        None => warn!("wine_main_preload_info not found"),
    }

    let av = layout.auxv;
    // SAFETY: `av` stays valid for the whole routine.
    let get = |tag, default| unsafe { auxv::get_auxiliary(av, tag, default) };
    let new_av = [
        AuxEntry::new(AT_PHDR, main_map.l_phdr as usize),
        AuxEntry::new(AT_PHENT, core::mem::size_of::<ElfPhdr>()),
        AuxEntry::new(AT_PHNUM, main_map.l_phnum),
        AuxEntry::new(AT_PAGESZ, page_size),
        AuxEntry::new(AT_BASE, interp_base),
        AuxEntry::new(AT_FLAGS, get(AT_FLAGS, 0)),
        AuxEntry::new(AT_ENTRY, main_map.l_entry),
        AuxEntry::new(AT_UID, get(AT_UID, syscall::getuid())),
        AuxEntry::new(AT_EUID, get(AT_EUID, syscall::geteuid())),
        AuxEntry::new(AT_GID, get(AT_GID, syscall::getgid())),
        AuxEntry::new(AT_EGID, get(AT_EGID, syscall::getegid())),
    ];

    // The vDSO entries must not survive if their pages were just paved over.
    let mut delete = [0usize; auxv::DELETE_CAPACITY];
    let mut ndelete = 0;
    let sysinfo = get(AT_SYSINFO, 0);
    let sysinfo_ehdr = get(AT_SYSINFO_EHDR, 0);
    if (sysinfo != 0 && reserve::is_addr_reserved(ranges, sysinfo))
        || (sysinfo_ehdr != 0 && reserve::is_addr_reserved(ranges, sysinfo_ehdr))
    {
        delete[ndelete] = AT_SYSINFO;
        ndelete += 1;
        delete[ndelete] = AT_SYSINFO_EHDR;
        ndelete += 1;
    }

    // SAFETY: argc >= 2; argv strings are the kernel's contiguous block.
    unsafe { stack::set_process_name(layout.argc, layout.argv) };
    // SAFETY: writes only the slot the dropped argument frees up.
    unsafe { stack::drop_first_arg(&layout, stack_slot) };
    // SAFETY: the auxv and the window below it are live stack memory.
    unsafe { auxv::rewrite(av, &new_av, &delete[..ndelete], stack_slot) };

    handoff_entry
}
