//! User-space mapping of one ELF image.
//!
//! This reproduces what the kernel's binfmt_elf loader normally does for an
//! executable: walk the program headers, map every PT_LOAD with the right
//! protections and file offsets, zero the data-segment tail, back the BSS
//! overflow with anonymous pages, and record where everything ended up.

use crate::context::LoaderContext;
use crate::cstr;
use crate::error::LoaderError;
use crate::syscall::{self, MapFlags, Prot};

use super::{
    ElfDyn, ElfPhdr, ET_DYN, PF_R, PF_W, PF_X, PT_DYNAMIC, PT_INTERP, PT_LOAD, PT_PHDR, PT_TLS,
};

/// Fixed bound on PT_LOAD entries; images with more are rejected up front.
pub const MAX_LOAD_COMMANDS: usize = 16;

/// The identity, program headers and interpreter path of every real-world
/// image fit comfortably in the first 2 KiB.
const HEADER_BUFFER_SIZE: usize = 2048;

/// One PT_LOAD reduced to mapping terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LoadCmd {
    /// Segment start, rounded down by the segment alignment.
    pub map_start: usize,
    /// End of the file-backed part, rounded up to a page.
    pub map_end: usize,
    /// Exact end of the file-backed part.
    pub data_end: usize,
    /// End of the in-memory image (BSS included).
    pub alloc_end: usize,
    /// File offset matching `map_start`.
    pub offset: usize,
    pub prot: Prot,
}

impl LoadCmd {
    const fn empty() -> Self {
        Self {
            map_start: 0,
            map_end: 0,
            data_end: 0,
            alloc_end: 0,
            offset: 0,
            prot: Prot::empty(),
        }
    }
}

/// Everything the program-header walk produces.
#[derive(Debug)]
pub(crate) struct HeaderInfo {
    pub cmds: [LoadCmd; MAX_LOAD_COMMANDS],
    pub ncmds: usize,
    pub dynamic_vaddr: usize,
    pub dynamic_count: usize,
    /// From PT_PHDR when present; otherwise found inside a mapped segment.
    pub phdr_vaddr: Option<usize>,
    pub interp_vaddr: usize,
}

/// One loaded image.
#[derive(Debug, Clone, Copy)]
pub struct LinkMap {
    /// Difference between runtime addresses and the image's own vaddrs.
    pub l_addr: usize,
    pub l_phdr: *const ElfPhdr,
    pub l_phnum: usize,
    /// Biased entry point.
    pub l_entry: usize,
    /// PT_INTERP vaddr offset; 0 when the image names no interpreter.
    pub l_interp: usize,
    pub l_ld: *const ElfDyn,
    pub l_ldnum: usize,
    pub l_map_start: usize,
    pub l_map_end: usize,
}

fn prot_from_flags(flags: u32) -> Prot {
    let mut prot = Prot::empty();
    if flags & PF_R != 0 {
        prot |= Prot::READ;
    }
    if flags & PF_W != 0 {
        prot |= Prot::WRITE;
    }
    if flags & PF_X != 0 {
        prot |= Prot::EXEC;
    }
    prot
}

/// Reduce the program headers to load commands plus the table locations the
/// later stages need.
pub(crate) fn build_load_commands<'a>(
    phdrs: &[ElfPhdr],
    ctx: &LoaderContext,
    path: &'a str,
) -> Result<HeaderInfo, LoaderError<'a>> {
    let mut info = HeaderInfo {
        cmds: [LoadCmd::empty(); MAX_LOAD_COMMANDS],
        ncmds: 0,
        dynamic_vaddr: 0,
        dynamic_count: 0,
        phdr_vaddr: None,
        interp_vaddr: 0,
    };

    for ph in phdrs {
        match ph.p_type {
            PT_DYNAMIC => {
                info.dynamic_vaddr = ph.p_vaddr;
                info.dynamic_count = ph.p_filesz / core::mem::size_of::<ElfDyn>();
            }
            PT_PHDR => info.phdr_vaddr = Some(ph.p_vaddr),
            PT_INTERP => info.interp_vaddr = ph.p_vaddr,
            PT_LOAD => {
                if ph.p_align < ctx.page_size || ph.p_align & ctx.page_mask != 0 {
                    return Err(LoaderError::BadAlignment {
                        path,
                        align: ph.p_align,
                    });
                }
                if ph.p_vaddr.wrapping_sub(ph.p_offset) & (ph.p_align - 1) != 0 {
                    return Err(LoaderError::MisalignedSegment { path });
                }
                if ph.p_filesz > ph.p_memsz {
                    return Err(LoaderError::BadSegmentSize { path });
                }
                assert!(info.ncmds < MAX_LOAD_COMMANDS, "load command overflow");
                info.cmds[info.ncmds] = LoadCmd {
                    map_start: ph.p_vaddr & !(ph.p_align - 1),
                    map_end: ctx.page_align_up(ph.p_vaddr + ph.p_filesz),
                    data_end: ph.p_vaddr + ph.p_filesz,
                    alloc_end: ph.p_vaddr + ph.p_memsz,
                    offset: ph.p_offset & !(ph.p_align - 1),
                    prot: prot_from_flags(ph.p_flags),
                };
                info.ncmds += 1;
            }
            // TLS is the interpreter's business, later and with full
            // knowledge of every loaded object.
            PT_TLS => {}
            _ => {}
        }
    }

    if info.ncmds == 0 {
        return Err(LoaderError::NoLoadSegments { path });
    }
    Ok(info)
}

/// Zero the BSS head inside the last file-backed page, then back the rest of
/// the allocation with anonymous pages.
unsafe fn zero_fill_tail(cmd: &LoadCmd, l_addr: usize, ctx: &LoaderContext) {
    let zero = l_addr.wrapping_add(cmd.data_end);
    let zero_end = l_addr.wrapping_add(cmd.alloc_end);
    let zero_page = ctx.page_align_up(zero).min(zero_end);

    if zero_page > zero {
        let page = ctx.page_align_down(zero);
        if !cmd.prot.contains(Prot::WRITE) {
            // SAFETY: the page belongs to the segment just mapped.
            let _ = unsafe { syscall::mprotect(page, ctx.page_size, cmd.prot | Prot::WRITE) };
        }
        // SAFETY: the range sits inside the segment's final file-backed page.
        unsafe { core::ptr::write_bytes(zero as *mut u8, 0, zero_page - zero) };
        if !cmd.prot.contains(Prot::WRITE) {
            // SAFETY: restoring the protection recorded in the load command.
            let _ = unsafe { syscall::mprotect(page, ctx.page_size, cmd.prot) };
        }
    }

    if zero_end > zero_page {
        // SAFETY: the pages lie inside the image extent this process owns.
        let _ = unsafe {
            syscall::mmap(
                zero_page,
                zero_end - zero_page,
                cmd.prot,
                MapFlags::FIXED | MapFlags::PRIVATE | MapFlags::ANONYMOUS,
                -1,
                0,
            )
        };
    }
}

/// Map the image at `path_ptr` into this process.
///
/// Position-independent images go wherever the kernel picks; fixed images go
/// to their linked addresses after a fatal check against the loader's own
/// extent.
///
/// # Safety
/// `path_ptr` must be a NUL-terminated path. Mapping a fixed image replaces
/// whatever its linked range previously held.
pub unsafe fn map_image<'a>(
    path_ptr: *const u8,
    ctx: &LoaderContext,
) -> Result<LinkMap, LoaderError<'a>> {
    // SAFETY: NUL termination per the contract.
    let path = unsafe { cstr::to_str(path_ptr) };

    // SAFETY: as above.
    let fd = unsafe { syscall::open_readonly(path_ptr) }
        .map_err(|errno| LoaderError::OpenFailed { path, errno })?;

    let mut buffer = [0u8; HEADER_BUFFER_SIZE];
    // SAFETY: the buffer is writable for its whole length.
    let have = unsafe { syscall::read(fd, buffer.as_mut_ptr(), HEADER_BUFFER_SIZE) }.unwrap_or(0);

    let header = super::validate_header(&buffer[..have], path)?;

    if header.e_type != ET_DYN && header.e_type != super::ET_EXEC {
        return Err(LoaderError::WrongType {
            path,
            e_type: header.e_type,
        });
    }

    let phnum = header.e_phnum as usize;
    let phentsize = header.e_phentsize as usize;
    if phnum > MAX_LOAD_COMMANDS {
        return Err(LoaderError::TooManyHeaders {
            path,
            count: header.e_phnum,
        });
    }
    if phentsize != core::mem::size_of::<ElfPhdr>()
        || header.e_phoff.checked_add(phnum * phentsize).is_none()
        || header.e_phoff + phnum * phentsize > have
    {
        return Err(LoaderError::BadHeaderTable { path });
    }

    let mut phdrs = [ElfPhdr::default(); MAX_LOAD_COMMANDS];
    for (i, slot) in phdrs[..phnum].iter_mut().enumerate() {
        // SAFETY: bounds were checked against the bytes actually read.
        *slot = unsafe {
            (buffer.as_ptr().add(header.e_phoff + i * phentsize) as *const ElfPhdr)
                .read_unaligned()
        };
    }

    let info = build_load_commands(&phdrs[..phnum], ctx, path)?;
    let cmds = &info.cmds[..info.ncmds];
    let first = cmds[0];
    let map_length = cmds[info.ncmds - 1].alloc_end - first.map_start;

    let l_addr;
    let l_map_start;
    if header.e_type == ET_DYN {
        // One covering mapping wherever the kernel likes; the bias falls out
        // of the address it picks. Everything past the first segment's
        // file-backed end is fenced off until the loop below re-maps it.
        // SAFETY: the kernel chooses the placement.
        let base = unsafe {
            syscall::mmap(
                0,
                map_length,
                first.prot,
                MapFlags::PRIVATE,
                fd,
                first.offset,
            )
        }
        .map_err(|errno| LoaderError::MapFailed { path, errno })?;
        l_map_start = base;
        l_addr = base.wrapping_sub(first.map_start);

        let first_span = first.map_end - first.map_start;
        if map_length > first_span {
            // SAFETY: inside the extent just mapped.
            let _ = unsafe {
                syscall::mprotect(base + first_span, map_length - first_span, Prot::empty())
            };
        }
    } else {
        let start = first.map_start;
        if ctx.overlaps_loader(start, start + map_length) {
            return Err(LoaderError::OverlapsLoader {
                path_start: start,
                path_end: start + map_length,
                loader_start: ctx.loader_start,
                loader_end: ctx.loader_end,
            });
        }
        l_addr = 0;
        l_map_start = start;
    }
    let l_map_end = l_map_start + map_length;

    let mut phdr_vaddr = info.phdr_vaddr;
    for (idx, cmd) in cmds.iter().enumerate() {
        // The covering ET_DYN mapping already holds the first segment.
        let already_mapped = header.e_type == ET_DYN && idx == 0;
        if !already_mapped && cmd.map_end > cmd.map_start {
            // SAFETY: the target range is inside the image extent (ET_DYN)
            // or was just checked against the loader (ET_EXEC).
            unsafe {
                syscall::mmap(
                    l_addr.wrapping_add(cmd.map_start),
                    cmd.map_end - cmd.map_start,
                    cmd.prot,
                    MapFlags::FIXED | MapFlags::PRIVATE,
                    fd,
                    cmd.offset,
                )
            }
            .map_err(|errno| LoaderError::MapFailed { path, errno })?;
        }

        if phdr_vaddr.is_none()
            && cmd.offset <= header.e_phoff
            && cmd.offset + (cmd.map_end - cmd.map_start) >= header.e_phoff + phnum * phentsize
        {
            phdr_vaddr = Some(cmd.map_start + header.e_phoff - cmd.offset);
        }

        if cmd.alloc_end > cmd.data_end {
            // SAFETY: the segment was mapped above.
            unsafe { zero_fill_tail(cmd, l_addr, ctx) };
        }
    }

    let _ = syscall::close(fd);

    let phdr_vaddr = phdr_vaddr.ok_or(LoaderError::NoProgramHeader { path })?;

    Ok(LinkMap {
        l_addr,
        l_phdr: l_addr.wrapping_add(phdr_vaddr) as *const ElfPhdr,
        l_phnum: phnum,
        l_entry: l_addr.wrapping_add(header.e_entry),
        l_interp: info.interp_vaddr,
        l_ld: if info.dynamic_vaddr != 0 {
            l_addr.wrapping_add(info.dynamic_vaddr) as *const ElfDyn
        } else {
            core::ptr::null()
        },
        l_ldnum: info.dynamic_count,
        l_map_start,
        l_map_end,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctx() -> LoaderContext {
        LoaderContext::new(0x1000, 0x7c40_0000, 0x7c50_0000)
    }

    fn load_phdr(vaddr: usize, offset: usize, filesz: usize, memsz: usize, flags: u32) -> ElfPhdr {
        ElfPhdr {
            p_type: PT_LOAD,
            p_flags: flags,
            p_offset: offset,
            p_vaddr: vaddr,
            p_paddr: vaddr,
            p_filesz: filesz,
            p_memsz: memsz,
            p_align: 0x1000,
        }
    }

    #[test]
    fn derives_page_rounded_load_commands() {
        let phdrs = [
            load_phdr(0, 0, 0x1234, 0x1234, PF_R | PF_X),
            load_phdr(0x2000, 0x2000, 0x800, 0x1800, PF_R | PF_W),
        ];
        let info = build_load_commands(&phdrs, &test_ctx(), "test").unwrap();
        assert_eq!(info.ncmds, 2);

        let text = info.cmds[0];
        assert_eq!(text.map_start, 0);
        assert_eq!(text.map_end, 0x2000);
        assert_eq!(text.data_end, 0x1234);
        assert_eq!(text.alloc_end, 0x1234);
        assert_eq!(text.offset, 0);
        assert_eq!(text.prot, Prot::READ | Prot::EXEC);

        let data = info.cmds[1];
        assert_eq!(data.map_start, 0x2000);
        assert_eq!(data.map_end, 0x3000);
        assert_eq!(data.data_end, 0x2800);
        assert_eq!(data.alloc_end, 0x3800);
        assert_eq!(data.prot, Prot::READ | Prot::WRITE);
    }

    #[test]
    fn records_the_table_locations() {
        let mut dynamic = load_phdr(0x3000, 0x3000, 0x100, 0x100, PF_R | PF_W);
        dynamic.p_type = PT_DYNAMIC;
        let mut interp = load_phdr(0x200, 0x200, 0x20, 0x20, PF_R);
        interp.p_type = PT_INTERP;
        let mut phdr = load_phdr(0x40, 0x40, 0x200, 0x200, PF_R);
        phdr.p_type = PT_PHDR;

        let phdrs = [phdr, interp, load_phdr(0, 0, 0x4000, 0x4000, PF_R | PF_X), dynamic];
        let info = build_load_commands(&phdrs, &test_ctx(), "test").unwrap();
        assert_eq!(info.ncmds, 1);
        assert_eq!(info.phdr_vaddr, Some(0x40));
        assert_eq!(info.interp_vaddr, 0x200);
        assert_eq!(info.dynamic_vaddr, 0x3000);
        assert_eq!(
            info.dynamic_count,
            0x100 / core::mem::size_of::<ElfDyn>()
        );
    }

    #[test]
    fn tls_segments_are_ignored() {
        let mut tls = load_phdr(0x5000, 0x5000, 0x100, 0x200, PF_R);
        tls.p_type = PT_TLS;
        let phdrs = [load_phdr(0, 0, 0x1000, 0x1000, PF_R | PF_X), tls];
        let info = build_load_commands(&phdrs, &test_ctx(), "test").unwrap();
        assert_eq!(info.ncmds, 1);
    }

    #[test]
    fn rejects_sub_page_alignment() {
        let mut ph = load_phdr(0, 0, 0x1000, 0x1000, PF_R);
        ph.p_align = 0x10;
        let err = build_load_commands(&[ph], &test_ctx(), "t").unwrap_err();
        assert_eq!(err, LoaderError::BadAlignment { path: "t", align: 0x10 });
    }

    #[test]
    fn rejects_vaddr_offset_skew() {
        let ph = load_phdr(0x1800, 0x1000, 0x1000, 0x1000, PF_R);
        let err = build_load_commands(&[ph], &test_ctx(), "t").unwrap_err();
        assert_eq!(err, LoaderError::MisalignedSegment { path: "t" });
    }

    #[test]
    fn rejects_filesz_beyond_memsz() {
        let ph = load_phdr(0, 0, 0x2000, 0x1000, PF_R);
        let err = build_load_commands(&[ph], &test_ctx(), "t").unwrap_err();
        assert_eq!(err, LoaderError::BadSegmentSize { path: "t" });
    }

    #[test]
    fn rejects_an_image_with_no_load_segments() {
        let mut ph = load_phdr(0, 0, 0x100, 0x100, PF_R);
        ph.p_type = PT_DYNAMIC;
        let err = build_load_commands(&[ph], &test_ctx(), "t").unwrap_err();
        assert_eq!(err, LoaderError::NoLoadSegments { path: "t" });
    }

    #[test]
    fn maps_a_real_image() {
        // The test binary itself is a valid image for the build machine.
        let map = unsafe { map_image(b"/proc/self/exe\0".as_ptr(), &test_ctx()) }
            .expect("mapping /proc/self/exe failed");

        assert!(map.l_phnum > 0);
        assert!(map.l_map_end > map.l_map_start);
        assert!(map.l_entry >= map.l_map_start && map.l_entry < map.l_map_end);
        assert!(!map.l_ld.is_null());

        // The recorded header table must be readable and contain the
        // PT_LOADs that produced the mapping.
        let phdrs =
            unsafe { core::slice::from_raw_parts(map.l_phdr, map.l_phnum) };
        assert!(phdrs.iter().any(|ph| ph.p_type == PT_LOAD));

        // A dynamically linked test runner names its interpreter.
        if map.l_interp != 0 {
            let path = unsafe { cstr::to_str((map.l_addr + map.l_interp) as *const u8) };
            assert!(path.contains("ld"), "unexpected interpreter {path}");
        }

        unsafe { syscall::munmap(map.l_map_start, map.l_map_end - map.l_map_start) }.unwrap();
    }

    #[test]
    fn open_failure_is_reported_with_the_path() {
        let err = unsafe { map_image(b"/no/such/image\0".as_ptr(), &test_ctx()) }.unwrap_err();
        assert!(matches!(err, LoaderError::OpenFailed { path: "/no/such/image", .. }));
    }
}
