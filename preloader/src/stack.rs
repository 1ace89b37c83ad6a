//! Walking and editing the kernel-provided initial stack.
//!
//! At process entry the stack holds, from the stack pointer up: argc, the
//! argv pointers, a NULL, the envp pointers, a NULL, and the auxiliary
//! vector. The loader reads all of it, removes its own leading argument
//! before hand-off, and compacts the argv strings so process listings show
//! the target program.

use crate::auxv::AuxEntry;
use crate::cstr;

#[cfg(target_os = "linux")]
use linux_raw_sys::prctl::PR_SET_NAME;

/// Decoded view of the initial stack.
#[derive(Debug, Clone, Copy)]
pub struct StackLayout {
    pub argc_ptr: *mut usize,
    pub argc: usize,
    pub argv: *mut *mut u8,
    pub envp: *mut *mut u8,
    pub auxv: *mut AuxEntry,
}

/// Decode the initial stack starting at `sp` (which points at argc).
///
/// # Safety
/// `sp` must point at a kernel-formed initial stack.
pub unsafe fn read_layout(sp: *mut usize) -> StackLayout {
    // SAFETY: layout guaranteed by the caller.
    unsafe {
        let argc = sp.read();
        let argv = sp.add(1) as *mut *mut u8;
        let envp = argv.add(argc + 1);
        let mut p = envp;
        while !p.read().is_null() {
            p = p.add(1);
        }
        StackLayout {
            argc_ptr: sp,
            argc,
            argv,
            envp,
            auxv: p.add(1) as *mut AuxEntry,
        }
    }
}

/// Value of the first environment entry starting with `prefix`, as a pointer
/// to the byte right after the prefix.
///
/// # Safety
/// The layout must describe a live initial stack.
pub unsafe fn find_env(layout: &StackLayout, prefix: &[u8]) -> Option<*const u8> {
    let mut p = layout.envp;
    // SAFETY: envp is NULL-terminated per the stack layout.
    while let Some(entry) = unsafe { p.read().as_ref() } {
        // SAFETY: environment entries are NUL-terminated strings.
        let bytes = unsafe { cstr::to_bytes(entry) };
        if bytes.len() >= prefix.len() && &bytes[..prefix.len()] == prefix {
            // SAFETY: inside the same string.
            return Some(unsafe { (entry as *const u8).add(prefix.len()) });
        }
        // SAFETY: still inside the pointer array.
        p = unsafe { p.add(1) };
    }
    None
}

/// Remove the leading argument: write the decremented argc one slot up and
/// report the new stack top through `stack`.
///
/// # Safety
/// The layout must describe a live initial stack and `stack` must be
/// writable.
pub unsafe fn drop_first_arg(layout: &StackLayout, stack: *mut *mut u8) {
    // SAFETY: slot 1 is the old argv[0] pointer, no longer needed.
    unsafe {
        layout.argc_ptr.add(1).write(layout.argc - 1);
        stack.write(layout.argc_ptr.add(1) as *mut u8);
    }
}

/// Set the process short name to the basename of argv[1] and slide the
/// argument strings down over argv[0] so external listings show the loaded
/// program instead of the loader.
///
/// # Safety
/// `argv` must hold at least `argc >= 2` pointers into the contiguous
/// argument-string block of a live initial stack.
pub unsafe fn set_process_name(argc: usize, argv: *mut *mut u8) {
    // SAFETY: argv[1] is a NUL-terminated string per the contract.
    let target = unsafe { cstr::to_bytes(argv.add(1).read()) };
    let name = cstr::basename(target);
    #[cfg(target_os = "linux")]
    // SAFETY: PR_SET_NAME reads a NUL-terminated string; `name` is a suffix
    // of a NUL-terminated argument. Failure only means the kernel keeps the
    // old name.
    let _ = unsafe { crate::syscall::prctl(PR_SET_NAME, name.as_ptr() as usize) };

    // The argument strings sit back to back; slide everything from argv[1]
    // through the end of the last argument down over argv[0]'s string.
    // SAFETY: all pointers index the contiguous argument block.
    unsafe {
        let first = argv.read();
        let second = argv.add(1).read();
        let off = second.offset_from(first) as usize;

        let last = argv.add(argc - 1).read();
        let mut end = last.add(cstr::strlen(last));
        end = end.add(1); // keep the final terminator

        let len = end.offset_from(second) as usize;
        core::ptr::copy(second, first, len);
        core::ptr::write_bytes(end.sub(off), 0, off);

        for i in 1..argc {
            let p = argv.add(i);
            p.write(p.read().sub(off));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auxv::{AT_NULL, AT_PAGESZ};
    use std::vec;
    use std::vec::Vec;

    /// A synthetic initial stack: argc, argv pointers, NULL, envp pointers,
    /// NULL, auxv, all pointing into one contiguous string block.
    struct FakeStack {
        words: Vec<usize>,
        _strings: Vec<u8>,
        _envs: Vec<Vec<u8>>,
    }

    impl FakeStack {
        fn new(args: &[&[u8]], envs: &[&[u8]]) -> Self {
            let mut strings = vec![0u8; 0];
            let mut arg_offsets = Vec::new();
            for a in args {
                arg_offsets.push(strings.len());
                strings.extend_from_slice(a);
                strings.push(0);
            }
            // Room for the compaction to zero the freed tail.
            strings.extend_from_slice(&[0xff; 8]);

            let envs: Vec<Vec<u8>> = envs
                .iter()
                .map(|e| {
                    let mut v = e.to_vec();
                    v.push(0);
                    v
                })
                .collect();

            let mut words = Vec::new();
            words.push(args.len());
            for off in &arg_offsets {
                words.push(strings.as_ptr() as usize + off);
            }
            words.push(0);
            for e in &envs {
                words.push(e.as_ptr() as usize);
            }
            words.push(0);
            words.push(AT_PAGESZ);
            words.push(0x1000);
            words.push(AT_NULL);
            words.push(0);

            Self {
                words,
                _strings: strings,
                _envs: envs,
            }
        }

        fn sp(&mut self) -> *mut usize {
            self.words.as_mut_ptr()
        }
    }

    #[test]
    fn decodes_argc_argv_envp_auxv() {
        let mut stack = FakeStack::new(&[b"loader", b"/usr/bin/wine"], &[b"HOME=/root"]);
        let layout = unsafe { read_layout(stack.sp()) };
        assert_eq!(layout.argc, 2);
        unsafe {
            assert_eq!(cstr::to_bytes(layout.argv.read()), b"loader");
            assert_eq!(cstr::to_bytes(layout.argv.add(1).read()), b"/usr/bin/wine");
            assert_eq!(cstr::to_bytes(layout.envp.read()), b"HOME=/root");
            assert_eq!(crate::auxv::get_auxiliary(layout.auxv, AT_PAGESZ, 0), 0x1000);
        }
    }

    #[test]
    fn finds_the_reserve_variable() {
        let mut stack = FakeStack::new(
            &[b"loader", b"wine"],
            &[b"HOME=/root", b"WINEPRELOADRESERVE=10000-20000", b"TERM=xterm"],
        );
        let layout = unsafe { read_layout(stack.sp()) };
        let value = unsafe { find_env(&layout, b"WINEPRELOADRESERVE=") }.unwrap();
        assert_eq!(unsafe { cstr::to_bytes(value) }, b"10000-20000");
        assert!(unsafe { find_env(&layout, b"WINEDEBUG=") }.is_none());
    }

    #[test]
    fn drops_the_leading_argument() {
        let mut stack = FakeStack::new(&[b"loader", b"wine", b"cmd.exe"], &[]);
        let layout = unsafe { read_layout(stack.sp()) };
        let mut top = layout.argc_ptr as *mut u8;
        unsafe { drop_first_arg(&layout, &mut top) };

        let new_layout = unsafe { read_layout(top as *mut usize) };
        assert_eq!(new_layout.argc, 2);
        unsafe {
            assert_eq!(cstr::to_bytes(new_layout.argv.read()), b"wine");
            assert_eq!(cstr::to_bytes(new_layout.argv.add(1).read()), b"cmd.exe");
        }
    }

    #[test]
    fn compaction_slides_strings_over_argv0() {
        let mut stack = FakeStack::new(&[b"loader", b"/usr/bin/wine", b"cmd.exe"], &[]);
        let layout = unsafe { read_layout(stack.sp()) };
        let base = unsafe { layout.argv.read() };
        unsafe { set_process_name(layout.argc, layout.argv) };

        unsafe {
            // argv[1] now starts where argv[0]'s string began.
            assert_eq!(layout.argv.add(1).read(), base);
            assert_eq!(cstr::to_bytes(layout.argv.add(1).read()), b"/usr/bin/wine");
            assert_eq!(cstr::to_bytes(layout.argv.add(2).read()), b"cmd.exe");
        }
    }
}
