//! The loader binary: entry trampolines and the panic backstop.
//!
//! `_start` is the literal first instruction of the process. It has to run
//! on the kernel-provided stack before any runtime exists, so each
//! architecture gets a hand-written naked trampoline: save the incoming
//! stack pointer, make room for auxiliary-vector growth, give the compiled
//! code a scratch TLS block to keep stack-protector prologues from
//! faulting, call the start routine, then enter the returned address with
//! the register state of a freshly exec'd process.

#![no_std]
#![no_main]

use core::panic::PanicInfo;

use preloader as _;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod entry {
    use core::arch::naked_asm;

    /// Scratch thread block; stack-protector reads of fs:0x28 land here.
    /// The contents are never interpreted.
    #[repr(align(64))]
    struct TlsBlock([u8; 256]);

    static mut TLS_BLOCK: TlsBlock = TlsBlock([0; 256]);

    /// arch_prctl code to point %fs at a new base.
    const ARCH_SET_FS: u32 = 0x1002;

    #[unsafe(naked)]
    #[no_mangle]
    unsafe extern "C" fn _start() -> ! {
        naked_asm!(
            // Save the kernel-provided stack pointer below a scratch area
            // big enough for the auxv rewrite to grow into.
            "mov rax, rsp",
            "lea rsp, [rsp - 256]",
            "mov [rsp], rax",
            // Install the scratch TLS block.
            "lea rsi, [rip + {tls}]",
            "mov edi, {arch_set_fs}",
            "mov eax, {nr_arch_prctl}",
            "syscall",
            // start(&saved_stack_pointer) -> entry address
            "mov rdi, rsp",
            "call {start}",
            "mov r12, rax",
            // Drop the TLS block again; TLS belongs to the interpreter now.
            "xor esi, esi",
            "mov edi, {arch_set_fs}",
            "mov eax, {nr_arch_prctl}",
            "syscall",
            // Enter the image on the rewritten stack with clean registers.
            "mov rsp, [rsp]",
            "push r12",
            "xor eax, eax",
            "xor ebx, ebx",
            "xor ecx, ecx",
            "xor edx, edx",
            "xor esi, esi",
            "xor edi, edi",
            "xor ebp, ebp",
            "xor r8d, r8d",
            "xor r9d, r9d",
            "xor r10d, r10d",
            "xor r11d, r11d",
            "xor r12d, r12d",
            "xor r13d, r13d",
            "xor r14d, r14d",
            "xor r15d, r15d",
            "ret",
            tls = sym TLS_BLOCK,
            arch_set_fs = const ARCH_SET_FS,
            nr_arch_prctl = const linux_raw_sys::general::__NR_arch_prctl,
            start = sym preloader::start::start,
        )
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86"))]
mod entry {
    use core::arch::naked_asm;

    /// Scratch thread block backing the temporary %gs segment.
    #[repr(align(64))]
    struct TlsBlock([u8; 256]);

    static mut TLS_BLOCK: TlsBlock = TlsBlock([0; 256]);

    /// set_thread_area descriptor: entry_number = -1 (allocate), 1 MiB
    /// page-granular 32-bit data segment, usable. The base is patched in at
    /// runtime, the allocated entry number is written back by the kernel.
    #[repr(C)]
    struct UserDesc {
        entry_number: u32,
        base_addr: u32,
        limit: u32,
        flags: u32,
    }

    static mut THREAD_LDT: UserDesc = UserDesc {
        entry_number: !0,
        base_addr: 0,
        limit: 0xfffff,
        // seg_32bit | limit_in_pages | useable
        flags: 0x51,
    };

    #[unsafe(naked)]
    #[no_mangle]
    unsafe extern "C" fn _start() -> ! {
        naked_asm!(
            // Allocate a %gs segment over the scratch TLS block.
            "mov ebx, offset {ldt}",
            "mov dword ptr [ebx + 4], offset {tls}",
            "mov eax, {nr_set_thread_area}",
            "int 0x80",
            "test eax, eax",
            "js 2f",
            "mov eax, [{ldt}]",
            "shl eax, 3",
            "or eax, 3",
            "mov gs, ax",
            "2:",
            // Save the kernel-provided stack pointer below scratch space
            // for the auxv rewrite.
            "mov eax, esp",
            "lea esp, [esp - 136]",
            "mov [esp], eax",
            // start(&saved_stack_pointer) -> entry address
            "push esp",
            "call {start}",
            "add esp, 4",
            // Enter the image on the rewritten stack with clean registers
            // and the TLS selector cleared again.
            "mov esp, [esp]",
            "push eax",
            "xor eax, eax",
            "xor ebx, ebx",
            "xor ecx, ecx",
            "xor edx, edx",
            "xor esi, esi",
            "xor edi, edi",
            "xor ebp, ebp",
            "mov gs, ax",
            "ret",
            ldt = sym THREAD_LDT,
            tls = sym TLS_BLOCK,
            nr_set_thread_area = const linux_raw_sys::general::__NR_set_thread_area,
            start = sym preloader::start::start,
        )
    }
}

#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
mod entry {
    use core::arch::naked_asm;
    use preloader::macho;

    #[unsafe(naked)]
    #[no_mangle]
    unsafe extern "C" fn _start() -> ! {
        naked_asm!(
            // start(original_stack) fills the hand-off block and returns
            // its address.
            "mov rbp, rsp",
            "and rsp, -16",
            "sub rsp, 16",
            "mov rdi, rbp",
            "call {start}",
            // LC_MAIN images are called like main(); LC_UNIXTHREAD images
            // get the raw stack and a jump.
            "cmp qword ptr [rax + 8], 0",
            "je 2f",
            "mov rdi, [rax + 16]",
            "mov rsi, [rax + 24]",
            "mov rdx, [rax + 32]",
            "mov rcx, [rax + 40]",
            "mov r13, [rax]",
            "call r13",
            "mov edi, eax",
            "mov eax, {nr_exit}",
            "syscall",
            "2:",
            "mov rsp, [rax + 48]",
            "mov r13, [rax]",
            "xor eax, eax",
            "xor ebx, ebx",
            "xor ecx, ecx",
            "xor edx, edx",
            "xor esi, esi",
            "xor edi, edi",
            "xor ebp, ebp",
            "jmp r13",
            nr_exit = const macho::sys::SYS_EXIT_TRAP,
            start = sym macho::start,
        )
    }
}

// The sysroot's `core` rlib references this symbol even under `panic = "abort"`
// because it was compiled for unwinding; it is never actually invoked here.
#[no_mangle]
extern "C" fn rust_eh_personality() {}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    // A panic is a programming error, but it still has to die cleanly.
    preloader::printerrln!("preloader: panic: {}", info);
    preloader::error::exit(1)
}
