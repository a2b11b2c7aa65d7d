//! AArch64 relocation support.

use core::arch::asm;
use linux_raw_sys::general::{__NR_mprotect, PROT_READ};

/// Absolute word: symbol value plus addend (`R_AARCH64_ABS64`).
pub(crate) const REL_SYMBOLIC: u32 = 257;
/// Copy initial data from a providing object (`R_AARCH64_COPY`).
pub(crate) const REL_COPY: u32 = 1024;
/// GOT entry: absolute symbol address (`R_AARCH64_GLOB_DAT`).
pub(crate) const REL_GOT: u32 = 1025;
/// PLT slot: absolute symbol address (`R_AARCH64_JUMP_SLOT`).
pub(crate) const REL_JUMP_SLOT: u32 = 1026;
/// Base-relative word (`R_AARCH64_RELATIVE`).
pub(crate) const REL_RELATIVE: u32 = 1027;

/// Whether `ty` copies data into the requesting object's image.
#[inline]
pub(crate) fn is_copy(ty: u32) -> bool {
    ty == REL_COPY
}

/// Patch one target according to `ty`.
///
/// The only architecture-dependent surface of the relocation driver.
///
/// # Safety
///
/// `reloc_addr` must be writable inside the object being relocated; for
/// copy relocations, `val..val + size` must be readable.
pub(crate) unsafe fn apply(
    reloc_addr: usize,
    ty: u32,
    val: usize,
    size: usize,
    base: usize,
    addend: usize,
) -> Result<(), u32> {
    match ty {
        REL_SYMBOLIC => *(reloc_addr as *mut usize) = val.wrapping_add(addend),
        REL_GOT | REL_JUMP_SLOT => *(reloc_addr as *mut usize) = val,
        REL_RELATIVE => *(reloc_addr as *mut usize) = base.wrapping_add(addend),
        REL_COPY => core::ptr::copy_nonoverlapping(val as *const u8, reloc_addr as *mut u8, size),
        _ => return Err(ty),
    }
    Ok(())
}

/// Perform a single load operation, outside the Rust memory model.
///
/// Used while the loader relocates itself: the accesses read memory that
/// Rust wouldn't think could be accessed, so they go through `asm` and
/// `usize` values which don't carry provenance.
///
/// # Safety
///
/// `ptr` must hold the address of a readable memory location.
#[inline]
pub(crate) unsafe fn relocation_load(ptr: usize) -> usize {
    let r0;

    // This is read-only but we don't use `readonly` because this memory
    // access happens outside the Rust memory model.
    asm!(
        "ldr {}, [{}]",
        out(reg) r0,
        in(reg) ptr,
        options(nostack, preserves_flags),
    );

    r0
}

/// Perform a single store operation, outside the Rust memory model.
///
/// # Safety
///
/// `ptr` must hold the address of a writable memory location.
#[inline]
pub(crate) unsafe fn relocation_store(ptr: usize, value: usize) {
    asm!(
        "str {}, [{}]",
        in(reg) value,
        in(reg) ptr,
        options(nostack, preserves_flags),
    );
}

/// Mark relro memory as readonly, with a raw system call.
///
/// Runs right after self-relocation, so it must not go through any other
/// crate; the failure path traps because no error reporting exists yet.
///
/// # Safety
///
/// `ptr` must hold a page-aligned address inside the loader's own image.
#[inline]
pub(crate) unsafe fn relocation_mprotect_readonly(ptr: usize, len: usize) {
    let r0: usize;

    asm!(
        "svc 0",
        in("x8") __NR_mprotect,
        inlateout("x0") ptr => r0,
        in("x1") len,
        in("x2") PROT_READ,
        options(nostack, preserves_flags),
    );

    if r0 != 0 {
        trap();
    }
}

/// Execute a trap instruction.
///
/// The stop of last resort for states that have no error path.
pub(crate) fn trap() -> ! {
    // SAFETY: diverges.
    unsafe {
        asm!("brk #0x1", options(noreturn, nostack));
    }
}
