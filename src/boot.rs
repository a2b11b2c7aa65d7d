//! Process bootstrap: the loader's entry routine.
//!
//! The kernel execs the program and hands control to the loader's entry
//! stub before anything has been relocated. Until [`dynlink`] finishes
//! applying the loader's own relocation tables, this code runs under
//! unusual rules: no call may leave the crate, nothing may read a static
//! that holds an address (it would go through an unwritten GOT slot), and
//! every access to the image goes through the per-architecture
//! `relocation_load`/`relocation_store` helpers, which operate outside
//! the Rust memory model. The `early_*` functions below exist for that
//! phase and nothing else; everything higher-level runs only after the
//! loader is self-relocated.

use core::ffi::c_void;
use core::mem::size_of;
use core::ptr::{null, null_mut};

use alloc::string::String;

use linux_raw_sys::ctypes::c_int;
use linux_raw_sys::general::{
    AT_BASE, AT_EGID, AT_ENTRY, AT_EUID, AT_GID, AT_PAGESZ, AT_PHDR, AT_PHENT, AT_PHNUM, AT_UID,
};

use crate::arch;
use crate::decode::decode_vec;
use crate::elf::{
    r_sym, r_type, Elf_Ehdr, Elf_Phdr, Elf_Sym, AUX_CNT, DT_HASH, DT_REL, DT_RELA, DT_RELASZ,
    DT_RELSZ, DT_STRTAB, DT_SYMTAB, DYN_CNT, OK_TYPES, PT_DYNAMIC, PT_GNU_RELRO,
};
use crate::error::Error;
use crate::object::{install, Dso, Engine};

/// Auxiliary-vector tags that must all be present for the secure-bit
/// check to mean anything.
const SECURE_TAGS: usize =
    (1 << AT_UID) | (1 << AT_EUID) | (1 << AT_GID) | (1 << AT_EGID);

/// Link the freshly exec'd program image and return its entry-point
/// address.
///
/// `got` points at the loader's first GOT slot, which the link editor
/// fills with the loader's own `DYNAMIC` offset; the word is turned into
/// an absolute pointer in place. The caller owns the final jump to the
/// returned address.
///
/// Any fatal condition (an unresolvable non-weak symbol, a relocation
/// type the patch primitive does not cover) terminates the process with
/// a direct kernel call: at this point in a program's life there is
/// nothing to report an error to.
///
/// # Safety
///
/// Must be called exactly once, on the initial thread, with `argc`,
/// `argv` taken from the initial stack as the kernel populated it and
/// `got` pointing at the loader's GOT.
pub unsafe fn dynlink(argc: c_int, argv: *mut *mut u8, got: *mut usize) -> *const c_void {
    // The initial stack is argc, argv, NULL, environ, NULL, auxv.
    let envp = argv.add(argc as usize + 1);
    let mut n = 0usize;
    while *envp.add(n) != null_mut() {
        n += 1;
    }
    let auxv = envp.add(n + 1).cast::<usize>();

    let mut aux = [0usize; AUX_CNT];
    decode_vec(auxv, &mut aux);
    let base = aux[AT_BASE as usize];

    // Turn the loader's DYNAMIC offset in the first GOT slot into an
    // absolute pointer, in place, and decode the section it names.
    arch::relocation_store(
        got as usize,
        arch::relocation_load(got as usize).wrapping_add(base),
    );
    let ldso_dynv = arch::relocation_load(got as usize) as *const usize;
    let mut ldso_dyn = [0usize; DYN_CNT];
    decode_vec(ldso_dynv, &mut ldso_dyn);

    // Find and decode the application's dynamic section. The application
    // is linked at fixed addresses, so p_vaddr is already absolute.
    let mut app_dyn = [0usize; DYN_CNT];
    let mut app_dynv: *const usize = null();
    let phent = aux[AT_PHENT as usize];
    let mut ph = aux[AT_PHDR as usize];
    let mut left = aux[AT_PHNUM as usize];
    while left != 0 {
        let phdr = &*(ph as *const Elf_Phdr);
        if phdr.p_type == PT_DYNAMIC {
            app_dynv = phdr.p_vaddr as usize as *const usize;
            decode_vec(app_dynv, &mut app_dyn);
            break;
        }
        ph += phent;
        left -= 1;
    }

    // Relocate the loader itself. The application's definitions take
    // precedence; its tables are absolute, the loader's need `base`.
    let scope = EarlyScope {
        app_syms: app_dyn[DT_SYMTAB] as *const Elf_Sym,
        app_strings: app_dyn[DT_STRTAB] as *const u8,
        app_hash: app_dyn[DT_HASH] as *const u32,
        ldso_syms: base.wrapping_add(ldso_dyn[DT_SYMTAB]) as *const Elf_Sym,
        ldso_strings: base.wrapping_add(ldso_dyn[DT_STRTAB]) as *const u8,
        ldso_hash: base.wrapping_add(ldso_dyn[DT_HASH]) as *const u32,
        ldso_base: base,
    };
    early_relocate(
        base,
        base.wrapping_add(ldso_dyn[DT_REL]),
        ldso_dyn[DT_RELSZ],
        2,
        &scope,
    );
    early_relocate(
        base,
        base.wrapping_add(ldso_dyn[DT_RELA]),
        ldso_dyn[DT_RELASZ],
        3,
        &scope,
    );
    // With the loader's GOT written, its relro region can seal.
    if aux[AT_PAGESZ as usize] != 0 {
        early_protect_relro(base, aux[AT_PAGESZ as usize]);
    }

    // The loader is a normal Rust crate from here on.

    // Only trust the user and environment if the kernel says we are not
    // running set-id.
    let trust_env = aux[0] & SECURE_TAGS == SECURE_TAGS
        && aux[AT_UID as usize] == aux[AT_EUID as usize]
        && aux[AT_GID as usize] == aux[AT_EGID as usize];

    let app = Dso {
        name: String::new(),
        base: 0,
        map: 0,
        map_len: 0,
        dynv: if app_dynv == null() {
            crate::object::EMPTY_DYNV.as_ptr()
        } else {
            app_dynv
        },
        syms: app_dyn[DT_SYMTAB] as *const Elf_Sym,
        strings: app_dyn[DT_STRTAB] as *const u8,
        hashtab: app_dyn[DT_HASH] as *const u32,
        dev: 0,
        ino: 0,
        refcnt: 1,
        global: true,
        relocated: false,
    };
    let ldso = Dso {
        name: String::new(),
        base,
        map: 0,
        map_len: 0,
        dynv: ldso_dynv,
        syms: base.wrapping_add(ldso_dyn[DT_SYMTAB]) as *const Elf_Sym,
        strings: base.wrapping_add(ldso_dyn[DT_STRTAB]) as *const u8,
        hashtab: base.wrapping_add(ldso_dyn[DT_HASH]) as *const u32,
        dev: 0,
        ino: 0,
        refcnt: 1,
        global: true,
        // Hand-relocated above; the sweep must never touch it.
        relocated: true,
    };

    let pagesz = if aux[AT_PAGESZ as usize] != 0 {
        aux[AT_PAGESZ as usize]
    } else {
        4096
    };
    let mut engine = Engine::new(app, ldso, pagesz, trust_env);
    engine.load_deps();
    if let Err(err) = engine.relocate_all() {
        fatal(&err);
    }
    engine.discard_transients();
    install(engine);

    // Hand the application a clean errno along with its entry point.
    *__errno_location() = 0;
    aux[AT_ENTRY as usize] as *const c_void
}

/// Stop the process over an unrecoverable linking failure.
fn fatal(err: &Error) -> ! {
    #[cfg(feature = "log")]
    log::error!("fatal: {}", err);
    let _ = err;
    rustix::runtime::exit_group(127)
}

extern "C" {
    // The C runtime that embeds the loader owns the errno slot.
    fn __errno_location() -> *mut c_int;
}

/// Symbol scope for the self-relocation pass: the application first, then
/// the loader itself.
struct EarlyScope {
    app_syms: *const Elf_Sym,
    app_strings: *const u8,
    app_hash: *const u32,
    ldso_syms: *const Elf_Sym,
    ldso_strings: *const u8,
    ldso_hash: *const u32,
    ldso_base: usize,
}

/// Apply one of the loader's own relocation tables.
///
/// Runs before the loader is relocated; see the module comment for the
/// rules this code lives under. A `-Bsymbolic`-linked loader carries
/// almost only relative entries, but GOT, PLT and absolute entries are
/// resolved too, application first. Anything else traps.
#[cold]
unsafe fn early_relocate(
    base: usize,
    mut rel: usize,
    mut rel_size: usize,
    stride: usize,
    scope: &EarlyScope,
) {
    let word = size_of::<usize>();
    while rel_size >= stride * word {
        let r_offset = arch::relocation_load(rel);
        let r_info = arch::relocation_load(rel + word);
        let ty = r_type(r_info);
        let sym_index = r_sym(r_info);
        let reloc_addr = base.wrapping_add(r_offset);
        let addend = if stride == 3 {
            arch::relocation_load(rel + 2 * word)
        } else {
            arch::relocation_load(reloc_addr)
        };

        if ty == arch::REL_RELATIVE {
            arch::relocation_store(reloc_addr, base.wrapping_add(addend));
        } else if sym_index != 0
            && (ty == arch::REL_GOT || ty == arch::REL_JUMP_SLOT || ty == arch::REL_SYMBOLIC)
        {
            let sym = scope.ldso_syms.add(sym_index);
            let name = scope.ldso_strings.add((*sym).st_name as usize);
            let val = early_find_sym(scope, name);
            let val = if ty == arch::REL_SYMBOLIC {
                val.wrapping_add(addend)
            } else {
                val
            };
            arch::relocation_store(reloc_addr, val);
        } else {
            // Nothing else belongs in the loader's own tables.
            arch::trap();
        }

        rel += stride * word;
        rel_size -= stride * word;
    }
}

/// Resolve one symbol for the self-relocation pass.
#[inline(always)]
unsafe fn early_find_sym(scope: &EarlyScope, name: *const u8) -> usize {
    let h = early_hash(name);
    if scope.app_hash != null() {
        let sym = early_lookup(name, h, scope.app_syms, scope.app_hash, scope.app_strings);
        if sym != null() && early_acceptable(sym) {
            // The application's tables are absolute.
            return (*sym).st_value;
        }
    }
    let sym = early_lookup(
        name,
        h,
        scope.ldso_syms,
        scope.ldso_hash,
        scope.ldso_strings,
    );
    if sym != null() && early_acceptable(sym) {
        return scope.ldso_base.wrapping_add((*sym).st_value);
    }
    0
}

#[inline(always)]
unsafe fn early_acceptable(sym: *const Elf_Sym) -> bool {
    (*sym).st_shndx != 0 && (*sym).st_value != 0 && OK_TYPES & (1 << (*sym).st_type()) != 0
}

#[inline(always)]
unsafe fn early_hash(mut s: *const u8) -> u32 {
    let mut h: u32 = 0;
    while *s != 0 {
        h = h.wrapping_mul(16).wrapping_add(*s as u32);
        h ^= (h >> 24) & 0xf0;
        s = s.add(1);
    }
    h & 0x0fff_ffff
}

#[inline(always)]
unsafe fn early_lookup(
    name: *const u8,
    h: u32,
    syms: *const Elf_Sym,
    hashtab: *const u32,
    strings: *const u8,
) -> *const Elf_Sym {
    let nbucket = *hashtab as usize;
    if nbucket == 0 {
        return null();
    }
    let buckets = hashtab.add(2);
    let chain = buckets.add(nbucket);
    let mut i = *buckets.add(h as usize % nbucket) as usize;
    while i != 0 {
        let sym = syms.add(i);
        if early_streq(strings.add((*sym).st_name as usize), name) {
            return sym;
        }
        i = *chain.add(i) as usize;
    }
    null()
}

#[inline(always)]
unsafe fn early_streq(mut a: *const u8, mut b: *const u8) -> bool {
    while *a != 0 && *a == *b {
        a = a.add(1);
        b = b.add(1);
    }
    *a == *b
}

/// Honor the loader's own relro description, if it carries one.
///
/// The ELF header sits at the start of the loader's first `LOAD` segment,
/// so its program headers are reachable from `base` alone.
#[cold]
unsafe fn early_protect_relro(base: usize, pagesz: usize) {
    let eh = &*(base as *const Elf_Ehdr);
    let phent = eh.e_phentsize as usize;
    let mut ph = base + eh.e_phoff as usize;
    let mut left = eh.e_phnum as usize;
    while left != 0 {
        let phdr = &*(ph as *const Elf_Phdr);
        if phdr.p_type == PT_GNU_RELRO {
            let addr = base.wrapping_add(phdr.p_vaddr as usize) & !(pagesz - 1);
            arch::relocation_mprotect_readonly(addr, phdr.p_memsz as usize);
        }
        ph += phent;
        left -= 1;
    }
}
