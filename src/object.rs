//! Loaded-object records and the global symbol namespace.
//!
//! The classic design threads a doubly linked list through the records
//! themselves. Here the records live in an arena owned by the engine and
//! the global search order is a vector of indices into it; "first record
//! wins" stays the resolution rule, the representation just stops being
//! cyclic.

use alloc::string::String;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::cell::UnsafeCell;

use crate::elf::{Elf_Sym, OK_TYPES};
use crate::hash::{lookup, sysv_hash};

/// Stable identifier of a loaded object: its index in the engine's arena.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct DsoId(pub(crate) usize);

/// A dynamic vector with nothing in it, for records that carry none.
pub(crate) static EMPTY_DYNV: [usize; 2] = [0, 0];

/// One loaded image.
pub(crate) struct Dso {
    /// The string the object was requested by; dedup key.
    pub(crate) name: String,
    /// Added to a virtual address declared in the file, yields the runtime
    /// address. Zero for the (fixed-address) application.
    pub(crate) base: usize,
    /// The initial mapping, kept only so it can be released on failure.
    /// Zero when the kernel did the mapping.
    pub(crate) map: usize,
    pub(crate) map_len: usize,
    /// The object's dynamic section: zero-tag-terminated (tag, value)
    /// pairs.
    pub(crate) dynv: *const usize,
    /// Symbol, string and hash tables as runtime pointers. The
    /// application's are absolute in the file's declared address space;
    /// everyone else's were offset by `base` at construction.
    pub(crate) syms: *const Elf_Sym,
    pub(crate) strings: *const u8,
    pub(crate) hashtab: *const u32,
    /// Backing file identity; dedup key for aliased paths.
    pub(crate) dev: u64,
    pub(crate) ino: u64,
    /// Distinct requests that resolved to this record.
    pub(crate) refcnt: usize,
    /// Whether the object participates in the global namespace. Always
    /// true today; reserved for local-scope loads.
    pub(crate) global: bool,
    /// One-shot. Once set, neither `base` nor any byte the relocations
    /// reach is mutated here again.
    pub(crate) relocated: bool,
}

impl Dso {
    /// Convert a file-declared virtual address to a runtime address.
    #[inline]
    pub(crate) fn laddr(&self, vaddr: usize) -> usize {
        self.base.wrapping_add(vaddr)
    }
}

bitflags! {
    /// Symbol-lookup policy.
    #[derive(Clone, Copy)]
    pub(crate) struct LookupFlags: u32 {
        /// Accept symbols with a zero section index.
        const ALLOW_UNDEFINED = 1 << 0;
    }
}

/// The link-editor state: object arena, global search order, the loader's
/// own synthetic record, and the environment trust flag.
pub(crate) struct Engine {
    pub(crate) objects: Vec<Dso>,
    /// Global search order. Element 0 is the application; insertion order
    /// is first-discovery order.
    pub(crate) order: Vec<DsoId>,
    /// The loader's own record, standing in for the C library.
    pub(crate) libc: DsoId,
    /// Kernel-reported page size, from the auxiliary vector.
    pub(crate) pagesz: usize,
    pub(crate) trust_env: bool,
}

impl Engine {
    /// Build the engine around the two records bootstrap constructs: the
    /// application (head of the search order) and the loader (listed only
    /// once a reserved name asks for it).
    pub(crate) fn new(app: Dso, ldso: Dso, pagesz: usize, trust_env: bool) -> Self {
        let mut objects = Vec::with_capacity(8);
        objects.push(app);
        objects.push(ldso);
        Engine {
            objects,
            order: alloc::vec![DsoId(0)],
            libc: DsoId(1),
            pagesz,
            trust_env,
        }
    }

    #[inline]
    pub(crate) fn get(&self, id: DsoId) -> &Dso {
        &self.objects[id.0]
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, id: DsoId) -> &mut Dso {
        &mut self.objects[id.0]
    }

    /// Append a record to the arena and to the tail of the search order.
    pub(crate) fn insert(&mut self, dso: Dso) -> DsoId {
        let id = DsoId(self.objects.len());
        self.objects.push(dso);
        self.order.push(id);
        id
    }

    /// Position of `id` in the search order, if listed.
    pub(crate) fn position(&self, id: DsoId) -> Option<usize> {
        self.order.iter().position(|&o| o == id)
    }

    /// Resolve `name` against the global namespace, walking the search
    /// order from position `start`.
    ///
    /// Returns the runtime address of the first acceptable definition, or
    /// zero when no listed object defines the symbol. Absence is not an
    /// error here; whether a zero resolution is fatal belongs to the
    /// relocation driver.
    pub(crate) fn find_sym(&self, start: usize, name: &[u8], flags: LookupFlags) -> usize {
        let h = sysv_hash(name);
        for &id in &self.order[start.min(self.order.len())..] {
            let dso = self.get(id);
            if !dso.global {
                continue;
            }
            // SAFETY: the record's tables point into its image, which
            // lives for the process lifetime.
            let sym = unsafe { lookup(name, h, dso.syms, dso.hashtab, dso.strings) };
            let Some(sym) = sym else { continue };
            let sym = unsafe { &*sym };
            if sym.st_shndx == 0 && !flags.contains(LookupFlags::ALLOW_UNDEFINED) {
                continue;
            }
            if sym.st_value == 0 {
                continue;
            }
            if OK_TYPES & (1 << sym.st_type()) == 0 {
                continue;
            }
            return dso.laddr(sym.st_value);
        }
        0
    }

    /// Drop the heap records once every object is relocated. A record
    /// whose mapping the kernel made stays; for the rest, the mappings
    /// persist for the process lifetime but nothing consults the records
    /// again.
    pub(crate) fn discard_transients(&mut self) {
        self.order.retain(|id| self.objects[id.0].map == 0);
        self.objects.truncate(2);
    }
}

/// Holds the engine once bootstrap completes, for later stages.
struct EngineCell(UnsafeCell<Option<Engine>>);

// SAFETY: the cell is written exactly once, by the entry routine, at a
// time when no second thread can exist, and is read-only afterwards.
unsafe impl Sync for EngineCell {}

static ENGINE: EngineCell = EngineCell(UnsafeCell::new(None));

/// Install the engine built by bootstrap.
///
/// # Safety
///
/// Must be called once, before the process has a second thread.
pub(crate) unsafe fn install(engine: Engine) {
    *ENGINE.0.get() = Some(engine);
}

/// Whether the process environment may be trusted.
///
/// Set during bootstrap from the kernel's auxiliary vector: true iff the
/// secure-bit mask covers the UID/GID tags and real ids equal effective
/// ids. Later stages consult this before honoring user-supplied search
/// overrides. False until bootstrap completes.
pub fn trusted_environment() -> bool {
    // SAFETY: see `EngineCell`.
    unsafe { (*ENGINE.0.get()).as_ref().map_or(false, |e| e.trust_env) }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;
    use core::ptr::null;

    static EMPTY_HASH: [u32; 2] = [0, 0];

    /// Hand-built symbol/string/hash tables. Keep the value alive for as
    /// long as any record points into it.
    pub(crate) struct Tables {
        pub(crate) syms: Vec<Elf_Sym>,
        pub(crate) strings: Vec<u8>,
        pub(crate) hash: Vec<u32>,
    }

    impl Tables {
        /// Entries are (name, st_value, st_info, st_shndx, st_size).
        pub(crate) fn build(entries: &[(&[u8], usize, u8, u16, usize)]) -> Tables {
            let mut strings = vec![0u8];
            let mut syms = vec![Elf_Sym {
                st_name: 0,
                st_info: 0,
                st_other: 0,
                st_shndx: 0,
                st_value: 0,
                st_size: 0,
            }];
            for &(name, value, info, shndx, size) in entries {
                let st_name = strings.len() as u32;
                strings.extend_from_slice(name);
                strings.push(0);
                syms.push(Elf_Sym {
                    st_name,
                    st_info: info,
                    st_other: 0,
                    st_shndx: shndx,
                    st_value: value,
                    st_size: size,
                });
            }
            // One bucket holding every symbol: the bucket points at the
            // last entry and each chain link steps back one.
            let nchain = syms.len() as u32;
            let mut hash = vec![1u32, nchain, nchain - 1];
            for i in 0..nchain {
                hash.push(i.saturating_sub(1));
            }
            Tables {
                syms,
                strings,
                hash,
            }
        }

        /// A record whose tables are this set, at the given base.
        pub(crate) fn dso(&self, name: &str, base: usize) -> Dso {
            Dso {
                name: String::from(name),
                base,
                map: 0,
                map_len: 0,
                dynv: EMPTY_DYNV.as_ptr(),
                syms: self.syms.as_ptr(),
                strings: self.strings.as_ptr(),
                hashtab: self.hash.as_ptr(),
                dev: 0,
                ino: 0,
                refcnt: 1,
                global: true,
                relocated: false,
            }
        }
    }

    /// A record with no symbols at all.
    pub(crate) fn empty_dso(name: &str, base: usize) -> Dso {
        Dso {
            name: String::from(name),
            base,
            map: 0,
            map_len: 0,
            dynv: EMPTY_DYNV.as_ptr(),
            syms: null(),
            strings: null(),
            hashtab: EMPTY_HASH.as_ptr(),
            dev: 0,
            ino: 0,
            refcnt: 1,
            global: true,
            relocated: false,
        }
    }
}
