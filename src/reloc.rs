//! The relocation driver.
//!
//! Tables come in two strides: REL entries are two words and keep their
//! addend in the word being patched, RELA entries carry it as a third
//! word. The PLT table borrows one of those shapes according to
//! `DT_PLTREL`. The driver iterates raw words and leaves the per-type
//! semantics to the architecture's patch primitive.

use alloc::string::String;

use crate::arch;
use crate::decode::decode_vec;
use crate::elf::{
    r_sym, r_type, Elf_Sym, DT_JMPREL, DT_PLTREL, DT_PLTRELSZ, DT_REL, DT_RELA, DT_RELASZ,
    DT_RELSZ, DYN_CNT, STB_WEAK,
};
use crate::error::Error;
use crate::hash::cstr_bytes;
use crate::object::{Engine, LookupFlags};

/// Apply one relocation table for the record at `pos` in the search
/// order.
///
/// # Safety
///
/// `rel..rel + rel_size` must be a readable table of `stride`-word
/// entries whose offsets land inside the record's writable image, and
/// `syms`/`strings` must be that record's tables.
pub(crate) unsafe fn do_relocs(
    engine: &Engine,
    pos: usize,
    base: usize,
    mut rel: *const usize,
    mut rel_size: usize,
    stride: usize,
    syms: *const Elf_Sym,
    strings: *const u8,
) -> Result<(), Error> {
    let word = core::mem::size_of::<usize>();
    while rel_size >= stride * word {
        let r_offset = *rel;
        let r_info = *rel.add(1);
        let ty = r_type(r_info);
        let sym_index = r_sym(r_info);
        let reloc_addr = base.wrapping_add(r_offset);
        // REL entries keep their addend in the target word.
        let addend = if stride == 3 {
            *rel.add(2)
        } else {
            *(reloc_addr as *const usize)
        };

        let mut val = 0usize;
        let mut size = 0usize;
        if sym_index != 0 {
            let sym = &*syms.add(sym_index);
            let name = cstr_bytes(strings.add(sym.st_name as usize));
            // A copy relocation must not bind to the requester's own
            // definition; start past it.
            let start = if arch::is_copy(ty) { pos + 1 } else { pos };
            val = engine.find_sym(start, name, LookupFlags::empty());
            size = sym.st_size;
            if val == 0 && sym.st_bind() != STB_WEAK {
                return Err(Error::UndefinedSymbol(
                    String::from_utf8_lossy(name).into_owned(),
                ));
            }
        }

        arch::apply(reloc_addr, ty, val, size, base, addend).map_err(Error::UnsupportedReloc)?;

        rel = rel.add(stride);
        rel_size -= stride * word;
    }
    Ok(())
}

impl Engine {
    /// Sweep every listed record that has not been relocated yet, in
    /// search order: the PLT table first, then REL, then RELA.
    ///
    /// The `relocated` flag is a one-shot; a second sweep over the same
    /// list leaves memory untouched.
    pub(crate) fn relocate_all(&mut self) -> Result<(), Error> {
        let mut pos = 0;
        while pos < self.order.len() {
            let id = self.order[pos];
            let (dynv, base, syms, strings, relocated) = {
                let dso = self.get(id);
                (dso.dynv, dso.base, dso.syms, dso.strings, dso.relocated)
            };
            if relocated {
                pos += 1;
                continue;
            }
            #[cfg(feature = "log")]
            log::debug!("relocating {}", self.get(id).name);
            let mut dyns = [0usize; DYN_CNT];
            // SAFETY: the record's dynamic vector was validated when it
            // was built; table addresses point into its image.
            unsafe {
                decode_vec(dynv, &mut dyns);
                let plt_stride = if dyns[DT_PLTREL] == DT_RELA { 3 } else { 2 };
                do_relocs(
                    self,
                    pos,
                    base,
                    base.wrapping_add(dyns[DT_JMPREL]) as *const usize,
                    dyns[DT_PLTRELSZ],
                    plt_stride,
                    syms,
                    strings,
                )?;
                do_relocs(
                    self,
                    pos,
                    base,
                    base.wrapping_add(dyns[DT_REL]) as *const usize,
                    dyns[DT_RELSZ],
                    2,
                    syms,
                    strings,
                )?;
                do_relocs(
                    self,
                    pos,
                    base,
                    base.wrapping_add(dyns[DT_RELA]) as *const usize,
                    dyns[DT_RELASZ],
                    3,
                    syms,
                    strings,
                )?;
            }
            self.get_mut(id).relocated = true;
            pos += 1;
        }
        Ok(())
    }
}
