//! ELF ABI items the link-editor consumes.
//!
//! `linux_raw_sys::elf` carries the header types and the handful of
//! dynamic tags a program's own startup path needs; a link-editor reads a
//! wider slice of the ABI, defined here.

pub(crate) use linux_raw_sys::elf::{Elf_Ehdr, Elf_Phdr};

// Program-header types and segment permission bits.
pub(crate) const PT_LOAD: u32 = 1;
pub(crate) const PT_DYNAMIC: u32 = 2;
pub(crate) const PT_GNU_RELRO: u32 = 0x6474_e552;
pub(crate) const PF_X: u32 = 1;
pub(crate) const PF_W: u32 = 2;
pub(crate) const PF_R: u32 = 4;

// Dynamic-array tags.
pub(crate) const DT_NEEDED: usize = 1;
pub(crate) const DT_PLTRELSZ: usize = 2;
pub(crate) const DT_HASH: usize = 4;
pub(crate) const DT_STRTAB: usize = 5;
pub(crate) const DT_SYMTAB: usize = 6;
pub(crate) const DT_RELA: usize = 7;
pub(crate) const DT_RELASZ: usize = 8;
pub(crate) const DT_REL: usize = 17;
pub(crate) const DT_RELSZ: usize = 18;
pub(crate) const DT_PLTREL: usize = 20;
pub(crate) const DT_JMPREL: usize = 23;

/// Length of the dense dynamic-tag array; covers every tag the engine
/// consumes.
pub(crate) const DYN_CNT: usize = 34;

/// Length of the dense auxiliary-vector array.
pub(crate) const AUX_CNT: usize = 15;

// Symbol types and bindings, from the `st_info` bitfield.
pub(crate) const STT_NOTYPE: u32 = 0;
pub(crate) const STT_OBJECT: u32 = 1;
pub(crate) const STT_FUNC: u32 = 2;
pub(crate) const STT_COMMON: u32 = 5;
pub(crate) const STB_WEAK: u8 = 2;

/// Symbol types a lookup may resolve to.
pub(crate) const OK_TYPES: u32 =
    (1 << STT_NOTYPE) | (1 << STT_OBJECT) | (1 << STT_FUNC) | (1 << STT_COMMON);

/// Symbol-table entry.
#[cfg(target_pointer_width = "32")]
#[repr(C)]
pub(crate) struct Elf_Sym {
    pub(crate) st_name: u32,
    pub(crate) st_value: usize,
    pub(crate) st_size: usize,
    pub(crate) st_info: u8,
    #[allow(dead_code)]
    pub(crate) st_other: u8,
    pub(crate) st_shndx: u16,
}

/// Symbol-table entry.
#[cfg(target_pointer_width = "64")]
#[repr(C)]
pub(crate) struct Elf_Sym {
    pub(crate) st_name: u32,
    pub(crate) st_info: u8,
    #[allow(dead_code)]
    pub(crate) st_other: u8,
    pub(crate) st_shndx: u16,
    pub(crate) st_value: usize,
    pub(crate) st_size: usize,
}

impl Elf_Sym {
    #[inline]
    pub(crate) fn st_type(&self) -> u32 {
        (self.st_info & 0xf) as u32
    }

    #[inline]
    pub(crate) fn st_bind(&self) -> u8 {
        self.st_info >> 4
    }
}

/// Relocation type from an `r_info` word.
#[inline]
pub(crate) fn r_type(info: usize) -> u32 {
    #[cfg(target_pointer_width = "32")]
    {
        (info & 0xff) as u32
    }
    #[cfg(target_pointer_width = "64")]
    {
        (info & 0xffff_ffff) as u32
    }
}

/// Symbol-table index from an `r_info` word.
#[inline]
pub(crate) fn r_sym(info: usize) -> usize {
    #[cfg(target_pointer_width = "32")]
    {
        info >> 8
    }
    #[cfg(target_pointer_width = "64")]
    {
        info >> 32
    }
}

/// Inverse of the `r_type`/`r_sym` split, for building test tables.
#[cfg(test)]
pub(crate) fn r_info(sym: usize, ty: u32) -> usize {
    #[cfg(target_pointer_width = "32")]
    {
        (sym << 8) | ty as usize
    }
    #[cfg(target_pointer_width = "64")]
    {
        (sym << 32) | ty as usize
    }
}
