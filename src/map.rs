//! Mapping ELF images into memory.
//!
//! A shared object is mapped in two steps. First one private mapping
//! covers the whole span from the lowest to the highest `LOAD` address;
//! it deliberately maps too much, possibly more than the file holds. The
//! excess is never touched; it only reserves the address range the later
//! overlays land in. Then every other `LOAD` segment is remapped `FIXED`
//! at its place inside the reservation with its own permissions, the tail
//! of the last file-backed page is zeroed, and any remaining BSS pages
//! get an anonymous zero overlay.

use core::ffi::c_void;
use core::mem::size_of;
use core::ptr::null_mut;

use rustix::fd::BorrowedFd;
use rustix::mm::{mmap, mmap_anonymous, munmap, MapFlags, ProtFlags};

use crate::elf::{Elf_Ehdr, Elf_Phdr, PF_R, PF_W, PF_X, PT_DYNAMIC, PT_LOAD};
use crate::error::Error;

/// How much of an object is read up front: the ELF header plus a
/// reasonable program-header table.
const PREFIX: usize = 896;

/// A freshly mapped image.
pub(crate) struct Image {
    /// Address and length of the initial mapping, for release on failure.
    pub(crate) map: usize,
    pub(crate) map_len: usize,
    /// The chosen load address minus the lowest declared `LOAD` address.
    pub(crate) base: usize,
    /// Virtual address of the dynamic section, relative to `base`.
    pub(crate) dyn_vaddr: usize,
}

fn prot(p_flags: u32) -> ProtFlags {
    let mut prot = ProtFlags::empty();
    if p_flags & PF_R != 0 {
        prot |= ProtFlags::READ;
    }
    if p_flags & PF_W != 0 {
        prot |= ProtFlags::WRITE;
    }
    if p_flags & PF_X != 0 {
        prot |= ProtFlags::EXEC;
    }
    prot
}

/// Release the reservation created by `map_library`.
pub(crate) fn release(map: usize, map_len: usize) {
    // SAFETY: releases a mapping this module created; `FIXED` overlays
    // inside it go with it.
    unsafe {
        let _ = munmap(map as *mut c_void, map_len);
    }
}

/// Turn an open object file into a mapped, permission-correct image.
///
/// `pg` is the kernel-reported page size. On failure any partial mapping
/// has been released; the caller owns only the file descriptor.
pub(crate) fn map_library(fd: BorrowedFd<'_>, pg: usize) -> Result<Image, Error> {
    // Word-aligned prefix buffer.
    let mut buf = [0usize; PREFIX / size_of::<usize>()];
    // SAFETY: plain byte view of the local buffer.
    let bytes =
        unsafe { core::slice::from_raw_parts_mut(buf.as_mut_ptr().cast::<u8>(), PREFIX) };

    let len = rustix::io::read(fd, &mut *bytes)?;
    if len < size_of::<Elf_Ehdr>() {
        return Err(Error::TruncatedObject);
    }
    let (phentsize, phnum, mut phoff) = {
        // SAFETY: the buffer is word-aligned and holds a full header.
        let eh = unsafe { &*bytes.as_ptr().cast::<Elf_Ehdr>() };
        (
            eh.e_phentsize as usize,
            eh.e_phnum as usize,
            eh.e_phoff as usize,
        )
    };
    let phsize = phentsize * phnum;
    if phsize == 0 || phsize + size_of::<Elf_Ehdr>() > PREFIX {
        return Err(Error::TruncatedObject);
    }
    if phoff.checked_add(phsize).map_or(true, |end| end > len) {
        // The table lies beyond the prefix; pull it into the tail.
        let tail = &mut bytes[size_of::<Elf_Ehdr>()..size_of::<Elf_Ehdr>() + phsize];
        if rustix::io::pread(fd, &mut *tail, phoff as u64)? != phsize {
            return Err(Error::TruncatedObject);
        }
        phoff = size_of::<Elf_Ehdr>();
    }

    let mut dyn_vaddr = 0usize;
    let mut addr_min = usize::MAX;
    let mut addr_max = 0usize;
    let mut off_start = 0usize;
    let mut map_prot = ProtFlags::empty();
    for i in 0..phnum {
        // SAFETY: bounds-checked against the prefix above; entries may be
        // unaligned within the byte buffer.
        let ph = unsafe {
            bytes
                .as_ptr()
                .add(phoff + i * phentsize)
                .cast::<Elf_Phdr>()
                .read_unaligned()
        };
        if ph.p_type == PT_DYNAMIC {
            dyn_vaddr = ph.p_vaddr as usize;
        }
        if ph.p_type != PT_LOAD {
            continue;
        }
        if (ph.p_vaddr as usize) < addr_min {
            addr_min = ph.p_vaddr as usize;
            off_start = ph.p_offset as usize;
            map_prot = prot(ph.p_flags);
        }
        if ph.p_vaddr as usize + ph.p_memsz as usize > addr_max {
            addr_max = ph.p_vaddr as usize + ph.p_memsz as usize;
        }
    }
    if dyn_vaddr == 0 {
        return Err(Error::MissingDynamic);
    }
    if addr_min == usize::MAX {
        return Err(Error::TruncatedObject);
    }

    let addr_max = (addr_max + pg - 1) & !(pg - 1);
    let addr_min = addr_min & !(pg - 1);
    let off_start = off_start & !(pg - 1);
    let map_len = addr_max - addr_min + off_start;

    // SAFETY: kernel-chosen placement; see the module comment for why the
    // length may exceed the file.
    let map = unsafe {
        mmap(
            null_mut(),
            map_len,
            map_prot,
            MapFlags::PRIVATE,
            fd,
            off_start as u64,
        )
    }? as usize;
    let base = map.wrapping_sub(addr_min);

    for i in 0..phnum {
        // SAFETY: as above.
        let ph = unsafe {
            bytes
                .as_ptr()
                .add(phoff + i * phentsize)
                .cast::<Elf_Phdr>()
                .read_unaligned()
        };
        if ph.p_type != PT_LOAD {
            continue;
        }
        // The lowest LOAD reuses the reservation itself.
        if ph.p_vaddr as usize & !(pg - 1) == addr_min {
            continue;
        }
        let this_min = ph.p_vaddr as usize & !(pg - 1);
        let this_max = (ph.p_vaddr as usize + ph.p_memsz as usize + pg - 1) & !(pg - 1);
        let off = ph.p_offset as usize & !(pg - 1);
        let seg_prot = prot(ph.p_flags);
        // SAFETY: lands inside the reservation.
        let mapped = unsafe {
            mmap(
                (base + this_min) as *mut c_void,
                this_max - this_min,
                seg_prot,
                MapFlags::PRIVATE | MapFlags::FIXED,
                fd,
                off as u64,
            )
        };
        if let Err(e) = mapped {
            release(map, map_len);
            return Err(Error::Os(e));
        }
        if ph.p_memsz as usize > ph.p_filesz as usize {
            let brk = base + ph.p_vaddr as usize + ph.p_filesz as usize;
            let pgbrk = (brk + pg - 1) & !(pg - 1);
            // The file may carry unrelated bytes past p_filesz on the
            // last file-backed page; they must read as zero.
            // SAFETY: inside the segment just mapped.
            unsafe { core::ptr::write_bytes(brk as *mut u8, 0, pgbrk - brk) };
            if pgbrk < base + this_max {
                // SAFETY: replaces the beyond-the-file tail of the
                // segment inside the reservation.
                let anon = unsafe {
                    mmap_anonymous(
                        pgbrk as *mut c_void,
                        base + this_max - pgbrk,
                        seg_prot,
                        MapFlags::PRIVATE | MapFlags::FIXED,
                    )
                };
                if let Err(e) = anon {
                    release(map, map_len);
                    return Err(Error::Os(e));
                }
            }
        }
    }

    #[cfg(feature = "log")]
    log::trace!(
        "mapped image at {:#x}..{:#x}, base {:#x}, dynamic at {:#x}",
        map,
        map + map_len,
        base,
        dyn_vaddr
    );

    Ok(Image {
        map,
        map_len,
        base,
        dyn_vaddr,
    })
}

#[cfg(test)]
#[cfg(target_pointer_width = "64")]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::io::{Seek as _, SeekFrom, Write as _};
    use std::os::fd::AsRawFd;
    use std::vec;
    use std::vec::Vec;

    fn put(buf: &mut [u8], off: usize, v: u64, len: usize) {
        buf[off..off + len].copy_from_slice(&v.to_le_bytes()[..len]);
    }

    fn ehdr(buf: &mut [u8], phoff: u64, phnum: u16) {
        buf[..4].copy_from_slice(b"\x7fELF");
        buf[4] = 2; // 64-bit
        buf[5] = 1; // little-endian
        put(buf, 16, 3, 2); // ET_DYN
        put(buf, 32, phoff, 8);
        put(buf, 54, 56, 2); // e_phentsize
        put(buf, 56, phnum as u64, 2);
    }

    #[allow(clippy::too_many_arguments)]
    fn phdr(
        buf: &mut [u8],
        table: usize,
        idx: usize,
        p_type: u32,
        flags: u32,
        off: u64,
        vaddr: u64,
        filesz: u64,
        memsz: u64,
    ) {
        let b = table + idx * 56;
        put(buf, b, p_type as u64, 4);
        put(buf, b + 4, flags as u64, 4);
        put(buf, b + 8, off, 8);
        put(buf, b + 16, vaddr, 8);
        put(buf, b + 24, vaddr, 8);
        put(buf, b + 32, filesz, 8);
        put(buf, b + 40, memsz, 8);
        put(buf, b + 48, 0x1000, 8);
    }

    fn image_file(bytes: &[u8]) -> std::fs::File {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(bytes).unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        f
    }

    fn map_file(f: &std::fs::File) -> Result<Image, Error> {
        // SAFETY: `f` stays open for the duration of the call.
        let fd = unsafe { BorrowedFd::borrow_raw(f.as_raw_fd()) };
        map_library(fd, rustix::param::page_size())
    }

    #[test]
    fn maps_segments_and_zeroes_bss() {
        // Segment layout, in whole pages: [0, pg) read-only with the
        // dynamic section inside it, then a writable segment at pg whose
        // p_filesz ends mid-page and whose p_memsz adds three more pages.
        let pg = rustix::param::page_size();
        let mut img = vec![0u8; 2 * pg];
        ehdr(&mut img, 64, 3);
        phdr(&mut img, 64, 0, PT_LOAD, PF_R, 0, 0, pg as u64, pg as u64);
        phdr(
            &mut img,
            64,
            1,
            PT_LOAD,
            PF_R | PF_W,
            pg as u64,
            pg as u64,
            0x234,
            0x234 + 3 * pg as u64,
        );
        phdr(&mut img, 64, 2, PT_DYNAMIC, PF_R, 0x800, 0x800, 0x100, 0x100);
        img[pg] = 0x5a;
        // Dirty bytes past p_filesz: the mapper must hide them.
        for b in &mut img[pg + 0x234..2 * pg] {
            *b = 0xaa;
        }
        let f = image_file(&img);
        let image = map_file(&f).unwrap();
        assert_eq!(image.dyn_vaddr, 0x800);
        let base = image.base;
        unsafe {
            assert_eq!(*((base + pg) as *const u8), 0x5a);
            let dirty: Vec<usize> = ((base + pg + 0x234)..(base + pg + 0x234 + 3 * pg))
                .filter(|&a| *(a as *const u8) != 0)
                .collect();
            assert!(dirty.is_empty(), "nonzero bytes in BSS window: {:x?}", dirty);
            // Writes through the writable segment land, file-backed and
            // anonymous parts alike.
            *((base + pg + 0x300) as *mut u8) = 7;
            *((base + 3 * pg) as *mut u8) = 7;
            assert_eq!(*((base + pg + 0x300) as *const u8), 7);
            assert_eq!(*((base + 3 * pg) as *const u8), 7);
        }
        release(image.map, image.map_len);
    }

    #[test]
    fn reads_a_header_table_beyond_the_prefix() {
        let pg = rustix::param::page_size();
        let mut img = vec![0u8; pg];
        ehdr(&mut img, 0x600, 2);
        phdr(&mut img, 0x600, 0, PT_LOAD, PF_R, 0, 0, pg as u64, pg as u64);
        phdr(&mut img, 0x600, 1, PT_DYNAMIC, PF_R, 0x800, 0x800, 0x100, 0x100);
        let f = image_file(&img);
        let image = map_file(&f).unwrap();
        assert_eq!(image.dyn_vaddr, 0x800);
        release(image.map, image.map_len);
    }

    #[test]
    fn requires_a_dynamic_segment() {
        let pg = rustix::param::page_size();
        let mut img = vec![0u8; pg];
        ehdr(&mut img, 64, 1);
        phdr(&mut img, 64, 0, PT_LOAD, PF_R, 0, 0, pg as u64, pg as u64);
        let f = image_file(&img);
        assert!(matches!(map_file(&f), Err(Error::MissingDynamic)));
    }

    #[test]
    fn rejects_short_images() {
        let f = image_file(&[0x7f, b'E', b'L', b'F']);
        assert!(matches!(map_file(&f), Err(Error::TruncatedObject)));
    }

    #[test]
    fn rejects_an_oversized_header_table() {
        let pg = rustix::param::page_size();
        let mut img = vec![0u8; pg];
        ehdr(&mut img, 64, 100);
        let f = image_file(&img);
        assert!(matches!(map_file(&f), Err(Error::TruncatedObject)));
    }
}
