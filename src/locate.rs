//! Locating shared objects by name.

use alloc::ffi::CString;
use alloc::string::String;

use rustix::fd::{AsFd, OwnedFd};
use rustix::fs::{fstat, open, Mode, OFlags};

use crate::decode::decode_vec;
use crate::elf::{Elf_Sym, DT_HASH, DT_STRTAB, DT_SYMTAB, DYN_CNT};
use crate::error::Error;
use crate::map::map_library;
use crate::object::{Dso, DsoId, Engine};

/// Directories probed for a bare library name, in order.
const SEARCH_PATH: &[&str] = &["/lib/", "/usr/local/lib/", "/usr/lib/"];

/// Library stems that always resolve to the loader's own image.
const RESERVED: &[&[u8]] = &[b"c", b"pthread", b"rt", b"m", b"dl", b"util", b"xnet"];

/// Basename bound, from linux/limits.h.
const NAME_MAX: usize = 255;

/// Whether `name` is `libX.*` with a reserved stem `X`.
///
/// The stem is the substring between `lib` and the first `.`, compared
/// for exact equality; `libcrypto.so.1` shares a prefix with `libc` but
/// does not match.
pub(crate) fn reserved_name(name: &[u8]) -> bool {
    let Some(rest) = name.strip_prefix(b"lib") else {
        return false;
    };
    let Some(dot) = rest.iter().position(|&c| c == b'.') else {
        return false;
    };
    RESERVED.contains(&&rest[..dot])
}

/// Open `name` directly if absolute; otherwise refuse names with
/// directory components and probe the fixed search path.
fn open_on_search_path(name: &[u8]) -> Result<OwnedFd, Error> {
    if name.first() == Some(&b'/') {
        let path = CString::new(name).map_err(|_| Error::NotFound)?;
        return open(path.as_c_str(), OFlags::RDONLY | OFlags::CLOEXEC, Mode::empty())
            .map_err(|_| Error::NotFound);
    }
    if name.len() > NAME_MAX || name.contains(&b'/') {
        return Err(Error::NotFound);
    }
    for dir in SEARCH_PATH {
        let dir = dir.as_bytes();
        let mut buf = [0u8; NAME_MAX + 32];
        buf[..dir.len()].copy_from_slice(dir);
        buf[dir.len()..dir.len() + name.len()].copy_from_slice(name);
        let path = &buf[..dir.len() + name.len() + 1];
        // SAFETY: the buffer is zero-filled past the copied bytes.
        let path = unsafe { core::ffi::CStr::from_bytes_with_nul_unchecked(path) };
        if let Ok(fd) = open(path, OFlags::RDONLY | OFlags::CLOEXEC, Mode::empty()) {
            return Ok(fd);
        }
    }
    Err(Error::NotFound)
}

impl Engine {
    /// Map a requested name to a listed record, loading the file if no
    /// cache answers.
    ///
    /// Descriptors close on every path; a failed load releases its
    /// mapping and inserts nothing.
    pub(crate) fn load_library(&mut self, name: &[u8]) -> Result<DsoId, Error> {
        // Reserved names resolve to the loader itself: reloading the
        // implementation under an alias would hand out a second copy of
        // its state.
        if reserved_name(name) {
            let libc = self.libc;
            if self.position(libc).is_none() {
                self.order.push(libc);
            }
            self.get_mut(libc).refcnt += 1;
            return Ok(libc);
        }

        // Already loaded under this exact name?
        if let Some(id) = self.lookup_name(name) {
            self.get_mut(id).refcnt += 1;
            #[cfg(feature = "log")]
            log::trace!(
                "reusing {} (refcnt {})",
                self.get(id).name,
                self.get(id).refcnt
            );
            return Ok(id);
        }

        let fd = open_on_search_path(name)?;
        let st = fstat(&fd)?;
        // A second name can still reach an already-mapped file.
        if let Some(id) = self.lookup_inode(st.st_dev as u64, st.st_ino as u64) {
            self.get_mut(id).refcnt += 1;
            #[cfg(feature = "log")]
            log::trace!(
                "{} aliases {} (refcnt {})",
                String::from_utf8_lossy(name),
                self.get(id).name,
                self.get(id).refcnt
            );
            return Ok(id);
        }

        let image = map_library(fd.as_fd(), self.pagesz)?;
        let dynv = (image.base + image.dyn_vaddr) as *const usize;
        let mut dyns = [0usize; DYN_CNT];
        // SAFETY: the dynamic section lies inside the mapping just made.
        unsafe { decode_vec(dynv, &mut dyns) };
        let dso = Dso {
            name: String::from_utf8_lossy(name).into_owned(),
            base: image.base,
            map: image.map,
            map_len: image.map_len,
            dynv,
            syms: (image.base + dyns[DT_SYMTAB]) as *const Elf_Sym,
            strings: (image.base + dyns[DT_STRTAB]) as *const u8,
            hashtab: (image.base + dyns[DT_HASH]) as *const u32,
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
            refcnt: 1,
            global: true,
            relocated: false,
        };
        #[cfg(feature = "log")]
        log::debug!(
            "loaded {} at {:#x} ({:#x} bytes mapped)",
            dso.name,
            dso.base,
            dso.map_len
        );
        Ok(self.insert(dso))
    }

    /// Scan the search order, past the head, for a record requested under
    /// the same name.
    fn lookup_name(&self, name: &[u8]) -> Option<DsoId> {
        self.order
            .iter()
            .skip(1)
            .copied()
            .find(|&id| self.get(id).name.as_bytes() == name)
    }

    /// Scan the search order, past the head, for a record backed by the
    /// same file. Records the kernel mapped carry no file identity.
    fn lookup_inode(&self, dev: u64, ino: u64) -> Option<DsoId> {
        self.order.iter().skip(1).copied().find(|&id| {
            let dso = self.get(id);
            dso.map != 0 && dso.dev == dev && dso.ino == ino
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::testutil::empty_dso;

    fn engine() -> Engine {
        Engine::new(empty_dso("", 0), empty_dso("", 0x9000), 4096, false)
    }

    #[test]
    fn reserved_stems_match_exactly() {
        assert!(reserved_name(b"libc.so.6"));
        assert!(reserved_name(b"libm.so.6"));
        assert!(reserved_name(b"libpthread.so.0"));
        assert!(reserved_name(b"libdl.so.2"));
        assert!(reserved_name(b"librt.so.1"));
        assert!(reserved_name(b"libutil.so.1"));
        assert!(reserved_name(b"libxnet.so"));

        // Shares a prefix with `libc` but names a different library.
        assert!(!reserved_name(b"libcrypto.so.1"));
        assert!(!reserved_name(b"libp.so.0"));
        assert!(!reserved_name(b"libfoo.so"));
        // No dot, no version suffix to split on.
        assert!(!reserved_name(b"libm"));
        assert!(!reserved_name(b"lib.so"));
        assert!(!reserved_name(b"crt0.o"));
    }

    #[test]
    fn reserved_names_short_circuit_to_the_loader() {
        let mut e = engine();
        let id = e.load_library(b"libc.so.6").unwrap();
        assert_eq!(id, e.libc);
        assert_eq!(e.order.len(), 2);

        // Any reserved alias lands on the same record, listed once.
        let id2 = e.load_library(b"libm.so.6").unwrap();
        assert_eq!(id2, e.libc);
        assert_eq!(e.order.len(), 2);
        assert_eq!(e.get(e.libc).refcnt, 3);
    }

    #[test]
    fn the_name_cache_answers_repeat_requests() {
        let mut e = engine();
        let id = e.insert(empty_dso("libfoo.so", 0x1000));
        let hit = e.load_library(b"libfoo.so").unwrap();
        assert_eq!(hit, id);
        assert_eq!(e.get(id).refcnt, 2);
        assert_eq!(e.order.len(), 2);
    }

    #[test]
    fn the_inode_cache_matches_aliased_files() {
        let mut e = engine();
        let mut dso = empty_dso("libfoo.so", 0x1000);
        dso.map = 0x1000;
        dso.map_len = 0x2000;
        dso.dev = 3;
        dso.ino = 9;
        let id = e.insert(dso);
        assert_eq!(e.lookup_inode(3, 9), Some(id));
        assert_eq!(e.lookup_inode(3, 10), None);
        // Synthetic records never answer for a real file.
        assert_eq!(e.lookup_inode(0, 0), None);
    }

    #[test]
    fn names_with_directory_components_are_refused() {
        let mut e = engine();
        assert!(matches!(
            e.load_library(b"sub/libfoo.so"),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn over_long_names_are_refused() {
        let mut e = engine();
        let long = [b'x'; NAME_MAX + 1];
        assert!(matches!(e.load_library(&long), Err(Error::NotFound)));
    }
}
