//! Walking `DT_NEEDED` records.

use crate::elf::DT_NEEDED;
use crate::hash::cstr_bytes;
use crate::object::Engine;

impl Engine {
    /// Extend the search order with every dependency reachable from the
    /// records already listed.
    ///
    /// The order list grows while it is being walked and the length is
    /// re-read each step, so discovery is naturally breadth-first. Only
    /// membership matters; the records the locator returns are dropped,
    /// and a failed load is left for relocation to surface as an
    /// undefined symbol.
    pub(crate) fn load_deps(&mut self) {
        let mut pos = 0;
        while pos < self.order.len() {
            let id = self.order[pos];
            let (mut dynv, strings) = {
                let dso = self.get(id);
                (dso.dynv, dso.strings)
            };
            // SAFETY: the dynamic vector is zero-tag-terminated and
            // needed entries hold offsets into the object's string table.
            unsafe {
                while *dynv != 0 {
                    if *dynv == DT_NEEDED {
                        let name = cstr_bytes(strings.add(*dynv.add(1)));
                        if let Err(_e) = self.load_library(name) {
                            #[cfg(feature = "log")]
                            log::warn!(
                                "cannot load {}: {}",
                                core::str::from_utf8(name).unwrap_or("?"),
                                _e
                            );
                        }
                    }
                    dynv = dynv.add(2);
                }
            }
            pos += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::object::testutil::{empty_dso, Tables};
    use crate::object::{Engine, LookupFlags};

    #[test]
    fn no_dependencies_leaves_the_list_alone() {
        let mut e = Engine::new(empty_dso("", 0), empty_dso("", 0x9000), 4096, false);
        e.load_deps();
        assert_eq!(e.order.len(), 1);
    }

    #[test]
    fn needed_entries_extend_the_list() {
        use crate::elf::DT_NEEDED;

        let strings = b"\0libc.so.6\0";
        let dynv = [DT_NEEDED, 1, 0, 0];
        let mut app = empty_dso("", 0);
        app.dynv = dynv.as_ptr();
        app.strings = strings.as_ptr();

        // The loader record stands in for the C library and defines its
        // symbols.
        let libc_tables = Tables::build(&[(b"write", 0x20, 0x12, 1, 0)]);
        let ldso = libc_tables.dso("", 0x7000);

        let mut e = Engine::new(app, ldso, 4096, false);
        e.load_deps();

        assert_eq!(e.order.len(), 2);
        assert_eq!(e.order[1], e.libc);
        // Resolution now reaches the C library's definitions.
        assert_eq!(
            e.find_sym(0, b"write", LookupFlags::empty()),
            0x7000 + 0x20
        );
    }

    #[test]
    fn duplicate_needed_entries_share_one_record() {
        use crate::elf::DT_NEEDED;

        let strings = b"\0libc.so.6\0libm.so.6\0";
        let dynv = [DT_NEEDED, 1, DT_NEEDED, 11, 0, 0];
        let mut app = empty_dso("", 0);
        app.dynv = dynv.as_ptr();
        app.strings = strings.as_ptr();

        let mut e = Engine::new(app, empty_dso("", 0x7000), 4096, false);
        e.load_deps();

        assert_eq!(e.order.len(), 2);
        assert_eq!(e.get(e.libc).refcnt, 3);
    }
}
