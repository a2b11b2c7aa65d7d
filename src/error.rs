//! Loader errors.

use alloc::string::String;
use core::fmt;
use rustix::io::Errno;

/// Everything that can keep an object from being loaded or linked.
///
/// Mapping and locating failures propagate as ordinary `Result`s; once
/// relocation starts, any error is fatal to the process, because nothing
/// is in a state to handle it.
#[derive(Debug)]
pub(crate) enum Error {
    /// A kernel interaction failed.
    Os(Errno),
    /// An object's header region was short or malformed.
    TruncatedObject,
    /// An object carries no `PT_DYNAMIC` segment.
    MissingDynamic,
    /// No file on the search path answers to the requested name.
    NotFound,
    /// A relocation referenced a symbol no loaded object defines.
    UndefinedSymbol(String),
    /// The patch primitive does not cover this relocation type.
    UnsupportedReloc(u32),
}

impl From<Errno> for Error {
    fn from(e: Errno) -> Self {
        Error::Os(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Os(e) => write!(f, "system call failed (errno {})", e.raw_os_error()),
            Error::TruncatedObject => f.write_str("short or malformed object header"),
            Error::MissingDynamic => f.write_str("object has no dynamic segment"),
            Error::NotFound => f.write_str("library not found"),
            Error::UndefinedSymbol(name) => write!(f, "undefined symbol: {}", name),
            Error::UnsupportedReloc(ty) => write!(f, "unsupported relocation type {}", ty),
        }
    }
}
