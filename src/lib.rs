#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

#[cfg_attr(target_arch = "x86_64", path = "arch/x86_64.rs")]
#[cfg_attr(target_arch = "aarch64", path = "arch/aarch64.rs")]
#[cfg_attr(target_arch = "riscv64", path = "arch/riscv64.rs")]
mod arch;
mod boot;
mod decode;
mod deps;
mod elf;
mod error;
mod hash;
mod locate;
mod map;
mod object;
mod reloc;

pub use boot::dynlink;
pub use object::trusted_environment;
