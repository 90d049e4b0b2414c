//! Minimal ELF loader and dynamic linker for homebrew payloads.
//!
//! This crate performs a from-scratch load of an unsigned ELF executable
//! into a target process: segment mapping, dynamic-table parsing, library
//! resolution, relocation, privileged-channel setup, content copy and
//! control transfer. The target may be the current process (in-process
//! mode) or a separate frozen process driven through the remote-process
//! controller (remote mode).
//!
//! # Supported linking model
//!
//! - Four relocation kinds: `R_X86_64_64`, `R_X86_64_GLOB_DAT`,
//!   `R_X86_64_RELATIVE`, `R_X86_64_JMP_SLOT`
//! - No lazy binding, no symbol versioning
//! - Library dependencies resolved eagerly, preloaded system libraries
//!   looked up by well-known handle

pub mod elf;
pub mod load;
pub mod patch;
pub mod symbols;
pub mod sysmodules;
pub mod target;

pub use elf::{ElfError, ElfImage, SegmentFlags};
pub use load::{ElfLoader, LoadError};
pub use patch::{EntrypointPatch, ENTRYPOINT_OFFSET};
pub use symbols::SymbolResolver;
pub use target::{
    DebugSession, LibraryInfo, MapFlags, ProcessController, ProcessDirectory, Protection,
    Registers, TargetError, TargetProcess,
};
