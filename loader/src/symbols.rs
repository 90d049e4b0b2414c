//! Aggregating cross-library symbol resolver.
//!
//! Collects the (image base, metadata address) record of every library
//! that participates in a load, in insertion order: preloaded system
//! libraries first, then freshly loaded dependencies. Lookups scan the
//! libraries in that order.

use log::debug;

use crate::target::{LibraryInfo, TargetProcess};

/// Ordered set of libraries a load resolves symbols against.
#[derive(Debug, Default)]
pub struct SymbolResolver {
    libraries: Vec<LibraryInfo>,
}

impl SymbolResolver {
    /// Create an empty resolver.
    pub fn new() -> Self {
        SymbolResolver { libraries: Vec::new() }
    }

    /// Pre-size the library list.
    pub fn reserve(&mut self, additional: usize) {
        self.libraries.reserve(additional);
    }

    /// Add one library's records; later lookups consult it in insertion
    /// order.
    pub fn add_library(&mut self, info: LibraryInfo) {
        self.libraries.push(info);
    }

    /// The libraries added so far, in insertion order.
    pub fn libraries(&self) -> &[LibraryInfo] {
        &self.libraries
    }

    /// Resolve `name` against every library in order; `None` if no
    /// library exports it.
    pub fn lookup(&self, target: &dyn TargetProcess, name: &str) -> Option<u64> {
        for lib in &self.libraries {
            if let Some(addr) = target.resolve_symbol(lib, name) {
                return Some(addr);
            }
        }
        debug!("symbol {name} not found in {} libraries", self.libraries.len());
        None
    }
}
