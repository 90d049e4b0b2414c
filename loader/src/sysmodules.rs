//! Well-known system module ids.
//!
//! Some libraries the payload may depend on are loadable by a numeric
//! internal id rather than by name. Ids carry the internal-module bit,
//! which also distinguishes them from string-table offsets when loading
//! remotely.

use std::sync::OnceLock;

use hashbrown::HashMap;

/// Bit set on every internal module id.
pub const INTERNAL_MASK: u32 = 0x8000_0000;

static TABLE: OnceLock<HashMap<&'static str, u32>> = OnceLock::new();

fn table() -> &'static HashMap<&'static str, u32> {
    TABLE.get_or_init(|| {
        let mut map = HashMap::new();
        map.insert("libSceAudioOut", INTERNAL_MASK | 0x0001);
        map.insert("libSceVideoOut", INTERNAL_MASK | 0x0002);
        map.insert("libScePad", INTERNAL_MASK | 0x0024);
        map.insert("libSceUserService", INTERNAL_MASK | 0x0011);
        map.insert("libSceSystemService", INTERNAL_MASK | 0x0010);
        map.insert("libSceNet", INTERNAL_MASK | 0x001C);
        map
    })
}

/// Internal id for a library name (without the ".so" suffix), or `None`
/// if the module must be loaded by name.
pub fn id_for(name: &str) -> Option<u32> {
    table().get(name).copied()
}
