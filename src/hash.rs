//! Content hasher: case-insensitive name → 128-bit id.
//!
//! Every lookup key in the crate (container entries, embedded resources,
//! cache slots, materialized file names) is derived here.  The digest is the
//! first 16 bytes of BLAKE3 over the lowercased UTF-8 name, carried as a
//! [`Uuid`] so it prints and serializes like the container instance ids.
//!
//! # Architecture variants
//! A name may be stored once as architecture-neutral (`"Foo"`) and again as
//! an architecture-specific override (`"x86:Foo"`, `"x64:Foo"`).  The
//! resolver probes [`Architecture::probe_order`]: native prefix first, then
//! neutral, then the other architecture.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Hash a module name.  Case-insensitive; the result is stable across runs
/// and platforms.
pub fn hash(name: &str) -> Uuid {
    let lowered = name.to_lowercase();
    let digest = blake3::hash(lowered.as_bytes());
    let mut id = [0u8; 16];
    id.copy_from_slice(&digest.as_bytes()[..16]);
    Uuid::from_bytes(id)
}

/// Hash `name` qualified for `arch`, i.e. `hash("<prefix>:<name>")`.
pub fn hash_for(arch: Architecture, name: &str) -> Uuid {
    hash(&format!("{}:{}", arch.prefix(), name))
}

/// Pointer-width family used to qualify module names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    X86,
    X64,
}

impl Architecture {
    /// Architecture of the running process.
    pub fn native() -> Self {
        if cfg!(target_pointer_width = "64") {
            Architecture::X64
        } else {
            Architecture::X86
        }
    }

    pub fn prefix(self) -> &'static str {
        match self {
            Architecture::X86 => "x86",
            Architecture::X64 => "x64",
        }
    }

    pub fn other(self) -> Self {
        match self {
            Architecture::X86 => Architecture::X64,
            Architecture::X64 => Architecture::X86,
        }
    }

    /// Hash variants of `name` in the order a resolver running as `self`
    /// must try them.
    pub fn probe_order(self, name: &str) -> [Uuid; 3] {
        [hash_for(self, name), hash(name), hash_for(self.other(), name)]
    }
}

impl Default for Architecture {
    fn default() -> Self {
        Architecture::native()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn casing_does_not_matter() {
        assert_eq!(hash("System.Core"), hash("SYSTEM.CORE"));
        assert_eq!(hash("libfoo.so"), hash("LibFoo.SO"));
    }

    #[test]
    fn distinct_names_hash_apart() {
        assert_ne!(hash("alpha"), hash("beta"));
        assert_ne!(hash("Foo"), hash_for(Architecture::X86, "Foo"));
        assert_ne!(hash_for(Architecture::X86, "Foo"), hash_for(Architecture::X64, "Foo"));
    }

    #[test]
    fn qualified_hash_is_prefixed_hash() {
        assert_eq!(hash_for(Architecture::X64, "Foo"), hash("x64:foo"));
    }

    #[test]
    fn probe_order_for_32_bit() {
        let order = Architecture::X86.probe_order("Foo");
        assert_eq!(order, [hash("x86:Foo"), hash("Foo"), hash("x64:Foo")]);
    }

    #[test]
    fn probe_order_for_64_bit() {
        let order = Architecture::X64.probe_order("Foo");
        assert_eq!(order, [hash("x64:Foo"), hash("Foo"), hash("x86:Foo")]);
    }

    proptest! {
        #[test]
        fn hash_ignores_ascii_case(name in "[A-Za-z0-9._-]{0,48}") {
            prop_assert_eq!(hash(&name), hash(&name.to_uppercase()));
            prop_assert_eq!(hash(&name), hash(&name.to_lowercase()));
        }

        #[test]
        fn hash_is_deterministic(name in ".{0,64}") {
            prop_assert_eq!(hash(&name), hash(&name));
            prop_assert_eq!(hash(&name).as_bytes().len(), 16);
        }
    }
}
