//! Embedded-resource index: modules stored as named resources inside the
//! host binary instead of in a container file.
//!
//! Resource names carry everything the index needs:
//!
//! ```text
//! modz://<32 hex hash>/<decimal size>[/<flags>]
//! ```
//!
//! `size` is the decoded length.  Flag letters:
//!
//! | Letter | Meaning |
//! |--------|---------|
//! | `z` | payload is a zstd frame |
//! | `u` | native code, must be materialized to a file |
//! | `p` | architecture-neutral |
//!
//! Names that do not match the grammar (including unknown flag letters) are
//! simply not module resources and are skipped.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec::{Codec, ZstdCodec};
use crate::container::EntryFlags;

pub const RESOURCE_SCHEME: &str = "modz";

static NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^modz://([0-9A-Fa-f]{32})/([0-9]{1,10})(?:/([a-z]*))?$")
        .expect("resource name pattern is valid")
});

#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("Resource '{0}' is indexed but the store returned nothing")]
    Missing(String),
    #[error("Resource '{name}' decoded to {actual} bytes, expected {expected}")]
    SizeMismatch { name: String, expected: usize, actual: usize },
    #[error("Resource '{name}' failed to decode: {reason}")]
    Decode { name: String, reason: String },
}

// ── Store ────────────────────────────────────────────────────────────────────

/// Named blobs embedded in the host.
pub trait ResourceStore: Send + Sync {
    fn resource_names(&self) -> Vec<String>;
    fn resource_bytes(&self, name: &str) -> Option<Vec<u8>>;
}

/// In-memory [`ResourceStore`]; names are reported in insertion order.
#[derive(Debug, Default, Clone)]
pub struct MemoryResources {
    names: Vec<String>,
    data:  HashMap<String, Vec<u8>>,
}

impl MemoryResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, bytes: Vec<u8>) {
        let name = name.into();
        if self.data.insert(name.clone(), bytes).is_none() {
            self.names.push(name);
        }
    }
}

impl ResourceStore for MemoryResources {
    fn resource_names(&self) -> Vec<String> {
        self.names.clone()
    }

    fn resource_bytes(&self, name: &str) -> Option<Vec<u8>> {
        self.data.get(name).cloned()
    }
}

// ── Names ────────────────────────────────────────────────────────────────────

/// One parsed resource name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEntry {
    pub name:       String,
    pub hash:       Uuid,
    pub size:       usize,
    pub compressed: bool,
    pub flags:      EntryFlags,
}

/// Parse a resource name; `None` if it is not a module resource.
pub fn parse_resource_name(name: &str) -> Option<ResourceEntry> {
    let caps = NAME_RE.captures(name)?;
    let mut id = [0u8; 16];
    hex::decode_to_slice(&caps[1], &mut id).ok()?;
    let size: usize = caps[2].parse().ok()?;

    let mut compressed = false;
    let mut flags = EntryFlags::NONE;
    for letter in caps.get(3).map_or("", |m| m.as_str()).chars() {
        match letter {
            'z' => compressed = true,
            'u' => flags |= EntryFlags::NATIVE,
            'p' => flags |= EntryFlags::PORTABLE,
            _ => return None,
        }
    }

    Some(ResourceEntry {
        name: name.to_owned(),
        hash: Uuid::from_bytes(id),
        size,
        compressed,
        flags,
    })
}

/// Format a resource name for the given payload description.
pub fn resource_name(hash: &Uuid, size: usize, compressed: bool, flags: EntryFlags) -> String {
    let mut letters = String::new();
    if compressed {
        letters.push('z');
    }
    if flags.is_native() {
        letters.push('u');
    }
    if flags.is_portable() {
        letters.push('p');
    }
    let mut name = format!("{RESOURCE_SCHEME}://{}/{size}", hex::encode(hash.as_bytes()));
    if !letters.is_empty() {
        name.push('/');
        name.push_str(&letters);
    }
    name
}

/// Prepare a module for embedding: returns the resource name and the bytes
/// to store under it.  With `compress`, the payload is zstd-encoded when
/// that makes it smaller.
pub fn embed(hash: &Uuid, data: &[u8], flags: EntryFlags, compress: bool) -> (String, Vec<u8>) {
    if compress {
        if let Ok(encoded) = ZstdCodec::default().encode(data) {
            if encoded.len() < data.len() {
                return (resource_name(hash, data.len(), true, flags), encoded);
            }
        }
    }
    (resource_name(hash, data.len(), false, flags), data.to_vec())
}

// ── Index ────────────────────────────────────────────────────────────────────

/// Hash → resource lookup built by scanning a store once.
pub struct ResourceIndex {
    id:      Uuid,
    store:   Arc<dyn ResourceStore>,
    entries: HashMap<Uuid, ResourceEntry>,
}

impl ResourceIndex {
    pub fn scan(store: Arc<dyn ResourceStore>) -> Self {
        let mut entries: HashMap<Uuid, ResourceEntry> = HashMap::new();
        for name in store.resource_names() {
            let Some(entry) = parse_resource_name(&name) else { continue };
            if let Some(existing) = entries.get(&entry.hash) {
                warn!(
                    hash = %entry.hash,
                    kept = %existing.name,
                    ignored = %entry.name,
                    "duplicate embedded module resource"
                );
                continue;
            }
            entries.insert(entry.hash, entry);
        }
        debug!(resources = entries.len(), "indexed embedded module resources");
        Self { id: Uuid::new_v4(), store, entries }
    }

    /// Identity of this index within a resolver's source list.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_entry(&self, hash: &Uuid) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn entry(&self, hash: &Uuid) -> Option<&ResourceEntry> {
        self.entries.get(hash)
    }

    /// Decoded bytes for `hash`, or `None` if not indexed.
    pub fn get_bytes(&self, hash: &Uuid) -> Result<Option<Vec<u8>>, ResourceError> {
        let Some(entry) = self.entries.get(hash) else { return Ok(None) };
        let raw = self
            .store
            .resource_bytes(&entry.name)
            .ok_or_else(|| ResourceError::Missing(entry.name.clone()))?;

        let bytes = if entry.compressed {
            ZstdCodec::default()
                .decode(&raw, entry.size)
                .map_err(|e| ResourceError::Decode { name: entry.name.clone(), reason: e.to_string() })?
        } else {
            raw
        };
        if bytes.len() != entry.size {
            return Err(ResourceError::SizeMismatch {
                name:     entry.name.clone(),
                expected: entry.size,
                actual:   bytes.len(),
            });
        }
        Ok(Some(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash;

    #[test]
    fn parses_plain_name() {
        let h = hash("Foo");
        let name = format!("modz://{}/1234", hex::encode(h.as_bytes()));
        let e = parse_resource_name(&name).unwrap();
        assert_eq!(e.hash, h);
        assert_eq!(e.size, 1234);
        assert!(!e.compressed);
        assert_eq!(e.flags, EntryFlags::NONE);
    }

    #[test]
    fn parses_flags() {
        let h = hash("Foo");
        let name = format!("modz://{}/10/zup", hex::encode(h.as_bytes()).to_uppercase());
        let e = parse_resource_name(&name).unwrap();
        assert_eq!(e.hash, h);
        assert!(e.compressed);
        assert!(e.flags.is_native());
        assert!(e.flags.is_portable());
    }

    #[test]
    fn rejects_non_module_names() {
        let hex = "0123456789abcdef0123456789abcdef";
        assert!(parse_resource_name("icon.png").is_none());
        assert!(parse_resource_name(&format!("http://{hex}/10")).is_none());
        assert!(parse_resource_name(&format!("modz://{hex}/")).is_none());
        assert!(parse_resource_name(&format!("modz://{hex}/10/q")).is_none());
        assert!(parse_resource_name("modz://0123/10").is_none());
    }

    #[test]
    fn name_formatting_round_trips() {
        let h = hash("bar");
        let name = resource_name(&h, 99, true, EntryFlags::NATIVE);
        assert!(name.ends_with("/99/zu"));
        let e = parse_resource_name(&name).unwrap();
        assert_eq!((e.hash, e.size, e.compressed, e.flags), (h, 99, true, EntryFlags::NATIVE));
    }

    #[test]
    fn index_decodes_compressed_and_plain() {
        let big = vec![b'a'; 4096];
        let (zname, zbytes) = embed(&hash("big"), &big, EntryFlags::NONE, true);
        let (pname, pbytes) = embed(&hash("small"), b"xyz", EntryFlags::NATIVE, true);
        assert!(zname.ends_with("/z"));
        assert!(pname.ends_with("/3/u"));

        let mut store = MemoryResources::new();
        store.insert(zname, zbytes);
        store.insert(pname, pbytes);
        store.insert("unrelated.txt", b"ignored".to_vec());
        let index = ResourceIndex::scan(Arc::new(store));

        assert_eq!(index.len(), 2);
        assert_eq!(index.get_bytes(&hash("BIG")).unwrap().unwrap(), big);
        assert_eq!(index.get_bytes(&hash("small")).unwrap().unwrap(), b"xyz");
        assert!(index.entry(&hash("small")).unwrap().flags.is_native());
        assert!(index.get_bytes(&hash("absent")).unwrap().is_none());
    }

    #[test]
    fn duplicate_hash_keeps_first() {
        let h = hash("dup");
        let mut store = MemoryResources::new();
        store.insert(resource_name(&h, 5, false, EntryFlags::NONE), b"first".to_vec());
        store.insert(resource_name(&h, 6, false, EntryFlags::PORTABLE), b"second".to_vec());
        let index = ResourceIndex::scan(Arc::new(store));
        assert_eq!(index.len(), 1);
        assert_eq!(index.get_bytes(&h).unwrap().unwrap(), b"first");
    }

    #[test]
    fn size_mismatch_is_reported() {
        let h = hash("liar");
        let mut store = MemoryResources::new();
        store.insert(resource_name(&h, 10, false, EntryFlags::NONE), b"short".to_vec());
        let index = ResourceIndex::scan(Arc::new(store));
        assert!(matches!(index.get_bytes(&h), Err(ResourceError::SizeMismatch { .. })));
    }
}
