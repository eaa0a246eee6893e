//! Codec registry: name-derived ids + the plugin contract.
//!
//! # Identity rules
//! Every codec is identified on disk by a `u32` id derived from its name:
//! `crc32(lowercase(name))`.  The id is what container entries store; the
//! name is only needed at registration and for diagnostics.
//!
//! Id `0` ([`NO_CODEC`]) is reserved and means "stored raw".  A codec whose
//! name happens to checksum to `0` is rejected at registration rather than
//! silently aliasing raw storage.
//!
//! # Write-time policy
//! [`CodecRegistry::encode_for_storage`] keeps the encoded form only when it
//! is strictly smaller than the input.  The choice is made per payload.

use std::borrow::Cow;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

/// Codec id meaning "no codec, raw bytes".
pub const NO_CODEC: u32 = 0;

/// Default Zstd compression level.
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;
/// Default Brotli quality.
pub const DEFAULT_BROTLI_QUALITY: u32 = 9;

/// Stable id for a codec name.
pub fn codec_id(name: &str) -> u32 {
    crc32fast::hash(name.to_lowercase().as_bytes())
}

fn validate_id(name: &str, id: u32) -> Result<u32, CodecError> {
    if id == NO_CODEC {
        return Err(CodecError::InvalidArgument(format!(
            "codec name '{name}' maps to the reserved id 0"
        )));
    }
    Ok(id)
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Codec '{name}' already registered (id {id:#010x})")]
    Duplicate { name: String, id: u32 },
    #[error("Unknown codec id {0:#010x}")]
    UnknownCodec(u32),
    #[error("Unknown codec '{0}'")]
    UnknownName(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Encode error: {0}")]
    Encode(String),
    #[error("Decode error: {0}")]
    Decode(String),
}

// ── Codec trait ──────────────────────────────────────────────────────────────

/// Plugin contract consumed by the registry.
///
/// `decode` receives the pre-codec length recorded at write time.  Codecs
/// may use it as a capacity hint; the registry verifies it either way.
pub trait Codec: Send + Sync {
    fn name(&self) -> &str;

    /// Called once when the codec is registered.
    fn initialize(&self) -> Result<(), CodecError> {
        Ok(())
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError>;
}

// ── Built-in codec implementations ──────────────────────────────────────────

pub struct ZstdCodec {
    pub level: i32,
}

impl Default for ZstdCodec {
    fn default() -> Self {
        Self { level: DEFAULT_ZSTD_LEVEL }
    }
}

impl Codec for ZstdCodec {
    fn name(&self) -> &str { "zstd" }
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        zstd::encode_all(data, self.level).map_err(|e| CodecError::Encode(e.to_string()))
    }
    fn decode(&self, data: &[u8], _: usize) -> Result<Vec<u8>, CodecError> {
        zstd::decode_all(data).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

pub struct Lz4Codec;
impl Codec for Lz4Codec {
    fn name(&self) -> &str { "lz4" }
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(lz4_flex::compress_prepend_size(data))
    }
    fn decode(&self, data: &[u8], _: usize) -> Result<Vec<u8>, CodecError> {
        lz4_flex::decompress_size_prepended(data).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

pub struct BrotliCodec {
    pub quality: u32,
}

impl Default for BrotliCodec {
    fn default() -> Self {
        Self { quality: DEFAULT_BROTLI_QUALITY }
    }
}

impl Codec for BrotliCodec {
    fn name(&self) -> &str { "brotli" }
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        {
            let mut w = brotli::CompressorWriter::new(&mut out, 4096, self.quality.min(11), 22);
            w.write_all(data).map_err(|e| CodecError::Encode(e.to_string()))?;
        }
        Ok(out)
    }
    fn decode(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(expected_len);
        brotli::Decompressor::new(data, 4096)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        Ok(out)
    }
}

pub struct LzmaCodec;
impl Codec for LzmaCodec {
    fn name(&self) -> &str { "lzma" }
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::lzma_compress(&mut std::io::Cursor::new(data), &mut out)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(out)
    }
    fn decode(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(expected_len);
        lzma_rs::lzma_decompress(&mut std::io::Cursor::new(data), &mut out)
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        Ok(out)
    }
}

type EncodeFn = dyn Fn(&[u8]) -> Result<Vec<u8>, CodecError> + Send + Sync;
type DecodeFn = dyn Fn(&[u8], usize) -> Result<Vec<u8>, CodecError> + Send + Sync;

/// Codec assembled from a pair of closures.
pub struct FnCodec {
    name:   String,
    encode: Box<EncodeFn>,
    decode: Box<DecodeFn>,
}

impl FnCodec {
    pub fn new<E, D>(name: impl Into<String>, encode: E, decode: D) -> Self
    where
        E: Fn(&[u8]) -> Result<Vec<u8>, CodecError> + Send + Sync + 'static,
        D: Fn(&[u8], usize) -> Result<Vec<u8>, CodecError> + Send + Sync + 'static,
    {
        Self { name: name.into(), encode: Box::new(encode), decode: Box::new(decode) }
    }
}

impl Codec for FnCodec {
    fn name(&self) -> &str { &self.name }
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> { (self.encode)(data) }
    fn decode(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        (self.decode)(data, expected_len)
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// Bytes ready to be written, plus the codec id that produced them.
#[derive(Debug)]
pub struct Encoded<'a> {
    pub codec_id: u32,
    pub bytes:    Cow<'a, [u8]>,
}

static GLOBAL: Lazy<Arc<CodecRegistry>> = Lazy::new(|| Arc::new(CodecRegistry::with_builtins()));

/// Mapping from codec id to implementation.
#[derive(Default)]
pub struct CodecRegistry {
    codecs: RwLock<HashMap<u32, Arc<dyn Codec>>>,
}

impl CodecRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding zstd, lz4, brotli and lzma.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        let builtins: [Arc<dyn Codec>; 4] = [
            Arc::new(ZstdCodec::default()),
            Arc::new(Lz4Codec),
            Arc::new(BrotliCodec::default()),
            Arc::new(LzmaCodec),
        ];
        for codec in builtins {
            // Built-in names are fixed and known not to collide.
            let id = codec_id(codec.name());
            registry.codecs.write().insert(id, codec);
        }
        registry
    }

    /// The process-wide registry shared by every container and resolver that
    /// is not handed one explicitly.
    pub fn global() -> Arc<CodecRegistry> {
        Arc::clone(&GLOBAL)
    }

    /// Register `codec`, returning its id.
    pub fn register(&self, codec: Arc<dyn Codec>, overwrite: bool) -> Result<u32, CodecError> {
        let name = codec.name().to_owned();
        let id = validate_id(&name, codec_id(&name))?;
        let mut codecs = self.codecs.write();
        if !overwrite {
            if let Some(existing) = codecs.get(&id) {
                return Err(CodecError::Duplicate { name: existing.name().to_owned(), id });
            }
        }
        codec.initialize()?;
        codecs.insert(id, codec);
        debug!(codec = %name, id, "registered codec");
        Ok(id)
    }

    /// Register a codec from an encode/decode closure pair.
    pub fn register_fns<E, D>(
        &self,
        name: &str,
        encode: E,
        decode: D,
        overwrite: bool,
    ) -> Result<u32, CodecError>
    where
        E: Fn(&[u8]) -> Result<Vec<u8>, CodecError> + Send + Sync + 'static,
        D: Fn(&[u8], usize) -> Result<Vec<u8>, CodecError> + Send + Sync + 'static,
    {
        self.register(Arc::new(FnCodec::new(name, encode, decode)), overwrite)
    }

    pub fn get(&self, id: u32) -> Option<Arc<dyn Codec>> {
        self.codecs.read().get(&id).cloned()
    }

    /// Look a codec up by name (case-insensitive).
    pub fn find(&self, name: &str) -> Option<(u32, Arc<dyn Codec>)> {
        let id = codec_id(name);
        self.get(id).map(|c| (id, c))
    }

    pub fn contains(&self, id: u32) -> bool {
        id == NO_CODEC || self.codecs.read().contains_key(&id)
    }

    /// Display name for an id; `"none"` for raw storage.
    pub fn name_of(&self, id: u32) -> Option<String> {
        if id == NO_CODEC {
            return Some("none".to_owned());
        }
        self.get(id).map(|c| c.name().to_owned())
    }

    /// Registered `(id, name)` pairs, sorted by name.
    pub fn list(&self) -> Vec<(u32, String)> {
        let mut out: Vec<(u32, String)> = self
            .codecs
            .read()
            .iter()
            .map(|(id, c)| (*id, c.name().to_owned()))
            .collect();
        out.sort_by(|a, b| a.1.cmp(&b.1));
        out
    }

    /// Decode `data` produced by codec `id` back to `expected_len` bytes.
    pub fn decode(&self, id: u32, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        let out = if id == NO_CODEC {
            data.to_vec()
        } else {
            let codec = self.get(id).ok_or(CodecError::UnknownCodec(id))?;
            codec.decode(data, expected_len)?
        };
        if out.len() != expected_len {
            return Err(CodecError::Decode(format!(
                "decoded {} bytes, expected {expected_len}",
                out.len()
            )));
        }
        Ok(out)
    }

    /// Apply the write-time policy: encode with `codec` (by name) and keep
    /// the result only if strictly smaller than `data`.
    pub fn encode_for_storage<'a>(
        &self,
        codec: Option<&str>,
        data: &'a [u8],
    ) -> Result<Encoded<'a>, CodecError> {
        let raw = Encoded { codec_id: NO_CODEC, bytes: Cow::Borrowed(data) };
        let Some(name) = codec else { return Ok(raw) };
        let (id, codec) = self.find(name).ok_or_else(|| CodecError::UnknownName(name.to_owned()))?;
        let encoded = codec.encode(data)?;
        if encoded.len() < data.len() {
            Ok(Encoded { codec_id: id, bytes: Cow::Owned(encoded) })
        } else {
            Ok(raw)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample(len: usize) -> Vec<u8> {
        b"the quick brown fox jumps over the lazy dog. "
            .iter()
            .cycle()
            .take(len)
            .copied()
            .collect()
    }

    #[test]
    fn builtins_are_registered() {
        let reg = CodecRegistry::with_builtins();
        for name in ["zstd", "lz4", "brotli", "lzma"] {
            assert!(reg.find(name).is_some(), "{name} missing");
        }
        assert!(reg.find("ZSTD").is_some());
        assert_eq!(reg.list().len(), 4);
    }

    #[test]
    fn duplicate_registration_fails_without_overwrite() {
        let reg = CodecRegistry::with_builtins();
        let err = reg.register(Arc::new(Lz4Codec), false).unwrap_err();
        assert!(matches!(err, CodecError::Duplicate { .. }));
        assert_eq!(reg.register(Arc::new(Lz4Codec), true).unwrap(), codec_id("lz4"));
    }

    #[test]
    fn reserved_id_is_rejected() {
        assert!(matches!(validate_id("x", NO_CODEC), Err(CodecError::InvalidArgument(_))));
        assert_eq!(validate_id("x", 7).unwrap(), 7);
    }

    #[test]
    fn unknown_id_fails_decode() {
        let reg = CodecRegistry::new();
        let err = reg.decode(0xdead_beef, b"abc", 3).unwrap_err();
        assert!(matches!(err, CodecError::UnknownCodec(0xdead_beef)));
    }

    #[test]
    fn raw_id_passes_through() {
        let reg = CodecRegistry::new();
        assert_eq!(reg.decode(NO_CODEC, b"abc", 3).unwrap(), b"abc");
        assert!(reg.decode(NO_CODEC, b"abc", 4).is_err());
    }

    #[test]
    fn storage_policy_keeps_smaller_encoding() {
        let reg = CodecRegistry::with_builtins();
        let data = sample(4096);
        let enc = reg.encode_for_storage(Some("zstd"), &data).unwrap();
        assert_eq!(enc.codec_id, codec_id("zstd"));
        assert!(enc.bytes.len() < data.len());
    }

    #[test]
    fn storage_policy_falls_back_to_raw() {
        let reg = CodecRegistry::with_builtins();
        let data = [0x5au8; 3];
        let enc = reg.encode_for_storage(Some("zstd"), &data).unwrap();
        assert_eq!(enc.codec_id, NO_CODEC);
        assert_eq!(&*enc.bytes, &data);
    }

    #[test]
    fn storage_policy_rejects_unknown_name() {
        let reg = CodecRegistry::new();
        assert!(matches!(
            reg.encode_for_storage(Some("nope"), b"data"),
            Err(CodecError::UnknownName(_))
        ));
    }

    #[test]
    fn closure_codec_registers_and_decodes() {
        let reg = CodecRegistry::new();
        let id = reg
            .register_fns(
                "xor",
                |d| Ok(d.iter().map(|b| b ^ 0xff).collect()),
                |d, _| Ok(d.iter().map(|b| b ^ 0xff).collect()),
                false,
            )
            .unwrap();
        assert_eq!(id, codec_id("xor"));
        let enc = reg.get(id).unwrap().encode(b"hi").unwrap();
        assert_eq!(reg.decode(id, &enc, 2).unwrap(), b"hi");
    }

    proptest! {
        #[test]
        fn builtin_codecs_round_trip(data in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let reg = CodecRegistry::with_builtins();
            for (id, _) in reg.list() {
                let codec = reg.get(id).unwrap();
                let enc = codec.encode(&data).unwrap();
                prop_assert_eq!(reg.decode(id, &enc, data.len()).unwrap(), data.clone());
            }
        }
    }
}
