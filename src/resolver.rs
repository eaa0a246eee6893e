//! Runtime resolver: answers "give me module X" from registered sources.
//!
//! # Search policy
//! A request for `name` is hashed into three variants, probed in order:
//! native-architecture-qualified, unqualified, other-architecture-qualified
//! (see [`Architecture::probe_order`]).  For each variant the sources are
//! scanned in registration order and the first one holding the hash wins.
//! A source that fails to produce the bytes (corrupt payload, missing
//! codec) is logged and skipped; the scan moves on to the next source.
//!
//! # Loading
//! [`Resolver::load`] layers a module cache and the host's
//! [`ModuleLoader`] on top of [`Resolver::resolve`].  Decoding and
//! instantiation run outside every lock; two threads racing on the same
//! hash both do the work and the last insert wins.
//!
//! Native payloads are written to `<temp_dir>/<hash>.<dll ext>` before
//! loading.  An existing file of the same length is reused.
//!
//! # Lifecycle
//! `Unregistered → Initializing → Active`, advanced once by whichever
//! caller wins the compare-and-swap in [`Resolver::initialize_with`].

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec::CodecRegistry;
use crate::container::{Container, ContainerError};
use crate::hash::{self, Architecture};
use crate::resource::ResourceIndex;
use crate::source::{Payload, Source};

/// Extra search directories, `PATH`-style.
pub const SEARCH_PATH_ENV: &str = "MODPAK_PATH";
/// Overrides the directory native modules are materialized into.
pub const TEMP_DIR_ENV: &str = "MODPAK_TEMP_DIR";

pub type LoadError = Box<dyn std::error::Error + Send + Sync>;

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ResolverError {
    #[error("Container file not found: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("Container error: {0}")]
    Container(#[from] ContainerError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid file pattern: {0}")]
    Pattern(#[from] glob::PatternError),
    #[error("Failed to load module {hash}: {source}")]
    Load {
        hash: Uuid,
        #[source]
        source: LoadError,
    },
}

// ── Options ──────────────────────────────────────────────────────────────────

/// Resolver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverOptions {
    /// Directories searched, in order, for relative container names.
    pub search_path:  Vec<PathBuf>,
    /// Where native modules are materialized.
    pub temp_dir:     PathBuf,
    pub architecture: Architecture,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ResolverOptions {
    /// Executable directory, then `MODPAK_PATH`, then `PATH`.
    pub fn from_env() -> Self {
        let exe = std::env::current_exe().ok();
        let mut search_path: Vec<PathBuf> = Vec::new();
        if let Some(dir) = exe.as_deref().and_then(Path::parent) {
            search_path.push(dir.to_path_buf());
        }
        for var in [SEARCH_PATH_ENV, "PATH"] {
            if let Some(value) = std::env::var_os(var) {
                for dir in std::env::split_paths(&value) {
                    if !dir.as_os_str().is_empty() && !search_path.contains(&dir) {
                        search_path.push(dir);
                    }
                }
            }
        }

        let temp_dir = match std::env::var_os(TEMP_DIR_ENV) {
            Some(dir) => PathBuf::from(dir),
            None => {
                let owner = exe.as_deref().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();
                let tag = hex::encode(&hash::hash(&owner).as_bytes()[..8]);
                std::env::temp_dir().join("modpak").join(tag)
            }
        };

        Self { search_path, temp_dir, architecture: Architecture::native() }
    }

    /// Load options from JSON; missing fields fall back to [`from_env`](Self::from_env).
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

// ── Host loader ──────────────────────────────────────────────────────────────

/// The host's module instantiation hooks.
pub trait ModuleLoader: Send + Sync {
    type Module: Clone + Send + Sync;

    fn load_bytes(&self, hash: &Uuid, bytes: Vec<u8>) -> Result<Self::Module, LoadError>;
    fn load_path(&self, hash: &Uuid, path: &Path) -> Result<Self::Module, LoadError>;
}

// ── State / stats ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResolverState {
    Unregistered = 0,
    Initializing = 1,
    Active       = 2,
}

impl ResolverState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ResolverState::Unregistered,
            1 => ResolverState::Initializing,
            _ => ResolverState::Active,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverStats {
    pub cache_hits:    u64,
    pub cache_misses:  u64,
    pub files_written: u64,
}

#[derive(Default)]
struct Counters {
    cache_hits:    AtomicU64,
    cache_misses:  AtomicU64,
    files_written: AtomicU64,
}

/// A successful [`Resolver::resolve`].
#[derive(Debug, Clone)]
pub struct ResolvedModule {
    /// The variant hash that matched.
    pub hash:   Uuid,
    /// Identity of the source that answered.
    pub source: Uuid,
    pub bytes:  Vec<u8>,
    pub native: bool,
}

// ── Resolver ─────────────────────────────────────────────────────────────────

pub struct Resolver<L: ModuleLoader> {
    options:     ResolverOptions,
    registry:    Arc<CodecRegistry>,
    loader:      L,
    state:       AtomicU8,
    sources:     RwLock<Vec<Arc<dyn Source>>>,
    cache:       Mutex<HashMap<Uuid, L::Module>>,
    materialize: Mutex<()>,
    counters:    Counters,
}

impl<L: ModuleLoader> Resolver<L> {
    pub fn new(options: ResolverOptions, loader: L) -> Self {
        Self::with_registry(options, CodecRegistry::global(), loader)
    }

    pub fn with_registry(options: ResolverOptions, registry: Arc<CodecRegistry>, loader: L) -> Self {
        Self {
            options,
            registry,
            loader,
            state:       AtomicU8::new(ResolverState::Unregistered as u8),
            sources:     RwLock::new(Vec::new()),
            cache:       Mutex::new(HashMap::new()),
            materialize: Mutex::new(()),
            counters:    Counters::default(),
        }
    }

    pub fn options(&self) -> &ResolverOptions {
        &self.options
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    pub fn state(&self) -> ResolverState {
        ResolverState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn source_count(&self) -> usize {
        self.sources.read().len()
    }

    pub fn stats(&self) -> ResolverStats {
        ResolverStats {
            cache_hits:    self.counters.cache_hits.load(Ordering::Relaxed),
            cache_misses:  self.counters.cache_misses.load(Ordering::Relaxed),
            files_written: self.counters.files_written.load(Ordering::Relaxed),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    pub fn initialize(&self) -> bool {
        self.initialize_with(|_| {})
    }

    /// Run `wire` exactly once, then mark the resolver active.  Returns
    /// `false` if another caller already claimed initialization.
    pub fn initialize_with<F: FnOnce(&Self)>(&self, wire: F) -> bool {
        let claimed = self
            .state
            .compare_exchange(
                ResolverState::Unregistered as u8,
                ResolverState::Initializing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !claimed {
            return false;
        }
        wire(self);
        self.state.store(ResolverState::Active as u8, Ordering::Release);
        debug!(temp_dir = %self.options.temp_dir.display(), "resolver active");
        true
    }

    // ── Registration ─────────────────────────────────────────────────────────

    /// Append `source` unless one with the same identity is already present.
    pub fn register_source(&self, source: Arc<dyn Source>) -> bool {
        self.initialize();
        let id = source.source_id();
        let mut sources = self.sources.write();
        if sources.iter().any(|s| s.source_id() == id) {
            debug!(source = %id, "source already registered");
            return false;
        }
        sources.push(source);
        debug!(source = %id, position = sources.len(), "registered source");
        true
    }

    /// Open a container on `stream` and register it.
    pub fn register_container<S>(&self, stream: S) -> Result<bool, ResolverError>
    where
        S: Read + Seek + Send + 'static,
    {
        let container = Container::open_with(stream, Arc::clone(&self.registry))?;
        Ok(self.register_source(Arc::new(container)))
    }

    pub fn register_resources(&self, index: ResourceIndex) -> bool {
        self.register_source(Arc::new(index))
    }

    /// Locate `path` on the search path and register it.  With `optional`,
    /// a missing file is not an error.
    pub fn register_file<P: AsRef<Path>>(&self, path: P, optional: bool) -> Result<bool, ResolverError> {
        let path = path.as_ref();
        match self.locate(path) {
            Some(found) => {
                debug!(path = %found.display(), "registering container file");
                self.register_container(File::open(found)?)
            }
            None if optional => Ok(false),
            None => Err(ResolverError::FileNotFound(path.to_path_buf())),
        }
    }

    /// Register every file matching `pattern` in each search directory.
    /// Returns how many new containers were registered.
    pub fn register_files(&self, pattern: &str) -> Result<usize, ResolverError> {
        let patterns: Vec<PathBuf> = if Path::new(pattern).is_absolute() {
            vec![PathBuf::from(pattern)]
        } else {
            self.options.search_path.iter().map(|dir| dir.join(pattern)).collect()
        };

        let mut registered = 0;
        for full in patterns {
            let full = full.to_string_lossy();
            for path in glob::glob(&full)?.flatten() {
                if path.is_file() && self.register_file(&path, true)? {
                    registered += 1;
                }
            }
        }
        Ok(registered)
    }

    /// Resolve `path` against the search path.
    pub fn locate(&self, path: &Path) -> Option<PathBuf> {
        if path.is_absolute() {
            return path.is_file().then(|| path.to_path_buf());
        }
        self.options
            .search_path
            .iter()
            .map(|dir| dir.join(path))
            .find(|candidate| candidate.is_file())
    }

    // ── Resolution ───────────────────────────────────────────────────────────

    /// Find and decode `name`.  `None` means no source has it.
    pub fn resolve(&self, name: &str) -> Option<ResolvedModule> {
        self.options
            .architecture
            .probe_order(name)
            .iter()
            .find_map(|hash| self.resolve_hash(hash))
    }

    /// Find and decode an exact hash, without architecture probing.
    pub fn resolve_hash(&self, hash: &Uuid) -> Option<ResolvedModule> {
        let sources: Vec<Arc<dyn Source>> = self.sources.read().clone();
        for source in sources {
            if !source.has_entry(hash) {
                continue;
            }
            match source.get_bytes(hash) {
                Ok(Some(Payload { bytes, native })) => {
                    debug!(%hash, source = %source.source_id(), len = bytes.len(), "resolved module");
                    return Some(ResolvedModule { hash: *hash, source: source.source_id(), bytes, native });
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(%hash, source = %source.source_id(), error = %e, "source failed, trying next");
                }
            }
        }
        None
    }

    /// Resolve and instantiate `name`, going through the module cache.
    pub fn load(&self, name: &str) -> Result<Option<L::Module>, ResolverError> {
        for hash in self.options.architecture.probe_order(name) {
            if let Some(module) = self.cached(&hash) {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(module));
            }
            let Some(resolved) = self.resolve_hash(&hash) else { continue };
            self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);

            let module = self.instantiate(resolved)?;
            self.cache.lock().insert(hash, module.clone());
            return Ok(Some(module));
        }
        Ok(None)
    }

    /// Cached module for an exact hash.
    pub fn cached(&self, hash: &Uuid) -> Option<L::Module> {
        self.cache.lock().get(hash).cloned()
    }

    fn instantiate(&self, resolved: ResolvedModule) -> Result<L::Module, ResolverError> {
        let hash = resolved.hash;
        let loaded = if resolved.native {
            let path = self.materialize(&hash, &resolved.bytes)?;
            self.loader.load_path(&hash, &path)
        } else {
            self.loader.load_bytes(&hash, resolved.bytes)
        };
        loaded.map_err(|source| ResolverError::Load { hash, source })
    }

    /// Path a native module with `hash` is materialized to.
    pub fn native_path(&self, hash: &Uuid) -> PathBuf {
        let mut file = hex::encode(hash.as_bytes());
        if !std::env::consts::DLL_EXTENSION.is_empty() {
            file.push('.');
            file.push_str(std::env::consts::DLL_EXTENSION);
        }
        self.options.temp_dir.join(file)
    }

    fn materialize(&self, hash: &Uuid, bytes: &[u8]) -> io::Result<PathBuf> {
        let path = self.native_path(hash);
        let _guard = self.materialize.lock();
        if let Ok(meta) = fs::metadata(&path) {
            if meta.len() == bytes.len() as u64 {
                return Ok(path);
            }
        }

        fs::create_dir_all(&self.options.temp_dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.options.temp_dir)?;
        tmp.write_all(bytes)?;
        tmp.flush()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        self.counters.files_written.fetch_add(1, Ordering::Relaxed);
        debug!(%hash, path = %path.display(), len = bytes.len(), "materialized native module");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullLoader;
    impl ModuleLoader for NullLoader {
        type Module = ();
        fn load_bytes(&self, _: &Uuid, _: Vec<u8>) -> Result<(), LoadError> { Ok(()) }
        fn load_path(&self, _: &Uuid, _: &Path) -> Result<(), LoadError> { Ok(()) }
    }

    fn options() -> ResolverOptions {
        ResolverOptions {
            search_path:  Vec::new(),
            temp_dir:     std::env::temp_dir().join("modpak-unit"),
            architecture: Architecture::X64,
        }
    }

    #[test]
    fn initialization_runs_once() {
        let r = Resolver::new(options(), NullLoader);
        assert_eq!(r.state(), ResolverState::Unregistered);
        let mut calls = 0;
        assert!(r.initialize_with(|inner| {
            assert_eq!(inner.state(), ResolverState::Initializing);
            calls += 1;
        }));
        assert!(!r.initialize_with(|_| calls += 1));
        assert!(!r.initialize());
        assert_eq!(calls, 1);
        assert_eq!(r.state(), ResolverState::Active);
    }

    #[test]
    fn registration_activates() {
        let r = Resolver::new(options(), NullLoader);
        let c = Container::create(io::Cursor::new(Vec::new())).unwrap();
        let bytes = c.close().unwrap();
        assert!(r.register_container(bytes).unwrap());
        assert_eq!(r.state(), ResolverState::Active);
    }

    #[test]
    fn empty_resolver_answers_nothing() {
        let r = Resolver::new(options(), NullLoader);
        assert!(r.resolve("anything").is_none());
        assert!(r.load("anything").unwrap().is_none());
        assert_eq!(r.stats(), ResolverStats::default());
    }

    #[test]
    fn missing_required_file_fails() {
        let r = Resolver::new(options(), NullLoader);
        assert!(!r.register_file("nope.modz", true).unwrap());
        assert!(matches!(r.register_file("nope.modz", false), Err(ResolverError::FileNotFound(_))));
    }

    #[test]
    fn options_from_json_fill_defaults() {
        let opts = ResolverOptions::from_json(br#"{"architecture":"x86","search_path":["/opt/mods"]}"#).unwrap();
        assert_eq!(opts.architecture, Architecture::X86);
        assert_eq!(opts.search_path, vec![PathBuf::from("/opt/mods")]);
        assert!(!opts.temp_dir.as_os_str().is_empty());
    }

    #[test]
    fn native_path_is_deterministic() {
        let r = Resolver::new(options(), NullLoader);
        let h = hash::hash("native");
        assert_eq!(r.native_path(&h), r.native_path(&h));
        assert!(r.native_path(&h).starts_with(&r.options().temp_dir));
    }
}
