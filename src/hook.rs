//! Process-level entry points for the host integration layer.
//!
//! The integration layer (whatever patches the host to call in at startup)
//! only ever talks to these free functions.  They forward to a single
//! [`Resolver<ImageLoader>`] created on first use from
//! [`ResolverOptions::from_env`].  The loader does not instantiate anything
//! itself: it hands the host a [`LoadedImage`] saying where the module can
//! be instantiated from.

use std::io::{Read, Seek};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use tracing::warn;
use uuid::Uuid;

use crate::resolver::{
    LoadError, ModuleLoader, ResolvedModule, Resolver, ResolverError, ResolverOptions,
};
use crate::resource::{ResourceIndex, ResourceStore};

/// Where the host should instantiate a module from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleImage {
    Memory(Arc<[u8]>),
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedImage {
    pub hash:  Uuid,
    pub image: ModuleImage,
}

/// [`ModuleLoader`] that hands images back to the host untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageLoader;

impl ModuleLoader for ImageLoader {
    type Module = LoadedImage;

    fn load_bytes(&self, hash: &Uuid, bytes: Vec<u8>) -> Result<LoadedImage, LoadError> {
        Ok(LoadedImage { hash: *hash, image: ModuleImage::Memory(bytes.into()) })
    }

    fn load_path(&self, hash: &Uuid, path: &Path) -> Result<LoadedImage, LoadError> {
        Ok(LoadedImage { hash: *hash, image: ModuleImage::File(path.to_path_buf()) })
    }
}

static RESOLVER: Lazy<Resolver<ImageLoader>> =
    Lazy::new(|| Resolver::new(ResolverOptions::from_env(), ImageLoader));

/// The process-wide resolver.
pub fn resolver() -> &'static Resolver<ImageLoader> {
    &RESOLVER
}

/// Idempotent; returns `true` only for the call that performed the
/// initialization.
pub fn initialize() -> bool {
    RESOLVER.initialize()
}

pub fn register_container<S>(stream: S) -> Result<bool, ResolverError>
where
    S: Read + Seek + Send + 'static,
{
    RESOLVER.register_container(stream)
}

pub fn register_file<P: AsRef<Path>>(path: P, optional: bool) -> Result<bool, ResolverError> {
    RESOLVER.register_file(path, optional)
}

pub fn register_files(pattern: &str) -> Result<usize, ResolverError> {
    RESOLVER.register_files(pattern)
}

/// Index the host's embedded module resources and register them.
pub fn register_resources(store: Arc<dyn ResourceStore>) -> bool {
    RESOLVER.register_resources(ResourceIndex::scan(store))
}

pub fn resolve(name: &str) -> Option<ResolvedModule> {
    RESOLVER.resolve(name)
}

/// Cache-aware load.  Failures are logged and reported as "not found" so the
/// host's own missing-module handling takes over.
pub fn load(name: &str) -> Option<LoadedImage> {
    match RESOLVER.load(name) {
        Ok(found) => found,
        Err(e) => {
            warn!(module = name, error = %e, "module resolution failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{AppendOptions, Container};
    use std::io::Cursor;

    #[test]
    fn image_loader_reports_origin() {
        let h = crate::hash::hash("m");
        let img = ImageLoader.load_bytes(&h, vec![1, 2, 3]).unwrap();
        assert_eq!(img.image, ModuleImage::Memory(Arc::from(&[1u8, 2, 3][..])));
        let img = ImageLoader.load_path(&h, Path::new("/tmp/m.so")).unwrap();
        assert_eq!(img.image, ModuleImage::File(PathBuf::from("/tmp/m.so")));
    }

    #[test]
    fn process_resolver_serves_registered_containers() {
        let mut c = Container::create(Cursor::new(Vec::new())).unwrap();
        c.append("hook-test-module", b"payload", &AppendOptions::default()).unwrap();
        let stream = c.close().unwrap();

        initialize();
        assert!(register_container(stream).unwrap());
        assert_eq!(resolve("Hook-Test-Module").unwrap().bytes, b"payload");
        let loaded = load("hook-test-module").unwrap();
        assert_eq!(loaded.image, ModuleImage::Memory(Arc::from(&b"payload"[..])));
        assert!(load("hook-test-missing").is_none());
    }
}
