pub mod hash;
pub mod codec;
pub mod container;
pub mod resource;
pub mod source;
pub mod resolver;
pub mod hook;

pub use hash::{hash, hash_for, Architecture};
pub use codec::{Codec, CodecError, CodecRegistry, NO_CODEC};
pub use container::{AppendOptions, Container, ContainerError, Entry, EntryFlags};
pub use resource::{MemoryResources, ResourceIndex, ResourceStore};
pub use source::{Payload, Source};
pub use resolver::{ModuleLoader, ResolvedModule, Resolver, ResolverError, ResolverOptions};
