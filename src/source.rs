//! The lookup surface shared by containers and resource indexes.

use std::io::{Read, Seek};

use thiserror::Error;
use uuid::Uuid;

use crate::container::{Container, ContainerError};
use crate::resource::{ResourceError, ResourceIndex};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
}

/// Decoded module bytes plus how the host may instantiate them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub bytes:  Vec<u8>,
    /// Must be materialized to a file before loading.
    pub native: bool,
}

/// Something the resolver can search for a hash.
pub trait Source: Send + Sync {
    /// Stable identity used to skip duplicate registrations.
    fn source_id(&self) -> Uuid;
    fn has_entry(&self, hash: &Uuid) -> bool;
    fn get_bytes(&self, hash: &Uuid) -> Result<Option<Payload>, SourceError>;
}

impl<S: Read + Seek + Send> Source for Container<S> {
    fn source_id(&self) -> Uuid {
        self.instance_id()
    }

    fn has_entry(&self, hash: &Uuid) -> bool {
        self.contains(hash)
    }

    fn get_bytes(&self, hash: &Uuid) -> Result<Option<Payload>, SourceError> {
        let native = self.entry(hash).is_some_and(|e| e.flags.is_native());
        Ok(Container::get_bytes(self, hash)?.map(|bytes| Payload { bytes, native }))
    }
}

impl Source for ResourceIndex {
    fn source_id(&self) -> Uuid {
        self.id()
    }

    fn has_entry(&self, hash: &Uuid) -> bool {
        ResourceIndex::has_entry(self, hash)
    }

    fn get_bytes(&self, hash: &Uuid) -> Result<Option<Payload>, SourceError> {
        let native = self.entry(hash).is_some_and(|e| e.flags.is_native());
        Ok(ResourceIndex::get_bytes(self, hash)?.map(|bytes| Payload { bytes, native }))
    }
}
