//! Container reader/writer.
//!
//! A container is a header, a run of payload regions, and a footer holding
//! the entry index.  The footer always sits at the end of the stream and is
//! rewritten whenever the entry set changes:
//!
//! ```text
//! ┌────────┬───────────┬───────────┬─────┬──────────────────────────────┐
//! │ header │ payload 0 │ payload 1 │ ... │ footer (index + back-pointer) │
//! └────────┴───────────┴───────────┴─────┴──────────────────────────────┘
//!                                          ^ footer_offset
//! ```
//!
//! # Writing
//! [`Container::append`] writes a payload over the old footer position and
//! advances `footer_offset`; the footer itself is only rewritten by
//! [`Container::flush`] / [`Container::close`].  A container that is dropped
//! dirty loses its new entries.
//!
//! # Reading
//! [`Container::get_bytes`] takes `&self`.  The stream sits behind a mutex
//! held only for the seek + copy; codec decoding runs after the lock is
//! released, so concurrent lookups of different entries decode in parallel.

pub mod format;
mod batch;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::codec::{CodecError, CodecRegistry, Encoded};
use crate::hash::{self, Architecture};

pub use format::{
    Entry, EntryFlags, Header, EMPTY_FOOTER_SIZE, ENTRY_SIZE, FORMAT_VERSION, HEADER_SIZE, MAGIC,
    TRAILER_SIZE,
};

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("Invalid container format: {0}")]
    Format(String),
    #[error("Unsupported container version: {0}")]
    UnsupportedVersion(u32),
    #[error("Entry {0} already exists")]
    DuplicateEntry(Uuid),
    #[error("Entry {hash} is corrupt: {reason}")]
    Corrupt { hash: Uuid, reason: String },
    #[error("Payload of {0} bytes exceeds the 4 GiB entry limit")]
    TooLarge(usize),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Stream truncation ────────────────────────────────────────────────────────

/// Streams whose length can be cut back.  Needed because removing entries
/// shrinks the footer, and the trailer must stay at the very end.
pub trait SetLen {
    fn set_len(&mut self, len: u64) -> io::Result<()>;
}

impl SetLen for File {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }
}

impl SetLen for Cursor<Vec<u8>> {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.get_mut().resize(len as usize, 0);
        Ok(())
    }
}

// ── AppendOptions ────────────────────────────────────────────────────────────

/// Configuration for [`Container::append`].
#[derive(Debug, Clone)]
pub struct AppendOptions {
    /// Codec name; `None` stores raw.  The codec is only used when it makes
    /// the payload strictly smaller.
    pub codec:        Option<String>,
    pub flags:        EntryFlags,
    /// Store under the architecture-qualified name (`"x86:<name>"`).
    pub architecture: Option<Architecture>,
    /// Replace an existing entry with the same hash.  The old payload stays
    /// on disk as dead space until [`Container::rebuild`].
    pub overwrite:    bool,
}

impl Default for AppendOptions {
    fn default() -> Self {
        Self {
            codec:        Some("zstd".to_owned()),
            flags:        EntryFlags::NONE,
            architecture: None,
            overwrite:    false,
        }
    }
}

impl AppendOptions {
    pub fn hash_for(&self, name: &str) -> Uuid {
        match self.architecture {
            Some(arch) => hash::hash_for(arch, name),
            None       => hash::hash(name),
        }
    }
}

// ── Container ────────────────────────────────────────────────────────────────

pub struct Container<S> {
    stream:        Mutex<S>,
    header:        Header,
    entries:       HashMap<Uuid, Entry>,
    footer_offset: u64,
    dirty:         bool,
    registry:      Arc<CodecRegistry>,
}

impl<S: Read + Seek> Container<S> {
    /// Open an existing container using the process-wide codec registry.
    pub fn open(stream: S) -> Result<Self, ContainerError> {
        Self::open_with(stream, CodecRegistry::global())
    }

    /// Open and validate an existing container.
    pub fn open_with(mut stream: S, registry: Arc<CodecRegistry>) -> Result<Self, ContainerError> {
        stream.seek(SeekFrom::Start(0))?;
        let header = Header::read(&mut stream)?;

        let end = stream.seek(SeekFrom::End(0))?;
        if end < HEADER_SIZE + EMPTY_FOOTER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("container of {end} bytes has no room for a footer"),
            )
            .into());
        }
        stream.seek(SeekFrom::Start(end - TRAILER_SIZE))?;
        let footer_offset = format::read_trailer(&mut stream)?;
        if footer_offset < HEADER_SIZE || footer_offset > end - EMPTY_FOOTER_SIZE {
            return Err(ContainerError::Format(format!(
                "footer offset {footer_offset} outside stream of {end} bytes"
            )));
        }

        stream.seek(SeekFrom::Start(footer_offset))?;
        let count = u64::from(stream.read_u32::<LittleEndian>()?);
        if footer_offset + 4 + count * ENTRY_SIZE + TRAILER_SIZE != end {
            return Err(ContainerError::Format(format!(
                "footer declares {count} entries but the stream length disagrees"
            )));
        }

        let mut entries = HashMap::with_capacity(count as usize);
        for _ in 0..count {
            let entry = Entry::read(&mut stream)?;
            if entry.offset < HEADER_SIZE || entry.end() > footer_offset {
                return Err(ContainerError::Corrupt {
                    hash:   entry.hash,
                    reason: format!("payload {}..{} outside data region", entry.offset, entry.end()),
                });
            }
            if entries.insert(entry.hash, entry.clone()).is_some() {
                return Err(ContainerError::Format(format!("duplicate entry {}", entry.hash)));
            }
        }

        debug!(container = %header.instance_id, entries = count, "opened container");
        Ok(Self {
            stream: Mutex::new(stream),
            header,
            entries,
            footer_offset,
            dirty: false,
            registry,
        })
    }

    pub fn instance_id(&self) -> Uuid {
        self.header.instance_id
    }

    pub fn version(&self) -> u32 {
        self.header.version
    }

    pub fn registry(&self) -> &Arc<CodecRegistry> {
        &self.registry
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, hash: &Uuid) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn entry(&self, hash: &Uuid) -> Option<&Entry> {
        self.entries.get(hash)
    }

    /// Live entries in on-disk order.
    pub fn entries(&self) -> Vec<&Entry> {
        let mut out: Vec<&Entry> = self.entries.values().collect();
        out.sort_by_key(|e| e.offset);
        out
    }

    pub fn footer_offset(&self) -> u64 {
        self.footer_offset
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Payload bytes no live entry refers to (removed or overwritten).
    pub fn dead_bytes(&self) -> u64 {
        let live: u64 = self.entries.values().map(|e| u64::from(e.storage_length)).sum();
        (self.footer_offset - HEADER_SIZE).saturating_sub(live)
    }

    /// Copy the still-encoded payload of `entry` out of the stream.
    pub fn read_raw(&self, entry: &Entry) -> Result<Vec<u8>, ContainerError> {
        let mut buf = vec![0u8; entry.storage_length as usize];
        let mut stream = self.stream.lock();
        stream.seek(SeekFrom::Start(entry.offset))?;
        stream.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Decoded payload for `hash`, or `None` if the container has no such
    /// entry.
    pub fn get_bytes(&self, hash: &Uuid) -> Result<Option<Vec<u8>>, ContainerError> {
        let Some(entry) = self.entries.get(hash) else { return Ok(None) };
        let raw = self.read_raw(entry)?;
        let bytes = self
            .registry
            .decode(entry.codec_id, &raw, entry.original_length as usize)
            .map_err(|e| ContainerError::Corrupt { hash: *hash, reason: e.to_string() })?;
        Ok(Some(bytes))
    }

    /// [`get_bytes`](Self::get_bytes) by unqualified name.
    pub fn get_named(&self, name: &str) -> Result<Option<Vec<u8>>, ContainerError> {
        self.get_bytes(&hash::hash(name))
    }

    /// Copy every live entry into a fresh container on `target`.  Payloads
    /// are copied still encoded; dead space is left behind.
    pub fn rebuild<T>(&self, target: T) -> Result<Container<T>, ContainerError>
    where
        T: Read + Write + Seek + SetLen,
    {
        let mut out = Container::create_with(target, Arc::clone(&self.registry))?;
        for entry in self.entries() {
            let raw = self.read_raw(entry)?;
            let encoded = Encoded { codec_id: entry.codec_id, bytes: raw.into() };
            out.write_payload(entry.hash, entry.flags, entry.original_length as usize, encoded)?;
        }
        out.flush()?;
        debug!(
            from = %self.instance_id(),
            to = %out.instance_id(),
            entries = out.len(),
            reclaimed = self.dead_bytes(),
            "rebuilt container"
        );
        Ok(out)
    }
}

impl<S: Read + Write + Seek + SetLen> Container<S> {
    /// Initialise a new, empty container on `stream` using the process-wide
    /// codec registry.
    pub fn create(stream: S) -> Result<Self, ContainerError> {
        Self::create_with(stream, CodecRegistry::global())
    }

    pub fn create_with(mut stream: S, registry: Arc<CodecRegistry>) -> Result<Self, ContainerError> {
        let header = Header::new();
        stream.seek(SeekFrom::Start(0))?;
        header.write(&mut stream)?;
        let mut container = Self {
            stream: Mutex::new(stream),
            header,
            entries: HashMap::new(),
            footer_offset: HEADER_SIZE,
            dirty: true,
            registry,
        };
        container.flush()?;
        Ok(container)
    }

    /// Append `data` under `name`.
    pub fn append(&mut self, name: &str, data: &[u8], options: &AppendOptions) -> Result<Entry, ContainerError> {
        self.append_hash(options.hash_for(name), data, options)
    }

    /// Append `data` under a precomputed hash.
    pub fn append_hash(
        &mut self,
        hash: Uuid,
        data: &[u8],
        options: &AppendOptions,
    ) -> Result<Entry, ContainerError> {
        self.check_vacant(&hash, options.overwrite)?;
        let encoded = self.registry.encode_for_storage(options.codec.as_deref(), data)?;
        self.write_payload(hash, options.flags, data.len(), encoded)
    }

    /// Append many `(name, data)` pairs.  Encoding runs on the Rayon pool
    /// when the `parallel` feature is enabled; writes stay in input order.
    pub fn append_all(
        &mut self,
        items: &[(String, Vec<u8>)],
        options: &AppendOptions,
    ) -> Result<Vec<Entry>, ContainerError> {
        let hashes: Vec<Uuid> = items.iter().map(|(name, _)| options.hash_for(name)).collect();
        for (i, h) in hashes.iter().enumerate() {
            self.check_vacant(h, options.overwrite)?;
            if hashes[..i].contains(h) {
                return Err(ContainerError::DuplicateEntry(*h));
            }
        }

        let payloads: Vec<&[u8]> = items.iter().map(|(_, data)| data.as_slice()).collect();
        let encoded = batch::encode_batch(&self.registry, &payloads, options.codec.as_deref())?;

        let mut out = Vec::with_capacity(items.len());
        for ((hash, data), enc) in hashes.into_iter().zip(&payloads).zip(encoded) {
            out.push(self.write_payload(hash, options.flags, data.len(), enc)?);
        }
        Ok(out)
    }

    /// Drop `hash` from the index.  Its payload becomes dead space.
    pub fn remove(&mut self, hash: &Uuid) -> bool {
        let removed = self.entries.remove(hash).is_some();
        self.dirty |= removed;
        removed
    }

    /// Rewrite the footer if anything changed since it was last written.
    pub fn flush(&mut self) -> Result<(), ContainerError> {
        if !self.dirty {
            return Ok(());
        }
        let footer_offset = self.footer_offset;
        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by_key(|e| e.offset);

        let mut footer = Vec::with_capacity((EMPTY_FOOTER_SIZE + ENTRY_SIZE * entries.len() as u64) as usize);
        format::write_footer(&mut footer, footer_offset, entries.into_iter())?;

        let stream = self.stream.get_mut();
        stream.seek(SeekFrom::Start(footer_offset))?;
        stream.write_all(&footer)?;
        stream.flush()?;
        stream.set_len(footer_offset + footer.len() as u64)?;
        self.dirty = false;
        Ok(())
    }

    /// Flush and hand back the underlying stream.
    pub fn close(mut self) -> Result<S, ContainerError> {
        self.flush()?;
        Ok(self.stream.into_inner())
    }

    fn check_vacant(&self, hash: &Uuid, overwrite: bool) -> Result<(), ContainerError> {
        if !overwrite && self.entries.contains_key(hash) {
            return Err(ContainerError::DuplicateEntry(*hash));
        }
        Ok(())
    }

    fn write_payload(
        &mut self,
        hash: Uuid,
        flags: EntryFlags,
        original_length: usize,
        encoded: Encoded<'_>,
    ) -> Result<Entry, ContainerError> {
        let original_length = u32::try_from(original_length).map_err(|_| ContainerError::TooLarge(original_length))?;
        let storage_length =
            u32::try_from(encoded.bytes.len()).map_err(|_| ContainerError::TooLarge(encoded.bytes.len()))?;

        let offset = self.footer_offset;
        let stream = self.stream.get_mut();
        stream.seek(SeekFrom::Start(offset))?;
        stream.write_all(&encoded.bytes)?;

        let entry = Entry {
            hash,
            flags,
            offset,
            original_length,
            storage_length,
            codec_id: encoded.codec_id,
        };
        self.footer_offset += u64::from(storage_length);
        self.entries.insert(hash, entry.clone());
        self.dirty = true;
        Ok(entry)
    }
}

// ── File helpers ─────────────────────────────────────────────────────────────

impl Container<File> {
    /// Open a container file read-only.
    pub fn open_file<P: AsRef<Path>>(path: P) -> Result<Self, ContainerError> {
        Self::open(File::open(path)?)
    }

    /// Open a container file for appending.
    pub fn open_file_rw<P: AsRef<Path>>(path: P) -> Result<Self, ContainerError> {
        Self::open(OpenOptions::new().read(true).write(true).open(path)?)
    }

    /// Create a new container file.  Fails if `path` already exists.
    pub fn create_file<P: AsRef<Path>>(path: P) -> Result<Self, ContainerError> {
        Self::create(OpenOptions::new().read(true).write(true).create_new(true).open(path)?)
    }

    pub fn open_or_create_file<P: AsRef<Path>>(path: P) -> Result<Self, ContainerError> {
        let path = path.as_ref();
        if path.exists() {
            Self::open_file_rw(path)
        } else {
            Self::create_file(path)
        }
    }

    /// Compact the container at `path` in place via a sibling temp file.
    /// Returns the number of bytes reclaimed.
    pub fn rebuild_file<P: AsRef<Path>>(path: P) -> Result<u64, ContainerError> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let src = Self::open_file(path)?;
        let before = src.footer_offset;
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        let out = src.rebuild(tmp.reopen()?)?;
        let after = out.footer_offset;
        out.close()?;
        drop(src);
        tmp.persist(path).map_err(|e| ContainerError::Io(e.error))?;
        Ok(before - after)
    }
}
