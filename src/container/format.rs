//! On-disk records of a container.
//!
//! ```text
//! Header:  [16B magic][16B instance id][4B version]                        36 B
//! Entry:   [16B hash][4B flags][8B offset][4B original len][4B storage len][4B codec id]  40 B
//! Footer:  [4B count][entry × count][8B footer offset][16B magic]
//! ```
//!
//! All integers are little-endian.  `original len` is the pre-codec size,
//! `storage len` the number of bytes actually on disk at `offset`.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use uuid::Uuid;

use super::ContainerError;

pub const MAGIC: &[u8; 16] = b"modpak-container";
pub const FORMAT_VERSION: u32 = 1;

pub const HEADER_SIZE: u64 = 16 + 16 + 4;
pub const ENTRY_SIZE: u64 = 16 + 4 + 8 + 4 + 4 + 4;
/// `[footer offset][magic]` at the very end of the stream.
pub const TRAILER_SIZE: u64 = 8 + 16;
/// Footer with zero entries.
pub const EMPTY_FOOTER_SIZE: u64 = 4 + TRAILER_SIZE;

// ── Flags ────────────────────────────────────────────────────────────────────

/// Per-entry flag bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryFlags(pub u32);

impl EntryFlags {
    pub const NONE: EntryFlags = EntryFlags(0);
    /// Payload cannot be instantiated from memory; it must be written to a
    /// file first.
    pub const NATIVE: EntryFlags = EntryFlags(0x1);
    /// Payload is architecture-neutral.
    pub const PORTABLE: EntryFlags = EntryFlags(0x2);

    pub fn contains(self, other: EntryFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_native(self) -> bool {
        self.contains(Self::NATIVE)
    }

    pub fn is_portable(self) -> bool {
        self.contains(Self::PORTABLE)
    }
}

impl std::ops::BitOr for EntryFlags {
    type Output = EntryFlags;
    fn bitor(self, rhs: Self) -> Self {
        EntryFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for EntryFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

// ── Header ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Header {
    pub instance_id: Uuid,
    pub version:     u32,
}

impl Header {
    pub fn new() -> Self {
        Self { instance_id: Uuid::new_v4(), version: FORMAT_VERSION }
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(MAGIC)?;
        writer.write_all(self.instance_id.as_bytes())?;
        writer.write_u32::<LittleEndian>(self.version)?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> Result<Self, ContainerError> {
        let mut magic = [0u8; 16];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(ContainerError::Format("invalid header magic".into()));
        }
        let mut id = [0u8; 16];
        reader.read_exact(&mut id)?;
        let version = reader.read_u32::<LittleEndian>()?;
        if version != FORMAT_VERSION {
            return Err(ContainerError::UnsupportedVersion(version));
        }
        Ok(Self { instance_id: Uuid::from_bytes(id), version })
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::new()
    }
}

// ── Entry ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub hash:            Uuid,
    pub flags:           EntryFlags,
    pub offset:          u64,
    /// Pre-codec length.
    pub original_length: u32,
    /// Bytes on disk.
    pub storage_length:  u32,
    pub codec_id:        u32,
}

impl Entry {
    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(self.hash.as_bytes())?;
        writer.write_u32::<LittleEndian>(self.flags.0)?;
        writer.write_u64::<LittleEndian>(self.offset)?;
        writer.write_u32::<LittleEndian>(self.original_length)?;
        writer.write_u32::<LittleEndian>(self.storage_length)?;
        writer.write_u32::<LittleEndian>(self.codec_id)?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let mut hash = [0u8; 16];
        reader.read_exact(&mut hash)?;
        Ok(Self {
            hash:            Uuid::from_bytes(hash),
            flags:           EntryFlags(reader.read_u32::<LittleEndian>()?),
            offset:          reader.read_u64::<LittleEndian>()?,
            original_length: reader.read_u32::<LittleEndian>()?,
            storage_length:  reader.read_u32::<LittleEndian>()?,
            codec_id:        reader.read_u32::<LittleEndian>()?,
        })
    }

    /// End of the payload region.
    pub fn end(&self) -> u64 {
        self.offset + u64::from(self.storage_length)
    }
}

// ── Footer ───────────────────────────────────────────────────────────────────

/// Write `[count][entries][footer_offset][magic]`.
pub fn write_footer<'a, W, I>(mut writer: W, footer_offset: u64, entries: I) -> io::Result<()>
where
    W: Write,
    I: ExactSizeIterator<Item = &'a Entry>,
{
    writer.write_u32::<LittleEndian>(entries.len() as u32)?;
    for entry in entries {
        entry.write(&mut writer)?;
    }
    writer.write_u64::<LittleEndian>(footer_offset)?;
    writer.write_all(MAGIC)?;
    Ok(())
}

/// Read the trailer (the last [`TRAILER_SIZE`] bytes) and return the footer
/// offset it points back to.
pub fn read_trailer<R: Read>(mut reader: R) -> Result<u64, ContainerError> {
    let footer_offset = reader.read_u64::<LittleEndian>()?;
    let mut magic = [0u8; 16];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(ContainerError::Format("invalid footer magic".into()));
    }
    Ok(footer_offset)
}
