//! Bundle manifest encoding and decoding.
//!
//! The manifest is the last thing in a bundle file. It lists every embedded
//! file with its absolute offset and size, and carries the bundle identifier
//! that names the extraction directory.
//!
//! ```text
//! magic        [u8; 8]       "SFBNDL\0\0"
//! version      u32 LE
//! entry_count  u32 LE
//! id_len       ULEB128
//! bundle_id    [u8; id_len]
//! entries      entry_count x { kind u8, name_len ULEB128, name, offset i64 LE, size i64 LE }
//! ```

use std::collections::HashSet;
use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::util::{read_uleb128, write_uleb128};

/// Magic bytes at the start of every manifest.
pub const MANIFEST_MAGIC: [u8; 8] = *b"SFBNDL\0\0";

/// Current manifest format version.
pub const MANIFEST_VERSION: u32 = 1;

/// Length of a bundle identifier: 16 digest bytes in lowercase hex.
pub const BUNDLE_ID_LEN: usize = 32;

/// Smallest possible encoded entry: kind, one-byte length, one-byte name, offset, size.
const MIN_ENTRY_SIZE: usize = 1 + 1 + 1 + 8 + 8;

// =============================================================================
// File Kind
// =============================================================================

/// Classification of a bundled file, stored as a one-byte tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FileKind {
    /// Any other file
    Unknown = 0,
    /// Managed assembly (`.dll`)
    Assembly = 1,
    /// Native library (`.so`, `.dylib`)
    NativeBinary = 2,
    /// Dependency manifest (`.deps.json`)
    DepsJson = 3,
    /// Runtime configuration (`.runtimeconfig.json`)
    RuntimeConfigJson = 4,
    /// Debug symbols (`.pdb`, `.dbg`, `.dwarf`)
    Symbols = 5,
}

impl FileKind {
    /// Returns the on-disk tag.
    #[inline]
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Parses an on-disk tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(FileKind::Unknown),
            1 => Some(FileKind::Assembly),
            2 => Some(FileKind::NativeBinary),
            3 => Some(FileKind::DepsJson),
            4 => Some(FileKind::RuntimeConfigJson),
            5 => Some(FileKind::Symbols),
            _ => None,
        }
    }

    /// Classifies a file by its bundle-relative name.
    pub fn from_name(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".deps.json") {
            FileKind::DepsJson
        } else if lower.ends_with(".runtimeconfig.json") {
            FileKind::RuntimeConfigJson
        } else if lower.ends_with(".dll") {
            FileKind::Assembly
        } else if lower.ends_with(".so") || lower.ends_with(".dylib") {
            FileKind::NativeBinary
        } else if lower.ends_with(".pdb") || lower.ends_with(".dbg") || lower.ends_with(".dwarf") {
            FileKind::Symbols
        } else {
            FileKind::Unknown
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileKind::Unknown => "unknown",
            FileKind::Assembly => "assembly",
            FileKind::NativeBinary => "native",
            FileKind::DepsJson => "deps.json",
            FileKind::RuntimeConfigJson => "runtimeconfig.json",
            FileKind::Symbols => "symbols",
        };
        f.write_str(name)
    }
}

/// Returns true if `name` is a safe bundle-relative path.
///
/// Safe paths are non-empty, `/`-separated, relative, and have no empty, `.`
/// or `..` components. Backslashes and NULs are rejected so a name means the
/// same thing on every platform.
pub fn is_safe_bundle_path(name: &str) -> bool {
    !name.is_empty()
        && !name.contains(['\\', '\0'])
        && name
            .split('/')
            .all(|component| !matches!(component, "" | "." | ".."))
}

/// Returns true if `id` is a well-formed bundle identifier.
///
/// The identifier names the extraction directory, so only lowercase hex of
/// the exact length is accepted.
pub fn is_valid_bundle_id(id: &str) -> bool {
    id.len() == BUNDLE_ID_LEN && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

// =============================================================================
// File Entry
// =============================================================================

/// One embedded file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// File classification
    pub kind: FileKind,
    /// Bundle-relative path, `/`-separated
    pub name: String,
    /// Absolute offset of the content in the bundle file
    pub offset: i64,
    /// Content size in bytes
    pub size: i64,
}

impl FileEntry {
    /// Returns the offset one past the content, or `None` on overflow.
    #[inline]
    pub fn end(&self) -> Option<i64> {
        self.offset.checked_add(self.size)
    }
}

// =============================================================================
// Manifest
// =============================================================================

/// Decoded bundle manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Format version
    pub version: u32,
    /// Bundle identifier (lowercase hex)
    pub bundle_id: String,
    /// Embedded files in payload order
    pub entries: Vec<FileEntry>,
}

impl Manifest {
    /// Creates a manifest in the current format version.
    pub fn new(bundle_id: impl Into<String>, entries: Vec<FileEntry>) -> Self {
        Self {
            version: MANIFEST_VERSION,
            bundle_id: bundle_id.into(),
            entries,
        }
    }

    /// Returns the entry with the given name.
    pub fn entry(&self, name: &str) -> Option<&FileEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Returns the total size of all embedded files.
    pub fn payload_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size.max(0) as u64).sum()
    }

    /// Encodes the manifest.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            24 + self.bundle_id.len()
                + self
                    .entries
                    .iter()
                    .map(|e| MIN_ENTRY_SIZE + e.name.len())
                    .sum::<usize>(),
        );

        out.extend_from_slice(&MANIFEST_MAGIC);
        let mut word = [0u8; 8];
        LittleEndian::write_u32(&mut word, self.version);
        out.extend_from_slice(&word[..4]);
        LittleEndian::write_u32(&mut word, self.entries.len() as u32);
        out.extend_from_slice(&word[..4]);

        write_uleb128(&mut out, self.bundle_id.len() as u64);
        out.extend_from_slice(self.bundle_id.as_bytes());

        for entry in &self.entries {
            out.push(entry.kind.tag());
            write_uleb128(&mut out, entry.name.len() as u64);
            out.extend_from_slice(entry.name.as_bytes());
            LittleEndian::write_i64(&mut word, entry.offset);
            out.extend_from_slice(&word);
            LittleEndian::write_i64(&mut word, entry.size);
            out.extend_from_slice(&word);
        }

        out
    }

    /// Decodes a manifest, rejecting anything but an exact, well-formed encoding.
    ///
    /// The bundle id must be [`BUNDLE_ID_LEN`] lowercase hex digits, and entry
    /// names must be safe and unique. Cross-entry range checks need the
    /// payload boundary and are done by [`Manifest::validate`].
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader { data, pos: 0 };

        let magic = reader.bytes(MANIFEST_MAGIC.len())?;
        if magic != MANIFEST_MAGIC {
            return Err(Error::manifest(0, "bad magic"));
        }

        let version = reader.u32()?;
        if version != MANIFEST_VERSION {
            return Err(Error::manifest(8, format!("unsupported version {}", version)));
        }

        let count_offset = reader.pos;
        let count = reader.u32()? as usize;

        let id_offset = reader.pos;
        let id_len = reader.length()?;
        let bundle_id = reader.string(id_len)?;
        if !is_valid_bundle_id(&bundle_id) {
            return Err(Error::manifest(
                id_offset,
                format!("invalid bundle id '{}'", bundle_id),
            ));
        }

        if count > reader.remaining() / MIN_ENTRY_SIZE {
            return Err(Error::manifest(
                count_offset,
                format!("{} entries do not fit in {} bytes", count, reader.remaining()),
            ));
        }

        let mut entries = Vec::with_capacity(count);
        let mut names = HashSet::with_capacity(count);

        for _ in 0..count {
            let entry_offset = reader.pos;

            let tag = reader.u8()?;
            let kind = FileKind::from_tag(tag)
                .ok_or_else(|| Error::manifest(entry_offset, format!("unknown file kind {}", tag)))?;

            let name_offset = reader.pos;
            let name_len = reader.length()?;
            let name = reader.string(name_len)?;
            if !is_safe_bundle_path(&name) {
                return Err(Error::manifest(name_offset, format!("unsafe entry name '{}'", name)));
            }
            if !names.insert(name.clone()) {
                return Err(Error::manifest(name_offset, format!("duplicate entry name '{}'", name)));
            }

            let field_offset = reader.pos;
            let offset = reader.i64()?;
            let size = reader.i64()?;
            if offset < 0 || size < 0 {
                return Err(Error::manifest(
                    field_offset,
                    format!("negative offset or size for '{}'", name),
                ));
            }

            entries.push(FileEntry {
                kind,
                name,
                offset,
                size,
            });
        }

        if reader.remaining() != 0 {
            return Err(Error::manifest(
                reader.pos,
                format!("{} trailing bytes", reader.remaining()),
            ));
        }

        Ok(Self {
            version,
            bundle_id,
            entries,
        })
    }

    /// Checks that every entry lies before `payload_end` and that no two
    /// entries overlap.
    pub fn validate(&self, payload_end: u64) -> Result<()> {
        let out_of_bounds = |entry: &FileEntry| Error::EntryOutOfBounds {
            name: entry.name.clone(),
            offset: entry.offset,
            size: entry.size,
            limit: payload_end,
        };

        for entry in &self.entries {
            match entry.end() {
                Some(end) if entry.offset >= 0 && entry.size >= 0 && end as u64 <= payload_end => {}
                _ => return Err(out_of_bounds(entry)),
            }
        }

        let mut sorted: Vec<&FileEntry> = self.entries.iter().collect();
        sorted.sort_by_key(|e| (e.offset, e.size));

        // Bounds were checked above, so `end()` cannot overflow here.
        let mut furthest: Option<(&FileEntry, i64)> = None;
        for entry in sorted {
            if let Some((previous, end)) = furthest {
                if entry.size > 0 && entry.offset < end {
                    return Err(Error::OverlappingEntries {
                        first: previous.name.clone(),
                        second: entry.name.clone(),
                    });
                }
            }
            let end = entry.offset + entry.size;
            if furthest.is_none_or(|(_, furthest_end)| end > furthest_end) {
                furthest = Some((entry, end));
            }
        }

        Ok(())
    }
}

// =============================================================================
// Reader
// =============================================================================

/// Bounds-checked little-endian cursor over an encoded manifest.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    #[inline]
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(Error::manifest(
                self.pos,
                format!("need {} bytes, {} remain", len, self.remaining()),
            ));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.bytes(4)?))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(LittleEndian::read_i64(self.bytes(8)?))
    }

    /// Reads a ULEB128 length that is non-zero and fits in the remaining bytes.
    fn length(&mut self) -> Result<usize> {
        let start = self.pos;
        let (value, consumed) = read_uleb128(&self.data[self.pos..])
            .ok_or_else(|| Error::manifest(start, "malformed length prefix"))?;
        self.pos += consumed;

        if value == 0 || value > self.remaining() as u64 {
            return Err(Error::manifest(
                start,
                format!("invalid length {} ({} bytes remain)", value, self.remaining()),
            ));
        }
        Ok(value as usize)
    }

    fn string(&mut self, len: usize) -> Result<String> {
        let start = self.pos;
        let bytes = self.bytes(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| Error::manifest(start, "string is not valid UTF-8"))
    }
}
