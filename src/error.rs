//! Error types for bundling, extraction and Mach-O patching.
//!
//! Errors fall into three families: argument errors (the caller handed in bad
//! input), format errors (a bundle or executable violates a structural
//! invariant) and the distinct [`Error::NotABundle`] outcome for files that
//! were never bundled. I/O failures carry the path they happened on.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for singlefile operations.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== I/O Errors ====================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open file '{path}': {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to memory map file '{path}': {source}")]
    MemoryMap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write output file '{path}': {source}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("file '{path}' is locked by another writer")]
    FileLocked { path: PathBuf },

    #[error("failed to commit extracted files to '{path}': {source}")]
    Commit {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ==================== Argument Errors ====================
    #[error("invalid file spec for '{source_path}': {reason}")]
    InvalidFileSpec {
        source_path: PathBuf,
        reason: &'static str,
    },

    #[error("host stub '{host_name}' is not among the file specs")]
    HostNotSpecified { host_name: String },

    #[error("bundle path '{name}' is specified more than once")]
    DuplicateBundlePath { name: String },

    #[error("bundle path '{name}' must be relative and must not contain '.' or '..' components")]
    UnsafeBundlePath { name: String },

    #[error("output file '{path}' would overwrite one of the bundled sources")]
    OutputOverwritesSource { path: PathBuf },

    // ==================== Bundle Format Errors ====================
    #[error("'{path}' is not a bundle")]
    NotABundle { path: PathBuf },

    #[error("host stub '{path}' has no reserved bundle marker")]
    MarkerNotFound { path: PathBuf },

    #[error("host stub '{path}' already has a filled-in bundle marker at {offset:#x}")]
    MarkerAlreadyFilled { path: PathBuf, offset: usize },

    #[error("host stub '{path}' holds more than one bundle marker ({first:#x} and {second:#x})")]
    DuplicateMarker {
        path: PathBuf,
        first: usize,
        second: usize,
    },

    #[error("malformed manifest at offset {offset:#x}: {reason}")]
    Manifest { offset: usize, reason: String },

    #[error("entry '{name}' ({offset:#x}+{size:#x}) lies outside the payload region (end {limit:#x})")]
    EntryOutOfBounds {
        name: String,
        offset: i64,
        size: i64,
        limit: u64,
    },

    #[error("entries '{first}' and '{second}' overlap")]
    OverlappingEntries { first: String, second: String },

    // ==================== Mach-O Errors ====================
    #[error("Mach-O format error: {0}")]
    MachO(#[from] MachOFormatError),
}

/// A specialized Result type for singlefile operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns true if the caller supplied invalid input.
    #[inline]
    pub fn is_argument_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidFileSpec { .. }
                | Error::HostNotSpecified { .. }
                | Error::DuplicateBundlePath { .. }
                | Error::UnsafeBundlePath { .. }
                | Error::OutputOverwritesSource { .. }
        )
    }

    /// Returns true if a bundle, stub or executable violates a structural invariant.
    #[inline]
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            Error::MarkerNotFound { .. }
                | Error::MarkerAlreadyFilled { .. }
                | Error::DuplicateMarker { .. }
                | Error::Manifest { .. }
                | Error::EntryOutOfBounds { .. }
                | Error::OverlappingEntries { .. }
                | Error::MachO(_)
        )
    }

    /// Creates a manifest error with a formatted message.
    #[inline]
    pub fn manifest(offset: usize, reason: impl Into<String>) -> Self {
        Error::Manifest {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates an invalid file spec error.
    #[inline]
    pub fn invalid_spec(source_path: impl Into<PathBuf>, reason: &'static str) -> Self {
        Error::InvalidFileSpec {
            source_path: source_path.into(),
            reason,
        }
    }
}

/// A Mach-O structural invariant that does not hold.
///
/// Every variant is detected before the file is modified, so a file rejected
/// with one of these is left exactly as it was.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MachOFormatError {
    #[error("not a 64-bit executable (file type {0:#x})")]
    NotExecutable(u32),

    #[error("load command at offset {offset:#x} extends beyond the load command area")]
    LoadCommandOverflow { offset: usize },

    #[error("malformed load command at offset {offset:#x}: {reason}")]
    MalformedCommand { offset: usize, reason: &'static str },

    #[error("segment name at offset {offset:#x} is not valid UTF-8")]
    InvalidSegmentName { offset: usize },

    #[error("duplicate '{name}' segment")]
    DuplicateSegment { name: &'static str },

    #[error("duplicate '__text' section")]
    DuplicateTextSection,

    #[error("duplicate LC_SYMTAB command")]
    DuplicateSymtab,

    #[error("'__LINKEDIT' segment not found")]
    MissingLinkEditSegment,

    #[error("'__TEXT' segment not found")]
    MissingTextSegment,

    #[error("'__TEXT,__text' section not found")]
    MissingTextSection,

    #[error("LC_SYMTAB command not found")]
    MissingSymtab,

    #[error("LC_CODE_SIGNATURE is not the last load command")]
    SignatureCommandNotLast,

    #[error("'__LINKEDIT' is not the last segment (ends at {end:#x}, file length {file_len:#x})")]
    LinkEditNotLast { end: u64, file_len: u64 },

    #[error("code signature blob does not end the file (ends at {end:#x}, file length {file_len:#x})")]
    SignatureBlobNotLast { end: u64, file_len: u64 },

    #[error("symbol table is not contained in '__LINKEDIT'")]
    SymtabNotInLinkEdit,

    #[error("code signature is not contained in '__LINKEDIT'")]
    SignatureNotInLinkEdit,

    #[error("code signature at {dataoff:#x} does not directly follow the symbol table ending at {symtab_end:#x}")]
    SignatureNotAfterSymtab { dataoff: u64, symtab_end: u64 },

    #[error("code signature is still present; remove it before adding the bundle segment")]
    SignatureNotRemoved,

    #[error("'__TEXT' segment starts at file offset {0:#x} instead of 0")]
    TextSegmentNotAtStart(u64),

    #[error("insufficient space for a new load command (need {needed} bytes, have {available})")]
    NoSpaceForCommand { needed: usize, available: usize },

    #[error("nothing has been appended after '__LINKEDIT'")]
    NothingAppended,
}
