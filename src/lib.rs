//! singlefile - Single-file application bundles.
//!
//! This library packs a published application (a native host executable plus
//! the files it loads) into one file, and unpacks such a file into a
//! per-bundle cache directory on demand.
//!
//! # Features
//!
//! - Versioned manifest format with strict decoding
//! - Content-derived bundle identifiers (SHA-256)
//! - Idempotent extraction that is safe to race from several processes
//! - Mach-O signature removal and `__BUNDLE` segment insertion
//!
//! # Example
//!
//! ```no_run
//! use singlefile::{Bundler, Extractor};
//!
//! fn main() -> singlefile::Result<()> {
//!     let bundle = Bundler::new("MyApp", "out").generate_from_dir("publish")?;
//!
//!     let extraction = Extractor::new(&bundle.path, "/tmp/.singlefile").extract()?;
//!     println!("files in {}", extraction.directory.display());
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bundle;
pub mod config;
pub mod error;
pub mod macho;
pub mod util;

// Re-export main types
pub use bundle::{
    BundleOptions, Bundler, Extraction, Extractor, FileEntry, FileKind, FileSpec, GeneratedBundle,
    Manifest,
};
pub use error::{Error, MachOFormatError, Result};
pub use macho::{add_bundle_segment, remove_signature, SegmentAddition, SignatureRemoval};
