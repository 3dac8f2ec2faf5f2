//! Single-file bundle format, generation and extraction.
//!
//! A bundle is a host executable with files appended to it:
//!
//! ```text
//! [host stub (marker inside)][file 1]...[file N][manifest]
//! ```

mod bundler;
mod extractor;
mod manifest;
mod marker;

#[cfg(test)]
pub(crate) mod fixtures;

pub use bundler::*;
pub use extractor::*;
pub use manifest::*;
pub use marker::*;
