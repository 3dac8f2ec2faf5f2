//! Mach-O file format handling.
//!
//! This module provides the on-disk structures of 64-bit Mach-O images, a
//! parsed view of their load commands and the two in-place patches applied to
//! bundled executables.

mod constants;
mod image;
mod patcher;
mod structs;

#[cfg(test)]
pub(crate) mod fixtures;

pub use constants::*;
pub use image::*;
pub use patcher::*;
pub use structs::*;
