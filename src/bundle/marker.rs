//! The bundle marker reserved inside a host stub.
//!
//! A host stub embeds [`MARKER_PLACEHOLDER`] somewhere in its image. The
//! bundler finds it by its signature and fills in where the manifest was
//! written; the extractor reads it back from the finished bundle.
//!
//! ```text
//! signature        [u8; 32]
//! manifest_offset  u64 LE    (0 while unbundled)
//! manifest_size    u64 LE    (0 while unbundled)
//! ```
//!
//! The signature is kept masked in this crate's own image so that the tool
//! itself never contains a second copy of it outside the placeholder.

use std::io::{self, Seek, SeekFrom, Write};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use memchr::memmem;

/// Length of the marker signature.
pub const MARKER_SIGNATURE_LEN: usize = 32;

/// Total marker size in bytes.
pub const MARKER_SIZE: usize = MARKER_SIGNATURE_LEN + 16;

const SIGNATURE_MASK: u8 = 0xA5;

const MASKED_SIGNATURE: [u8; MARKER_SIGNATURE_LEN] = [
    0xDE, 0x1F, 0x13, 0x55, 0x5D, 0xD0, 0x4A, 0x21, 0x30, 0x79, 0x0C, 0x16, 0xD5, 0x66, 0xD9, 0xFE,
    0xC5, 0xBB, 0xE5, 0x7E, 0xF2, 0xD9, 0xF6, 0xB9, 0x9B, 0x97, 0x4C, 0xA7, 0x77, 0xCE, 0xB5, 0x33,
];

/// Marker as it appears in an unbundled host stub.
///
/// Stub crates embed it as `#[used] static BUNDLE_MARKER: [u8; MARKER_SIZE] = MARKER_PLACEHOLDER;`.
pub const MARKER_PLACEHOLDER: [u8; MARKER_SIZE] = {
    let mut marker = [0u8; MARKER_SIZE];
    let mut i = 0;
    while i < MARKER_SIGNATURE_LEN {
        marker[i] = MASKED_SIGNATURE[i] ^ SIGNATURE_MASK;
        i += 1;
    }
    marker
};

/// Returns the marker signature.
pub fn marker_signature() -> [u8; MARKER_SIGNATURE_LEN] {
    let mask = std::hint::black_box(SIGNATURE_MASK);
    MASKED_SIGNATURE.map(|b| b ^ mask)
}

/// A marker found in a file image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BundleMarker {
    /// File offset of the marker signature
    pub position: usize,
    /// Offset of the manifest, 0 while unbundled
    pub manifest_offset: u64,
    /// Size of the manifest, 0 while unbundled
    pub manifest_size: u64,
}

impl BundleMarker {
    /// Finds every marker in `data`, in file order.
    ///
    /// A signature too close to the end of the data to be followed by the two
    /// fields is skipped.
    pub fn find_all(data: &[u8]) -> Vec<Self> {
        let signature = marker_signature();

        memmem::find_iter(data, &signature)
            .filter_map(|position| {
                let fields = data.get(position + MARKER_SIGNATURE_LEN..position + MARKER_SIZE)?;
                Some(Self {
                    position,
                    manifest_offset: LittleEndian::read_u64(&fields[..8]),
                    manifest_size: LittleEndian::read_u64(&fields[8..]),
                })
            })
            .collect()
    }

    /// Returns true if the marker has not been filled in.
    #[inline]
    pub fn is_placeholder(&self) -> bool {
        self.manifest_offset == 0 && self.manifest_size == 0
    }

    /// Returns the manifest byte range, if filled in.
    pub fn manifest_range(&self) -> Option<std::ops::Range<u64>> {
        if self.manifest_offset == 0 {
            return None;
        }
        Some(self.manifest_offset..self.manifest_offset.checked_add(self.manifest_size)?)
    }

    /// Writes the manifest location into the marker at `position`.
    pub fn write<W: Write + Seek>(
        writer: &mut W,
        position: usize,
        manifest_offset: u64,
        manifest_size: u64,
    ) -> io::Result<()> {
        writer.seek(SeekFrom::Start((position + MARKER_SIGNATURE_LEN) as u64))?;
        writer.write_u64::<LittleEndian>(manifest_offset)?;
        writer.write_u64::<LittleEndian>(manifest_size)?;
        writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn stub_with_marker(position: usize) -> Vec<u8> {
        let mut data = vec![0xCCu8; 0x200];
        data[position..position + MARKER_SIZE].copy_from_slice(&MARKER_PLACEHOLDER);
        data
    }

    #[test]
    fn test_placeholder_layout() {
        assert_eq!(MARKER_SIZE, 48);
        assert_eq!(&MARKER_PLACEHOLDER[..4], &[0x7B, 0xBA, 0xB6, 0xF0]);
        assert_eq!(&MARKER_PLACEHOLDER[..MARKER_SIGNATURE_LEN], &marker_signature());
        assert!(MARKER_PLACEHOLDER[MARKER_SIGNATURE_LEN..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_find_placeholder() {
        let data = stub_with_marker(0x40);
        let markers = BundleMarker::find_all(&data);
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].position, 0x40);
        assert!(markers[0].is_placeholder());
        assert_eq!(markers[0].manifest_range(), None);
    }

    #[test]
    fn test_find_missing() {
        assert!(BundleMarker::find_all(&[0u8; 0x100]).is_empty());

        // Signature without room for the fields.
        let data = marker_signature().to_vec();
        assert!(BundleMarker::find_all(&data).is_empty());
    }

    #[test]
    fn test_find_every_marker() {
        let mut data = stub_with_marker(0x10);
        data[0x100..0x100 + MARKER_SIZE].copy_from_slice(&MARKER_PLACEHOLDER);

        let positions: Vec<_> = BundleMarker::find_all(&data).iter().map(|m| m.position).collect();
        assert_eq!(positions, [0x10, 0x100]);
    }

    #[test]
    fn test_write_marker() {
        let mut cursor = Cursor::new(stub_with_marker(0x80));
        BundleMarker::write(&mut cursor, 0x80, 0x1234, 0x56).unwrap();

        let data = cursor.into_inner();
        assert_eq!(data.len(), 0x200);

        let marker = BundleMarker::find_all(&data)[0];
        assert_eq!(marker.position, 0x80);
        assert!(!marker.is_placeholder());
        assert_eq!(marker.manifest_offset, 0x1234);
        assert_eq!(marker.manifest_size, 0x56);
        assert_eq!(marker.manifest_range(), Some(0x1234..0x128A));
        assert_eq!(data[0x80 + MARKER_SIZE], 0xCC);
    }
}
