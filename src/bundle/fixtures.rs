//! Publish directories and host stubs for bundling tests.

use std::fs;
use std::io::Cursor;
use std::path::Path;

use tempfile::TempDir;

use super::bundler::FileSpec;
use super::manifest::{FileEntry, FileKind, Manifest};
use super::marker::{BundleMarker, MARKER_PLACEHOLDER};
use crate::macho::fixtures::MachOBuilder;

/// Bundle-relative name of the host stub.
pub const HOST: &str = "app";

/// Offset of the marker inside the `__text` section of [`macho_stub`].
pub const MARKER_OFFSET: usize = 0x800;

/// A synthetic Mach-O executable carrying a marker placeholder.
pub fn macho_stub(signed: bool) -> Vec<u8> {
    let builder = if signed {
        MachOBuilder::new().signed(0x170)
    } else {
        MachOBuilder::new()
    };
    let mut data = builder.build();
    data[MARKER_OFFSET..MARKER_OFFSET + MARKER_PLACEHOLDER.len()].copy_from_slice(&MARKER_PLACEHOLDER);
    data
}

/// A non-Mach-O host stub carrying a marker placeholder.
pub fn plain_stub() -> Vec<u8> {
    let mut data = b"\x7fELF\x02\x01\x01\0stub".to_vec();
    data.extend_from_slice(&MARKER_PLACEHOLDER);
    data.extend_from_slice(&[0x90; 0x40]);
    data
}

/// Builds a bundle by hand: `files` and a manifest with `bundle_id` are
/// appended to `stub` and its placeholder is filled in.
///
/// Unlike the bundler this takes any id, so tests can hand the extractor
/// manifests the bundler would never write.
pub fn assemble(stub: &[u8], bundle_id: &str, files: &[(&str, &[u8])]) -> Vec<u8> {
    let marker = BundleMarker::find_all(stub)
        .into_iter()
        .find(|m| m.is_placeholder())
        .unwrap();

    let mut data = stub.to_vec();
    let mut entries = Vec::new();
    for (name, content) in files {
        entries.push(FileEntry {
            kind: FileKind::from_name(name),
            name: name.to_string(),
            offset: data.len() as i64,
            size: content.len() as i64,
        });
        data.extend_from_slice(content);
    }

    let manifest = Manifest::new(bundle_id, entries).encode();
    let manifest_offset = data.len() as u64;
    data.extend_from_slice(&manifest);

    let mut cursor = Cursor::new(data);
    BundleMarker::write(&mut cursor, marker.position, manifest_offset, manifest.len() as u64).unwrap();
    cursor.into_inner()
}

/// A temporary publish directory and the specs for its files.
pub struct PublishDir {
    pub dir: TempDir,
    pub specs: Vec<FileSpec>,
}

impl PublishDir {
    /// Creates a publish directory holding only the host stub.
    pub fn new(stub: &[u8]) -> Self {
        let mut publish = Self {
            dir: TempDir::new().unwrap(),
            specs: Vec::new(),
        };
        publish.add(HOST, stub);
        publish
    }

    /// A typical application: managed code, native code, config and symbols.
    pub fn sample(stub: &[u8]) -> Self {
        let mut publish = Self::new(stub);
        publish
            .add("app.dll", &[0x4D, 0x5A, 0x90, 0x00, 0x03])
            .add("app.deps.json", br#"{"runtimeTarget":{"name":".NETCoreApp"}}"#)
            .add("app.runtimeconfig.json", br#"{"runtimeOptions":{}}"#)
            .add("app.runtimeconfig.dev.json", br#"{"runtimeOptions":{"additionalProbingPaths":[]}}"#)
            .add("app.pdb", b"BSJB symbols")
            .add("runtimes/osx-arm64/native/libfoo.dylib", &[0xCF; 300])
            .add("empty.txt", b"");
        publish
    }

    /// Writes a file and records its spec.
    pub fn add(&mut self, name: &str, content: &[u8]) -> &mut Self {
        let path = self.dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        self.specs.push(FileSpec::new(path, name));
        self
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Returns the content of a published file.
    pub fn read(&self, name: &str) -> Vec<u8> {
        fs::read(self.dir.path().join(name)).unwrap()
    }
}
