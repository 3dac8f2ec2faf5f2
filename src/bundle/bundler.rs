//! Single-file bundle generation.
//!
//! The bundler copies the host stub, appends every other published file and a
//! manifest describing them, then records the manifest location in the marker
//! reserved inside the stub. Mach-O stubs are unsigned before anything is
//! appended and get a `__BUNDLE` segment afterwards.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::manifest::{is_safe_bundle_path, FileEntry, FileKind, Manifest, BUNDLE_ID_LEN};
use super::marker::BundleMarker;
use crate::error::{Error, Result};
use crate::macho::{add_bundle_segment, remove_signature, SignatureRemoval};

/// Buffer size for streaming file contents into the bundle.
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Alignment of assembly payloads, so they can be mapped in place.
const ASSEMBLY_ALIGNMENT: u64 = 16;

/// Number of digest bytes used for the bundle identifier.
const BUNDLE_ID_BYTES: usize = BUNDLE_ID_LEN / 2;

// =============================================================================
// File Spec
// =============================================================================

/// A file to bundle and its path relative to the bundle root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpec {
    /// Path of the file on disk
    pub source_path: PathBuf,
    /// `/`-separated path inside the bundle
    pub bundle_relative_path: Option<String>,
}

impl FileSpec {
    /// Creates a file spec.
    pub fn new(source_path: impl Into<PathBuf>, bundle_relative_path: impl Into<String>) -> Self {
        Self {
            source_path: source_path.into(),
            bundle_relative_path: Some(bundle_relative_path.into()),
        }
    }

    /// Returns the validated bundle-relative path.
    fn relative_path(&self) -> Result<&str> {
        if self.source_path.as_os_str().is_empty() {
            return Err(Error::invalid_spec(&self.source_path, "source path is empty"));
        }

        let name = match self.bundle_relative_path.as_deref() {
            None => {
                return Err(Error::invalid_spec(
                    &self.source_path,
                    "bundle-relative path is missing",
                ))
            }
            Some(name) if name.trim().is_empty() => {
                return Err(Error::invalid_spec(
                    &self.source_path,
                    "bundle-relative path is empty",
                ))
            }
            Some(name) => name,
        };

        if !is_safe_bundle_path(name) {
            return Err(Error::UnsafeBundlePath {
                name: name.to_string(),
            });
        }

        Ok(name)
    }
}

// =============================================================================
// Bundler
// =============================================================================

/// Options controlling bundle generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BundleOptions {
    /// Embed symbol files instead of copying them beside the bundle
    pub embed_symbols: bool,
}

/// A bundle written by [`Bundler::generate`].
#[derive(Debug, Clone)]
pub struct GeneratedBundle {
    /// Path of the bundle file
    pub path: PathBuf,
    /// The manifest appended to the bundle
    pub manifest: Manifest,
    /// Symbol files copied beside the bundle
    pub symbol_files: Vec<PathBuf>,
}

/// Builds single-file bundles from a host stub and its dependencies.
#[derive(Debug, Clone)]
pub struct Bundler {
    host_name: String,
    output_dir: PathBuf,
    options: BundleOptions,
}

impl Bundler {
    /// Creates a bundler writing `output_dir/host_name`.
    pub fn new(host_name: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            host_name: host_name.into(),
            output_dir: output_dir.into(),
            options: BundleOptions::default(),
        }
    }

    /// Sets the bundle options.
    pub fn with_options(mut self, options: BundleOptions) -> Self {
        self.options = options;
        self
    }

    /// Returns the path of the bundle this bundler writes.
    pub fn output_path(&self) -> PathBuf {
        self.output_dir.join(&self.host_name)
    }

    /// Bundles every file under `publish_dir`.
    ///
    /// Bundle-relative paths are the file paths relative to `publish_dir`,
    /// joined with `/`, in sorted order.
    pub fn generate_from_dir<P: AsRef<Path>>(&self, publish_dir: P) -> Result<GeneratedBundle> {
        let publish_dir = publish_dir.as_ref();
        let mut specs = Vec::new();

        for entry in WalkDir::new(publish_dir).sort_by_file_name() {
            let entry = entry.map_err(|e| Error::FileOpen {
                path: e.path().unwrap_or(publish_dir).to_path_buf(),
                source: e.into(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(publish_dir)
                .unwrap_or(entry.path());
            let mut name = String::new();
            for component in relative.components() {
                let part = component
                    .as_os_str()
                    .to_str()
                    .ok_or_else(|| Error::invalid_spec(entry.path(), "path is not valid UTF-8"))?;
                if !name.is_empty() {
                    name.push('/');
                }
                name.push_str(part);
            }

            specs.push(FileSpec::new(entry.path(), name));
        }

        debug!("Found {} files in {}", specs.len(), publish_dir.display());
        self.generate(&specs)
    }

    /// Generates the bundle.
    ///
    /// On failure no bundle file is left behind.
    pub fn generate(&self, specs: &[FileSpec]) -> Result<GeneratedBundle> {
        let output = self.output_path();
        let host = self.validate(specs, &output)?;

        let stub = fs::read(&host.source_path).map_err(|e| Error::FileOpen {
            path: host.source_path.clone(),
            source: e,
        })?;
        let markers = BundleMarker::find_all(&stub);
        let marker = match markers.as_slice() {
            [] => {
                return Err(Error::MarkerNotFound {
                    path: host.source_path.clone(),
                })
            }
            [marker] => *marker,
            [first, second, ..] => {
                return Err(Error::DuplicateMarker {
                    path: host.source_path.clone(),
                    first: first.position,
                    second: second.position,
                })
            }
        };
        if !marker.is_placeholder() {
            return Err(Error::MarkerAlreadyFilled {
                path: host.source_path.clone(),
                offset: marker.position,
            });
        }

        fs::create_dir_all(&self.output_dir).map_err(|e| Error::FileWrite {
            path: self.output_dir.clone(),
            source: e,
        })?;
        let mut temp = tempfile::Builder::new()
            .prefix(".singlefile-")
            .tempfile_in(&self.output_dir)
            .map_err(|e| Error::FileWrite {
                path: self.output_dir.clone(),
                source: e,
            })?;

        temp.write_all(&stub).map_err(|e| Error::FileWrite {
            path: temp.path().to_path_buf(),
            source: e,
        })?;
        temp.flush()?;

        // The signature blob sits at the end of the file, so it must go
        // before anything is appended.
        let removal = remove_signature(temp.path())?;
        let is_macho = removal != SignatureRemoval::NotMachO;

        let mut symbols = Vec::new();
        let manifest = self.append_payload(&mut temp, specs, &mut symbols)?;

        let encoded = manifest.encode();
        let file = temp.as_file_mut();
        let manifest_offset = file.seek(SeekFrom::End(0))?;
        file.write_all(&encoded).map_err(|e| Error::FileWrite {
            path: output.clone(),
            source: e,
        })?;
        BundleMarker::write(file, marker.position, manifest_offset, encoded.len() as u64)?;
        file.sync_all()?;

        if is_macho {
            add_bundle_segment(temp.path())?;
        }

        let permissions = fs::metadata(&host.source_path)?.permissions();
        fs::set_permissions(temp.path(), permissions)?;

        // Symbol files land beside the bundle only once nothing else can fail
        // but the final rename.
        let symbol_files = self.copy_symbols(&symbols)?;
        if let Err(e) = temp.persist(&output) {
            remove_all(&symbol_files);
            return Err(Error::FileWrite {
                path: output,
                source: e.error,
            });
        }

        info!(
            "Bundled {} files ({} bytes) into {} [{}]",
            manifest.entries.len(),
            manifest.payload_size(),
            output.display(),
            manifest.bundle_id
        );

        Ok(GeneratedBundle {
            path: output,
            manifest,
            symbol_files,
        })
    }

    /// Checks every spec and returns the host stub's spec.
    fn validate<'a>(&self, specs: &'a [FileSpec], output: &Path) -> Result<&'a FileSpec> {
        let mut names = HashSet::with_capacity(specs.len());
        let mut host = None;

        for spec in specs {
            let name = spec.relative_path()?;
            if !names.insert(name) {
                return Err(Error::DuplicateBundlePath {
                    name: name.to_string(),
                });
            }
            if name == self.host_name {
                host = Some(spec);
            }
        }

        let host = host.ok_or_else(|| Error::HostNotSpecified {
            host_name: self.host_name.clone(),
        })?;

        let output = fs::canonicalize(&self.output_dir)
            .map(|dir| dir.join(&self.host_name))
            .unwrap_or_else(|_| output.to_path_buf());
        for spec in specs {
            let source = fs::canonicalize(&spec.source_path).unwrap_or_else(|_| spec.source_path.clone());
            if source == output {
                return Err(Error::OutputOverwritesSource { path: output });
            }
        }

        Ok(host)
    }

    /// Appends every non-host file and returns the finished manifest.
    ///
    /// Symbol files that stay outside the bundle are collected in `symbols`.
    fn append_payload<'a>(
        &self,
        temp: &mut NamedTempFile,
        specs: &'a [FileSpec],
        symbols: &mut Vec<(&'a FileSpec, &'a str)>,
    ) -> Result<Manifest> {
        let temp_path = temp.path().to_path_buf();
        let file = temp.as_file_mut();
        let mut position = file.seek(SeekFrom::End(0))?;
        let mut hasher = Sha256::new();
        let mut entries = Vec::with_capacity(specs.len());
        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];

        for spec in specs {
            let name = spec.relative_path()?;
            if name == self.host_name {
                continue;
            }
            if name.to_ascii_lowercase().ends_with(".dev.json") {
                debug!("Skipping development-only file {}", name);
                continue;
            }

            let kind = FileKind::from_name(name);
            if kind == FileKind::Symbols && !self.options.embed_symbols {
                symbols.push((spec, name));
                continue;
            }

            if kind == FileKind::Assembly {
                let padding = position.next_multiple_of(ASSEMBLY_ALIGNMENT) - position;
                if padding > 0 {
                    file.write_all(&[0u8; ASSEMBLY_ALIGNMENT as usize][..padding as usize])
                        .map_err(|e| Error::FileWrite {
                            path: temp_path.clone(),
                            source: e,
                        })?;
                    position += padding;
                }
            }

            let mut source = File::open(&spec.source_path).map_err(|e| Error::FileOpen {
                path: spec.source_path.clone(),
                source: e,
            })?;

            hasher.update((name.len() as u64).to_le_bytes());
            hasher.update(name.as_bytes());
            hasher.update([kind.tag()]);

            let mut size = 0u64;
            loop {
                let read = source.read(&mut buffer).map_err(|e| Error::FileOpen {
                    path: spec.source_path.clone(),
                    source: e,
                })?;
                if read == 0 {
                    break;
                }
                hasher.update(&buffer[..read]);
                file.write_all(&buffer[..read]).map_err(|e| Error::FileWrite {
                    path: temp_path.clone(),
                    source: e,
                })?;
                size += read as u64;
            }
            hasher.update(size.to_le_bytes());

            debug!("  {:#x}+{:#x} {} ({})", position, size, name, kind);
            entries.push(FileEntry {
                kind,
                name: name.to_string(),
                offset: position as i64,
                size: size as i64,
            });
            position += size;
        }

        Ok(Manifest::new(bundle_id(hasher), entries))
    }

    /// Copies every symbol file next to the bundle.
    ///
    /// On failure the copies made so far are removed again.
    fn copy_symbols(&self, symbols: &[(&FileSpec, &str)]) -> Result<Vec<PathBuf>> {
        let mut copied = Vec::with_capacity(symbols.len());
        for (spec, name) in symbols {
            match self.copy_beside(spec, name) {
                Ok(dest) => copied.push(dest),
                Err(e) => {
                    remove_all(&copied);
                    return Err(e);
                }
            }
        }
        Ok(copied)
    }

    /// Copies a file next to the bundle, keeping its relative path.
    fn copy_beside(&self, spec: &FileSpec, name: &str) -> Result<PathBuf> {
        let mut dest = self.output_dir.clone();
        dest.extend(name.split('/'));

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::FileWrite {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        fs::copy(&spec.source_path, &dest).map_err(|e| Error::FileWrite {
            path: dest.clone(),
            source: e,
        })?;

        debug!("Copied symbol file {} beside the bundle", name);
        Ok(dest)
    }
}

/// Removes files written beside a bundle that was not produced.
fn remove_all(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

/// Formats the first digest bytes as lowercase hex.
fn bundle_id(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut id = String::with_capacity(BUNDLE_ID_BYTES * 2);
    for byte in &digest[..BUNDLE_ID_BYTES] {
        let _ = write!(id, "{:02x}", byte);
    }
    id
}
