//! Bundle extraction.
//!
//! Files are extracted into `base_dir/<application>/<bundle id>`. The bundle
//! id changes whenever any bundled byte changes, so a complete directory for
//! the same id can be reused as is. Concurrent extractions each write into a
//! private temporary directory and publish it with a single rename; the first
//! rename wins and the others adopt its result.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use memmap2::Mmap;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::manifest::{Manifest, MANIFEST_MAGIC};
use super::marker::{BundleMarker, MARKER_SIZE};
use crate::error::{Error, Result};

/// How often a rename rejected with "permission denied" is retried.
const COMMIT_RETRIES: u32 = 500;

/// Delay between commit retries.
const COMMIT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Result of [`Extractor::extract`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    /// Directory holding the extracted files
    pub directory: PathBuf,
    /// Extracted files in manifest order
    pub files: Vec<PathBuf>,
    /// True if an existing extraction was used and nothing was written
    pub reused: bool,
}

/// Extracts the files embedded in a bundle.
#[derive(Debug, Clone)]
pub struct Extractor {
    bundle_path: PathBuf,
    base_dir: PathBuf,
}

impl Extractor {
    /// Creates an extractor for `bundle_path` extracting below `base_dir`.
    pub fn new(bundle_path: impl Into<PathBuf>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            bundle_path: bundle_path.into(),
            base_dir: base_dir.into(),
        }
    }

    /// Returns the application name: the bundle file name without `.exe`.
    pub fn app_name(&self) -> String {
        let name = self
            .bundle_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "bundle".to_string());

        match name.len().checked_sub(4) {
            Some(stem) if name.is_char_boundary(stem) && name[stem..].eq_ignore_ascii_case(".exe") => {
                name[..stem].to_string()
            }
            _ => name,
        }
    }

    /// Reads and validates the manifest without extracting anything.
    pub fn read_manifest(&self) -> Result<Manifest> {
        let mmap = self.map()?;
        self.parse_manifest(&mmap)
    }

    /// Extracts every embedded file, reusing a complete earlier extraction.
    pub fn extract(&self) -> Result<Extraction> {
        let mmap = self.map()?;
        let manifest = self.parse_manifest(&mmap)?;

        let app_dir = self.base_dir.join(self.app_name());
        let target = app_dir.join(&manifest.bundle_id);

        if target.exists()
            && (is_complete(&target, &manifest) || discard_incomplete(&app_dir, &target, &manifest)?)
        {
            info!("Reusing extraction at {}", target.display());
            return Ok(Self::finish(target, &manifest, true));
        }

        fs::create_dir_all(&app_dir).map_err(|e| Error::FileWrite {
            path: app_dir.clone(),
            source: e,
        })?;
        let staging = tempfile::Builder::new()
            .prefix(&format!(".{}-", manifest.bundle_id))
            .tempdir_in(&app_dir)
            .map_err(|e| Error::FileWrite {
                path: app_dir.clone(),
                source: e,
            })?;

        for entry in &manifest.entries {
            let dest = join_bundle_path(staging.path(), &entry.name);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| Error::FileWrite {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }

            // Bounds were validated against the manifest offset.
            let start = entry.offset as usize;
            let end = start + entry.size as usize;
            fs::write(&dest, &mmap[start..end]).map_err(|e| Error::FileWrite {
                path: dest.clone(),
                source: e,
            })?;
            debug!("  {} ({} bytes)", entry.name, entry.size);
        }

        let reused = commit(staging.path(), &target, &manifest)?;
        if !reused {
            info!(
                "Extracted {} files to {}",
                manifest.entries.len(),
                target.display()
            );
        }

        Ok(Self::finish(target, &manifest, reused))
    }

    fn finish(directory: PathBuf, manifest: &Manifest, reused: bool) -> Extraction {
        let files = manifest
            .entries
            .iter()
            .map(|e| join_bundle_path(&directory, &e.name))
            .collect();
        Extraction {
            directory,
            files,
            reused,
        }
    }

    fn map(&self) -> Result<Mmap> {
        let file = File::open(&self.bundle_path).map_err(|e| Error::FileOpen {
            path: self.bundle_path.clone(),
            source: e,
        })?;
        if file.metadata()?.len() < MARKER_SIZE as u64 {
            return Err(Error::NotABundle {
                path: self.bundle_path.clone(),
            });
        }

        unsafe { Mmap::map(&file) }.map_err(|e| Error::MemoryMap {
            path: self.bundle_path.clone(),
            source: e,
        })
    }

    /// Locates the manifest through the marker and validates it.
    fn parse_manifest(&self, data: &[u8]) -> Result<Manifest> {
        let not_a_bundle = || Error::NotABundle {
            path: self.bundle_path.clone(),
        };

        // Prefer the filled marker whose manifest is really there; any other
        // copy of the signature in the stub is just data.
        let markers = BundleMarker::find_all(data);
        let filled: Vec<&BundleMarker> = markers.iter().filter(|m| !m.is_placeholder()).collect();
        let marker = filled
            .iter()
            .find(|m| points_at_manifest(m, data))
            .or(filled.first())
            .ok_or_else(not_a_bundle)?;
        let range = marker.manifest_range().ok_or_else(not_a_bundle)?;

        if marker.manifest_size == 0 || range.end > data.len() as u64 {
            return Err(Error::manifest(
                marker.manifest_offset as usize,
                format!(
                    "manifest {:#x}+{:#x} lies outside the file ({:#x} bytes)",
                    marker.manifest_offset,
                    marker.manifest_size,
                    data.len()
                ),
            ));
        }

        let manifest = Manifest::decode(&data[range.start as usize..range.end as usize])?;
        manifest.validate(marker.manifest_offset)?;

        debug!(
            "{}: bundle {} with {} files",
            self.bundle_path.display(),
            manifest.bundle_id,
            manifest.entries.len()
        );
        Ok(manifest)
    }
}

/// Returns true if the marker's manifest range holds a manifest header.
fn points_at_manifest(marker: &BundleMarker, data: &[u8]) -> bool {
    marker
        .manifest_range()
        .and_then(|range| data.get(range.start as usize..range.end as usize))
        .is_some_and(|manifest| manifest.starts_with(&MANIFEST_MAGIC))
}

/// Moves an incomplete extraction at `target` out of the way.
///
/// Repairs of the same bundle are serialized through a lock file in
/// `app_dir`. The stale directory is renamed into a private temporary
/// directory before it is deleted, so `target` itself is only ever absent or
/// complete for everyone else. Returns true if `target` turned out to be
/// complete once the lock was held.
fn discard_incomplete(app_dir: &Path, target: &Path, manifest: &Manifest) -> Result<bool> {
    let lock_path = app_dir.join(format!(".{}.lock", manifest.bundle_id));
    let lock = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| Error::FileOpen {
            path: lock_path.clone(),
            source: e,
        })?;
    lock.lock().map_err(|e| Error::FileOpen {
        path: lock_path.clone(),
        source: e,
    })?;

    if !target.exists() {
        return Ok(false);
    }
    if is_complete(target, manifest) {
        return Ok(true);
    }

    warn!(
        "Extraction at {} is incomplete, extracting again",
        target.display()
    );
    let stale = tempfile::Builder::new()
        .prefix(&format!(".{}-stale-", manifest.bundle_id))
        .tempdir_in(app_dir)
        .map_err(|e| Error::FileWrite {
            path: app_dir.to_path_buf(),
            source: e,
        })?;
    match fs::rename(target, stale.path().join("old")) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(Error::Commit {
                path: target.to_path_buf(),
                source: e,
            })
        }
    }

    // `stale` is dropped, and the old files deleted, before `lock` is released.
    Ok(false)
}

/// Publishes `staging` as `target`.
///
/// Returns true if another extraction committed first.
fn commit(staging: &Path, target: &Path, manifest: &Manifest) -> Result<bool> {
    let mut attempts = 0;

    loop {
        let err = match fs::rename(staging, target) {
            Ok(()) => return Ok(false),
            Err(e) => e,
        };

        if is_complete(target, manifest) {
            debug!(
                "{} was extracted concurrently, discarding own copy",
                target.display()
            );
            return Ok(true);
        }

        if err.kind() == io::ErrorKind::PermissionDenied && attempts < COMMIT_RETRIES {
            attempts += 1;
            thread::sleep(COMMIT_RETRY_DELAY);
            continue;
        }

        return Err(Error::Commit {
            path: target.to_path_buf(),
            source: err,
        });
    }
}

/// Returns true if `dir` holds exactly the manifest's files with their sizes.
fn is_complete(dir: &Path, manifest: &Manifest) -> bool {
    let mut expected: HashMap<PathBuf, u64> = manifest
        .entries
        .iter()
        .map(|e| (join_bundle_path(dir, &e.name), e.size as u64))
        .collect();

    for entry in WalkDir::new(dir).min_depth(1) {
        let Ok(entry) = entry else {
            return false;
        };
        if entry.file_type().is_dir() {
            continue;
        }
        if !entry.file_type().is_file() {
            return false;
        }

        let size = match entry.metadata() {
            Ok(metadata) => metadata.len(),
            Err(_) => return false,
        };
        if expected.remove(entry.path()) != Some(size) {
            return false;
        }
    }

    expected.is_empty()
}

/// Joins a `/`-separated bundle path onto `dir`.
fn join_bundle_path(dir: &Path, name: &str) -> PathBuf {
    let mut path = dir.to_path_buf();
    path.extend(name.split('/'));
    path
}
