//! Runtime configuration read from the environment.

use std::env;
use std::path::PathBuf;

/// Environment variable overriding the extraction base directory.
pub const EXTRACT_BASE_DIR_VAR: &str = "SINGLEFILE_EXTRACT_BASE_DIR";

/// Directory created under the system temp directory by default.
const DEFAULT_DIR_NAME: &str = ".singlefile";

/// Where bundles are extracted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionConfig {
    /// Base directory holding one subdirectory per application
    pub base_dir: PathBuf,
}

impl ExtractionConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_var(env::var_os(EXTRACT_BASE_DIR_VAR).map(PathBuf::from))
    }

    fn from_var(value: Option<PathBuf>) -> Self {
        let base_dir = value
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| env::temp_dir().join(DEFAULT_DIR_NAME));
        Self { base_dir }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self::from_var(None)
    }
}
