//! Loader configuration, persisted as TOML.
//!
//! ```toml
//! search_locations = ["file:///opt/app/classes", "file:///opt/app/lib.jar"]
//! cache_capacity = 512
//! constants_capacity = 128
//! isolate = true
//! ```

use std::path::Path;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::host::SearchLocation;

/// Errors from reading loader configuration.
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read loader config: {path}")]
    #[diagnostic(
        code(dynload::config::read),
        help("Ensure the config file exists and is readable.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse loader config: {path}: {message}")]
    #[diagnostic(
        code(dynload::config::parse),
        help("Check the TOML syntax. Known keys: search_locations, cache_capacity, constants_capacity, isolate.")
    )]
    Parse { path: String, message: String },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Settings for [`DynamicLoader::from_config`](crate::loader::DynamicLoader::from_config).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoaderConfig {
    /// Initial search locations, searched in order.
    #[serde(default)]
    pub search_locations: Vec<String>,
    /// Capacity hint for a freshly created unit cache.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Capacity hint for a freshly created constants table.
    #[serde(default = "default_constants_capacity")]
    pub constants_capacity: usize,
    /// Give a loader under a dynamic parent its own child context instead of
    /// sharing the parent's.
    #[serde(default)]
    pub isolate: bool,
}

fn default_cache_capacity() -> usize {
    64
}
fn default_constants_capacity() -> usize {
    64
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            search_locations: Vec::new(),
            cache_capacity: default_cache_capacity(),
            constants_capacity: default_constants_capacity(),
            isolate: false,
        }
    }
}

impl LoaderConfig {
    pub fn from_toml_str(s: &str) -> ConfigResult<Self> {
        toml::from_str(s).map_err(|e| ConfigError::Parse {
            path: "<inline>".into(),
            message: e.to_string(),
        })
    }

    /// Read and parse a TOML config file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    pub fn to_toml_string(&self) -> String {
        // A struct of strings, integers and a bool always serializes.
        toml::to_string_pretty(self).unwrap_or_default()
    }

    pub fn locations(&self) -> Vec<SearchLocation> {
        self.search_locations
            .iter()
            .map(|s| SearchLocation::new(s.as_str()))
            .collect()
    }
}
