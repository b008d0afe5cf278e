//! CLI settings file.
//!
//! Looked up as `./oql.toml`, then `<config dir>/oql/config.toml`:
//!
//! ```toml
//! dialect = "sqlite"
//! mapping = "mapping.toml"
//! database_url = "sqlite://app.db"
//!
//! [substitutions]
//! schema = "main"
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::dialect::Dialect;
use crate::error::OqlError;

const LOCAL_FILE: &str = "oql.toml";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// When unset, the dialect follows the database URL.
    pub dialect: Option<Dialect>,
    pub mapping: Option<PathBuf>,
    pub database_url: Option<String>,
    pub substitutions: BTreeMap<String, String>,
}

impl Settings {
    pub fn from_toml_str(input: &str) -> Result<Self, OqlError> {
        toml::from_str(input).map_err(|e| OqlError::Config(format!("invalid settings: {}", e)))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, OqlError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let mut settings = Self::from_toml_str(&content)?;
        // A relative mapping path is relative to the settings file.
        if let (Some(mapping), Some(dir)) = (settings.mapping.as_mut(), path.parent()) {
            if mapping.is_relative() {
                *mapping = dir.join(&*mapping);
            }
        }
        Ok(settings)
    }

    /// Candidate settings files, most specific first.
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(LOCAL_FILE)];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("oql").join("config.toml"));
        }
        paths
    }

    /// The first settings file found, or defaults when there is none.
    pub fn load() -> Result<Self, OqlError> {
        match Self::search_paths().into_iter().find(|p| p.is_file()) {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Explicit dialect, else the one implied by the database URL.
    pub fn resolve_dialect(&self) -> Dialect {
        self.dialect
            .or_else(|| self.database_url.as_deref().and_then(Dialect::from_url))
            .unwrap_or_default()
    }
}
