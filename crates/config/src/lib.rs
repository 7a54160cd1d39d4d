//! Layered configuration for shelf.
//!
//! Sources are merged in order, later sources winning:
//! 1. built-in defaults,
//! 2. `shelf.toml`, `shelf.yaml` and `shelf.json` in the platform config
//!    directory,
//! 3. an explicit file given on the command line,
//! 4. `library.json` in the platform config directory, written by
//!    [`Config::set_library`] when the library is relocated,
//! 5. `SHELF_`-prefixed environment variables, with `__` separating nested
//!    keys (`SHELF_MIGRATION__SEGMENT_SIZE=1048576`).

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const MIB: u64 = 1024 * 1024;
const STATE_FILE: &str = "library.json";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "shelf")
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory holding the canonical `{key}.zip` files.
    pub library: PathBuf,
    /// SQLite database holding comic records and pending moves.
    pub database: PathBuf,
    pub migration: MigrationConfig,
    pub delete: DeleteConfig,
    #[serde(skip)]
    state_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let data = project_dirs().map_or_else(|| PathBuf::from(".shelf"), |dirs| dirs.data_dir().to_path_buf());
        Self {
            library: data.join("library"),
            database: data.join("shelf.db"),
            migration: MigrationConfig::default(),
            delete: DeleteConfig::default(),
            state_file: None,
        }
    }
}

/// Tuning for relocation jobs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Bytes per concurrently written segment when extracting bundles.
    pub segment_size: u64,
    /// Entries buffered between decompression and re-compression.
    pub pipeline_depth: usize,
    /// Buffer size for direct copies.
    pub copy_chunk_size: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self { segment_size: 4 * MIB, pipeline_depth: 2, copy_chunk_size: 4 * MIB }
    }
}

/// Retry policy for deleting files that are still held open elsewhere.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteConfig {
    pub attempts: u32,
    /// Linear backoff step; attempt `n` waits `n * backoff_ms`.
    pub backoff_ms: u64,
}

impl Default for DeleteConfig {
    fn default() -> Self {
        Self { attempts: 3, backoff_ms: 100 }
    }
}

impl DeleteConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl Config {
    /// Load from the platform config directory, an optional explicit file and
    /// the environment.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut loader = Loader::new();
        if let Some(dirs) = project_dirs() {
            loader = loader.config_dir(dirs.config_dir());
        }
        if let Some(file) = explicit {
            loader = loader.file(file);
        }
        loader.load()
    }

    pub fn validate(&self) -> Result<()> {
        if !self.library.is_absolute() {
            exn::bail!(ErrorKind::Invalid("library root must be an absolute path"));
        }
        if self.migration.segment_size == 0 {
            exn::bail!(ErrorKind::Invalid("segment size must be greater than zero"));
        }
        if self.migration.copy_chunk_size == 0 {
            exn::bail!(ErrorKind::Invalid("copy chunk size must be greater than zero"));
        }
        if self.migration.pipeline_depth == 0 {
            exn::bail!(ErrorKind::Invalid("pipeline depth must be at least one"));
        }
        if self.delete.attempts == 0 {
            exn::bail!(ErrorKind::Invalid("delete attempts must be at least one"));
        }
        Ok(())
    }

    /// Switch the library root and remember it for the next run.
    ///
    /// Nothing is written when the configuration was not loaded from a config
    /// directory.
    pub fn set_library(&mut self, library: impl Into<PathBuf>) -> Result<()> {
        let library = library.into();
        if !library.is_absolute() {
            exn::bail!(ErrorKind::Invalid("library root must be an absolute path"));
        }
        if let Some(state) = &self.state_file {
            if let Some(parent) = state.parent() {
                std::fs::create_dir_all(parent).or_raise(|| ErrorKind::Persist)?;
            }
            let json =
                serde_json::to_vec_pretty(&serde_json::json!({ "library": library })).or_raise(|| ErrorKind::Persist)?;
            std::fs::write(state, json).or_raise(|| ErrorKind::Persist)?;
            debug!(path = %state.display(), "persisted library root");
        }
        self.library = library;
        Ok(())
    }
}

/// Builder for the figment stack behind [`Config::load`].
#[derive(Debug, Default)]
pub struct Loader {
    config_dir: Option<PathBuf>,
    file: Option<PathBuf>,
}

impl Loader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = Some(dir.into());
        self
    }

    pub fn file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn load(self) -> Result<Config> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(dir) = &self.config_dir {
            figment = figment
                .merge(Toml::file(dir.join("shelf.toml")))
                .merge(Yaml::file(dir.join("shelf.yaml")))
                .merge(Json::file(dir.join("shelf.json")));
        }
        if let Some(file) = &self.file {
            if !file.is_file() {
                exn::bail!(ErrorKind::Load);
            }
            figment = match file.extension().and_then(|e| e.to_str()) {
                Some("yaml" | "yml") => figment.merge(Yaml::file(file)),
                Some("json") => figment.merge(Json::file(file)),
                _ => figment.merge(Toml::file(file)),
            };
        }
        let state_file = self.config_dir.as_ref().map(|dir| dir.join(STATE_FILE));
        if let Some(state) = &state_file {
            figment = figment.merge(Json::file(state));
        }
        figment = figment.merge(Env::prefixed("SHELF_").split("__"));

        let mut config: Config = figment.extract().or_raise(|| ErrorKind::Load)?;
        config.state_file = state_file;
        config.validate()?;
        Ok(config)
    }
}
