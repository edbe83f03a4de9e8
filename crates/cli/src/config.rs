//! Layered defaults for the CLI
//!
//! Built-in values, then `~/.config/kubectl-prof/config.{toml,json,yaml}`,
//! then `KUBECTL_PROF_*` environment variables. Command line flags override
//! all of them.

use anyhow::{Context, Result};
use prof_lib::config::{
    DEFAULT_HEAP_DUMP_SPLIT_SIZE, DEFAULT_IMAGE_REPOSITORY, DEFAULT_POOL_SIZE_RETRIEVE_CHUNKS,
    DEFAULT_RETRIEVE_FILE_RETRIES,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "KUBECTL_PROF";

/// CLI defaults that can be overridden without flags
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Settings {
    #[serde(default = "default_image_repository")]
    pub image_repository: String,

    #[serde(default = "default_image_version")]
    pub image_version: String,

    #[serde(default = "default_local_path")]
    pub local_path: PathBuf,

    #[serde(default = "default_pool_size_retrieve_chunks")]
    pub pool_size_retrieve_chunks: usize,

    #[serde(default = "default_retrieve_file_retries")]
    pub retrieve_file_retries: u32,

    #[serde(default = "default_heap_dump_split_size")]
    pub heap_dump_split_size: String,

    /// Go style duration, e.g. `5m`
    #[serde(default = "default_grace_period_ending")]
    pub grace_period_ending: String,

    #[serde(default = "default_ephemeral_timeout")]
    pub ephemeral_timeout: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_image_repository() -> String {
    DEFAULT_IMAGE_REPOSITORY.to_string()
}

fn default_image_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_local_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_pool_size_retrieve_chunks() -> usize {
    DEFAULT_POOL_SIZE_RETRIEVE_CHUNKS
}

fn default_retrieve_file_retries() -> u32 {
    DEFAULT_RETRIEVE_FILE_RETRIES
}

fn default_heap_dump_split_size() -> String {
    DEFAULT_HEAP_DUMP_SPLIT_SIZE.to_string()
}

fn default_grace_period_ending() -> String {
    "5m".to_string()
}

fn default_ephemeral_timeout() -> String {
    "5m".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            image_repository: default_image_repository(),
            image_version: default_image_version(),
            local_path: default_local_path(),
            pool_size_retrieve_chunks: default_pool_size_retrieve_chunks(),
            retrieve_file_retries: default_retrieve_file_retries(),
            heap_dump_split_size: default_heap_dump_split_size(),
            grace_period_ending: default_grace_period_ending(),
            ephemeral_timeout: default_ephemeral_timeout(),
            log_level: default_log_level(),
        }
    }
}

impl Settings {
    /// Load from the user config directory and the environment
    pub fn load() -> Result<Self> {
        Self::load_from(config_base().as_deref())
    }

    /// Load with `base` (a path without extension) as the optional file
    /// source
    pub fn load_from(base: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(base) = base {
            builder = builder.add_source(
                config::File::with_name(&base.to_string_lossy()).required(false),
            );
        }
        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()
            .context("Failed to load kubectl-prof settings")?;

        settings
            .try_deserialize()
            .context("Failed to parse kubectl-prof settings")
    }
}

/// `~/.config/kubectl-prof/config`, extension resolved by the loader
fn config_base() -> Option<PathBuf> {
    dirs_next::home_dir().map(|home| home.join(".config").join("kubectl-prof").join("config"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_file() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::load_from(Some(&dir.path().join("config"))).unwrap();
        assert_eq!(settings.image_repository, "josepdcs/kubectl-prof");
        assert_eq!(settings.pool_size_retrieve_chunks, 5);
        assert_eq!(settings.retrieve_file_retries, 3);
        assert_eq!(settings.heap_dump_split_size, "50M");
        assert_eq!(settings.grace_period_ending, "5m");
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "image_repository = \"registry.local/prof\"\nretrieve_file_retries = 7\n",
        )
        .unwrap();

        let settings = Settings::load_from(Some(&dir.path().join("config"))).unwrap();
        assert_eq!(settings.image_repository, "registry.local/prof");
        assert_eq!(settings.retrieve_file_retries, 7);
        assert_eq!(settings.local_path, PathBuf::from("."));
    }
}
