//! Configuration management for failscout
//!
//! Stores settings in ~/.config/failscout/config.json. These are CLI defaults
//! only; the GitHub token always comes from the environment and is never
//! written to disk.

use crate::models::DEFAULT_QUERIES;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Maximum candidates accepted per discovery pass.
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Minimum star count; 0 disables the filter.
    #[serde(default = "default_min_stars")]
    pub min_stars: u32,
    /// Download and analyze report artifacts to confirm real failures.
    #[serde(default = "default_verify")]
    pub verify_failures: bool,
    /// Custom search queries; the built-in set is used when absent.
    #[serde(default)]
    pub queries: Option<Vec<String>>,
}

fn default_limit() -> usize {
    30
}

fn default_min_stars() -> u32 {
    100
}

fn default_verify() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Config {
            limit: default_limit(),
            min_stars: default_min_stars(),
            verify_failures: default_verify(),
            queries: None,
        }
    }
}

impl Config {
    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("failscout"))
    }

    /// Get the config file path
    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load config from disk, or return default
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            if let Ok(content) = fs::read_to_string(&path) {
                match serde_json::from_str(&content) {
                    Ok(config) => return config,
                    Err(err) => {
                        preserve_corrupt_config(&path, &content);
                        eprintln!(
                            "  Warning: Config file was corrupted ({}). A backup was saved and defaults were loaded.",
                            err
                        );
                    }
                }
            }
        }
        Self::default()
    }

    /// Save config to disk
    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir().context("Could not determine config directory")?;

        fs::create_dir_all(&dir).context("Failed to create config directory")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = fs::set_permissions(&dir, fs::Permissions::from_mode(0o700)) {
                eprintln!("  Warning: Failed to set config directory permissions: {}", e);
            }
        }

        let path = dir.join("config.json");
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize config")?;

        #[cfg(unix)]
        {
            write_config_atomic(&path, &content).context("Failed to write config")?;
        }

        #[cfg(not(unix))]
        {
            fs::write(&path, content).context("Failed to write config")?;
        }

        Ok(())
    }

    /// The search queries to run: custom if configured, built-in otherwise.
    pub fn effective_queries(&self) -> Vec<String> {
        match &self.queries {
            Some(queries) if !queries.is_empty() => queries.clone(),
            _ => DEFAULT_QUERIES.iter().map(|q| q.to_string()).collect(),
        }
    }

    /// Get the config file location for display
    pub fn config_location() -> String {
        Self::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "~/.config/failscout/config.json".to_string())
    }
}

fn preserve_corrupt_config(path: &std::path::Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

#[cfg(unix)]
fn write_config_atomic(path: &std::path::Path, content: &str) -> Result<()> {
    use std::fs::OpenOptions;
    use std::os::unix::fs::PermissionsExt;

    let tmp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)
        .with_context(|| format!("Failed to open {}", tmp_path.display()))?;

    if let Err(e) = file.set_permissions(fs::Permissions::from_mode(0o600)) {
        eprintln!("  Warning: Failed to set temp config file permissions: {}", e);
    }

    file.write_all(content.as_bytes())
        .context("Failed to write temp config file")?;

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err).context("Failed to replace config file");
    }
    Ok(())
}
