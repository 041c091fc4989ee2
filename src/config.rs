//! User settings loaded from disk.
//!
//! Every field is optional: command-line flags take precedence, then these
//! settings, then the built-in defaults. The file lives at
//! `<config dir>/splitfetch/config.json`.
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Default number of workers.
    pub threads: Option<usize>,
    /// Directory downloads are saved to when no output path is given.
    pub default_dir: Option<String>,
    /// Retries per range before giving up.
    pub retries: Option<u32>,
    /// Delay between retries, in milliseconds.
    pub retry_delay_ms: Option<u64>,
    /// Write buffer size in bytes.
    pub chunk_size: Option<usize>,
    pub connect_timeout_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
    /// Write each range to its own part file and concatenate at the end.
    pub part_files: Option<bool>,
}

impl Settings {
    /// Default location of the settings file.
    pub fn path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("splitfetch").join("config.json"))
    }

    /// Loads settings from the default location.
    ///
    /// # Errors
    ///
    /// Fails if there is no config directory on this platform, or the file is
    /// missing or malformed. Callers usually fall back to `Settings::default()`.
    pub fn load() -> Result<Self> {
        let path = Self::path().ok_or(anyhow!("No config directory on this platform."))?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let settings = serde_json::from_str(&json)
            .with_context(|| format!("Invalid settings in {}", path.display()))?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_partial_settings() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "threads": 6, "part_files": true }"#)?;

        let settings = Settings::load_from(&path)?;
        assert_eq!(settings.threads, Some(6));
        assert_eq!(settings.part_files, Some(true));
        assert_eq!(settings.retries, None);
        assert_eq!(settings.default_dir, None);
        Ok(())
    }

    #[test]
    fn test_load_rejects_malformed_file() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("config.json");
        std::fs::write(&path, "threads = 6")?;

        assert!(Settings::load_from(&path).is_err());
        assert!(Settings::load_from(&dir.path().join("missing.json")).is_err());
        Ok(())
    }
}
