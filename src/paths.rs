//! Config and log file locations
//!
//! Priority:
//! 1. `--config-dir` CLI argument
//! 2. `VIDGRID_CONFIG_DIR` environment variable
//! 3. Current directory IF it already holds vidgrid.json or vidgrid.log
//! 4. Platform directory from dirs-next:
//!    - Linux: ~/.config/vidgrid (config), ~/.local/share/vidgrid (data)
//!    - macOS: ~/Library/Application Support/vidgrid
//!    - Windows: %APPDATA%\vidgrid

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub const CONFIG_DIR_ENV: &str = "VIDGRID_CONFIG_DIR";
const APP_DIR: &str = "vidgrid";
const LOCAL_MARKERS: [&str; 2] = ["vidgrid.json", "vidgrid.log"];

/// Overrides for the default locations
#[derive(Debug, Clone, Default)]
pub struct PathConfig {
    /// Custom config directory (from CLI or ENV)
    pub config_dir: Option<PathBuf>,
}

impl PathConfig {
    /// CLI argument wins over the environment variable
    pub fn from_env_and_cli(cli_dir: Option<PathBuf>) -> Self {
        Self::resolve(cli_dir, std::env::var(CONFIG_DIR_ENV).ok())
    }

    fn resolve(cli_dir: Option<PathBuf>, env_dir: Option<String>) -> Self {
        let config_dir = cli_dir.or_else(|| env_dir.filter(|d| !d.is_empty()).map(PathBuf::from));
        Self { config_dir }
    }
}

/// Path of a configuration file such as `vidgrid.json`
pub fn config_file(name: &str, config: &PathConfig) -> PathBuf {
    resolve_dir(config, dirs_next::config_dir()).join(name)
}

/// Path of a data file such as the log
pub fn data_file(name: &str, config: &PathConfig) -> PathBuf {
    resolve_dir(config, dirs_next::data_dir()).join(name)
}

/// Create the config and data directories if missing
pub fn ensure_dirs(config: &PathConfig) -> Result<()> {
    let config_dir = resolve_dir(config, dirs_next::config_dir());
    let data_dir = resolve_dir(config, dirs_next::data_dir());

    for dir in [&config_dir, &data_dir] {
        if !dir.exists() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
    }
    Ok(())
}

fn has_local_config_files(dir: &Path) -> bool {
    LOCAL_MARKERS.iter().any(|f| dir.join(f).exists())
}

fn resolve_dir(config: &PathConfig, platform_dir: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = &config.config_dir {
        return dir.clone();
    }

    if let Ok(current_dir) = std::env::current_dir() {
        if has_local_config_files(&current_dir) {
            return current_dir;
        }
    }

    match platform_dir {
        Some(dir) => dir.join(APP_DIR),
        None => PathBuf::from("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_dir_beats_env() {
        let config = PathConfig::resolve(Some(PathBuf::from("/cli")), Some("/env".into()));
        assert_eq!(config.config_dir, Some(PathBuf::from("/cli")));

        let config = PathConfig::resolve(None, Some("/env".into()));
        assert_eq!(config.config_dir, Some(PathBuf::from("/env")));

        let config = PathConfig::resolve(None, Some(String::new()));
        assert_eq!(config.config_dir, None);
    }

    #[test]
    fn test_files_in_custom_dir() {
        let config = PathConfig {
            config_dir: Some(PathBuf::from("/custom")),
        };
        assert_eq!(config_file("vidgrid.json", &config), PathBuf::from("/custom/vidgrid.json"));
        assert_eq!(data_file("vidgrid.log", &config), PathBuf::from("/custom/vidgrid.log"));
    }

    #[test]
    fn test_platform_dir_gets_app_subdir() {
        let config = PathConfig::default();
        let dir = resolve_dir(&config, Some(PathBuf::from("/platform")));
        // Unless the test runs from a directory holding vidgrid files
        if !has_local_config_files(&std::env::current_dir().unwrap()) {
            assert_eq!(dir, PathBuf::from("/platform/vidgrid"));
        }
    }

    #[test]
    fn test_local_marker_detection() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!has_local_config_files(dir.path()));
        std::fs::write(dir.path().join("vidgrid.log"), "").unwrap();
        assert!(has_local_config_files(dir.path()));
    }

    #[test]
    fn test_ensure_dirs_creates_custom_dir() {
        let dir = tempfile::tempdir().unwrap();
        let custom = dir.path().join("nested").join("cfg");
        let config = PathConfig {
            config_dir: Some(custom.clone()),
        };
        ensure_dirs(&config).unwrap();
        assert!(custom.is_dir());
    }
}
