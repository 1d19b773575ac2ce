//! Tunables file
//!
//! The shim runs inside arbitrary applications, so there is no search through
//! home or working directories: the file is the one named by `CUDAGOV_CONFIG`
//! (or `--config` for the monitor), else the system-wide file.

use crate::config::Config;
use crate::error::ConfigError;

use std::path::{Path, PathBuf};

/// System-wide tunables, read when no file is named explicitly
pub const SYSTEM_CONFIG_PATH: &str = "/etc/cudagov/config.toml";

pub struct ConfigFile;

impl ConfigFile {
    /// Parse one TOML file; missing sections keep their defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound(path.display().to_string()))?;

        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// File to read: the named one, else the system file if present
    pub fn locate(named: Option<&str>) -> Option<PathBuf> {
        match named {
            Some(path) => Some(PathBuf::from(path)),
            None => {
                let system = PathBuf::from(SYSTEM_CONFIG_PATH);
                system.exists().then_some(system)
            }
        }
    }

    /// Load the located file
    ///
    /// A named file that cannot be read is reported and ignored; it does not
    /// fall back to the system file.
    pub fn load_located(named: Option<&str>) -> Option<Config> {
        let path = Self::locate(named)?;
        match Self::load(&path) {
            Ok(config) => {
                log::info!("Loaded config from {}", path.display());
                Some(config)
            }
            Err(e) => {
                log::warn!("Ignoring {}: {}", path.display(), e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[throttle]
wait_interval_ms = 50
standalone = true

[monitor]
sample_window_secs = 2
"#
        )
        .unwrap();

        let config = ConfigFile::load(file.path()).unwrap();
        assert_eq!(config.throttle.wait_interval_ms, 50);
        assert!(config.throttle.standalone);
        assert_eq!(config.monitor.sample_window_secs, 2);
        assert_eq!(config.monitor.interval_ms, 100);
        assert_eq!(config.shm.prefix, "/cuda_hook");
    }

    #[test]
    fn test_load_missing_file() {
        let result = ConfigFile::load("/nonexistent/cudagov.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_named_file_wins() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[shm]\nprefix = \"/named\"").unwrap();
        let path = file.path().to_str().unwrap();

        assert_eq!(ConfigFile::locate(Some(path)), Some(PathBuf::from(path)));
        let config = ConfigFile::load_located(Some(path)).unwrap();
        assert_eq!(config.shm.prefix, "/named");
    }

    #[test]
    fn test_unreadable_named_file_is_ignored() {
        assert!(ConfigFile::load_located(Some("/nonexistent/cudagov.toml")).is_none());
    }

    #[test]
    fn test_load_invalid_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[throttle\nwait_interval_ms = ").unwrap();
        let result = ConfigFile::load(file.path());
        assert!(matches!(result, Err(ConfigError::TomlError(_))));
    }
}
