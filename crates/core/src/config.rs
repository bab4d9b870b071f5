use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "FRAMELAPSE_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub server: ServerConfig,
    pub jobs: JobsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    /// Encoded timelapse videos land here until the reaper removes them.
    pub output_dir: PathBuf,
    /// Per-job frame staging directories live here while a job runs.
    pub frames_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct JobsConfig {
    /// Upper bound on assets accepted in a single render request.
    pub max_assets_per_job: usize,
    /// Concurrently running pipelines; each one holds an ffmpeg process
    /// and a full staged frame set on disk.
    pub max_concurrent: usize,
    /// Output files older than this are deleted by the reaper.
    pub retention_hours: u64,
    /// Interval between reaper sweeps.
    pub reaper_interval_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            server: ServerConfig::default(),
            jobs: JobsConfig::default(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("timelapses"),
            frames_dir: PathBuf::from("timelapse-frames"),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            host: "0.0.0.0".to_string(),
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_assets_per_job: 1000,
            max_concurrent: 2,
            retention_hours: 24,
            reaper_interval_secs: 3600,
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. FRAMELAPSE_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Initialize the data directory structure on first run:
/// - Creates data_dir, output_dir, and frames_dir if missing
/// - Writes default config.toml only if the file doesn't exist
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    let config = if cfg_path.exists() {
        AppConfig::load_from_path(&cfg_path)?
    } else {
        let default_cfg = AppConfig::default();
        default_cfg.save_to_path(&cfg_path)?;
        default_cfg
    };

    for dir in [&config.paths.output_dir, &config.paths.frames_dir] {
        let resolved = resolve_relative_to(data_dir, dir);
        fs::create_dir_all(&resolved).with_context(|| {
            format!("failed to create storage directory: {}", resolved.display())
        })?;
    }

    Ok(())
}

/// Resolve a path relative to a base directory.
/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.paths.output_dir, PathBuf::from("timelapses"));
        assert_eq!(cfg.paths.frames_dir, PathBuf::from("timelapse-frames"));

        assert_eq!(cfg.server.port, 5000);
        assert_eq!(cfg.server.host, "0.0.0.0");

        assert_eq!(cfg.jobs.max_assets_per_job, 1000);
        assert_eq!(cfg.jobs.max_concurrent, 2);
        assert_eq!(cfg.jobs.retention_hours, 24);
        assert_eq!(cfg.jobs.reaper_interval_secs, 3600);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let original = AppConfig::default();
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let decoded: AppConfig =
            toml::from_str("[server]\nport = 8080\n").expect("deserialize partial config");
        assert_eq!(decoded.server.port, 8080);
        assert_eq!(decoded.server.host, "0.0.0.0");
        assert_eq!(decoded.jobs.max_concurrent, 2);
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let path = unique_temp_config_path();
        let loaded = AppConfig::load_from_path(&path).expect("load config from nonexistent path");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let cli_path = Path::new("/custom");
        let result = data_dir(Some(cli_path));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn data_dir_uses_env_var_when_no_cli() {
        env::set_var(ENV_DATA_DIR, "/env/path");
        let result = data_dir(None);
        env::remove_var(ENV_DATA_DIR);
        assert_eq!(result, PathBuf::from("/env/path"));
    }

    #[test]
    fn config_path_is_data_dir_join_config_toml() {
        let result = config_path(Path::new("/data"));
        assert_eq!(result, PathBuf::from("/data/config.toml"));
    }

    #[test]
    fn initialize_creates_data_dir_config_and_storage_dirs() {
        let temp = unique_temp_dir();
        initialize_data_dir(&temp).expect("initialize data dir");

        assert!(temp.exists());
        assert!(temp.join("config.toml").exists());
        assert!(temp.join("timelapses").exists());
        assert!(temp.join("timelapse-frames").exists());

        fs::remove_dir_all(&temp).ok();
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let temp = unique_temp_dir();
        fs::create_dir_all(&temp).expect("create temp dir");

        let cfg_path = temp.join("config.toml");
        let custom_content = "[server]\nport = 9999\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_data_dir(&temp).expect("initialize data dir");

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, custom_content);

        fs::remove_dir_all(&temp).ok();
    }

    #[test]
    fn resolve_relative_to_absolute_path_unchanged() {
        let result = resolve_relative_to(Path::new("/base"), Path::new("/abs/path"));
        assert_eq!(result, PathBuf::from("/abs/path"));
    }

    #[test]
    fn resolve_relative_to_joins_relative_path() {
        let result = resolve_relative_to(Path::new("/base"), Path::new("sub"));
        assert_eq!(result, PathBuf::from("/base/sub"));
    }

    fn unique_temp_config_path() -> PathBuf {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time moved backwards")
            .as_nanos();
        std::env::temp_dir().join(format!(
            "framelapse-config-test-{}-{timestamp}.toml",
            std::process::id()
        ))
    }

    fn unique_temp_dir() -> PathBuf {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time moved backwards")
            .as_nanos();
        std::env::temp_dir().join(format!(
            "framelapse-config-test-{}-{timestamp}",
            std::process::id()
        ))
    }
}
