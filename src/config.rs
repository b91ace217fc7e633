use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  /// SQLite database holding the durable cache tier and reconciled records
  /// (defaults to $XDG_DATA_HOME/sunat-sync/sunat-sync.db)
  pub database: Option<PathBuf>,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sunat: SunatConfig,
  #[serde(default)]
  pub log: LogConfig,
}

/// Cache engine tuning. All durations are in milliseconds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
  pub max_memory_entries: usize,
  pub max_durable_bytes: u64,
  pub default_ttl_ms: i64,
  pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      max_memory_entries: 100,
      max_durable_bytes: 50 * 1024 * 1024,
      default_ttl_ms: 1_800_000,
      sweep_interval_ms: 600_000,
    }
  }
}

impl CacheConfig {
  pub fn default_ttl(&self) -> chrono::Duration {
    chrono::Duration::milliseconds(self.default_ttl_ms)
  }

  pub fn sweep_interval(&self) -> std::time::Duration {
    // tokio intervals panic on a zero period
    std::time::Duration::from_millis(self.sweep_interval_ms.max(1))
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SunatConfig {
  /// Directory holding downloaded ledger exports (`{kind}_{ruc}_{period}.json`)
  #[serde(default = "default_export_dir")]
  pub export_dir: PathBuf,
}

impl Default for SunatConfig {
  fn default() -> Self {
    Self {
      export_dir: default_export_dir(),
    }
  }
}

fn default_export_dir() -> PathBuf {
  PathBuf::from("exports")
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
  /// Default filter when RUST_LOG is unset
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Write a daily rolling log file here in addition to stderr
  pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      directory: None,
    }
  }
}

fn default_log_level() -> String {
  "info".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./sunat-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/sunat-sync/config.yaml
  ///
  /// With no file found the defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("sunat-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("sunat-sync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    // An empty file deserializes to null
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }

  /// Database path, falling back to the per-user data directory.
  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(path) => Ok(path.clone()),
      None => crate::db::default_path(),
    }
  }
}
