use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::cache::SqliteStorage;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub stream: StreamConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL of the REST API, e.g. https://site.example.com/api/v1
  pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Persist streams to disk. When off, every load starts empty.
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Cache directory (defaults to $XDG_CACHE_HOME/feedsync)
  pub dir: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      dir: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
  /// Maximum number of updates requested per rescan
  pub page_size: usize,
  /// Maximum number of events read from the store on load
  pub load_limit: usize,
  /// Extra fields requested for linked entities, per entity type
  pub entity_fields: BTreeMap<String, Vec<String>>,
}

impl Default for StreamConfig {
  fn default() -> Self {
    Self {
      page_size: 100,
      load_limit: 1000,
      entity_fields: default_entity_fields(),
    }
  }
}

fn default_true() -> bool {
  true
}

fn default_entity_fields() -> BTreeMap<String, Vec<String>> {
  let media = ["description", "sg_uploaded_movie", "image", "entity"];
  let mut fields = BTreeMap::new();
  fields.insert("Task", vec!["created_at", "task_assignees", "entity"]);
  for entity_type in ["Shot", "Asset", "Sequence"] {
    fields.insert(entity_type, vec!["image"]);
  }
  for entity_type in ["Version", "PublishedFile", "TankPublishedFile"] {
    fields.insert(entity_type, media.to_vec());
  }
  fields
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.into_iter().map(String::from).collect()))
    .collect()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./feedsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/feedsync/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/feedsync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("feedsync.yaml");
    if local.exists() {
      return Some(local);
    }

    let xdg_path = dirs::config_dir()?.join("feedsync").join("config.yaml");
    xdg_path.exists().then_some(xdg_path)
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Directory holding the store and the log file.
  pub fn cache_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.cache.dir {
      return Ok(dir.clone());
    }

    let cache_dir = dirs::cache_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".cache")))
      .ok_or_else(|| eyre!("Could not determine cache directory"))?;

    Ok(cache_dir.join("feedsync"))
  }

  /// Path of the store file for the current protocol version.
  pub fn store_path(&self) -> Result<PathBuf> {
    Ok(self.cache_dir()?.join(SqliteStorage::file_name()))
  }

  /// Get the API token from the environment.
  pub fn get_api_token() -> Result<String> {
    std::env::var("FEEDSYNC_API_TOKEN")
      .map_err(|_| eyre!("API token not found. Set the FEEDSYNC_API_TOKEN environment variable."))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse("api:\n  url: https://site.example.com/api/v1\n").unwrap();

    assert!(config.cache.enabled);
    assert_eq!(config.stream.page_size, 100);
    assert_eq!(config.stream.load_limit, 1000);
    assert_eq!(config.stream.entity_fields["Shot"], vec!["image"]);
    assert_eq!(
      config.stream.entity_fields["Version"],
      vec!["description", "sg_uploaded_movie", "image", "entity"]
    );
  }

  #[test]
  fn test_overrides() {
    let config = Config::parse(
      r#"
api:
  url: https://site.example.com/api/v1
cache:
  enabled: false
  dir: /tmp/feedsync-test
stream:
  page_size: 25
  entity_fields:
    Shot: [image, code]
"#,
    )
    .unwrap();

    assert!(!config.cache.enabled);
    assert_eq!(config.stream.page_size, 25);
    assert_eq!(config.stream.load_limit, 1000);
    assert_eq!(config.stream.entity_fields.len(), 1);
    assert_eq!(
      config.store_path().unwrap(),
      PathBuf::from("/tmp/feedsync-test/activity_stream_v1.sqlite")
    );
  }

  #[test]
  fn test_missing_api_section_is_an_error() {
    assert!(Config::parse("cache:\n  enabled: true\n").is_err());
  }

  #[test]
  fn test_explicit_missing_path_is_an_error() {
    assert!(Config::load(Some(Path::new("/nonexistent/feedsync.yaml"))).is_err());
  }
}
