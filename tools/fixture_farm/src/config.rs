use crate::errors::FixtureFarmError;
use crate::runtime::FileSystem;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "fixture_farm.toml";

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub naming: NamingConfig,
    pub blobs: BlobsConfig,
}

/// Locations relative to the project root unless absolute.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathsConfig {
    pub fixtures_dir: PathBuf,
    pub session_file: PathBuf,
    pub storage_dir: PathBuf,
    pub log_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NamingConfig {
    /// Parent types used for naming only when no other parent is available.
    pub low_priority_parent_types: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlobsConfig {
    pub enabled: bool,
    pub entity_type: String,
    pub key_attribute: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig {
                fixtures_dir: PathBuf::from("test/fixtures"),
                session_file: PathBuf::from("tmp/fixture_farm_store.json"),
                storage_dir: PathBuf::from("storage"),
                log_file: PathBuf::from("tmp/fixture_farm.jsonl"),
            },
            naming: NamingConfig {
                low_priority_parent_types: Vec::new(),
            },
            blobs: BlobsConfig {
                enabled: false,
                entity_type: "ActiveStorage::Blob".to_string(),
                key_attribute: "key".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Copy with every path anchored at `root`.
    pub fn rooted_at(&self, root: &Path) -> Self {
        let mut cfg = self.clone();
        cfg.paths = PathsConfig {
            fixtures_dir: absolutize_path(root, &self.paths.fixtures_dir),
            session_file: absolutize_path(root, &self.paths.session_file),
            storage_dir: absolutize_path(root, &self.paths.storage_dir),
            log_file: absolutize_path(root, &self.paths.log_file),
        };
        cfg
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialAppConfig {
    paths: Option<PartialPathsConfig>,
    naming: Option<PartialNamingConfig>,
    blobs: Option<PartialBlobsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialPathsConfig {
    fixtures_dir: Option<PathBuf>,
    session_file: Option<PathBuf>,
    storage_dir: Option<PathBuf>,
    log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialNamingConfig {
    low_priority_parent_types: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialBlobsConfig {
    enabled: Option<bool>,
    entity_type: Option<String>,
    key_attribute: Option<String>,
}

/// Project root and the configuration anchored to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectScope {
    pub process_cwd: PathBuf,
    pub root: PathBuf,
    pub config_path: Option<PathBuf>,
}

pub fn resolve_scope(process_cwd: &Path, overrides: &CliOverrides, fs: &dyn FileSystem) -> ProjectScope {
    let root = match &overrides.root {
        Some(root) => absolutize_path(process_cwd, root),
        None => process_cwd.to_path_buf(),
    };
    let config_path = match &overrides.config_path {
        Some(path) => Some(absolutize_path(process_cwd, path)),
        None => Some(root.join(CONFIG_FILE_NAME)).filter(|path| fs.exists(path)),
    };
    ProjectScope {
        process_cwd: process_cwd.to_path_buf(),
        root,
        config_path,
    }
}

/// Defaults, then the config file, then validation. Paths in the result are
/// absolute.
pub fn load_config(
    overrides: &CliOverrides,
    process_cwd: &Path,
    fs: &dyn FileSystem,
) -> Result<(AppConfig, ProjectScope), FixtureFarmError> {
    let scope = resolve_scope(process_cwd, overrides, fs);
    let mut cfg = AppConfig::default();

    if let Some(path) = &scope.config_path {
        let file_contents = fs.read_to_string(path)?;
        cfg = parse_config(&file_contents)?;
    }

    validate_config(&cfg)?;
    Ok((cfg.rooted_at(&scope.root), scope))
}

pub fn parse_config(text: &str) -> Result<AppConfig, FixtureFarmError> {
    let partial: PartialAppConfig =
        toml::from_str(text).map_err(|e| FixtureFarmError::ConfigParse(e.to_string()))?;
    let mut cfg = AppConfig::default();
    merge_partial_config(&mut cfg, partial);
    Ok(cfg)
}

fn merge_partial_config(cfg: &mut AppConfig, partial: PartialAppConfig) {
    if let Some(paths) = partial.paths {
        if let Some(value) = paths.fixtures_dir {
            cfg.paths.fixtures_dir = value;
        }
        if let Some(value) = paths.session_file {
            cfg.paths.session_file = value;
        }
        if let Some(value) = paths.storage_dir {
            cfg.paths.storage_dir = value;
        }
        if let Some(value) = paths.log_file {
            cfg.paths.log_file = value;
        }
    }

    if let Some(naming) = partial.naming {
        if let Some(value) = naming.low_priority_parent_types {
            cfg.naming.low_priority_parent_types = value;
        }
    }

    if let Some(blobs) = partial.blobs {
        if let Some(value) = blobs.enabled {
            cfg.blobs.enabled = value;
        }
        if let Some(value) = blobs.entity_type {
            cfg.blobs.entity_type = value;
        }
        if let Some(value) = blobs.key_attribute {
            cfg.blobs.key_attribute = value;
        }
    }
}

fn absolutize_path(base: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        base.join(value)
    }
}

fn validate_config(cfg: &AppConfig) -> Result<(), FixtureFarmError> {
    if cfg.paths.fixtures_dir.as_os_str().is_empty() {
        return Err(FixtureFarmError::InvalidConfig(
            "paths.fixtures_dir must not be empty".to_string(),
        ));
    }
    if cfg.paths.session_file.as_os_str().is_empty() {
        return Err(FixtureFarmError::InvalidConfig(
            "paths.session_file must not be empty".to_string(),
        ));
    }
    if cfg.blobs.enabled
        && (cfg.blobs.entity_type.trim().is_empty() || cfg.blobs.key_attribute.trim().is_empty())
    {
        return Err(FixtureFarmError::InvalidConfig(
            "blobs.entity_type and blobs.key_attribute are required when blobs.enabled".to_string(),
        ));
    }
    Ok(())
}
