use crate::config::BlobsConfig;
use crate::errors::FixtureFarmError;
use crate::logging::append_run_log;
use crate::model::{DataStore, RecordSnapshot, Value};
use crate::runtime::FileSystem;
use serde_json::json;
use std::path::{Path, PathBuf};

/// `<storage>/ab/cd/abcdef` for key `abcdef`. Short keys use what they have.
pub fn storage_path(storage_dir: &Path, key: &str) -> PathBuf {
    let first = key.get(0..2).unwrap_or(key);
    let second = key.get(2..4).unwrap_or_else(|| key.get(2..).unwrap_or(""));
    storage_dir.join(first).join(second).join(key)
}

/// Give each named blob record a storage key equal to its fixture name and
/// move its bytes to match. Returns the new file paths.
pub fn rename_blobs(
    store: &dyn DataStore,
    fs: &dyn FileSystem,
    config: &BlobsConfig,
    storage_dir: &Path,
    named: &mut [(String, RecordSnapshot)],
) -> Result<Vec<PathBuf>, FixtureFarmError> {
    if !config.enabled {
        return Ok(Vec::new());
    }
    let mut moved = Vec::new();
    for (name, snapshot) in named.iter_mut() {
        let is_blob = store
            .type_hierarchy(&snapshot.record.entity_type)
            .iter()
            .any(|ancestor| *ancestor == config.entity_type);
        if !is_blob {
            continue;
        }
        let Some(old_key) = snapshot
            .get(&config.key_attribute)
            .and_then(Value::as_text)
            .map(str::to_string)
        else {
            continue;
        };
        if old_key == *name {
            continue;
        }

        store.update_attribute(&snapshot.record, &config.key_attribute, Value::Text(name.clone()))?;
        snapshot.set(&config.key_attribute, Value::Text(name.clone()));

        let from = storage_path(storage_dir, &old_key);
        let to = storage_path(storage_dir, name);
        if let Some(parent) = to.parent() {
            fs.create_dir_all(parent)?;
        }
        if fs.exists(&from) {
            fs.rename(&from, &to)?;
        }
        append_run_log(
            "info",
            "blobs.renamed",
            json!({"record": snapshot.record.to_string(), "from": old_key, "to": name}),
        );
        moved.push(to);
    }
    Ok(moved)
}
