//! On-disk fixture files: one YAML mapping of fixture name to attributes per
//! entity type.

use crate::errors::FixtureFarmError;
use crate::fixture_identity::identify;
use crate::inflect::fixture_file_stem;
use crate::logging::append_run_log;
use crate::model::{DataStore, RecordKey};
use crate::runtime::FileSystem;
use serde_json::json;
use serde_yaml::{Mapping, Value as Yaml};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FixtureSet {
    entries: Mapping,
}

impl FixtureSet {
    /// Anything that is not a YAML mapping reads as an empty set.
    pub fn parse(text: &str) -> Self {
        match serde_yaml::from_str::<Yaml>(text) {
            Ok(Yaml::Mapping(entries)) => Self { entries },
            _ => Self::default(),
        }
    }

    pub fn load(fs: &dyn FileSystem, path: &Path) -> Result<Self, FixtureFarmError> {
        if !fs.exists(path) {
            return Ok(Self::default());
        }
        let text = fs.read_to_string(path)?;
        let set = Self::parse(&text);
        if set.is_empty() && !text.trim().is_empty() {
            append_run_log(
                "warn",
                "fixtures.unreadable",
                json!({"path": path.display().to_string()}),
            );
        }
        Ok(set)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Mapping> {
        self.entries.get(name).and_then(Yaml::as_mapping)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().filter_map(Yaml::as_str)
    }

    /// Entries in file order; entries whose body is not a mapping read as empty.
    pub fn entries(&self) -> Vec<(String, Mapping)> {
        self.entries
            .iter()
            .filter_map(|(name, body)| {
                let name = name.as_str()?.to_string();
                let body = body.as_mapping().cloned().unwrap_or_default();
                Some((name, body))
            })
            .collect()
    }

    /// Name of the entry that loads as the record with primary key `key`.
    pub fn name_for_key(&self, key: RecordKey) -> Option<String> {
        self.entries.iter().find_map(|(name, body)| {
            let name = name.as_str()?;
            (entry_key(name, body) == key).then(|| name.to_string())
        })
    }

    pub fn insert(&mut self, name: &str, attributes: Mapping) {
        self.entries
            .insert(Yaml::String(name.to_string()), Yaml::Mapping(attributes));
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    /// YAML text with a blank line between top-level entries.
    pub fn render(&self) -> Result<String, FixtureFarmError> {
        let yaml = serde_yaml::to_string(&self.entries)
            .map_err(|e| FixtureFarmError::FixtureParse(e.to_string()))?;
        let yaml = yaml.strip_prefix("---\n").unwrap_or(&yaml);
        let mut out = String::with_capacity(yaml.len() + self.entries.len());
        for (index, line) in yaml.lines().enumerate() {
            let top_level = line.chars().next().is_some_and(|ch| !ch.is_whitespace());
            if index > 0 && top_level {
                out.push('\n');
            }
            out.push_str(line);
            out.push('\n');
        }
        Ok(out)
    }

    /// Rewrite `path`, or delete it once the set is empty.
    pub fn save(&self, fs: &dyn FileSystem, path: &Path) -> Result<(), FixtureFarmError> {
        if self.is_empty() {
            if fs.exists(path) {
                fs.remove_file(path)?;
            }
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs.create_dir_all(parent)?;
        }
        fs.write_string(path, &self.render()?)
    }
}

/// Primary key an entry loads with: an explicit integer `id`, else the hashed
/// label.
pub fn entry_key(name: &str, body: &Yaml) -> RecordKey {
    body.get("id")
        .and_then(Yaml::as_i64)
        .unwrap_or_else(|| identify(name))
}

/// Locates fixture files and caches their contents as first read during a
/// recording pass.
pub struct FixtureIndex<'a> {
    fs: &'a dyn FileSystem,
    fixtures_dir: PathBuf,
    existing: HashMap<PathBuf, FixtureSet>,
}

impl<'a> FixtureIndex<'a> {
    pub fn new(fs: &'a dyn FileSystem, fixtures_dir: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            fixtures_dir: fixtures_dir.into(),
            existing: HashMap::new(),
        }
    }

    pub fn file_system(&self) -> &'a dyn FileSystem {
        self.fs
    }

    pub fn canonical_path(&self, entity_type: &str) -> PathBuf {
        self.fixtures_dir
            .join(format!("{}.yml", fixture_file_stem(entity_type)))
    }

    /// The most specific type in the hierarchy that already has a file wins;
    /// otherwise the most-derived type's conventional path.
    pub fn path_for(&self, store: &dyn DataStore, entity_type: &str) -> PathBuf {
        store
            .type_hierarchy(entity_type)
            .iter()
            .map(|ancestor| self.canonical_path(ancestor))
            .find(|path| self.fs.exists(path))
            .unwrap_or_else(|| self.canonical_path(entity_type))
    }

    /// Contents of the type's fixture file as it was when first consulted.
    pub fn existing(
        &mut self,
        store: &dyn DataStore,
        entity_type: &str,
    ) -> Result<&FixtureSet, FixtureFarmError> {
        let path = self.path_for(store, entity_type);
        if !self.existing.contains_key(&path) {
            let set = FixtureSet::load(self.fs, &path)?;
            self.existing.insert(path.clone(), set);
        }
        self.existing
            .get(&path)
            .ok_or_else(|| FixtureFarmError::FixtureParse(path.display().to_string()))
    }

    pub fn existing_name(
        &mut self,
        store: &dyn DataStore,
        entity_type: &str,
        key: RecordKey,
    ) -> Result<Option<String>, FixtureFarmError> {
        Ok(self.existing(store, entity_type)?.name_for_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FakeFileSystem;

    #[test]
    fn parse_tolerates_empty_and_non_mapping_text() {
        assert!(FixtureSet::parse("").is_empty());
        assert!(FixtureSet::parse("- a\n- b\n").is_empty());
        assert!(FixtureSet::parse("{not yaml").is_empty());
        let set = FixtureSet::parse("user_1:\n  name: A\n");
        assert_eq!(set.names().collect::<Vec<_>>(), vec!["user_1"]);
    }

    #[test]
    fn render_separates_entries_with_blank_lines() {
        let mut set = FixtureSet::default();
        let mut first = Mapping::new();
        first.insert("name".into(), "A".into());
        first.insert("email".into(), "a@example.com".into());
        set.insert("user_1", first);
        let mut second = Mapping::new();
        second.insert("name".into(), "B".into());
        set.insert("user_2", second);

        let text = set.render().expect("render");
        assert_eq!(
            text,
            "user_1:\n  name: A\n  email: a@example.com\n\nuser_2:\n  name: B\n"
        );
        assert_eq!(FixtureSet::parse(&text), set);
    }

    #[test]
    fn name_for_key_uses_identity_or_explicit_id() {
        let set = FixtureSet::parse("existing_user:\n  name: A\npinned:\n  id: 7\n");
        assert_eq!(
            set.name_for_key(identify("existing_user")).as_deref(),
            Some("existing_user")
        );
        assert_eq!(set.name_for_key(7).as_deref(), Some("pinned"));
        assert_eq!(set.name_for_key(identify("pinned")), None);
    }

    #[test]
    fn save_deletes_file_when_last_entry_is_removed() {
        let path = Path::new("/app/test/fixtures/users.yml");
        let fs = FakeFileSystem::with_file(path, "user_1:\n  name: A\n");
        let mut set = FixtureSet::load(&fs, path).expect("load");
        assert!(set.remove("user_1"));
        assert!(!set.remove("user_1"));
        set.save(&fs, path).expect("save");
        assert!(!fs.exists(path));
    }

    #[test]
    fn save_creates_parent_directories() {
        let fs = FakeFileSystem::default();
        let path = Path::new("/app/test/fixtures/active_storage/blobs.yml");
        let mut set = FixtureSet::default();
        set.insert("blob_1", Mapping::new());
        set.save(&fs, path).expect("save");
        assert_eq!(
            fs.created_dirs(),
            vec![PathBuf::from("/app/test/fixtures/active_storage")]
        );
        assert_eq!(fs.file(path).as_deref(), Some("blob_1: {}\n"));
    }
}
