//! Fixture names for records observed during a recording pass.
//!
//! A name is `[prefix | parent name] <local type name>_<n>`. The parent is the
//! first record reachable through a belongs-to relation that can be named,
//! preferring types not configured as low priority. Names are assigned once
//! and reused for the rest of the pass.

use crate::errors::FixtureFarmError;
use crate::fixture_file::FixtureIndex;
use crate::inflect::local_name;
use crate::logging::append_run_log;
use crate::model::{find_associated, DataStore, RecordRef, RecordSnapshot};
use serde_json::json;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

/// An existing fixture whose record was destroyed during the pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedFixture {
    pub name: String,
    pub record: RecordRef,
}

pub struct NameResolver<'a> {
    store: &'a dyn DataStore,
    index: FixtureIndex<'a>,
    prefix: Option<String>,
    low_priority_types: Vec<String>,
    names: HashMap<RecordRef, String>,
    taken: HashSet<String>,
    in_progress: HashSet<RecordRef>,
    named: Vec<(String, RecordSnapshot)>,
    written: HashSet<RecordRef>,
    deleted: Vec<DeletedFixture>,
}

impl<'a> NameResolver<'a> {
    pub fn new(store: &'a dyn DataStore, index: FixtureIndex<'a>, prefix: Option<String>) -> Self {
        Self {
            store,
            index,
            prefix: prefix.filter(|prefix| !prefix.is_empty()),
            low_priority_types: Vec::new(),
            names: HashMap::new(),
            taken: HashSet::new(),
            in_progress: HashSet::new(),
            named: Vec::new(),
            written: HashSet::new(),
            deleted: Vec::new(),
        }
    }

    pub fn with_low_priority_types(mut self, types: Vec<String>) -> Self {
        self.low_priority_types = types;
        self
    }

    /// Reuse a name assigned by an earlier pass of the same session.
    pub fn seed(&mut self, record: RecordRef, name: String) {
        self.taken.insert(name.clone());
        self.names.insert(record, name);
    }

    pub fn mark_deleted(&mut self, name: String, record: RecordRef) {
        if !self.deleted.iter().any(|deleted| deleted.name == name && deleted.record == record) {
            self.deleted.push(DeletedFixture { name, record });
        }
    }

    pub fn deleted(&self) -> &[DeletedFixture] {
        &self.deleted
    }

    pub fn index(&mut self) -> &mut FixtureIndex<'a> {
        &mut self.index
    }

    pub fn store(&self) -> &'a dyn DataStore {
        self.store
    }

    /// Fixtures to write for this pass, in naming order.
    pub fn named_fixtures(&self) -> &[(String, RecordSnapshot)] {
        &self.named
    }

    pub fn named_fixtures_mut(&mut self) -> &mut [(String, RecordSnapshot)] {
        &mut self.named
    }

    /// Every name assigned or seeded so far, keyed by record.
    pub fn assigned_names(&self) -> &HashMap<RecordRef, String> {
        &self.names
    }

    /// Name already known for `record`, from this session or its fixture file.
    pub fn name_of(&mut self, record: &RecordRef) -> Result<Option<String>, FixtureFarmError> {
        if let Some(name) = self.names.get(record) {
            return Ok(Some(name.clone()));
        }
        self.index
            .existing_name(self.store, &record.entity_type, record.key)
    }

    /// Name `snapshot`, naming its parents first. `None` only when the record
    /// is already being named further up the current walk.
    pub fn ensure_name(
        &mut self,
        snapshot: &RecordSnapshot,
    ) -> Result<Option<String>, FixtureFarmError> {
        let record = &snapshot.record;
        if let Some(name) = self.names.get(record).cloned() {
            if self.written.insert(record.clone()) {
                self.named.push((name.clone(), snapshot.clone()));
            }
            return Ok(Some(name));
        }
        if let Some(name) = self
            .index
            .existing_name(self.store, &record.entity_type, record.key)?
        {
            return Ok(Some(name));
        }
        if !self.in_progress.insert(record.clone()) {
            return Ok(None);
        }

        let parent = self.parent_name(snapshot);
        self.in_progress.remove(record);
        let parent = parent?;

        let mut segments = Vec::with_capacity(3);
        match (&self.prefix, &parent) {
            (Some(prefix), Some(parent)) if !has_prefix(parent, prefix) => {
                segments.push(prefix.clone());
                segments.push(parent.clone());
            }
            (_, Some(parent)) => segments.push(parent.clone()),
            (Some(prefix), None) => segments.push(prefix.clone()),
            (None, None) => {}
        }
        segments.push(format!("{}_1", local_name(&record.entity_type)));
        let mut name = segments.join("_");

        while self.is_taken(&record.entity_type, &name)? {
            name = bump_suffix(&name);
        }

        append_run_log(
            "debug",
            "naming.assigned",
            json!({"record": record.to_string(), "name": name, "parent": parent}),
        );
        self.taken.insert(name.clone());
        self.names.insert(record.clone(), name.clone());
        self.written.insert(record.clone());
        self.named.push((name.clone(), snapshot.clone()));
        Ok(Some(name))
    }

    /// Replace `from` with `to` everywhere it was assigned in this session.
    /// Skipped when `to` is already used in the session or in the fixture
    /// file the renamed records belong to.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<bool, FixtureFarmError> {
        if from == to {
            return Ok(false);
        }
        let types = self
            .names
            .iter()
            .filter(|(_, name)| name.as_str() == from)
            .map(|(record, _)| record.entity_type.clone())
            .collect::<BTreeSet<_>>();
        for entity_type in &types {
            if self.is_taken(entity_type, to)? {
                return Ok(false);
            }
        }
        let mut renamed = false;
        for name in self.names.values_mut() {
            if name == from {
                *name = to.to_string();
                renamed = true;
            }
        }
        for (name, _) in &mut self.named {
            if name == from {
                *name = to.to_string();
            }
        }
        if renamed {
            self.taken.remove(from);
            self.taken.insert(to.to_string());
        }
        Ok(renamed)
    }

    fn parent_name(&mut self, snapshot: &RecordSnapshot) -> Result<Option<String>, FixtureFarmError> {
        let mut fallback = None;
        for relation in self.store.belongs_to(&snapshot.record.entity_type) {
            let Some(target) = find_associated(self.store, snapshot, &relation)? else {
                continue;
            };
            if self.is_deleted(&target.record) {
                continue;
            }
            let Some(name) = self.ensure_name(&target)? else {
                continue;
            };
            if !self.is_low_priority(&target.record.entity_type) {
                return Ok(Some(name));
            }
            fallback = Some(name);
        }
        Ok(fallback)
    }

    fn is_low_priority(&self, entity_type: &str) -> bool {
        self.store
            .type_hierarchy(entity_type)
            .iter()
            .any(|ancestor| self.low_priority_types.contains(ancestor))
    }

    fn is_deleted(&self, record: &RecordRef) -> bool {
        self.deleted.iter().any(|deleted| &deleted.record == record)
    }

    fn is_taken(&mut self, entity_type: &str, name: &str) -> Result<bool, FixtureFarmError> {
        if self.taken.contains(name) {
            return Ok(true);
        }
        let path = self.index.path_for(self.store, entity_type);
        if !self.index.existing(self.store, entity_type)?.contains(name) {
            return Ok(false);
        }
        Ok(!self.deleted_in(&path, name))
    }

    fn deleted_in(&self, path: &Path, name: &str) -> bool {
        self.deleted.iter().any(|deleted| {
            deleted.name == name && self.index.path_for(self.store, &deleted.record.entity_type) == path
        })
    }
}

fn has_prefix(parent: &str, prefix: &str) -> bool {
    parent == prefix
        || parent
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('_'))
}

/// `user_1` -> `user_2`; names without a numeric tail gain `_2`.
fn bump_suffix(name: &str) -> String {
    if let Some((stem, tail)) = name.rsplit_once('_') {
        if let Ok(n) = tail.parse::<u64>() {
            return format!("{stem}_{}", n + 1);
        }
    }
    format!("{name}_2")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture_identity::identify;
    use crate::model::{Attribute, BelongsTo, ColumnType, Value};
    use crate::runtime::FakeFileSystem;

    #[derive(Default)]
    struct GraphStore {
        records: Vec<RecordSnapshot>,
        relations: HashMap<String, Vec<BelongsTo>>,
    }

    impl GraphStore {
        fn add(&mut self, entity_type: &str, key: i64, fields: &[(&str, Value)]) -> RecordSnapshot {
            let snapshot = RecordSnapshot {
                record: RecordRef::new(entity_type, key),
                attributes: fields
                    .iter()
                    .map(|(name, value)| Attribute {
                        name: name.to_string(),
                        column_type: Some(ColumnType::Integer),
                        value: value.clone(),
                    })
                    .collect(),
            };
            self.records.push(snapshot.clone());
            snapshot
        }

        fn relate(&mut self, entity_type: &str, relation: BelongsTo) {
            self.relations
                .entry(entity_type.to_string())
                .or_default()
                .push(relation);
        }
    }

    impl DataStore for GraphStore {
        fn type_hierarchy(&self, entity_type: &str) -> Vec<String> {
            vec![entity_type.to_string()]
        }

        fn belongs_to(&self, entity_type: &str) -> Vec<BelongsTo> {
            self.relations.get(entity_type).cloned().unwrap_or_default()
        }

        fn find(&self, entity_type: &str, key: i64, _unscoped: bool) -> Result<RecordSnapshot, FixtureFarmError> {
            self.records
                .iter()
                .find(|snapshot| snapshot.record == RecordRef::new(entity_type, key))
                .cloned()
                .ok_or_else(|| FixtureFarmError::not_found(entity_type, key))
        }

        fn update_attribute(&self, _record: &RecordRef, _name: &str, _value: Value) -> Result<(), FixtureFarmError> {
            Ok(())
        }
    }

    fn resolver<'a>(store: &'a GraphStore, fs: &'a FakeFileSystem, prefix: Option<&str>) -> NameResolver<'a> {
        NameResolver::new(
            store,
            FixtureIndex::new(fs, "/app/test/fixtures"),
            prefix.map(str::to_string),
        )
    }

    #[test]
    fn child_names_extend_parent_names_without_repeating_prefix() {
        let mut store = GraphStore::default();
        store.relate("Post", BelongsTo::to("user", "User"));
        let user = store.add("User", 1, &[]);
        let post = store.add("Post", 1, &[("user_id", Value::Integer(1))]);
        let fs = FakeFileSystem::default();
        let mut names = resolver(&store, &fs, Some("test"));

        assert_eq!(names.ensure_name(&post).expect("name").as_deref(), Some("test_user_1_post_1"));
        assert_eq!(names.ensure_name(&user).expect("name").as_deref(), Some("test_user_1"));
        assert_eq!(names.ensure_name(&post).expect("name").as_deref(), Some("test_user_1_post_1"));
        assert_eq!(names.named_fixtures().len(), 2);
    }

    #[test]
    fn unrelated_records_count_up_and_skip_existing_names() {
        let mut store = GraphStore::default();
        let first = store.add("User", 1, &[]);
        let second = store.add("User", 2, &[]);
        let fs = FakeFileSystem::with_file("/app/test/fixtures/users.yml", "user_1:\n  name: Existing\n");
        let mut names = resolver(&store, &fs, None);

        assert_eq!(names.ensure_name(&first).expect("name").as_deref(), Some("user_2"));
        assert_eq!(names.ensure_name(&second).expect("name").as_deref(), Some("user_3"));
    }

    #[test]
    fn names_of_deleted_fixtures_are_reusable() {
        let mut store = GraphStore::default();
        let user = store.add("User", 5, &[]);
        let fs = FakeFileSystem::with_file("/app/test/fixtures/users.yml", "user_1:\n  name: Gone\n");
        let mut names = resolver(&store, &fs, None);
        names.mark_deleted("user_1".to_string(), RecordRef::new("User", identify("user_1")));

        assert_eq!(names.ensure_name(&user).expect("name").as_deref(), Some("user_1"));
    }

    #[test]
    fn existing_fixture_names_are_never_replaced() {
        let mut store = GraphStore::default();
        let key = identify("existing_user");
        let user = store.add("User", key, &[]);
        let fs = FakeFileSystem::with_file("/app/test/fixtures/users.yml", "existing_user:\n  name: A\n");
        let mut names = resolver(&store, &fs, Some("p"));

        assert_eq!(names.ensure_name(&user).expect("name").as_deref(), Some("existing_user"));
        assert!(names.named_fixtures().is_empty());
    }

    #[test]
    fn low_priority_parent_is_only_a_fallback() {
        let mut store = GraphStore::default();
        store.relate("TenantPost", BelongsTo::to("tenant_model", "TenantModel"));
        store.relate("TenantPost", BelongsTo::to("user", "User"));
        store.add("TenantModel", 1, &[]);
        store.add("User", 1, &[]);
        let both = store.add(
            "TenantPost",
            1,
            &[("tenant_model_id", Value::Integer(1)), ("user_id", Value::Integer(1))],
        );
        let tenant_only = store.add("TenantPost", 2, &[("tenant_model_id", Value::Integer(1))]);
        let fs = FakeFileSystem::default();
        let mut names = resolver(&store, &fs, Some("priority_test"))
            .with_low_priority_types(vec!["TenantModel".to_string()]);

        assert_eq!(
            names.ensure_name(&both).expect("name").as_deref(),
            Some("priority_test_user_1_tenant_post_1")
        );
        assert_eq!(
            names.ensure_name(&tenant_only).expect("name").as_deref(),
            Some("priority_test_tenant_model_1_tenant_post_1")
        );
    }

    #[test]
    fn cyclic_relations_terminate() {
        let mut store = GraphStore::default();
        store.relate("Node", BelongsTo::to("peer", "Node"));
        let a = store.add("Node", 1, &[("peer_id", Value::Integer(2))]);
        store.add("Node", 2, &[("peer_id", Value::Integer(1))]);
        let fs = FakeFileSystem::default();
        let mut names = resolver(&store, &fs, None);

        assert_eq!(names.ensure_name(&a).expect("name").as_deref(), Some("node_1_node_1"));
        let b = store.find("Node", 2, true).expect("find");
        assert_eq!(names.ensure_name(&b).expect("name").as_deref(), Some("node_1"));
    }

    #[test]
    fn rename_follows_into_lookups() {
        let mut store = GraphStore::default();
        let user = store.add("User", 1, &[]);
        let fs = FakeFileSystem::default();
        let mut names = resolver(&store, &fs, None);
        names.ensure_name(&user).expect("name");

        assert!(names.rename("user_1", "new_user").expect("rename"));
        assert_eq!(names.name_of(&user.record).expect("lookup").as_deref(), Some("new_user"));
        assert_eq!(names.named_fixtures()[0].0, "new_user");
    }

    #[test]
    fn rename_onto_an_existing_fixture_is_skipped() {
        let mut store = GraphStore::default();
        let user = store.add("User", 1, &[]);
        let fs = FakeFileSystem::with_file("/app/test/fixtures/users.yml", "alice:\n  name: Alice\n");
        let mut names = resolver(&store, &fs, None);
        names.ensure_name(&user).expect("name");

        assert!(!names.rename("user_1", "alice").expect("rename"));
        assert_eq!(names.name_of(&user.record).expect("lookup").as_deref(), Some("user_1"));
        assert!(!names.rename("user_1", "user_1").expect("rename"));
    }

    #[test]
    fn bump_suffix_increments_numeric_tail() {
        assert_eq!(bump_suffix("user_1"), "user_2");
        assert_eq!(bump_suffix("test_user_1_post_9"), "test_user_1_post_10");
        assert_eq!(bump_suffix("user"), "user_2");
    }
}
