use crate::errors::FixtureFarmError;
use crate::fixture_file::FixtureSet;
use crate::logging::append_run_log;
use crate::model::{find_associated, RecordSnapshot};
use crate::naming::NameResolver;
use crate::value_serializer::{is_implied_timestamp, ValueSerializer};
use serde_json::json;
use serde_yaml::{Mapping, Value as Yaml};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Remove the entries of fixtures whose records were destroyed. Returns the
/// number of entries removed.
pub fn delete_fixtures(resolver: &mut NameResolver<'_>) -> Result<usize, FixtureFarmError> {
    let store = resolver.store();
    let mut by_path: BTreeMap<PathBuf, Vec<String>> = BTreeMap::new();
    for deleted in resolver.deleted().to_vec() {
        let path = resolver
            .index()
            .path_for(store, &deleted.record.entity_type);
        by_path.entry(path).or_default().push(deleted.name);
    }

    let fs = resolver.index().file_system();
    let mut removed = 0;
    for (path, names) in by_path {
        let mut set = FixtureSet::load(fs, &path)?;
        let before = set.len();
        for name in &names {
            set.remove(name);
        }
        if set.len() == before {
            continue;
        }
        removed += before - set.len();
        set.save(fs, &path)?;
        append_run_log(
            "info",
            "fixtures.delete",
            json!({"path": path.display().to_string(), "names": names, "file_removed": set.is_empty()}),
        );
    }
    Ok(removed)
}

/// Merge every fixture named in this pass into its type's file. Same-named
/// entries are replaced.
pub fn write_fixtures(
    resolver: &mut NameResolver<'_>,
    serializer: &ValueSerializer,
) -> Result<usize, FixtureFarmError> {
    let store = resolver.store();
    let mut by_path: BTreeMap<PathBuf, Vec<(String, Mapping)>> = BTreeMap::new();
    for (name, snapshot) in resolver.named_fixtures().to_vec() {
        let attributes = fixture_attributes(resolver, serializer, &snapshot)?;
        let path = resolver
            .index()
            .path_for(store, &snapshot.record.entity_type);
        by_path.entry(path).or_default().push((name, attributes));
    }

    let fs = resolver.index().file_system();
    let mut written = 0;
    for (path, fixtures) in by_path {
        let mut set = FixtureSet::load(fs, &path)?;
        let names = fixtures
            .iter()
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();
        for (name, attributes) in fixtures {
            set.insert(&name, attributes);
            written += 1;
        }
        set.save(fs, &path)?;
        append_run_log(
            "info",
            "fixtures.write",
            json!({"path": path.display().to_string(), "names": names}),
        );
    }
    Ok(written)
}

/// Attribute mapping for one fixture entry. Foreign keys become the related
/// fixture's name under the relation name; unresolvable relations and
/// virtual attributes are left out.
pub fn fixture_attributes(
    resolver: &mut NameResolver<'_>,
    serializer: &ValueSerializer,
    snapshot: &RecordSnapshot,
) -> Result<Mapping, FixtureFarmError> {
    let store = resolver.store();
    let relations = store.belongs_to(&snapshot.record.entity_type);
    let mut out = Mapping::new();
    for attribute in &snapshot.attributes {
        if attribute.name == "id" || attribute.value.is_null() {
            continue;
        }
        if let Some(relation) = relations
            .iter()
            .find(|relation| relation.foreign_key == attribute.name)
        {
            let Some(target) = find_associated(store, snapshot, relation)? else {
                continue;
            };
            if let Some(name) = resolver.name_of(&target.record)? {
                out.insert(Yaml::String(relation.name.clone()), Yaml::String(name));
            }
            continue;
        }
        if attribute.column_type.is_none() {
            continue;
        }
        let Some(serialized) = serializer.serialize(&attribute.value) else {
            continue;
        };
        if is_implied_timestamp(&attribute.name, &serialized) {
            continue;
        }
        out.insert(Yaml::String(attribute.name.clone()), serialized);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture_file::FixtureIndex;
    use crate::fixture_identity::identify;
    use crate::model::{Attribute, BelongsTo, ColumnType, DataStore, RecordRef, Value};
    use crate::runtime::FakeFileSystem;
    use chrono::{Duration, NaiveDate, NaiveDateTime};
    use std::path::Path;

    struct PostStore {
        records: Vec<RecordSnapshot>,
    }

    impl DataStore for PostStore {
        fn type_hierarchy(&self, entity_type: &str) -> Vec<String> {
            vec![entity_type.to_string()]
        }

        fn belongs_to(&self, entity_type: &str) -> Vec<BelongsTo> {
            match entity_type {
                "Post" => vec![BelongsTo::to("user", "User")],
                _ => vec![],
            }
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

    fn attr(name: &str, column_type: Option<ColumnType>, value: Value) -> Attribute {
        Attribute {
            name: name.to_string(),
            column_type,
            value,
        }
    }

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .and_then(|d| d.and_hms_opt(12, 30, 0))
            .expect("valid time")
    }

    fn store() -> PostStore {
        let user = RecordSnapshot {
            record: RecordRef::new("User", 1),
            attributes: vec![
                attr("name", Some(ColumnType::String), Value::Text("Test User".to_string())),
                attr("nickname", Some(ColumnType::String), Value::Null),
                attr("created_at", Some(ColumnType::DateTime), Value::Timestamp(noon())),
                attr("updated_at", Some(ColumnType::DateTime), Value::Timestamp(noon() - Duration::days(1))),
                attr("display_label", None, Value::Text("virtual".to_string())),
            ],
        };
        let post = RecordSnapshot {
            record: RecordRef::new("Post", 1),
            attributes: vec![
                attr("title", Some(ColumnType::String), Value::Text("Test Post".to_string())),
                attr("user_id", Some(ColumnType::Integer), Value::Integer(1)),
            ],
        };
        let orphan = RecordSnapshot {
            record: RecordRef::new("Post", 2),
            attributes: vec![
                attr("title", Some(ColumnType::String), Value::Text("Orphan".to_string())),
                attr("user_id", Some(ColumnType::Integer), Value::Integer(404)),
            ],
        };
        PostStore {
            records: vec![user, post, orphan],
        }
    }

    #[test]
    fn writes_relation_names_and_serialized_scalars() {
        let store = store();
        let fs = FakeFileSystem::default();
        let mut resolver = NameResolver::new(&store, FixtureIndex::new(&fs, "/app/test/fixtures"), Some("test".to_string()));
        for record in &store.records {
            resolver.ensure_name(record).expect("name");
        }
        let serializer = ValueSerializer::new(noon(), noon());
        assert_eq!(write_fixtures(&mut resolver, &serializer).expect("write"), 3);

        let users = FixtureSet::parse(&fs.file("/app/test/fixtures/users.yml").expect("users.yml"));
        let user = users.get("test_user_1").expect("user entry");
        let keys = user.keys().filter_map(Yaml::as_str).collect::<Vec<_>>();
        assert_eq!(keys, vec!["name", "updated_at"]);
        assert_eq!(
            user.get("updated_at").and_then(Yaml::as_str),
            Some("<%= Time.zone.now - 1.day %>")
        );
        let posts = FixtureSet::parse(&fs.file("/app/test/fixtures/posts.yml").expect("posts.yml"));
        let post = posts.get("test_user_1_post_1").expect("post entry");
        assert_eq!(post.get("user").and_then(Yaml::as_str), Some("test_user_1"));
        assert!(post.get("user_id").is_none());
        let orphan = posts.get("test_post_1").expect("orphan entry");
        assert!(orphan.get("user").is_none());
    }

    #[test]
    fn deleting_last_entry_removes_the_file() {
        let store = store();
        let path = Path::new("/app/test/fixtures/users.yml");
        let fs = FakeFileSystem::with_file(path, "existing_user:\n  name: A\n\nother_user:\n  name: B\n");
        let mut resolver = NameResolver::new(&store, FixtureIndex::new(&fs, "/app/test/fixtures"), None);

        resolver.mark_deleted("existing_user".to_string(), RecordRef::new("User", identify("existing_user")));
        assert_eq!(delete_fixtures(&mut resolver).expect("delete"), 1);
        assert_eq!(fs.file(path).as_deref(), Some("other_user:\n  name: B\n"));

        resolver.mark_deleted("other_user".to_string(), RecordRef::new("User", identify("other_user")));
        assert_eq!(delete_fixtures(&mut resolver).expect("delete"), 1);
        assert!(fs.file(path).is_none());
    }
}
