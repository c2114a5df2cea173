use super::{db_err, insert_row, parse_timestamp, to_sql, SqliteStore, INHERITANCE_COLUMN};
use crate::errors::FixtureFarmError;
use crate::fixture_file::{entry_key, FixtureIndex, FixtureSet};
use crate::fixture_identity::identify;
use crate::iso_duration::IsoDuration;
use crate::logging::append_run_log;
use crate::model::{ColumnType, RelationTarget, Value};
use crate::relative_time::{Evaluated, RelativeTime};
use crate::runtime::FileSystem;
use chrono::{NaiveDate, NaiveDateTime};
use serde_json::json;
use serde_yaml::{Mapping, Value as Yaml};
use std::path::Path;

/// Replace the store's contents with the fixture files under `fixtures_dir`.
/// Returns the number of rows inserted.
pub fn load_fixtures(store: &SqliteStore, fs: &dyn FileSystem, fixtures_dir: &Path) -> Result<usize, FixtureFarmError> {
    let index = FixtureIndex::new(fs, fixtures_dir);
    let now = store.clock().now();

    let mut rows = Vec::new();
    for model in store.registry().models() {
        let path = index.canonical_path(&model.name);
        let set = FixtureSet::load(fs, &path)?;
        for (name, body) in set.entries() {
            let entity_type = body
                .get(INHERITANCE_COLUMN)
                .and_then(Yaml::as_str)
                .filter(|stored| store.registry().get(stored).is_some())
                .unwrap_or(&model.name)
                .to_string();
            let key = entry_key(&name, &Yaml::Mapping(body.clone()));
            let columns = fixture_row(store, &entity_type, &name, &body, now)?;
            rows.push((entity_type, key, columns));
        }
    }

    let conn = store.conn();
    conn.execute_batch("BEGIN").map_err(db_err)?;
    let inserted = (|| {
        for table in store.registry().tables() {
            conn.execute(&format!("DELETE FROM \"{table}\""), [])
                .map_err(db_err)?;
        }
        for (entity_type, key, columns) in &rows {
            let table = &store.registry().model(entity_type)?.table;
            let mut names = vec!["id".to_string()];
            let mut values = vec![rusqlite::types::Value::Integer(*key)];
            for (name, column_type, value) in columns {
                names.push(name.clone());
                values.push(to_sql(value, *column_type));
            }
            insert_row(&conn, table, &names, values)?;
        }
        Ok::<usize, FixtureFarmError>(rows.len())
    })();
    match inserted {
        Ok(count) => {
            conn.execute_batch("COMMIT").map_err(db_err)?;
            append_run_log(
                "info",
                "sqlite_store.fixtures_loaded",
                json!({"dir": fixtures_dir.display().to_string(), "rows": count}),
            );
            Ok(count)
        }
        Err(err) => {
            conn.execute_batch("ROLLBACK").map_err(db_err)?;
            Err(err)
        }
    }
}

/// Column values for one entry. Relation labels become the hashed key of the
/// labelled fixture; missing timestamps default to `now`.
fn fixture_row(
    store: &SqliteStore,
    entity_type: &str,
    name: &str,
    body: &Mapping,
    now: NaiveDateTime,
) -> Result<Vec<(String, ColumnType, Value)>, FixtureFarmError> {
    let registry = store.registry();
    let columns = registry.columns(entity_type);
    let relations = registry.relations(entity_type);
    let column_type_of = |attribute: &str| {
        columns
            .iter()
            .find(|column| column.name == attribute)
            .map(|column| column.column_type)
    };

    let mut row: Vec<(String, ColumnType, Value)> = Vec::new();
    let mut put = |attribute: &str, column_type: ColumnType, value: Value| {
        row.retain(|(existing, _, _)| existing != attribute);
        row.push((attribute.to_string(), column_type, value));
    };

    for (attribute, yaml) in body {
        let Some(attribute) = attribute.as_str() else {
            continue;
        };
        if attribute == "id" {
            continue;
        }
        if let Some(relation) = relations.iter().find(|relation| relation.name == attribute) {
            let Some(label) = yaml.as_str() else {
                put(&relation.foreign_key, ColumnType::Integer, Value::Null);
                continue;
            };
            match &relation.target {
                RelationTarget::Type(_) => {
                    put(&relation.foreign_key, ColumnType::Integer, Value::Integer(identify(label)));
                }
                RelationTarget::Polymorphic { type_attribute } => {
                    let (label, target) = split_polymorphic_label(label);
                    put(&relation.foreign_key, ColumnType::Integer, Value::Integer(identify(label)));
                    if let Some(target) = target {
                        put(type_attribute, ColumnType::String, Value::Text(target.to_string()));
                    }
                }
            }
            continue;
        }
        let Some(column_type) = column_type_of(attribute) else {
            return Err(FixtureFarmError::FixtureParse(format!(
                "fixture {name}: {entity_type} has no attribute {attribute}"
            )));
        };
        put(attribute, column_type, yaml_value(yaml, column_type, now)?);
    }

    for stamp in ["created_at", "updated_at"] {
        if column_type_of(stamp).is_some() && !body.contains_key(stamp) {
            put(stamp, ColumnType::DateTime, Value::Timestamp(now));
        }
    }
    let is_subtype = registry
        .get(entity_type)
        .is_some_and(|model| model.parent.is_some());
    if is_subtype && registry.uses_inheritance(entity_type) && !body.contains_key(INHERITANCE_COLUMN) {
        put(INHERITANCE_COLUMN, ColumnType::String, Value::Text(entity_type.to_string()));
    }
    Ok(row)
}

/// `"label (Type)"` names the target type inline.
fn split_polymorphic_label(label: &str) -> (&str, Option<&str>) {
    match label.trim().strip_suffix(')').and_then(|rest| rest.rsplit_once(" (")) {
        Some((label, target)) => (label.trim(), Some(target.trim())),
        None => (label.trim(), None),
    }
}

fn yaml_value(yaml: &Yaml, column_type: ColumnType, now: NaiveDateTime) -> Result<Value, FixtureFarmError> {
    if let Some(text) = yaml.as_str() {
        if let Some(relative) = RelativeTime::parse(text) {
            return Ok(match relative.evaluate(now) {
                Evaluated::Timestamp(at) if column_type == ColumnType::Date => Value::Date(at.date()),
                Evaluated::Timestamp(at) => Value::Timestamp(at),
                Evaluated::Date(day) => Value::Date(day),
            });
        }
    }

    let value = match (yaml, column_type) {
        (Yaml::Null, _) => Value::Null,
        (Yaml::Bool(flag), _) => Value::Bool(*flag),
        (Yaml::Number(number), ColumnType::Decimal) => Value::Decimal(number.to_string()),
        (Yaml::Number(number), ColumnType::Float) => Value::Float(number.as_f64().unwrap_or_default()),
        (Yaml::Number(number), _) => match number.as_i64() {
            Some(integer) => Value::Integer(integer),
            None => Value::Float(number.as_f64().unwrap_or_default()),
        },
        (Yaml::String(text), ColumnType::DateTime) => {
            parse_timestamp(text).map_or_else(|| Value::Text(text.clone()), Value::Timestamp)
        }
        (Yaml::String(text), ColumnType::Date) => NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .map_or_else(|_| Value::Text(text.clone()), Value::Date),
        (Yaml::String(text), ColumnType::Duration) => {
            IsoDuration::parse(text).map_or_else(|| Value::Text(text.clone()), Value::Duration)
        }
        (Yaml::String(text), ColumnType::Json) => match serde_json::from_str(text) {
            Ok(json) => Value::Map(json),
            Err(_) => Value::Text(text.clone()),
        },
        (Yaml::String(text), ColumnType::Decimal) => Value::Decimal(text.clone()),
        (Yaml::String(text), _) => Value::Text(text.clone()),
        (other, _) => Value::Map(
            serde_json::to_value(other).map_err(|e| FixtureFarmError::FixtureParse(e.to_string()))?,
        ),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::{ModelDef, ModelRegistry};
    use crate::model::{BelongsTo, DataStore};
    use crate::runtime::{FakeClock, FakeFileSystem};
    use std::sync::Arc;

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .expect("valid time")
    }

    fn store() -> SqliteStore {
        let user = ModelDef::new("User", "users")
            .column("name", ColumnType::String)
            .column(INHERITANCE_COLUMN, ColumnType::String)
            .column("last_seen_at", ColumnType::DateTime)
            .timestamps();
        let admin = ModelDef::subtype_of("Admin", &user);
        let comment = ModelDef::new("Comment", "comments")
            .column("body", ColumnType::Text)
            .belongs_to(BelongsTo::to("author", "User"))
            .belongs_to(BelongsTo::polymorphic("subject"));
        let registry = ModelRegistry::new()
            .define(user)
            .and_then(|r| r.define(admin))
            .and_then(|r| r.define(comment))
            .expect("registry");
        SqliteStore::open_in_memory(registry, Arc::new(FakeClock::new(noon()))).expect("store")
    }

    #[test]
    fn loads_labels_relative_times_and_subtypes() {
        let fs = FakeFileSystem::with_file(
            "/app/fixtures/users.yml",
            "ann:\n  name: Ann\n  last_seen_at: <%= Time.zone.now - 2.days %>\n\nroot:\n  name: Root\n  type: Admin\n  id: 7\n",
        );
        fs.write_string(
            Path::new("/app/fixtures/comments.yml"),
            "hello:\n  body: Hi\n  author: ann\n  subject: root (Admin)\n",
        )
        .expect("write");
        let store = store();

        let loaded = load_fixtures(&store, &fs, Path::new("/app/fixtures")).expect("load");
        assert_eq!(loaded, 3);

        let ann = store.find("User", identify("ann"), false).expect("ann");
        assert_eq!(
            ann.get("last_seen_at"),
            Some(&Value::Timestamp(noon() - chrono::Duration::days(2)))
        );
        assert_eq!(ann.get("created_at"), Some(&Value::Timestamp(noon())));

        let root = store.find("User", 7, false).expect("root");
        assert_eq!(root.record.entity_type, "Admin");

        let hello = store.find("Comment", identify("hello"), false).expect("comment");
        assert_eq!(hello.get("author_id"), Some(&Value::Integer(identify("ann"))));
        assert_eq!(hello.get("subject_id"), Some(&Value::Integer(identify("root"))));
        assert_eq!(hello.get("subject_type"), Some(&Value::Text("Admin".to_string())));
    }

    #[test]
    fn unknown_attributes_are_rejected_and_nothing_changes() {
        let store = store();
        store.create("User", &[]).expect("create");
        let fs = FakeFileSystem::with_file("/app/fixtures/users.yml", "ann:\n  nickname: A\n");
        let err = load_fixtures(&store, &fs, Path::new("/app/fixtures")).expect_err("unknown");
        assert!(matches!(err, FixtureFarmError::FixtureParse(_)));
        assert_eq!(store.count("User").expect("count"), 1);
    }

    #[test]
    fn polymorphic_labels_split_on_trailing_type() {
        assert_eq!(split_polymorphic_label("root (Admin)"), ("root", Some("Admin")));
        assert_eq!(split_polymorphic_label("root"), ("root", None));
    }
}
