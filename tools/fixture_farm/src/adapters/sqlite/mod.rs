//! Reference data store over SQLite.
//!
//! Models are declared up front in a [`ModelRegistry`]. Creates and destroys
//! are published on an embedded [`EventBus`] together with the records
//! enrolled in the current transaction, the way an ORM reports them.

mod loader;
mod registry;

pub use loader::load_fixtures;
pub use registry::{ColumnDef, ModelDef, ModelRegistry, INHERITANCE_COLUMN};

use crate::errors::FixtureFarmError;
use crate::iso_duration::IsoDuration;
use crate::logging::append_run_log;
use crate::model::{
    Attribute, BelongsTo, ColumnType, DataStore, EventBus, Notification, NotificationBus,
    NotificationHandler, OperationKind, RecordKey, RecordRef, RecordSnapshot, SubscriptionToken,
    TransactionRecord, Value,
};
use crate::runtime::Clock;
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

type StoreResult<T> = Result<T, FixtureFarmError>;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";
const DATE_FORMAT: &str = "%Y-%m-%d";

pub struct SqliteStore {
    conn: Mutex<Connection>,
    registry: ModelRegistry,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    transaction: Mutex<Option<Vec<TransactionRecord>>>,
}

impl SqliteStore {
    pub fn open_in_memory(registry: ModelRegistry, clock: Arc<dyn Clock>) -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::with_connection(conn, registry, clock)
    }

    pub fn open(path: impl AsRef<Path>, registry: ModelRegistry, clock: Arc<dyn Clock>) -> StoreResult<Self> {
        let path = path.as_ref();
        append_run_log(
            "info",
            "sqlite_store.open",
            json!({ "path": path.display().to_string() }),
        );
        let conn = Connection::open(path).map_err(db_err)?;
        Self::with_connection(conn, registry, clock)
    }

    fn with_connection(conn: Connection, registry: ModelRegistry, clock: Arc<dyn Clock>) -> StoreResult<Self> {
        conn.execute_batch(&registry.schema_sql()).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
            registry,
            bus: EventBus::new(),
            clock,
            transaction: Mutex::new(None),
        })
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn tx_state(&self) -> MutexGuard<'_, Option<Vec<TransactionRecord>>> {
        self.transaction
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `work` in one transaction. Nested calls join the outer one.
    pub fn transaction<T>(&self, work: impl FnOnce(&Self) -> StoreResult<T>) -> StoreResult<T> {
        if self.tx_state().is_some() {
            return work(self);
        }
        self.conn().execute_batch("BEGIN").map_err(db_err)?;
        *self.tx_state() = Some(Vec::new());
        let result = work(self);
        *self.tx_state() = None;
        match result {
            Ok(value) => {
                self.conn().execute_batch("COMMIT").map_err(db_err)?;
                Ok(value)
            }
            Err(err) => {
                self.conn().execute_batch("ROLLBACK").map_err(db_err)?;
                Err(err)
            }
        }
    }

    /// Insert a record; `created_at`/`updated_at` default to the store clock.
    pub fn create(&self, entity_type: &str, attributes: &[(&str, Value)]) -> StoreResult<RecordSnapshot> {
        let model = self.registry.model(entity_type)?;
        let columns = self.registry.columns(entity_type);
        let now = self.clock.now();

        let mut names = Vec::new();
        let mut values = Vec::new();
        for (name, value) in attributes {
            let column = columns
                .iter()
                .find(|column| column.name == *name)
                .ok_or_else(|| unknown_column(entity_type, name))?;
            names.push(column.name.clone());
            values.push(to_sql(value, column.column_type));
        }
        for stamp in ["created_at", "updated_at"] {
            if columns.iter().any(|column| column.name == stamp) && !names.iter().any(|name| name == stamp) {
                names.push(stamp.to_string());
                values.push(to_sql(&Value::Timestamp(now), ColumnType::DateTime));
            }
        }
        if model.parent.is_some()
            && self.registry.uses_inheritance(entity_type)
            && !names.iter().any(|name| name == INHERITANCE_COLUMN)
        {
            names.push(INHERITANCE_COLUMN.to_string());
            values.push(SqlValue::Text(entity_type.to_string()));
        }

        let key = insert_row(&self.conn(), &model.table, &names, values)?;
        let record = RecordRef::new(entity_type, key);
        append_run_log(
            "debug",
            "sqlite_store.create",
            json!({ "record": record.to_string() }),
        );
        self.publish_in_transaction(OperationKind::Create, TransactionRecord {
            record: record.clone(),
            persisted: false,
            destroyed: false,
        });
        self.find(entity_type, key, true)
    }

    /// Change attributes and touch `updated_at`.
    pub fn update(&self, record: &RecordRef, attributes: &[(&str, Value)]) -> StoreResult<RecordSnapshot> {
        let mut changes = attributes
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect::<Vec<_>>();
        let columns = self.registry.columns(&record.entity_type);
        if columns.iter().any(|column| column.name == "updated_at")
            && !changes.iter().any(|(name, _)| name == "updated_at")
        {
            changes.push(("updated_at".to_string(), Value::Timestamp(self.clock.now())));
        }
        for (name, value) in changes {
            self.update_attribute(record, &name, value)?;
        }
        self.find(&record.entity_type, record.key, true)
    }

    pub fn destroy(&self, record: &RecordRef) -> StoreResult<()> {
        let model = self.registry.model(&record.entity_type)?;
        let deleted = self
            .conn()
            .execute(
                &format!("DELETE FROM \"{}\" WHERE id = ?1", model.table),
                [record.key],
            )
            .map_err(db_err)?;
        if deleted == 0 {
            return Err(FixtureFarmError::not_found(record.entity_type.clone(), record.key));
        }
        append_run_log(
            "debug",
            "sqlite_store.destroy",
            json!({ "record": record.to_string() }),
        );
        self.publish_in_transaction(OperationKind::Destroy, TransactionRecord {
            record: record.clone(),
            persisted: true,
            destroyed: true,
        });
        Ok(())
    }

    /// Publish with `current` enrolled in the active transaction (or a
    /// single-statement one). Earlier creates of the transaction report as
    /// persisted.
    fn publish_in_transaction(&self, kind: OperationKind, current: TransactionRecord) {
        let entity_type = current.record.entity_type.clone();
        let mut state = self.tx_state();
        let transaction_records = match state.as_mut() {
            Some(records) => {
                records.retain(|existing| existing.record != current.record);
                records.push(current.clone());
                records.clone()
            }
            None => vec![current.clone()],
        };
        drop(state);
        self.bus.publish(&Notification {
            kind,
            entity_type,
            transaction_records,
        });
        if let Some(records) = self.tx_state().as_mut() {
            for record in records.iter_mut().filter(|record| record.record == current.record) {
                record.persisted = !record.destroyed;
            }
        }
    }

    pub fn count(&self, entity_type: &str) -> StoreResult<i64> {
        let model = self.registry.model(entity_type)?;
        let (filter, params) = self.type_filter(entity_type);
        let sql = format!("SELECT COUNT(*) FROM \"{}\" WHERE 1 = 1{filter}", model.table);
        self.conn()
            .query_row(&sql, params_from_iter(params), |row| row.get(0))
            .map_err(db_err)
    }

    /// Restricts subtype queries to rows of that type or its subtypes.
    fn type_filter(&self, entity_type: &str) -> (String, Vec<SqlValue>) {
        let is_subtype = self
            .registry
            .get(entity_type)
            .is_some_and(|model| model.parent.is_some());
        if !is_subtype || !self.registry.uses_inheritance(entity_type) {
            return (String::new(), Vec::new());
        }
        let types = self.registry.descendants(entity_type);
        let placeholders = vec!["?"; types.len()].join(", ");
        (
            format!(" AND \"{INHERITANCE_COLUMN}\" IN ({placeholders})"),
            types.into_iter().map(SqlValue::Text).collect(),
        )
    }

    fn row_snapshot(&self, entity_type: &str, key: RecordKey, row: Vec<(String, SqlValue)>) -> RecordSnapshot {
        let stored_type = row
            .iter()
            .find(|(name, _)| name == INHERITANCE_COLUMN)
            .and_then(|(_, value)| match value {
                SqlValue::Text(text) if self.registry.get(text).is_some() => Some(text.clone()),
                _ => None,
            });
        let actual_type = stored_type.unwrap_or_else(|| entity_type.to_string());
        let columns = self.registry.columns(&actual_type);
        let attributes = columns
            .iter()
            .map(|column| {
                let raw = row
                    .iter()
                    .find(|(name, _)| *name == column.name)
                    .map(|(_, value)| value.clone())
                    .unwrap_or(SqlValue::Null);
                Attribute {
                    name: column.name.clone(),
                    column_type: Some(column.column_type),
                    value: from_sql(raw, column.column_type),
                }
            })
            .collect();
        RecordSnapshot {
            record: RecordRef::new(actual_type, key),
            attributes,
        }
    }
}

impl DataStore for SqliteStore {
    fn type_hierarchy(&self, entity_type: &str) -> Vec<String> {
        self.registry.hierarchy(entity_type)
    }

    fn belongs_to(&self, entity_type: &str) -> Vec<BelongsTo> {
        self.registry.relations(entity_type)
    }

    fn find(&self, entity_type: &str, key: RecordKey, unscoped: bool) -> StoreResult<RecordSnapshot> {
        let model = self.registry.model(entity_type)?;
        let (mut filter, mut params) = self.type_filter(entity_type);
        if !unscoped {
            for ancestor in self.registry.hierarchy(entity_type) {
                if let Some(scope) = self.registry.get(&ancestor).and_then(|m| m.default_scope.as_ref()) {
                    filter.push_str(&format!(" AND ({scope})"));
                }
            }
        }
        params.insert(0, SqlValue::Integer(key));
        let sql = format!("SELECT * FROM \"{}\" WHERE id = ?{filter}", model.table);

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let names = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        let row = stmt
            .query_row(params_from_iter(params), |row| {
                let mut values = Vec::with_capacity(names.len());
                for (index, name) in names.iter().enumerate() {
                    values.push((name.clone(), row.get::<_, SqlValue>(index)?));
                }
                Ok(values)
            })
            .optional()
            .map_err(db_err)?;
        drop(stmt);
        drop(conn);

        match row {
            Some(row) => Ok(self.row_snapshot(entity_type, key, row)),
            None => Err(FixtureFarmError::not_found(entity_type, key)),
        }
    }

    fn update_attribute(&self, record: &RecordRef, name: &str, value: Value) -> StoreResult<()> {
        let model = self.registry.model(&record.entity_type)?;
        let column = self
            .registry
            .columns(&record.entity_type)
            .into_iter()
            .find(|column| column.name == name)
            .ok_or_else(|| unknown_column(&record.entity_type, name))?;
        let changed = self
            .conn()
            .execute(
                &format!("UPDATE \"{}\" SET \"{}\" = ?1 WHERE id = ?2", model.table, column.name),
                rusqlite::params![to_sql(&value, column.column_type), record.key],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(FixtureFarmError::not_found(record.entity_type.clone(), record.key));
        }
        Ok(())
    }
}

impl NotificationBus for SqliteStore {
    fn subscribe(&self, kind: OperationKind, handler: NotificationHandler) -> SubscriptionToken {
        self.bus.subscribe(kind, handler)
    }

    fn unsubscribe(&self, token: SubscriptionToken) {
        self.bus.unsubscribe(token);
    }
}

fn insert_row(conn: &Connection, table: &str, names: &[String], values: Vec<SqlValue>) -> StoreResult<RecordKey> {
    if names.is_empty() {
        conn.execute(&format!("INSERT INTO \"{table}\" DEFAULT VALUES"), [])
            .map_err(db_err)?;
        return Ok(conn.last_insert_rowid());
    }
    let columns = names
        .iter()
        .map(|name| format!("\"{name}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=names.len())
        .map(|index| format!("?{index}"))
        .collect::<Vec<_>>()
        .join(", ");
    conn.execute(
        &format!("INSERT INTO \"{table}\" ({columns}) VALUES ({placeholders})"),
        params_from_iter(values),
    )
    .map_err(db_err)?;
    Ok(conn.last_insert_rowid())
}

fn to_sql(value: &Value, column_type: ColumnType) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Integer(number) if column_type == ColumnType::Float => SqlValue::Real(*number as f64),
        Value::Integer(number) => SqlValue::Integer(*number),
        Value::Float(number) => SqlValue::Real(*number),
        Value::Text(text) | Value::Decimal(text) => SqlValue::Text(text.clone()),
        Value::Timestamp(at) => SqlValue::Text(at.format(TIMESTAMP_FORMAT).to_string()),
        Value::Date(day) => SqlValue::Text(day.format(DATE_FORMAT).to_string()),
        Value::Duration(duration) => SqlValue::Text(duration.iso8601()),
        Value::Map(json) => SqlValue::Text(json.to_string()),
    }
}

fn from_sql(raw: SqlValue, column_type: ColumnType) -> Value {
    match (raw, column_type) {
        (SqlValue::Null, _) => Value::Null,
        (SqlValue::Integer(number), ColumnType::Boolean) => Value::Bool(number != 0),
        (SqlValue::Integer(number), ColumnType::Float) => Value::Float(number as f64),
        (SqlValue::Integer(number), _) => Value::Integer(number),
        (SqlValue::Real(number), _) => Value::Float(number),
        (SqlValue::Text(text), ColumnType::Decimal) => Value::Decimal(text),
        (SqlValue::Text(text), ColumnType::DateTime) => {
            parse_timestamp(&text).map_or(Value::Text(text), Value::Timestamp)
        }
        (SqlValue::Text(text), ColumnType::Date) => NaiveDate::parse_from_str(&text, DATE_FORMAT)
            .map_or(Value::Text(text), Value::Date),
        (SqlValue::Text(text), ColumnType::Duration) => match IsoDuration::parse(&text) {
            Some(duration) => Value::Duration(duration),
            None => Value::Text(text),
        },
        (SqlValue::Text(text), ColumnType::Json) => match serde_json::from_str(&text) {
            Ok(json) => Value::Map(json),
            Err(_) => Value::Text(text),
        },
        (SqlValue::Text(text), _) => Value::Text(text),
        (SqlValue::Blob(bytes), _) => Value::Text(String::from_utf8_lossy(&bytes).into_owned()),
    }
}

pub(crate) fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text.trim(), format).ok())
}

fn unknown_column(entity_type: &str, name: &str) -> FixtureFarmError {
    FixtureFarmError::Database(format!("{entity_type} has no column {name}"))
}

fn db_err(error: rusqlite::Error) -> FixtureFarmError {
    FixtureFarmError::Database(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FakeClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .expect("valid time")
    }

    fn store() -> SqliteStore {
        let user = ModelDef::new("User", "users")
            .column("name", ColumnType::String)
            .column("score", ColumnType::Decimal)
            .column("settings", ColumnType::Json)
            .column("active", ColumnType::Boolean)
            .column(INHERITANCE_COLUMN, ColumnType::String)
            .column("deleted_at", ColumnType::DateTime)
            .timestamps()
            .default_scope("deleted_at IS NULL");
        let admin = ModelDef::subtype_of("Admin", &user).column("level", ColumnType::Integer);
        let registry = ModelRegistry::new()
            .define(user)
            .and_then(|r| r.define(admin))
            .expect("registry");
        SqliteStore::open_in_memory(registry, Arc::new(FakeClock::new(noon()))).expect("store")
    }

    #[test]
    fn create_stamps_timestamps_and_round_trips_values() {
        let store = store();
        let user = store
            .create(
                "User",
                &[
                    ("name", Value::Text("A".to_string())),
                    ("score", Value::Decimal("10.50".to_string())),
                    ("settings", Value::Map(json!({"theme": "dark"}))),
                    ("active", Value::Bool(true)),
                ],
            )
            .expect("create");
        assert_eq!(user.get("created_at"), Some(&Value::Timestamp(noon())));
        assert_eq!(user.get("score"), Some(&Value::Decimal("10.50".to_string())));
        assert_eq!(user.get("settings"), Some(&Value::Map(json!({"theme": "dark"}))));
        assert_eq!(user.get("active"), Some(&Value::Bool(true)));
        assert_eq!(user.get("deleted_at"), Some(&Value::Null));
    }

    #[test]
    fn subtypes_report_their_own_type_and_columns() {
        let store = store();
        let admin = store
            .create("Admin", &[("name", Value::Text("Root".to_string())), ("level", Value::Integer(3))])
            .expect("create");
        let found = store.find("User", admin.record.key, false).expect("find");
        assert_eq!(found.record.entity_type, "Admin");
        assert_eq!(found.get("level"), Some(&Value::Integer(3)));
        assert_eq!(found.get("type"), Some(&Value::Text("Admin".to_string())));

        let plain = store.create("User", &[]).expect("create");
        assert!(store.find("Admin", plain.record.key, false).expect_err("not admin").is_not_found());
        assert_eq!(store.count("User").expect("count"), 2);
        assert_eq!(store.count("Admin").expect("count"), 1);
    }

    #[test]
    fn default_scope_hides_rows_unless_unscoped() {
        let store = store();
        let user = store
            .create("User", &[("deleted_at", Value::Timestamp(noon()))])
            .expect("create");
        assert!(store.find("User", user.record.key, false).expect_err("scoped").is_not_found());
        assert!(store.reload(&user.record).is_ok());
    }

    #[test]
    fn notifications_carry_transaction_membership() {
        let store = store();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        store.subscribe(
            OperationKind::Create,
            Arc::new(move |notification: &Notification| {
                sink.lock().expect("lock").push(notification.transaction_records.clone());
            }),
        );

        store
            .transaction(|store| {
                store.create("User", &[])?;
                store.create("Admin", &[])?;
                Ok(())
            })
            .expect("transaction");

        let seen = seen.lock().expect("lock");
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].len(), 2);
        assert!(seen[1][0].persisted);
        assert!(!seen[1][1].persisted);
        assert_eq!(seen[1][1].record.entity_type, "Admin");
    }

    #[test]
    fn rollback_discards_rows_and_destroy_publishes() {
        let store = store();
        let failed = store.transaction(|store| {
            store.create("User", &[])?;
            Err::<(), _>(FixtureFarmError::Database("boom".to_string()))
        });
        assert!(failed.is_err());
        assert_eq!(store.count("User").expect("count"), 0);

        let destroys = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&destroys);
        store.subscribe(
            OperationKind::Destroy,
            Arc::new(move |notification: &Notification| {
                if notification.transaction_records.iter().all(|tx| tx.destroyed) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );
        let user = store.create("User", &[]).expect("create");
        store.destroy(&user.record).expect("destroy");
        assert_eq!(destroys.load(Ordering::SeqCst), 1);
        assert!(store.destroy(&user.record).expect_err("gone").is_not_found());
    }

    #[test]
    fn update_touches_updated_at() {
        let store = store();
        let user = store.create("User", &[]).expect("create");
        let clock = FakeClock::new(noon());
        let later = SqliteStore {
            clock: Arc::new(clock.clone()),
            ..store
        };
        clock.advance(chrono::Duration::hours(2));
        let updated = later
            .update(&user.record, &[("name", Value::Text("B".to_string()))])
            .expect("update");
        assert_eq!(updated.get("name"), Some(&Value::Text("B".to_string())));
        assert_eq!(
            updated.get("updated_at"),
            Some(&Value::Timestamp(noon() + chrono::Duration::hours(2)))
        );
        assert_eq!(updated.get("created_at"), Some(&Value::Timestamp(noon())));
    }
}
