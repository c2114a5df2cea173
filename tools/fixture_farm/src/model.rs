//! Contract between the recorder and the data-access layer it observes.
//!
//! The recorder never talks to a database directly. A store adapter implements
//! [`DataStore`] for lookups and reflection, and [`NotificationBus`] for the
//! per-operation create/destroy stream the tracer listens to.

use crate::errors::FixtureFarmError;
use crate::iso_duration::IsoDuration;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

pub type RecordKey = i64;

/// Identity of one persisted record. Equal `(entity_type, key)` pairs denote
/// the same logical record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordRef {
    pub entity_type: String,
    pub key: RecordKey,
}

impl RecordRef {
    pub fn new(entity_type: impl Into<String>, key: RecordKey) -> Self {
        Self {
            entity_type: entity_type.into(),
            key,
        }
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity_type, self.key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    String,
    Text,
    Integer,
    Float,
    Decimal,
    Boolean,
    DateTime,
    Date,
    Duration,
    Json,
}

impl ColumnType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Decimal => "decimal",
            Self::Boolean => "boolean",
            Self::DateTime => "datetime",
            Self::Date => "date",
            Self::Duration => "duration",
            Self::Json => "json",
        }
    }
}

/// Attribute value as read from the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    /// Arbitrary-precision decimal kept in its textual form.
    Decimal(String),
    Timestamp(NaiveDateTime),
    Date(NaiveDate),
    Duration(IsoDuration),
    Map(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_key(&self) -> Option<RecordKey> {
        match self {
            Self::Integer(key) => Some(*key),
            Self::Text(text) => text.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    /// `None` for virtual attributes with no backing column; those are never
    /// written to fixtures.
    pub column_type: Option<ColumnType>,
    pub value: Value,
}

/// A record as loaded from the store, primary key excluded from `attributes`.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSnapshot {
    pub record: RecordRef,
    pub attributes: Vec<Attribute>,
}

impl RecordSnapshot {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes
            .iter()
            .find(|attribute| attribute.name == name)
            .map(|attribute| &attribute.value)
    }

    pub fn set(&mut self, name: &str, value: Value) {
        if let Some(attribute) = self
            .attributes
            .iter_mut()
            .find(|attribute| attribute.name == name)
        {
            attribute.value = value;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationTarget {
    Type(String),
    /// Target type is read from a companion attribute, e.g. `notifiable_type`.
    Polymorphic { type_attribute: String },
}

/// A declared "belongs-to" ownership relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BelongsTo {
    pub name: String,
    pub foreign_key: String,
    pub target: RelationTarget,
    /// Resolve with default scoping disabled (tenancy, soft-delete filters).
    pub unscoped: bool,
}

impl BelongsTo {
    pub fn to(name: &str, target: &str) -> Self {
        Self {
            name: name.to_string(),
            foreign_key: format!("{name}_id"),
            target: RelationTarget::Type(target.to_string()),
            unscoped: true,
        }
    }

    pub fn polymorphic(name: &str) -> Self {
        Self {
            name: name.to_string(),
            foreign_key: format!("{name}_id"),
            target: RelationTarget::Polymorphic {
                type_attribute: format!("{name}_type"),
            },
            unscoped: true,
        }
    }
}

pub trait DataStore {
    /// The type followed by its ancestors, most-derived first.
    fn type_hierarchy(&self, entity_type: &str) -> Vec<String>;

    /// Belongs-to relations of `entity_type` in declared order.
    fn belongs_to(&self, entity_type: &str) -> Vec<BelongsTo>;

    /// Fails with [`FixtureFarmError::NotFound`] when the key no longer exists.
    fn find(
        &self,
        entity_type: &str,
        key: RecordKey,
        unscoped: bool,
    ) -> Result<RecordSnapshot, FixtureFarmError>;

    fn reload(&self, record: &RecordRef) -> Result<RecordSnapshot, FixtureFarmError> {
        self.find(&record.entity_type, record.key, true)
    }

    fn update_attribute(
        &self,
        record: &RecordRef,
        name: &str,
        value: Value,
    ) -> Result<(), FixtureFarmError>;
}

/// Follow `relation` from `snapshot`. `Ok(None)` when the foreign key is blank,
/// the polymorphic type is unknown, or the target row is gone.
pub fn find_associated(
    store: &dyn DataStore,
    snapshot: &RecordSnapshot,
    relation: &BelongsTo,
) -> Result<Option<RecordSnapshot>, FixtureFarmError> {
    let Some(key) = snapshot.get(&relation.foreign_key).and_then(Value::as_key) else {
        return Ok(None);
    };
    let target = match &relation.target {
        RelationTarget::Type(target) => target.clone(),
        RelationTarget::Polymorphic { type_attribute } => {
            match snapshot.get(type_attribute).and_then(Value::as_text) {
                Some(target) if !target.is_empty() => target.to_string(),
                _ => return Ok(None),
            }
        }
    };
    if store.type_hierarchy(&target).is_empty() {
        return Ok(None);
    }
    match store.find(&target, key, relation.unscoped) {
        Ok(found) => Ok(Some(found)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Destroy,
}

/// A record enrolled in the store's active transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub record: RecordRef,
    pub persisted: bool,
    pub destroyed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: OperationKind,
    pub entity_type: String,
    pub transaction_records: Vec<TransactionRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionToken(pub u64);

pub type NotificationHandler = Arc<dyn Fn(&Notification) + Send + Sync>;

pub trait NotificationBus {
    fn subscribe(&self, kind: OperationKind, handler: NotificationHandler) -> SubscriptionToken;
    fn unsubscribe(&self, token: SubscriptionToken);
}

#[derive(Default)]
struct BusState {
    next_token: u64,
    handlers: Vec<(SubscriptionToken, OperationKind, NotificationHandler)>,
}

/// In-process bus that store adapters embed and publish through.
#[derive(Default, Clone)]
pub struct EventBus {
    state: Arc<Mutex<BusState>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscriber_count(&self) -> usize {
        self.state().handlers.len()
    }

    pub fn publish(&self, notification: &Notification) {
        // Handlers run outside the lock so they may (un)subscribe.
        let handlers = self
            .state()
            .handlers
            .iter()
            .filter(|(_, kind, _)| *kind == notification.kind)
            .map(|(_, _, handler)| Arc::clone(handler))
            .collect::<Vec<_>>();
        for handler in handlers {
            handler(notification);
        }
    }
}

impl NotificationBus for EventBus {
    fn subscribe(&self, kind: OperationKind, handler: NotificationHandler) -> SubscriptionToken {
        let mut state = self.state();
        state.next_token += 1;
        let token = SubscriptionToken(state.next_token);
        state.handlers.push((token, kind, handler));
        token
    }

    fn unsubscribe(&self, token: SubscriptionToken) {
        self.state()
            .handlers
            .retain(|(existing, _, _)| *existing != token);
    }
}
