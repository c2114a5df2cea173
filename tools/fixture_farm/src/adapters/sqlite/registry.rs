use crate::errors::FixtureFarmError;
use crate::model::{BelongsTo, ColumnType, RelationTarget};
use std::collections::BTreeMap;

/// Column holding the concrete type of single-table-inheritance rows.
pub const INHERITANCE_COLUMN: &str = "type";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
}

/// A model type. Subtypes share their base type's table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDef {
    pub name: String,
    pub table: String,
    pub parent: Option<String>,
    pub columns: Vec<ColumnDef>,
    pub belongs_to: Vec<BelongsTo>,
    /// SQL predicate applied to scoped lookups, e.g. `deleted_at IS NULL`.
    pub default_scope: Option<String>,
}

impl ModelDef {
    pub fn new(name: &str, table: &str) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            parent: None,
            columns: Vec::new(),
            belongs_to: Vec::new(),
            default_scope: None,
        }
    }

    /// Subtype stored in `parent`'s table.
    pub fn subtype_of(name: &str, parent: &ModelDef) -> Self {
        Self {
            parent: Some(parent.name.clone()),
            ..Self::new(name, &parent.table)
        }
    }

    pub fn column(mut self, name: &str, column_type: ColumnType) -> Self {
        self.columns.push(ColumnDef {
            name: name.to_string(),
            column_type,
        });
        self
    }

    /// `created_at` and `updated_at`.
    pub fn timestamps(self) -> Self {
        self.column("created_at", ColumnType::DateTime)
            .column("updated_at", ColumnType::DateTime)
    }

    /// Declares the relation and its foreign key column (plus the type
    /// column of polymorphic relations).
    pub fn belongs_to(mut self, relation: BelongsTo) -> Self {
        self.columns.push(ColumnDef {
            name: relation.foreign_key.clone(),
            column_type: ColumnType::Integer,
        });
        if let RelationTarget::Polymorphic { type_attribute } = &relation.target {
            self.columns.push(ColumnDef {
                name: type_attribute.clone(),
                column_type: ColumnType::String,
            });
        }
        self.belongs_to.push(relation);
        self
    }

    pub fn default_scope(mut self, predicate: &str) -> Self {
        self.default_scope = Some(predicate.to_string());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelRegistry {
    models: BTreeMap<String, ModelDef>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(mut self, model: ModelDef) -> Result<Self, FixtureFarmError> {
        if let Some(parent) = &model.parent {
            if !self.models.contains_key(parent) {
                return Err(FixtureFarmError::InvalidConfig(format!(
                    "{} extends undefined model {parent}",
                    model.name
                )));
            }
        }
        self.models.insert(model.name.clone(), model);
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&ModelDef> {
        self.models.get(name)
    }

    pub fn model(&self, name: &str) -> Result<&ModelDef, FixtureFarmError> {
        self.get(name)
            .ok_or_else(|| FixtureFarmError::Database(format!("unknown model {name}")))
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelDef> {
        self.models.values()
    }

    /// `name` and its ancestors, most-derived first. Empty for unknown types.
    pub fn hierarchy(&self, name: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut current = self.get(name);
        while let Some(model) = current {
            if chain.contains(&model.name) {
                break;
            }
            chain.push(model.name.clone());
            current = model.parent.as_deref().and_then(|parent| self.get(parent));
        }
        chain
    }

    pub fn base(&self, name: &str) -> Result<&ModelDef, FixtureFarmError> {
        let hierarchy = self.hierarchy(name);
        let base = hierarchy
            .last()
            .ok_or_else(|| FixtureFarmError::Database(format!("unknown model {name}")))?;
        self.model(base)
    }

    /// `name` and every type that inherits from it.
    pub fn descendants(&self, name: &str) -> Vec<String> {
        self.models
            .values()
            .filter(|model| self.hierarchy(&model.name).iter().any(|ancestor| ancestor == name))
            .map(|model| model.name.clone())
            .collect()
    }

    /// Columns visible on `name`: inherited ones first.
    pub fn columns(&self, name: &str) -> Vec<ColumnDef> {
        let mut columns: Vec<ColumnDef> = Vec::new();
        for ancestor in self.hierarchy(name).iter().rev() {
            if let Some(model) = self.get(ancestor) {
                for column in &model.columns {
                    if !columns.iter().any(|existing| existing.name == column.name) {
                        columns.push(column.clone());
                    }
                }
            }
        }
        columns
    }

    /// Union of the columns of every type stored in `table`.
    pub fn table_columns(&self, table: &str) -> Vec<ColumnDef> {
        let mut columns: Vec<ColumnDef> = Vec::new();
        for model in self.models.values().filter(|model| model.table == table) {
            for column in self.columns(&model.name) {
                if !columns.iter().any(|existing| existing.name == column.name) {
                    columns.push(column);
                }
            }
        }
        columns
    }

    pub fn relations(&self, name: &str) -> Vec<BelongsTo> {
        let mut relations = Vec::new();
        for ancestor in self.hierarchy(name).iter().rev() {
            if let Some(model) = self.get(ancestor) {
                relations.extend(model.belongs_to.iter().cloned());
            }
        }
        relations
    }

    pub fn uses_inheritance(&self, name: &str) -> bool {
        self.columns(name)
            .iter()
            .any(|column| column.name == INHERITANCE_COLUMN)
    }

    pub fn tables(&self) -> Vec<String> {
        let mut tables = self
            .models
            .values()
            .map(|model| model.table.clone())
            .collect::<Vec<_>>();
        tables.sort();
        tables.dedup();
        tables
    }

    /// `CREATE TABLE` statements for every table.
    pub fn schema_sql(&self) -> String {
        let mut sql = String::new();
        for table in self.tables() {
            let mut definitions = vec!["id INTEGER PRIMARY KEY AUTOINCREMENT".to_string()];
            for column in self.table_columns(&table) {
                definitions.push(format!("\"{}\" {}", column.name, sql_type(column.column_type)));
            }
            sql.push_str(&format!(
                "CREATE TABLE IF NOT EXISTS \"{table}\" ({});\n",
                definitions.join(", ")
            ));
        }
        sql
    }
}

fn sql_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Integer | ColumnType::Boolean => "INTEGER",
        ColumnType::Float => "REAL",
        ColumnType::String
        | ColumnType::Text
        | ColumnType::Decimal
        | ColumnType::DateTime
        | ColumnType::Date
        | ColumnType::Duration
        | ColumnType::Json => "TEXT",
    }
}
