use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FixtureFarmError {
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("record not found: {entity_type} with key {key}")]
    NotFound { entity_type: String, key: i64 },
    #[error("session file error: {0}")]
    SessionParse(String),
    #[error("fixture file error: {0}")]
    FixtureParse(String),
}

impl FixtureFarmError {
    pub fn not_found(entity_type: impl Into<String>, key: i64) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            key,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
