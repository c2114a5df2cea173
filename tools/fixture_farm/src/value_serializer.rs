use crate::model::Value;
use crate::relative_time::{date_expression, timestamp_expression, RelativeTime};
use chrono::NaiveDateTime;
use serde_yaml::Value as Yaml;

/// Serialized form of a timestamp equal to the moment of recording.
pub const NOW_EXPRESSION: &str = "<%= Time.zone.now %>";

/// Turns attribute values into fixture-safe YAML scalars.
#[derive(Debug, Clone, Copy)]
pub struct ValueSerializer {
    /// When the recording pass began.
    pub initial_now: NaiveDateTime,
    /// When the fixtures are being written.
    pub now: NaiveDateTime,
}

impl ValueSerializer {
    pub fn new(initial_now: NaiveDateTime, now: NaiveDateTime) -> Self {
        Self { initial_now, now }
    }

    /// `None` for nulls, which are left out of fixtures entirely.
    pub fn serialize(&self, value: &Value) -> Option<Yaml> {
        let yaml = match value {
            Value::Null => return None,
            Value::Bool(flag) => Yaml::Bool(*flag),
            Value::Integer(number) => Yaml::Number((*number).into()),
            Value::Float(number) => Yaml::Number((*number).into()),
            Value::Text(text) => Yaml::String(text.clone()),
            Value::Decimal(text) => match text.trim().parse::<f64>() {
                Ok(number) => Yaml::Number(number.into()),
                Err(_) => Yaml::String(text.clone()),
            },
            Value::Timestamp(at) => Yaml::String(self.timestamp(*at).to_template()),
            Value::Date(day) => {
                Yaml::String(date_expression(*day, self.initial_now, self.now).to_template())
            }
            Value::Duration(duration) => Yaml::String(duration.iso8601()),
            Value::Map(json) => Yaml::String(json.to_string()),
        };
        Some(yaml)
    }

    pub fn timestamp(&self, value: NaiveDateTime) -> RelativeTime {
        timestamp_expression(value, self.initial_now, self.now)
    }
}

/// Bookkeeping timestamps that merely say "created while recording" carry no
/// information the loader would not fill in anyway.
pub fn is_implied_timestamp(attribute: &str, serialized: &Yaml) -> bool {
    matches!(attribute, "created_at" | "updated_at")
        && serialized.as_str() == Some(NOW_EXPRESSION)
}
