use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RecordError;

/// Маркер, который Processor добавляет в производную запись.
pub const PROCESSED_FIELD: &str = "processed";

// ════════════════════════════════════════════════════════════════
//  Record
// ════════════════════════════════════════════════════════════════

/// Непрозрачный структурированный документ: упорядоченный map
/// `String -> Value`, без фиксированной схемы.
///
/// Map разделяется между клонами через `Arc` и никогда не меняется
/// на месте: любая мутация идёт через copy-on-write, поэтому подписчик,
/// изменивший свою копию, не затрагивает других подписчиков того же publish.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Arc<Map<String, Value>>);

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Принимает только JSON object.
    pub fn from_value(value: Value) -> Result<Self, RecordError> {
        match value {
            Value::Object(map) => Ok(Self(Arc::new(map))),
            Value::Null => Err(RecordError::NotAnObject("null")),
            Value::Bool(_) => Err(RecordError::NotAnObject("bool")),
            Value::Number(_) => Err(RecordError::NotAnObject("number")),
            Value::String(_) => Err(RecordError::NotAnObject("string")),
            Value::Array(_) => Err(RecordError::NotAnObject("array")),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Вставить поле. Если map разделён с другими клонами, сначала копируется.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        Arc::make_mut(&mut self.0).insert(key.into(), value.into())
    }

    /// Производная запись: копия `self` плюс одно поле. `self` не меняется.
    pub fn with_field(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut derived = self.clone();
        derived.insert(key, value);
        derived
    }

    pub fn to_value(&self) -> Value {
        Value::Object((*self.0).clone())
    }

    /// Pretty-printed JSON документ.
    pub fn to_pretty_json(&self) -> String {
        // Map<String, Value> всегда сериализуется.
        serde_json::to_string_pretty(&*self.0).unwrap_or_else(|_| "{}".to_string())
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(Arc::new(map))
    }
}

impl TryFrom<Value> for Record {
    type Error = RecordError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}
