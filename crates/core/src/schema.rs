//! Field schema: declared fields, storage column names and value
//! materialization.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::expr::{lookup_path, CompiledExpr, ExprValue};
use crate::{Error, Result};

/// Column names owned by the store itself.
pub const BUILTIN_COLUMNS: [&str; 5] = ["id", "geometry", "healpix_index", "geogroup_id", "properties"];

/// Type of a declared field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Date,
    Number,
    Json,
}

/// Declaration of one ingestible and queryable attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Property path of the field, e.g. `SurveyName` or `obs.band`
    pub id: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Expression deriving the value from the feature's properties
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computed: Option<String>,
    /// Display hint; `tags` fields are summarized as value counts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub widget: Option<String>,
}

impl FieldSpec {
    pub fn new(id: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            id: id.into(),
            field_type,
            computed: None,
            widget: None,
        }
    }

    pub fn with_computed(mut self, expression: impl Into<String>) -> Self {
        self.computed = Some(expression.into());
        self
    }

    pub fn with_widget(mut self, widget: impl Into<String>) -> Self {
        self.widget = Some(widget.into());
        self
    }

    pub fn is_tags(&self) -> bool {
        self.widget.as_deref() == Some("tags")
    }
}

/// Storage column name of a field id: dots become underscores.
pub fn column_name(field_id: &str) -> String {
    field_id.replace('.', "_")
}

/// A materialized field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Number(f64),
    /// Milliseconds since the Unix epoch, UTC
    Date(i64),
    Json(Value),
}

impl FieldValue {
    /// Numeric view used by ranges and histograms.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Date(ms) => Some(*ms as f64),
            FieldValue::Text(s) => s.trim().parse().ok(),
            FieldValue::Json(v) => v.as_f64(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Text(s) => Value::String(s.clone()),
            FieldValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            FieldValue::Date(ms) => Value::from(*ms),
            FieldValue::Json(v) => v.clone(),
        }
    }

    /// Key used for value counting: text as-is, everything else as JSON text.
    pub fn count_key(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            other => other.to_json().to_string(),
        }
    }
}

/// A column addressable by queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnRef {
    Id,
    GeogroupId,
    HealpixIndex,
    /// Index into the schema's field list
    Field(usize),
}

/// The fixed field set of a store.
#[derive(Debug, Clone)]
pub struct Schema {
    fields: Vec<FieldSpec>,
    computed: Vec<Option<CompiledExpr>>,
    by_id: HashMap<String, usize>,
}

impl Schema {
    /// Validate a field list and compile its computed expressions.
    ///
    /// Field ids must be unique, must not collide with built-in columns and
    /// must map to distinct column names.
    pub fn new(fields: Vec<FieldSpec>) -> Result<Self> {
        let mut by_id = HashMap::with_capacity(fields.len());
        let mut columns: HashMap<String, &str> = HashMap::with_capacity(fields.len());
        let mut computed = Vec::with_capacity(fields.len());

        for (idx, field) in fields.iter().enumerate() {
            if field.id.trim().is_empty() {
                return Err(Error::Schema(format!("field at index {idx} has an empty id")));
            }
            if by_id.insert(field.id.clone(), idx).is_some() {
                return Err(Error::Schema(format!("duplicate field id '{}'", field.id)));
            }
            let column = column_name(&field.id);
            if BUILTIN_COLUMNS.contains(&column.as_str()) {
                return Err(Error::Schema(format!(
                    "field id '{}' collides with built-in column '{column}'",
                    field.id
                )));
            }
            if let Some(other) = columns.insert(column.clone(), &field.id) {
                return Err(Error::Schema(format!(
                    "field ids '{other}' and '{}' map to the same column '{column}'",
                    field.id
                )));
            }
            let compiled = match &field.computed {
                Some(src) => Some(CompiledExpr::compile(src).map_err(|e| {
                    Error::Schema(format!("computed field '{}': {e}", field.id))
                })?),
                None => None,
            };
            computed.push(compiled);
        }

        Ok(Self {
            fields,
            computed,
            by_id,
        })
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, idx: usize) -> &FieldSpec {
        &self.fields[idx]
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.by_id.get(id).copied()
    }

    /// Resolve a field id or built-in column name.
    pub fn resolve(&self, id: &str) -> Option<ColumnRef> {
        match id {
            "id" => Some(ColumnRef::Id),
            "geogroup_id" => Some(ColumnRef::GeogroupId),
            "healpix_index" => Some(ColumnRef::HealpixIndex),
            _ => self.index_of(id).map(ColumnRef::Field),
        }
    }

    /// Type of a column, if it has one.
    pub fn column_type(&self, column: ColumnRef) -> FieldType {
        match column {
            ColumnRef::Id | ColumnRef::HealpixIndex => FieldType::Number,
            ColumnRef::GeogroupId => FieldType::String,
            ColumnRef::Field(idx) => self.fields[idx].field_type,
        }
    }

    /// Materialize one value per field from a feature's properties.
    ///
    /// Missing properties, failed conversions and NaN results are `None`.
    pub fn materialize(&self, props: &Map<String, Value>) -> Vec<Option<FieldValue>> {
        self.fields
            .iter()
            .zip(&self.computed)
            .map(|(field, computed)| match computed {
                Some(expr) => from_expr(field.field_type, expr.eval(props)),
                None => lookup_path(props, &field.id).and_then(|v| from_json(field.field_type, v)),
            })
            .collect()
    }
}

fn from_json(field_type: FieldType, value: &Value) -> Option<FieldValue> {
    if value.is_null() {
        return None;
    }
    match field_type {
        FieldType::String => Some(FieldValue::Text(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })),
        FieldType::Number => match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
        .filter(|n| n.is_finite())
        .map(FieldValue::Number),
        FieldType::Date => date_value_millis(value).map(FieldValue::Date),
        FieldType::Json => Some(FieldValue::Json(value.clone())),
    }
}

fn from_expr(field_type: FieldType, value: ExprValue) -> Option<FieldValue> {
    if let ExprValue::Number(n) = value {
        if !n.is_finite() {
            return None;
        }
    }
    from_json(field_type, &value.into_json()?)
}

/// Milliseconds since the epoch from a JSON date value.
///
/// Accepts numeric epoch milliseconds and the string forms understood by
/// [`parse_date_millis`].
pub fn date_value_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)),
        Value::String(s) => parse_date_millis(s),
        _ => None,
    }
}

/// Parse a date string into UTC epoch milliseconds.
///
/// Supported forms: RFC 3339 (`2021-03-04T05:06:07Z`, with offset or
/// fraction), naive date-times (`2021-03-04T05:06:07`, `2021-03-04 05:06:07`,
/// read as UTC) and plain dates (`2021-03-04`, midnight UTC).
pub fn parse_date_millis(text: &str) -> Option<i64> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.timestamp_millis());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Some(dt.and_utc().timestamp_millis());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
}
