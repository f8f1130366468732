//! Typed query model.
//!
//! Client queries arrive as loosely typed JSON:
//!
//! ```json
//! {
//!   "constraints": [{"fieldId": "SurveyName", "operation": "STRING_EQUAL", "expression": "DES"}],
//!   "aggregationOptions": [{"operation": "COUNT", "out": "total"}],
//!   "groupingOptions": [{"operation": "GROUP_ALL"}]
//! }
//! ```
//!
//! They are decoded once into [`Query`]. Unknown operation tags are rejected
//! here with [`Error::UnsupportedOperation`]; malformed payloads with
//! [`Error::InvalidQuery`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::schema::date_value_millis;
use crate::{Error, Result};

/// A filter operation on one field
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "operation", content = "expression", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    StringEqual(String),
    IntEqual(i64),
    IsUndefined,
    /// Inclusive range in epoch milliseconds
    DateRange(i64, i64),
    /// Inclusive numeric range
    NumberRange(f64, f64),
    In(Vec<Value>),
}

/// One constraint. Constraints on the same field are OR-combined, constraints
/// on distinct fields are AND-combined.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Constraint {
    pub field_id: String,
    #[serde(flatten)]
    pub operation: Operation,
}

impl Constraint {
    pub fn new(field_id: impl Into<String>, operation: Operation) -> Self {
        Self {
            field_id: field_id.into(),
            operation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregationOp {
    Count,
    ValuesAndCount,
    DateHistogram,
    NumberHistogram,
}

impl AggregationOp {
    pub fn is_histogram(self) -> bool {
        matches!(self, AggregationOp::DateHistogram | AggregationOp::NumberHistogram)
    }
}

/// One aggregation over the filtered rows, stored under `out`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregation {
    #[serde(rename = "operation")]
    pub op: AggregationOp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_id: Option<String>,
    pub out: String,
}

impl Aggregation {
    pub fn count(out: impl Into<String>) -> Self {
        Self {
            op: AggregationOp::Count,
            field_id: None,
            out: out.into(),
        }
    }

    pub fn values_and_count(field_id: impl Into<String>, out: impl Into<String>) -> Self {
        Self::on_field(AggregationOp::ValuesAndCount, field_id, out)
    }

    pub fn date_histogram(field_id: impl Into<String>, out: impl Into<String>) -> Self {
        Self::on_field(AggregationOp::DateHistogram, field_id, out)
    }

    pub fn number_histogram(field_id: impl Into<String>, out: impl Into<String>) -> Self {
        Self::on_field(AggregationOp::NumberHistogram, field_id, out)
    }

    fn on_field(op: AggregationOp, field_id: impl Into<String>, out: impl Into<String>) -> Self {
        Self {
            op,
            field_id: Some(field_id.into()),
            out: out.into(),
        }
    }
}

/// A decoded client query
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub constraints: Vec<Constraint>,
    /// Columns to return; `None` returns every column
    #[serde(rename = "projectOptions", skip_serializing_if = "Option::is_none")]
    pub projection: Option<Vec<String>>,
    #[serde(rename = "aggregationOptions", skip_serializing_if = "Vec::is_empty")]
    pub aggregations: Vec<Aggregation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip: Option<usize>,
    /// Count each grid piece as its own row instead of each ingested feature
    pub on_sub_features: bool,
}

impl Query {
    /// Decode a query from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(text)?)
    }

    /// Decode a query from a JSON value.
    pub fn from_value(value: Value) -> Result<Self> {
        let raw: RawQuery = serde_json::from_value(value)?;
        raw.decode()
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregations.push(aggregation);
        self
    }

    pub fn with_projection<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projection = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Set paging. A limit of 0 means no limit.
    pub fn with_page(mut self, skip: Option<usize>, limit: Option<usize>) -> Self {
        self.skip = skip;
        self.limit = limit.filter(|&n| n > 0);
        self
    }

    pub fn on_sub_features(mut self, on: bool) -> Self {
        self.on_sub_features = on;
        self
    }

    /// Check rules that hold regardless of the data: a histogram must be the
    /// only aggregation of its query.
    pub fn validate(&self) -> Result<()> {
        if self.aggregations.len() > 1 && self.aggregations.iter().any(|a| a.op.is_histogram()) {
            return Err(Error::InvalidQuery(
                "a histogram must be the only aggregation of a query".to_string(),
            ));
        }
        for aggregation in &self.aggregations {
            if aggregation.op != AggregationOp::Count && aggregation.field_id.is_none() {
                return Err(Error::InvalidQuery(format!(
                    "aggregation '{}' needs a fieldId",
                    aggregation.out
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawQuery {
    #[serde(default)]
    constraints: Vec<RawConstraint>,
    #[serde(default)]
    project_options: Option<Map<String, Value>>,
    #[serde(default)]
    aggregation_options: Option<Vec<RawAggregation>>,
    #[serde(default)]
    grouping_options: Option<Vec<RawGrouping>>,
    #[serde(default)]
    limit: Option<Value>,
    #[serde(default)]
    skip: Option<Value>,
    #[serde(default)]
    on_sub_features: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConstraint {
    field_id: String,
    operation: String,
    #[serde(default)]
    expression: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAggregation {
    operation: String,
    #[serde(default)]
    field_id: Option<String>,
    #[serde(default)]
    out: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawGrouping {
    operation: String,
}

impl RawQuery {
    fn decode(self) -> Result<Query> {
        let constraints = self
            .constraints
            .into_iter()
            .map(RawConstraint::decode)
            .collect::<Result<Vec<_>>>()?;

        let aggregations = self
            .aggregation_options
            .unwrap_or_default()
            .into_iter()
            .map(RawAggregation::decode)
            .collect::<Result<Vec<_>>>()?;

        for grouping in self.grouping_options.iter().flatten() {
            if grouping.operation != "GROUP_ALL" {
                return Err(Error::UnsupportedOperation(format!(
                    "grouping operation '{}'",
                    grouping.operation
                )));
            }
        }

        let query = Query {
            constraints,
            projection: self.project_options.map(|p| p.into_iter().map(|(k, _)| k).collect()),
            aggregations,
            limit: self.limit.as_ref().and_then(page_value).filter(|&n| n > 0),
            skip: self.skip.as_ref().and_then(page_value),
            on_sub_features: self.on_sub_features,
        };
        query.validate()?;
        Ok(query)
    }
}

/// Paging values are honored only when they are non-negative integers.
fn page_value(value: &Value) -> Option<usize> {
    value.as_u64().and_then(|n| usize::try_from(n).ok())
}

impl RawConstraint {
    fn decode(self) -> Result<Constraint> {
        let field = &self.field_id;
        let expr = &self.expression;
        let operation = match self.operation.as_str() {
            "STRING_EQUAL" => Operation::StringEqual(match expr {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return Err(invalid(field, "STRING_EQUAL needs a string")),
            }),
            "INT_EQUAL" => Operation::IntEqual(
                as_integer(expr).ok_or_else(|| invalid(field, "INT_EQUAL needs an integer"))?,
            ),
            "IS_UNDEFINED" => Operation::IsUndefined,
            "DATE_RANGE" => {
                let (lo, hi) = bounds(expr)
                    .and_then(|(a, b)| Some((date_value_millis(a)?, date_value_millis(b)?)))
                    .ok_or_else(|| invalid(field, "DATE_RANGE needs two dates"))?;
                Operation::DateRange(lo, hi)
            }
            "NUMBER_RANGE" => {
                let (lo, hi) = bounds(expr)
                    .and_then(|(a, b)| Some((as_number(a)?, as_number(b)?)))
                    .ok_or_else(|| invalid(field, "NUMBER_RANGE needs two numbers"))?;
                Operation::NumberRange(lo, hi)
            }
            "IN" => match expr {
                Value::Array(items) => Operation::In(items.clone()),
                _ => return Err(invalid(field, "IN needs an array")),
            },
            other => {
                return Err(Error::UnsupportedOperation(format!(
                    "constraint operation '{other}' on '{field}'"
                )))
            }
        };
        Ok(Constraint::new(self.field_id, operation))
    }
}

impl RawAggregation {
    fn decode(self) -> Result<Aggregation> {
        let op = match self.operation.as_str() {
            "COUNT" => AggregationOp::Count,
            "VALUES_AND_COUNT" => AggregationOp::ValuesAndCount,
            "DATE_HISTOGRAM" => AggregationOp::DateHistogram,
            "NUMBER_HISTOGRAM" => AggregationOp::NumberHistogram,
            other => {
                return Err(Error::UnsupportedOperation(format!(
                    "aggregation operation '{other}'"
                )))
            }
        };
        let out = self.out.filter(|o| !o.is_empty()).ok_or_else(|| {
            Error::InvalidQuery(format!("aggregation {} needs an 'out' name", self.operation))
        })?;
        Ok(Aggregation {
            op,
            field_id: self.field_id,
            out,
        })
    }
}

fn invalid(field: &str, reason: &str) -> Error {
    Error::InvalidQuery(format!("constraint on '{field}': {reason}"))
}

fn bounds(value: &Value) -> Option<(&Value, &Value)> {
    match value.as_array()?.as_slice() {
        [lo, hi] => Some((lo, hi)),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|n| !n.is_nan())
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
