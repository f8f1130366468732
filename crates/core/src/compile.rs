//! Query compiler: turns a decoded [`Query`] into an executable plan over a
//! [`FeatureStore`].
//!
//! Constraints are grouped by field. Within a group the tests are OR-combined,
//! across groups they are AND-combined. Each test is answered from the store's
//! column indexes; the resulting row sets are unioned per group and
//! intersected across groups.

use serde_json::{Map, Value};

use crate::query::{AggregationOp, Constraint, Operation, Query};
use crate::schema::{ColumnRef, Schema};
use crate::store::{FeatureRecord, FeatureStore, IndexKey};
use crate::{Error, Result};

/// A single column test.
#[derive(Debug, Clone, PartialEq)]
pub enum Test {
    /// Value equals one of the keys
    Equal(Vec<IndexKey>),
    Undefined,
    /// Numeric value in the closed interval
    Range(f64, f64),
}

impl Test {
    fn from_operation(operation: &Operation) -> Self {
        match operation {
            Operation::StringEqual(s) => Test::Equal(text_keys(s)),
            Operation::IntEqual(i) => {
                Test::Equal(vec![IndexKey::number(*i as f64), IndexKey::text(i.to_string())])
            }
            Operation::IsUndefined => Test::Undefined,
            Operation::DateRange(lo, hi) => Test::Range(*lo as f64, *hi as f64),
            Operation::NumberRange(lo, hi) => Test::Range(*lo, *hi),
            Operation::In(values) => Test::Equal(values.iter().flat_map(value_keys).collect()),
        }
    }

    pub fn matches(&self, record: &FeatureRecord, column: ColumnRef) -> bool {
        let value = record.column_value(column);
        match (self, value) {
            (Test::Undefined, value) => value.is_none(),
            (Test::Equal(keys), Some(v)) => keys.contains(&IndexKey::of(&v)),
            (Test::Range(lo, hi), Some(v)) => v
                .as_number()
                .map_or(false, |n| !n.is_nan() && *lo <= n && n <= *hi),
            (_, None) => false,
        }
    }

    fn rows(&self, store: &FeatureStore, column: ColumnRef) -> Vec<usize> {
        match self {
            Test::Undefined => store.undefined_rows(column).to_vec(),
            Test::Range(lo, hi) => store.range_rows(column, *lo, *hi),
            Test::Equal(keys) => {
                let mut rows: Vec<usize> = keys
                    .iter()
                    .flat_map(|k| store.equal_rows(column, k).iter().copied())
                    .collect();
                rows.sort_unstable();
                rows.dedup();
                rows
            }
        }
    }
}

fn text_keys(s: &str) -> Vec<IndexKey> {
    let mut keys = vec![IndexKey::text(s)];
    if let Ok(n) = s.trim().parse::<f64>() {
        keys.push(IndexKey::number(n));
    }
    keys
}

fn value_keys(value: &Value) -> Vec<IndexKey> {
    match value {
        Value::String(s) => text_keys(s),
        Value::Number(n) => {
            let mut keys = vec![IndexKey::text(n.to_string())];
            if let Some(f) = n.as_f64() {
                keys.push(IndexKey::number(f));
            }
            keys
        }
        other => vec![IndexKey::text(other.to_string())],
    }
}

#[derive(Debug, Clone, PartialEq)]
struct FieldGroup {
    column: ColumnRef,
    tests: Vec<Test>,
}

impl FieldGroup {
    fn matches(&self, record: &FeatureRecord) -> bool {
        self.tests.iter().any(|t| t.matches(record, self.column))
    }

    fn rows(&self, store: &FeatureStore) -> Vec<usize> {
        let mut rows: Vec<usize> = self
            .tests
            .iter()
            .flat_map(|t| t.rows(store, self.column))
            .collect();
        rows.sort_unstable();
        rows.dedup();
        rows
    }
}

/// AND of per-field OR groups.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Predicate {
    groups: Vec<FieldGroup>,
}

impl Predicate {
    /// Compile constraints against a schema.
    ///
    /// Fields must exist in the schema or be one of the built-in columns.
    pub fn compile(constraints: &[Constraint], schema: &Schema) -> Result<Self> {
        let mut groups: Vec<(String, FieldGroup)> = Vec::new();
        for constraint in constraints {
            let test = Test::from_operation(&constraint.operation);
            match groups.iter_mut().find(|(id, _)| *id == constraint.field_id) {
                Some((_, group)) => group.tests.push(test),
                None => {
                    let column = schema.resolve(&constraint.field_id).ok_or_else(|| {
                        Error::InvalidQuery(format!("unknown field '{}'", constraint.field_id))
                    })?;
                    groups.push((
                        constraint.field_id.clone(),
                        FieldGroup {
                            column,
                            tests: vec![test],
                        },
                    ));
                }
            }
        }
        Ok(Self {
            groups: groups.into_iter().map(|(_, g)| g).collect(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn matches(&self, record: &FeatureRecord) -> bool {
        self.groups.iter().all(|g| g.matches(record))
    }

    /// Matching rows in storage order.
    pub fn rows(&self, store: &FeatureStore) -> Vec<usize> {
        let mut sets: Vec<Vec<usize>> = self.groups.iter().map(|g| g.rows(store)).collect();
        if sets.is_empty() {
            return (0..store.len()).collect();
        }
        sets.sort_by_key(Vec::len);
        let mut rows = sets.remove(0);
        for other in &sets {
            rows.retain(|row| other.binary_search(row).is_ok());
            if rows.is_empty() {
                break;
            }
        }
        rows
    }
}

/// A column that can appear in a result row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputColumn {
    Column(ColumnRef),
    Geometry,
    Properties,
}

/// An aggregation bound to a resolved column.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledAggregation {
    pub op: AggregationOp,
    pub column: Option<ColumnRef>,
    pub out: String,
}

/// Executable form of a query.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub predicate: Predicate,
    pub projection: Vec<(String, OutputColumn)>,
    pub aggregations: Vec<CompiledAggregation>,
    pub limit: Option<usize>,
    pub skip: Option<usize>,
    pub on_sub_features: bool,
}

impl CompiledQuery {
    pub fn compile(query: &Query, schema: &Schema) -> Result<Self> {
        query.validate()?;
        let predicate = Predicate::compile(&query.constraints, schema)?;

        let projection = match &query.projection {
            Some(columns) => columns
                .iter()
                .map(|id| {
                    let column = match id.as_str() {
                        "geometry" => OutputColumn::Geometry,
                        "properties" => OutputColumn::Properties,
                        _ => OutputColumn::Column(schema.resolve(id).ok_or_else(|| {
                            Error::InvalidQuery(format!("unknown projected field '{id}'"))
                        })?),
                    };
                    Ok((id.clone(), column))
                })
                .collect::<Result<Vec<_>>>()?,
            None => default_projection(schema),
        };

        let aggregations = query
            .aggregations
            .iter()
            .map(|a| {
                let column = match &a.field_id {
                    Some(id) => Some(schema.resolve(id).ok_or_else(|| {
                        Error::InvalidQuery(format!("unknown aggregated field '{id}'"))
                    })?),
                    None => None,
                };
                Ok(CompiledAggregation {
                    op: a.op,
                    column,
                    out: a.out.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            predicate,
            projection,
            aggregations,
            limit: query.limit.filter(|&n| n > 0),
            skip: query.skip,
            on_sub_features: query.on_sub_features,
        })
    }

    /// Matching rows in storage order. Unless the query works on sub-features,
    /// only the first matching piece of each ingested feature is kept.
    pub fn select(&self, store: &FeatureStore) -> Vec<usize> {
        let mut rows = self.predicate.rows(store);
        if !self.on_sub_features {
            let mut seen = std::collections::HashSet::new();
            rows.retain(|&row| seen.insert(store.record(row).id));
        }
        rows
    }

    /// Apply `skip` then `limit`.
    pub fn page<'a>(&self, rows: &'a [usize]) -> &'a [usize] {
        let start = self.skip.unwrap_or(0).min(rows.len());
        let rows = &rows[start..];
        let end = self.limit.unwrap_or(rows.len()).min(rows.len());
        &rows[..end]
    }

    /// Render one result row.
    pub fn render_row(&self, record: &FeatureRecord) -> Map<String, Value> {
        self.projection
            .iter()
            .map(|(name, column)| {
                let value = match column {
                    OutputColumn::Geometry => {
                        serde_json::to_value(record.geometry()).unwrap_or(Value::Null)
                    }
                    OutputColumn::Properties => Value::Object((*record.properties).clone()),
                    OutputColumn::Column(ColumnRef::Id) => Value::from(record.id),
                    OutputColumn::Column(ColumnRef::HealpixIndex) => {
                        Value::from(record.healpix_index)
                    }
                    OutputColumn::Column(c) => record
                        .column_value(*c)
                        .map_or(Value::Null, |v| v.to_json()),
                };
                (name.clone(), value)
            })
            .collect()
    }
}

fn default_projection(schema: &Schema) -> Vec<(String, OutputColumn)> {
    let mut columns = vec![
        ("id".to_string(), OutputColumn::Column(ColumnRef::Id)),
        ("geogroup_id".to_string(), OutputColumn::Column(ColumnRef::GeogroupId)),
        ("healpix_index".to_string(), OutputColumn::Column(ColumnRef::HealpixIndex)),
    ];
    columns.extend(
        schema
            .fields()
            .iter()
            .enumerate()
            .map(|(idx, f)| (f.id.clone(), OutputColumn::Column(ColumnRef::Field(idx)))),
    );
    columns
}
